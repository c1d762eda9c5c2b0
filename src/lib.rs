//! gpu-dispatch: typed buffers, kernel objects, and an asynchronous compute
//! dispatch scheduler over a pluggable device backend.
//!
//! The runtime owns three guarantees the device API does not give you:
//! buffers and kernels are never released while the device still references
//! them, compiled plans are reused exactly as long as source and bindings
//! are unchanged, and completions resolve in submission order.

pub mod backend;
pub mod buffer;
pub mod completion;
pub mod context;
pub mod error;
pub mod kernel;
mod packing;
pub mod pipeline;
mod scheduler;
pub mod types;

pub use backend::mock::{MockBackend, MockDispatch};
pub use backend::DeviceBackend;
pub use buffer::{ReadHandle, TypedBuffer};
pub use completion::CompletionHandle;
pub use context::DeviceContext;
pub use error::{DispatchError, RecoveryAction, Result};
pub use kernel::{DispatchHandle, Kernel, KernelState};
pub use pipeline::CacheStats;
pub use types::{BufferId, Element, ElementType, KernelId, KernelSource, ResourceState, SlotDecl, F16};

#[cfg(target_os = "macos")]
pub use backend::metal::MetalBackend;
