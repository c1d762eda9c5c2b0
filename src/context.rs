//! Device context: one backend connection, its resource registry, and the
//! submission thread that owns the device queue.
//!
//! The context is explicit state with a documented init/teardown lifecycle,
//! injectable with any [`DeviceBackend`] so tests can run against the mock.
//! Destroying the context invalidates every buffer and kernel created under
//! it; their operations then fail `ContextInvalid` instead of touching freed
//! device state.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::backend::{DeviceBackend, StorageId};
use crate::buffer::TypedBuffer;
use crate::completion::{completion_pair, CompletionHandle};
use crate::error::{DispatchError, Result};
use crate::kernel::Kernel;
use crate::packing;
use crate::pipeline::{CacheStats, CachedPlan};
use crate::scheduler::{self, Op};
use crate::types::{BufferId, ElementType, KernelId, KernelSource, ResourceState};

/// Registry entry for one typed buffer.
pub(crate) struct BufferEntry {
    pub storage: StorageId,
    pub element_type: ElementType,
    pub logical_len: usize,
    pub state: ResourceState,
    /// Unresolved submissions (dispatches, reads, queued writes) that
    /// reference this buffer.
    pub in_flight: u32,
}

/// Registry entry for one kernel object.
pub(crate) struct KernelEntry {
    pub source: Option<KernelSource>,
    pub bindings: BTreeMap<u32, BufferId>,
    pub cached: Option<CachedPlan>,
    pub stats: CacheStats,
    pub state: ResourceState,
    pub in_flight: u32,
}

/// All caller-created resources of a context.
pub(crate) struct Registry {
    pub buffers: HashMap<BufferId, BufferEntry>,
    pub kernels: HashMap<KernelId, KernelEntry>,
    next_id: u64,
}

impl Registry {
    fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            kernels: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn next_buffer_id(&mut self) -> BufferId {
        let id = self.next_id;
        self.next_id += 1;
        BufferId(id)
    }

    pub(crate) fn next_kernel_id(&mut self) -> KernelId {
        let id = self.next_id;
        self.next_id += 1;
        KernelId(id)
    }
}

/// State shared between the caller-facing handles and the submission thread.
pub(crate) struct Shared {
    pub backend: Arc<dyn DeviceBackend>,
    pub registry: Mutex<Registry>,
    pub queue: Mutex<VecDeque<Op>>,
    pub wake: Condvar,
    /// Set once when the device reports an execution error; everything
    /// queued or submitted afterwards fails `DeviceLost`.
    pub poison: Mutex<Option<String>>,
    pub destroyed: AtomicBool,
}

impl Shared {
    /// Fail fast when the context is gone or the device was lost.
    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(DispatchError::ContextInvalid);
        }
        if let Some(reason) = self.poison.lock().unwrap().clone() {
            return Err(DispatchError::DeviceLost(reason));
        }
        Ok(())
    }

    /// Queue an op for the submission thread.
    pub(crate) fn push_op(&self, op: Op) {
        self.queue.lock().unwrap().push_back(op);
        self.wake.notify_all();
        // A submit racing with destroy() can land after the submission
        // thread exited; drain here so no completion is left unresolved.
        if self.destroyed.load(Ordering::Acquire) {
            scheduler::drain_failed(self);
        }
    }
}

/// Process-wide handle to one initialized device connection.
///
/// States: Uninitialized (no value yet) -> Ready (constructed) ->
/// Destroyed (`destroy()` called or the value dropped).
pub struct DeviceContext {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    device_name: String,
}

impl DeviceContext {
    /// Initialize a context over the given backend: probe the device and
    /// spawn the submission thread.
    pub fn init(backend: Arc<dyn DeviceBackend>) -> Result<Self> {
        let device_name = backend.name();

        let shared = Arc::new(Shared {
            backend,
            registry: Mutex::new(Registry::new()),
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            poison: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        let thread = scheduler::spawn(shared.clone());

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
            device_name,
        })
    }

    /// Initialize on a helper thread; the handle resolves once device
    /// probing finishes.
    pub fn init_async(backend: Arc<dyn DeviceBackend>) -> CompletionHandle<DeviceContext> {
        let (tx, rx) = completion_pair();
        std::thread::Builder::new()
            .name("gpu-dispatch-init".into())
            .spawn(move || {
                tx.resolve(DeviceContext::init(backend));
            })
            .expect("failed to spawn init thread");
        rx
    }

    /// Initialize over the system Metal device.
    #[cfg(target_os = "macos")]
    pub fn init_system() -> Result<Self> {
        let backend = crate::backend::metal::MetalBackend::new()?;
        Self::init(Arc::new(backend))
    }

    /// Device name reported by the backend at init.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Whether `destroy()` has run.
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    /// Allocate a typed buffer of `logical_len` elements.
    pub fn create_buffer(
        &self,
        element_type: ElementType,
        logical_len: usize,
    ) -> Result<TypedBuffer> {
        self.shared.check_usable()?;

        let word_len = packing::physical_word_len(element_type, logical_len);
        let storage = self.shared.backend.alloc(word_len)?;

        let mut registry = self.shared.registry.lock().unwrap();
        let id = registry.next_buffer_id();
        registry.buffers.insert(
            id,
            BufferEntry {
                storage,
                element_type,
                logical_len,
                state: ResourceState::Live,
                in_flight: 0,
            },
        );

        Ok(TypedBuffer::new(id, element_type, logical_len, self.shared.clone()))
    }

    /// Create an empty kernel object (state: Unloaded).
    pub fn create_kernel(&self) -> Result<Kernel> {
        self.shared.check_usable()?;

        let mut registry = self.shared.registry.lock().unwrap();
        let id = registry.next_kernel_id();
        registry.kernels.insert(
            id,
            KernelEntry {
                source: None,
                bindings: BTreeMap::new(),
                cached: None,
                stats: CacheStats::default(),
                state: ResourceState::Live,
                in_flight: 0,
            },
        );

        Ok(Kernel::new(id, self.shared.clone()))
    }

    /// Tear the context down: unresolved submissions fail `ContextInvalid`,
    /// the submission thread exits, and every surviving resource is
    /// released. Idempotent errors: a second destroy fails `ContextInvalid`.
    pub fn destroy(&self) -> Result<()> {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return Err(DispatchError::ContextInvalid);
        }
        self.shared.wake.notify_all();

        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        // The thread has drained the queue; release whatever is left.
        let mut registry = self.shared.registry.lock().unwrap();
        for entry in registry.buffers.values_mut() {
            if entry.state != ResourceState::Destroyed {
                self.shared.backend.release(entry.storage);
                entry.state = ResourceState::Destroyed;
            }
        }
        for entry in registry.kernels.values_mut() {
            if entry.state != ResourceState::Destroyed {
                if let Some(cached) = entry.cached.take() {
                    self.shared.backend.release_plan(cached.plan);
                }
                entry.bindings.clear();
                entry.state = ResourceState::Destroyed;
            }
        }
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            let _ = self.destroy();
        }
    }
}
