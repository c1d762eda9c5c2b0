//! Centralized error types for the dispatch runtime.
//!
//! Every failure mode has a defined recovery classification:
//!
//! | Error             | Recovery                                      |
//! |-------------------|-----------------------------------------------|
//! | ContextInvalid    | Context destroyed: create a new context       |
//! | AllocationFailed  | Device rejected the size: retry smaller       |
//! | Range             | Caller bug: fix offsets/counts                |
//! | TypeMismatch      | Caller bug: fix element types                 |
//! | MissingBinding    | Caller bug: bind every declared slot          |
//! | UseAfterFree      | Caller lifetime bug: reject, never corrupt    |
//! | ShaderCompilation | Kernel source rejected by the device compiler |
//! | DeviceLost        | Device-level fatal: reinitialize the context  |
//! | Execution         | Device-level fatal: reinitialize the context  |
//!
//! Validation errors are returned synchronously, before anything is submitted
//! to the device. Device-level errors travel back through the same completion
//! handle as a normal result, as an explicit `Err` -- never as a panic across
//! the async boundary.

use std::fmt;

use crate::types::ElementType;

/// Central error type for all runtime operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Operation on a resource whose owning context has been destroyed.
    ContextInvalid,

    /// The backend rejected a buffer allocation of this many 32-bit words.
    AllocationFailed { words: usize },

    /// Element offset + count exceeds the buffer's logical length, or a
    /// dispatch grid dimension is zero.
    Range {
        offset: usize,
        count: usize,
        len: usize,
    },

    /// Host element type does not match the buffer's or the slot's declared
    /// element type.
    TypeMismatch {
        expected: ElementType,
        found: ElementType,
    },

    /// A declared slot has no bound buffer, or a bind targeted a slot the
    /// kernel never declared.
    MissingBinding { slot: u32 },

    /// Operation on a buffer or kernel after `destroy()`.
    UseAfterFree,

    /// The device compiler rejected the kernel source.
    ShaderCompilation(String),

    /// The device connection failed; in-flight and queued work is lost.
    DeviceLost(String),

    /// The device reported an execution error for this dispatch.
    Execution(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::ContextInvalid => {
                write!(f, "device context destroyed -- resource is invalid")
            }
            DispatchError::AllocationFailed { words } => {
                write!(f, "device rejected allocation of {} words", words)
            }
            DispatchError::Range { offset, count, len } => {
                write!(
                    f,
                    "range out of bounds: offset {} + count {} exceeds length {}",
                    offset, count, len
                )
            }
            DispatchError::TypeMismatch { expected, found } => {
                write!(f, "element type mismatch: expected {}, found {}", expected, found)
            }
            DispatchError::MissingBinding { slot } => {
                write!(f, "slot {} has no binding in the declared interface", slot)
            }
            DispatchError::UseAfterFree => {
                write!(f, "resource used after destroy()")
            }
            DispatchError::ShaderCompilation(msg) => {
                write!(f, "kernel compilation failed: {}", msg)
            }
            DispatchError::DeviceLost(msg) => {
                write!(f, "device lost: {}", msg)
            }
            DispatchError::Execution(msg) => {
                write!(f, "device execution error: {}", msg)
            }
        }
    }
}

impl std::error::Error for DispatchError {}

/// Type alias for Results using DispatchError.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// How the caller should respond to a given error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Create a fresh context; everything under the old one is gone.
    Reinitialize,
    /// The device is healthy but refused the size; retry with less.
    RetrySmaller,
    /// Programming error in the calling code; retrying cannot help.
    FixCaller,
}

impl DispatchError {
    /// Determine the appropriate recovery action for this error.
    pub fn recovery_action(&self) -> RecoveryAction {
        match self {
            DispatchError::ContextInvalid
            | DispatchError::DeviceLost(_)
            | DispatchError::Execution(_) => RecoveryAction::Reinitialize,
            DispatchError::AllocationFailed { .. } => RecoveryAction::RetrySmaller,
            DispatchError::Range { .. }
            | DispatchError::TypeMismatch { .. }
            | DispatchError::MissingBinding { .. }
            | DispatchError::UseAfterFree
            | DispatchError::ShaderCompilation(_) => RecoveryAction::FixCaller,
        }
    }

    /// Whether this error invalidates the whole context.
    pub fn is_fatal(&self) -> bool {
        self.recovery_action() == RecoveryAction::Reinitialize
    }

    /// Whether this error indicates a bug in the calling code.
    pub fn is_caller_bug(&self) -> bool {
        self.recovery_action() == RecoveryAction::FixCaller
    }
}
