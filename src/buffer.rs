//! Typed GPU buffers with logical element addressing.
//!
//! A buffer is created with an element type and a logical length; the
//! physical allocation is whatever the packing rule requires in 32-bit
//! words. Reads and writes address logical elements only -- packing and
//! unpacking never leak out of this module and [`crate::packing`].
//!
//! Writes to an idle buffer apply immediately. Writes and reads on a buffer
//! with in-flight references ride the submission queue, so they are ordered
//! after every earlier dispatch touching the buffer (last submitted wins,
//! and a read submitted after a dispatch observes that dispatch's output).

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::completion::{completion_pair, CompletionHandle};
use crate::context::Shared;
use crate::error::{DispatchError, Result};
use crate::packing;
use crate::scheduler::{apply_write, Op};
use crate::types::{BufferId, Element, ElementType, ResourceState};

/// A device-resident typed buffer. Owned by the caller; the runtime holds
/// only non-owning references while the buffer is bound or in flight.
pub struct TypedBuffer {
    id: BufferId,
    element_type: ElementType,
    logical_len: usize,
    shared: Arc<Shared>,
}

impl TypedBuffer {
    pub(crate) fn new(
        id: BufferId,
        element_type: ElementType,
        logical_len: usize,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            element_type,
            logical_len,
            shared,
        }
    }

    /// Opaque identity, unique for this buffer's lifetime.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Logical element type.
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Logical element count.
    pub fn logical_len(&self) -> usize {
        self.logical_len
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ResourceState {
        let registry = self.shared.registry.lock().unwrap();
        registry
            .buffers
            .get(&self.id)
            .map(|e| e.state)
            .unwrap_or(ResourceState::Destroyed)
    }

    fn check_range(&self, offset: usize, count: usize) -> Result<()> {
        let end = offset
            .checked_add(count)
            .ok_or(DispatchError::Range {
                offset,
                count,
                len: self.logical_len,
            })?;
        if end > self.logical_len {
            return Err(DispatchError::Range {
                offset,
                count,
                len: self.logical_len,
            });
        }
        Ok(())
    }

    /// Write `data` starting at logical element `offset`.
    ///
    /// Synchronous when the buffer has no in-flight references; otherwise
    /// the write is queued behind them and applied in submission order.
    pub fn write<T: Element>(&self, data: &[T], offset: usize) -> Result<()> {
        self.shared.check_usable()?;
        if T::ELEMENT_TYPE != self.element_type {
            return Err(DispatchError::TypeMismatch {
                expected: self.element_type,
                found: T::ELEMENT_TYPE,
            });
        }
        self.check_range(offset, data.len())?;

        let enc = packing::encode_write(data, offset);

        let mut registry = self.shared.registry.lock().unwrap();
        let entry = registry
            .buffers
            .get_mut(&self.id)
            .ok_or(DispatchError::UseAfterFree)?;
        if entry.state != ResourceState::Live {
            return Err(DispatchError::UseAfterFree);
        }

        if entry.in_flight == 0 {
            // Idle: nothing queued references this storage.
            return apply_write(self.shared.backend.as_ref(), entry.storage, enc);
        }

        entry.in_flight += 1;
        let storage = entry.storage;
        drop(registry);

        self.shared.push_op(Op::Write {
            buffer: self.id,
            storage,
            enc,
        });
        Ok(())
    }

    /// Read `count` logical elements starting at `offset`.
    ///
    /// The read rides the submission queue: it observes every dispatch and
    /// write submitted before it. Decoding back to `T` happens in
    /// [`ReadHandle::wait`].
    pub fn read<T: Element>(&self, count: usize, offset: usize) -> Result<ReadHandle<T>> {
        self.shared.check_usable()?;
        if T::ELEMENT_TYPE != self.element_type {
            return Err(DispatchError::TypeMismatch {
                expected: self.element_type,
                found: T::ELEMENT_TYPE,
            });
        }
        self.check_range(offset, count)?;

        let (word_offset, word_count) = packing::word_span(self.element_type, offset, count);

        let mut registry = self.shared.registry.lock().unwrap();
        let entry = registry
            .buffers
            .get_mut(&self.id)
            .ok_or(DispatchError::UseAfterFree)?;
        if entry.state != ResourceState::Live {
            return Err(DispatchError::UseAfterFree);
        }
        entry.in_flight += 1;
        let storage = entry.storage;
        drop(registry);

        let (tx, rx) = completion_pair();
        self.shared.push_op(Op::Read {
            buffer: self.id,
            storage,
            word_offset,
            word_count,
            done: tx,
        });

        Ok(ReadHandle {
            inner: rx,
            elem_offset: offset,
            count,
            _marker: PhantomData,
        })
    }

    /// Destroy the buffer. Releases storage immediately when idle;
    /// otherwise defers the physical release until the last in-flight
    /// submission referencing it resolves.
    pub fn destroy(&self) -> Result<()> {
        if self.shared.destroyed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(DispatchError::ContextInvalid);
        }

        let mut registry = self.shared.registry.lock().unwrap();
        let entry = registry
            .buffers
            .get_mut(&self.id)
            .ok_or(DispatchError::UseAfterFree)?;
        match entry.state {
            ResourceState::Live => {
                if entry.in_flight > 0 {
                    entry.state = ResourceState::PendingDestroy;
                } else {
                    self.shared.backend.release(entry.storage);
                    entry.state = ResourceState::Destroyed;
                }
                Ok(())
            }
            ResourceState::PendingDestroy | ResourceState::Destroyed => {
                Err(DispatchError::UseAfterFree)
            }
        }
    }
}

impl Drop for TypedBuffer {
    fn drop(&mut self) {
        // Safety net for a forgotten destroy(); same deferred-release path.
        let _ = self.destroy();
    }
}

/// Pending result of an asynchronous buffer read.
pub struct ReadHandle<T: Element> {
    inner: CompletionHandle<Vec<u32>>,
    elem_offset: usize,
    count: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> ReadHandle<T> {
    /// Block until the device-side copy completes, then decode.
    pub fn wait(self) -> Result<Vec<T>> {
        let words = self.inner.wait()?;
        Ok(packing::decode_read(&words, self.elem_offset, self.count))
    }

    /// Caller-side deadline; on expiry the handle comes back unresolved and
    /// the read still completes inside the runtime.
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<Result<Vec<T>>, Self> {
        let elem_offset = self.elem_offset;
        let count = self.count;
        match self.inner.wait_timeout(timeout) {
            Ok(words) => Ok(words.map(|w| packing::decode_read(&w, elem_offset, count))),
            Err(inner) => Err(ReadHandle {
                inner,
                elem_offset,
                count,
                _marker: PhantomData,
            }),
        }
    }

    /// Whether the read has resolved.
    pub fn is_resolved(&self) -> bool {
        self.inner.is_resolved()
    }
}
