//! Submission scheduler: the single authority over the device queue.
//!
//! All device work funnels through one background thread pulling from a
//! FIFO op queue, so command encoding is a critical section by construction
//! and completions resolve strictly in submission order. The thread also
//! owns the release side of resource lifetime: every op carries the ids it
//! references, submission incremented their in-flight counts, and the
//! thread decrements them after resolution -- performing the deferred
//! physical release of anything the caller destroyed mid-flight.
//!
//! Failure model: when the backend reports an execution error the failing
//! dispatch resolves `Execution`, the context is poisoned, and every op
//! already queued behind it (and every later submission) fails `DeviceLost`
//! without touching the device. Plan releases still run during drains; they
//! are host-side bookkeeping.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::backend::{DeviceBackend, PlanId, StorageId};
use crate::completion::Completer;
use crate::context::Shared;
use crate::error::{DispatchError, Result};
use crate::packing::{merge_word, EncodedWrite};
use crate::types::{BufferId, KernelId, ResourceState};

/// One unit of work on the submission queue.
pub(crate) enum Op {
    Dispatch {
        kernel: KernelId,
        plan: PlanId,
        bindings: Vec<(u32, StorageId)>,
        buffers: Vec<BufferId>,
        groups: (u32, u32, u32),
        done: Completer<()>,
    },
    Read {
        buffer: BufferId,
        storage: StorageId,
        word_offset: usize,
        word_count: usize,
        done: Completer<Vec<u32>>,
    },
    Write {
        buffer: BufferId,
        storage: StorageId,
        enc: EncodedWrite,
    },
    /// Deferred release of a superseded compiled plan; ordered behind every
    /// dispatch that may still use it.
    ReleasePlan { plan: PlanId },
}

/// Spawn the submission thread for a context.
pub(crate) fn spawn(shared: Arc<Shared>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("gpu-dispatch-submit".into())
        .spawn(move || run(&shared))
        .expect("failed to spawn submission thread")
}

fn run(shared: &Shared) {
    loop {
        let op = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(op) = queue.pop_front() {
                    break Some(op);
                }
                if shared.destroyed.load(std::sync::atomic::Ordering::Acquire) {
                    break None;
                }
                queue = shared.wake.wait(queue).unwrap();
            }
        };
        let Some(op) = op else { return };

        if shared.destroyed.load(std::sync::atomic::Ordering::Acquire) {
            fail(shared, op, DispatchError::ContextInvalid);
            continue;
        }
        let poisoned = shared.poison.lock().unwrap().clone();
        if let Some(reason) = poisoned {
            fail(shared, op, DispatchError::DeviceLost(reason));
            continue;
        }

        process(shared, op);
    }
}

fn process(shared: &Shared, op: Op) {
    match op {
        Op::Dispatch {
            kernel,
            plan,
            bindings,
            buffers,
            groups,
            done,
        } => {
            let result = shared.backend.execute(plan, &bindings, groups);
            if let Err(err) = &result {
                // The device queue is gone for this context: everything
                // behind this dispatch fails, nothing is retried.
                *shared.poison.lock().unwrap() = Some(err.to_string());
            }
            // Holds drop before the caller can observe completion.
            release_refs(shared, Some(kernel), &buffers);
            done.resolve(result);
        }

        Op::Read {
            buffer,
            storage,
            word_offset,
            word_count,
            done,
        } => {
            let result = shared.backend.read_words(storage, word_offset, word_count);
            release_refs(shared, None, &[buffer]);
            done.resolve(result);
        }

        Op::Write {
            buffer,
            storage,
            enc,
        } => {
            let _ = apply_write(shared.backend.as_ref(), storage, enc);
            release_refs(shared, None, &[buffer]);
        }

        Op::ReleasePlan { plan } => {
            shared.backend.release_plan(plan);
        }
    }
}

/// Drain every queued op as `ContextInvalid`. Called by submitters that
/// raced with context destruction and may have enqueued after the
/// submission thread already exited; popping is shared with the thread, so
/// each op resolves exactly once.
pub(crate) fn drain_failed(shared: &Shared) {
    loop {
        let op = shared.queue.lock().unwrap().pop_front();
        let Some(op) = op else { return };
        fail(shared, op, DispatchError::ContextInvalid);
    }
}

/// Resolve an op without device work during a poison or destroy drain.
fn fail(shared: &Shared, op: Op, err: DispatchError) {
    match op {
        Op::Dispatch {
            kernel,
            buffers,
            done,
            ..
        } => {
            release_refs(shared, Some(kernel), &buffers);
            done.resolve(Err(err));
        }
        Op::Read { buffer, done, .. } => {
            release_refs(shared, None, &[buffer]);
            done.resolve(Err(err));
        }
        Op::Write { buffer, .. } => {
            release_refs(shared, None, &[buffer]);
        }
        // Host-side bookkeeping still runs while draining.
        Op::ReleasePlan { plan } => {
            shared.backend.release_plan(plan);
        }
    }
}

/// Apply an encoded write, merging partially covered edge words so
/// neighboring packed elements survive.
pub(crate) fn apply_write(
    backend: &dyn DeviceBackend,
    storage: StorageId,
    mut enc: EncodedWrite,
) -> Result<()> {
    if enc.words.is_empty() {
        return Ok(());
    }
    if let Some(keep) = enc.head_keep {
        let old = backend.read_words(storage, enc.word_offset, 1)?[0];
        enc.words[0] = merge_word(old, enc.words[0], keep);
    }
    if let Some(keep) = enc.tail_keep {
        let last = enc.words.len() - 1;
        let old = backend.read_words(storage, enc.word_offset + last, 1)?[0];
        enc.words[last] = merge_word(old, enc.words[last], keep);
    }
    backend.write_words(storage, enc.word_offset, &enc.words)
}

/// Decrement in-flight counts after an op resolves, releasing anything the
/// caller destroyed while the op was outstanding.
fn release_refs(shared: &Shared, kernel: Option<KernelId>, buffers: &[BufferId]) {
    let mut registry = shared.registry.lock().unwrap();

    for id in buffers {
        if let Some(entry) = registry.buffers.get_mut(id) {
            entry.in_flight -= 1;
            if entry.in_flight == 0 && entry.state == ResourceState::PendingDestroy {
                shared.backend.release(entry.storage);
                entry.state = ResourceState::Destroyed;
            }
        }
    }

    if let Some(id) = kernel {
        if let Some(entry) = registry.kernels.get_mut(&id) {
            entry.in_flight -= 1;
            if entry.in_flight == 0 && entry.state == ResourceState::PendingDestroy {
                if let Some(cached) = entry.cached.take() {
                    shared.backend.release_plan(cached.plan);
                }
                entry.bindings.clear();
                entry.state = ResourceState::Destroyed;
            }
        }
    }
}
