//! Kernel objects: opaque program source, slot bindings, cached plan.
//!
//! A kernel may be rebound and redispatched arbitrarily many times. The
//! cached compiled plan survives exactly as long as the plan key does:
//! rebinding the same handle to the same slot is a no-op, everything else
//! (new source, different handle, different slot, type change) invalidates.
//! Superseded plans are released through the submission queue so a dispatch
//! still in flight can never lose its plan underneath it.

use std::sync::Arc;

use crate::completion::{completion_pair, CompletionHandle};
use crate::context::Shared;
use crate::error::{DispatchError, Result};
use crate::pipeline::{source_hash, CacheStats, CachedPlan, PlanKey};
use crate::scheduler::Op;
use crate::types::{KernelId, KernelSource, ResourceState};

/// Progress of a kernel object toward dispatchability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    /// No source loaded.
    Unloaded,
    /// Source loaded, at least one declared slot unbound.
    Loaded,
    /// All declared slots bound, no valid compiled plan yet.
    Bound,
    /// All slots bound and the cached plan matches the current key.
    Dispatchable,
}

/// Completion of one dispatch.
pub type DispatchHandle = CompletionHandle<()>;

/// A compute kernel object. Owned by the caller; destroy defers like
/// buffers while dispatches are outstanding.
pub struct Kernel {
    id: KernelId,
    shared: Arc<Shared>,
}

impl Kernel {
    pub(crate) fn new(id: KernelId, shared: Arc<Shared>) -> Self {
        Self { id, shared }
    }

    /// Opaque identity.
    pub fn id(&self) -> KernelId {
        self.id
    }

    /// Replace the program source and its declared binding interface.
    ///
    /// A source with different content invalidates the cached plan; loading
    /// byte-identical source keeps it (the plan key hashes content, so the
    /// next dispatch still matches). Bindings persist across loads.
    pub fn load_source(&self, source: KernelSource) -> Result<()> {
        self.shared.check_usable()?;

        let release = {
            let mut registry = self.shared.registry.lock().unwrap();
            let entry = registry
                .kernels
                .get_mut(&self.id)
                .ok_or(DispatchError::UseAfterFree)?;
            if entry.state != ResourceState::Live {
                return Err(DispatchError::UseAfterFree);
            }

            let changed = entry
                .source
                .as_ref()
                .map(|old| source_hash(old) != source_hash(&source))
                .unwrap_or(true);
            entry.source = Some(source);

            if changed {
                entry.cached.take().map(|old| {
                    entry.stats.invalidations += 1;
                    old.plan
                })
            } else {
                None
            }
        };

        if let Some(plan) = release {
            self.shared.push_op(Op::ReleasePlan { plan });
        }
        Ok(())
    }

    /// Bind a buffer to a declared slot.
    ///
    /// Binding the handle already present is a no-op with respect to cache
    /// validity. A different handle updates the binding and invalidates the
    /// cached plan. Type mismatches mutate nothing.
    pub fn bind(&self, slot: u32, buffer: &crate::buffer::TypedBuffer) -> Result<()> {
        self.shared.check_usable()?;

        let release = {
            let mut guard = self.shared.registry.lock().unwrap();
            let registry = &mut *guard;
            let entry = registry
                .kernels
                .get_mut(&self.id)
                .ok_or(DispatchError::UseAfterFree)?;
            if entry.state != ResourceState::Live {
                return Err(DispatchError::UseAfterFree);
            }

            let source = entry
                .source
                .as_ref()
                .ok_or(DispatchError::MissingBinding { slot })?;
            let declared = source
                .slot_type(slot)
                .ok_or(DispatchError::MissingBinding { slot })?;

            let bentry = registry
                .buffers
                .get(&buffer.id())
                .ok_or(DispatchError::UseAfterFree)?;
            if bentry.state != ResourceState::Live {
                return Err(DispatchError::UseAfterFree);
            }
            if bentry.element_type != declared {
                return Err(DispatchError::TypeMismatch {
                    expected: declared,
                    found: bentry.element_type,
                });
            }

            if entry.bindings.get(&slot) == Some(&buffer.id()) {
                return Ok(()); // same identity: cache untouched
            }

            entry.bindings.insert(slot, buffer.id());
            entry.cached.take().map(|old| {
                entry.stats.invalidations += 1;
                old.plan
            })
        };

        if let Some(plan) = release {
            self.shared.push_op(Op::ReleasePlan { plan });
        }
        Ok(())
    }

    /// Dispatch over an `(x, y, z)` grid of workgroups.
    ///
    /// Requires source loaded and every declared slot bound. Reuses the
    /// cached plan on a key match, compiles otherwise -- the expensive path
    /// runs no more often than source/binding changes require. A zero grid
    /// dimension is a caller error, reported through the range taxonomy
    /// (dimension index as offset, minimum length 1).
    pub fn dispatch(&self, x: u32, y: u32, z: u32) -> Result<DispatchHandle> {
        self.shared.check_usable()?;

        for (dim, value) in [x, y, z].into_iter().enumerate() {
            if value == 0 {
                return Err(DispatchError::Range {
                    offset: dim,
                    count: 0,
                    len: 1,
                });
            }
        }

        let (plan, bindings, buffer_ids, release) = {
            let mut guard = self.shared.registry.lock().unwrap();
            let registry = &mut *guard;

            let entry = registry
                .kernels
                .get_mut(&self.id)
                .ok_or(DispatchError::UseAfterFree)?;
            if entry.state != ResourceState::Live {
                return Err(DispatchError::UseAfterFree);
            }
            let source = entry
                .source
                .as_ref()
                .ok_or(DispatchError::MissingBinding { slot: 0 })?;

            let mut key_bindings = Vec::with_capacity(source.slots.len());
            let mut storages = Vec::with_capacity(source.slots.len());
            let mut referenced = Vec::new();
            for decl in &source.slots {
                let bid = *entry
                    .bindings
                    .get(&decl.slot)
                    .ok_or(DispatchError::MissingBinding { slot: decl.slot })?;
                let bentry = registry
                    .buffers
                    .get(&bid)
                    .ok_or(DispatchError::UseAfterFree)?;
                if bentry.state != ResourceState::Live {
                    return Err(DispatchError::UseAfterFree);
                }
                key_bindings.push((decl.slot, bid, bentry.element_type));
                storages.push((decl.slot, bentry.storage));
                if !referenced.contains(&bid) {
                    referenced.push(bid);
                }
            }

            let key = PlanKey {
                source_hash: source_hash(source),
                bindings: key_bindings,
            };

            let mut release = None;
            let plan = match &entry.cached {
                Some(cached) if cached.key == key => {
                    entry.stats.hits += 1;
                    cached.plan
                }
                _ => {
                    entry.stats.misses += 1;
                    let plan = self.shared.backend.compile(source)?;
                    entry.stats.compiles += 1;
                    release = entry.cached.take().map(|old| old.plan);
                    entry.cached = Some(CachedPlan { key, plan });
                    plan
                }
            };

            entry.in_flight += 1;
            for bid in &referenced {
                if let Some(bentry) = registry.buffers.get_mut(bid) {
                    bentry.in_flight += 1;
                }
            }

            (plan, storages, referenced, release)
        };

        if let Some(old) = release {
            self.shared.push_op(Op::ReleasePlan { plan: old });
        }

        let (tx, rx) = completion_pair();
        self.shared.push_op(Op::Dispatch {
            kernel: self.id,
            plan,
            bindings,
            buffers: buffer_ids,
            groups: (x, y, z),
            done: tx,
        });
        Ok(rx)
    }

    /// Current position in the Unloaded -> Loaded -> Bound -> Dispatchable
    /// state machine.
    pub fn state(&self) -> Result<KernelState> {
        let guard = self.shared.registry.lock().unwrap();
        let entry = guard
            .kernels
            .get(&self.id)
            .ok_or(DispatchError::UseAfterFree)?;
        if entry.state != ResourceState::Live {
            return Err(DispatchError::UseAfterFree);
        }

        let Some(source) = &entry.source else {
            return Ok(KernelState::Unloaded);
        };

        let mut key_bindings = Vec::with_capacity(source.slots.len());
        for decl in &source.slots {
            let Some(bid) = entry.bindings.get(&decl.slot) else {
                return Ok(KernelState::Loaded);
            };
            let Some(bentry) = guard.buffers.get(bid) else {
                return Ok(KernelState::Loaded);
            };
            key_bindings.push((decl.slot, *bid, bentry.element_type));
        }

        let key = PlanKey {
            source_hash: source_hash(source),
            bindings: key_bindings,
        };
        match &entry.cached {
            Some(cached) if cached.key == key => Ok(KernelState::Dispatchable),
            _ => Ok(KernelState::Bound),
        }
    }

    /// Plan cache counters for this kernel.
    pub fn plan_stats(&self) -> Result<CacheStats> {
        let guard = self.shared.registry.lock().unwrap();
        guard
            .kernels
            .get(&self.id)
            .map(|e| e.stats)
            .ok_or(DispatchError::UseAfterFree)
    }

    /// Destroy the kernel: releases the cached plan and clears bindings,
    /// deferring while dispatches are outstanding.
    pub fn destroy(&self) -> Result<()> {
        if self.shared.destroyed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(DispatchError::ContextInvalid);
        }

        let mut registry = self.shared.registry.lock().unwrap();
        let entry = registry
            .kernels
            .get_mut(&self.id)
            .ok_or(DispatchError::UseAfterFree)?;
        match entry.state {
            ResourceState::Live => {
                if entry.in_flight > 0 {
                    entry.state = ResourceState::PendingDestroy;
                } else {
                    if let Some(cached) = entry.cached.take() {
                        self.shared.backend.release_plan(cached.plan);
                    }
                    entry.bindings.clear();
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

impl Drop for Kernel {
    fn drop(&mut self) {
        // Safety net for a forgotten destroy(); same deferred path.
        let _ = self.destroy();
    }
}
