//! Device backend seam.
//!
//! Everything above this trait is host-portable: the scheduler, the plan
//! cache, and the typed-buffer layer speak in opaque storage/plan ids and
//! 32-bit words. The Metal implementation lives in [`metal`] (macOS only);
//! [`mock`] is the in-process reference backend used by the test suites and
//! for injecting a backend into a context under test.

use crate::error::Result;
use crate::types::KernelSource;

#[cfg(target_os = "macos")]
pub mod metal;
pub mod mock;

/// Opaque id of a device-resident storage allocation, in 32-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageId(pub(crate) u64);

/// Opaque id of a compiled execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanId(pub(crate) u64);

/// The device driver boundary.
///
/// `execute` returns only after the device reports completion for the
/// submitted work; the scheduler relies on that to resolve completions in
/// submission order. All methods may be called from the scheduler thread
/// and, for alloc/write/read of idle buffers, from caller threads -- the
/// runtime serializes access per resource, implementations only need
/// whole-registry interior mutability.
pub trait DeviceBackend: Send + Sync {
    /// Human-readable device name, reported at context init.
    fn name(&self) -> String;

    /// Allocate `word_count` 32-bit words of device storage.
    fn alloc(&self, word_count: usize) -> Result<StorageId>;

    /// Release a storage allocation. Idempotent on unknown ids.
    fn release(&self, storage: StorageId);

    /// Copy words into storage at a word offset.
    fn write_words(&self, storage: StorageId, word_offset: usize, words: &[u32]) -> Result<()>;

    /// Copy `word_count` words out of storage at a word offset.
    fn read_words(&self, storage: StorageId, word_offset: usize, word_count: usize)
        -> Result<Vec<u32>>;

    /// Compile kernel source into an execution plan.
    fn compile(&self, source: &KernelSource) -> Result<PlanId>;

    /// Release a compiled plan. Idempotent on unknown ids.
    fn release_plan(&self, plan: PlanId);

    /// Run one dispatch over a 3D grid of workgroups, with `bindings`
    /// listing `(slot, storage)` in declared-slot order. Blocks until the
    /// device reports completion.
    fn execute(
        &self,
        plan: PlanId,
        bindings: &[(u32, StorageId)],
        groups: (u32, u32, u32),
    ) -> Result<()>;
}
