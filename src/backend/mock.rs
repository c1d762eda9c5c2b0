//! In-process reference backend.
//!
//! Storage is plain word vectors; "compiling" a kernel looks its entry point
//! up in a program registry populated by the host (usually a test). Counters
//! expose how many compiles and executes the backend has served, and faults
//! can be injected to exercise allocation failure and device-loss paths.
//!
//! Execution copies each bound storage in, runs the program, and copies the
//! results back. Binding the same storage to two slots therefore behaves as
//! two snapshots with the higher slot's write-back winning; real devices
//! alias instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{DeviceBackend, PlanId, StorageId};
use crate::error::{DispatchError, Result};
use crate::types::KernelSource;

/// One mock dispatch: grid size plus the bound buffers, addressable by slot.
pub struct MockDispatch {
    groups: (u32, u32, u32),
    buffers: Vec<(u32, Vec<u32>)>,
}

impl MockDispatch {
    /// Workgroup counts the dispatch was submitted with.
    pub fn groups(&self) -> (u32, u32, u32) {
        self.groups
    }

    /// Words bound at `slot`.
    ///
    /// # Panics
    /// Panics if the slot is not bound; mock programs declare their own
    /// interface and are trusted in tests.
    pub fn slot(&self, slot: u32) -> &[u32] {
        self.buffers
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, w)| w.as_slice())
            .unwrap_or_else(|| panic!("mock program read from unbound slot {}", slot))
    }

    /// Mutable words bound at `slot`.
    pub fn slot_mut(&mut self, slot: u32) -> &mut Vec<u32> {
        self.buffers
            .iter_mut()
            .find(|(s, _)| *s == slot)
            .map(|(_, w)| w)
            .unwrap_or_else(|| panic!("mock program wrote to unbound slot {}", slot))
    }
}

/// A host closure standing in for a compiled kernel.
pub type MockProgram = Arc<dyn Fn(&mut MockDispatch) + Send + Sync>;

struct MockPlan {
    program: MockProgram,
}

/// Reference backend over host memory.
pub struct MockBackend {
    storage: Mutex<HashMap<u64, Vec<u32>>>,
    plans: Mutex<HashMap<u64, MockPlan>>,
    programs: Mutex<HashMap<String, MockProgram>>,
    next_id: AtomicU64,
    compile_count: AtomicU64,
    execute_count: AtomicU64,
    alloc_limit_words: Mutex<Option<usize>>,
    fail_execute_in: Mutex<Option<u64>>,
    execute_delay: Mutex<Duration>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            storage: Mutex::new(HashMap::new()),
            plans: Mutex::new(HashMap::new()),
            programs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            compile_count: AtomicU64::new(0),
            execute_count: AtomicU64::new(0),
            alloc_limit_words: Mutex::new(None),
            fail_execute_in: Mutex::new(None),
            execute_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Register the program behind an entry point. Compiling a source whose
    /// entry point has no registered program fails `ShaderCompilation`.
    pub fn register_program<F>(&self, entry_point: &str, program: F)
    where
        F: Fn(&mut MockDispatch) + Send + Sync + 'static,
    {
        self.programs
            .lock()
            .unwrap()
            .insert(entry_point.to_string(), Arc::new(program));
    }

    /// Number of successful compiles so far.
    pub fn compile_count(&self) -> u64 {
        self.compile_count.load(Ordering::Acquire)
    }

    /// Number of dispatches executed (successful or injected-failed).
    pub fn execute_count(&self) -> u64 {
        self.execute_count.load(Ordering::Acquire)
    }

    /// Reject allocations larger than `words`; `None` lifts the limit.
    pub fn set_alloc_limit(&self, words: Option<usize>) {
        *self.alloc_limit_words.lock().unwrap() = words;
    }

    /// Arm an execution failure: the dispatch `after` executes from now
    /// (0 = the very next one) reports a device execution error.
    pub fn inject_execution_error(&self, after: u64) {
        *self.fail_execute_in.lock().unwrap() = Some(after);
    }

    /// Stall every execute by `delay`, simulating long-running kernels.
    pub fn set_execute_delay(&self, delay: Duration) {
        *self.execute_delay.lock().unwrap() = delay;
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl DeviceBackend for MockBackend {
    fn name(&self) -> String {
        "mock".to_string()
    }

    fn alloc(&self, word_count: usize) -> Result<StorageId> {
        if let Some(limit) = *self.alloc_limit_words.lock().unwrap() {
            if word_count > limit {
                return Err(DispatchError::AllocationFailed { words: word_count });
            }
        }
        let id = self.next_id();
        self.storage.lock().unwrap().insert(id, vec![0u32; word_count]);
        Ok(StorageId(id))
    }

    fn release(&self, storage: StorageId) {
        self.storage.lock().unwrap().remove(&storage.0);
    }

    fn write_words(&self, storage: StorageId, word_offset: usize, words: &[u32]) -> Result<()> {
        let mut map = self.storage.lock().unwrap();
        let dst = map
            .get_mut(&storage.0)
            .ok_or(DispatchError::UseAfterFree)?;
        dst[word_offset..word_offset + words.len()].copy_from_slice(words);
        Ok(())
    }

    fn read_words(
        &self,
        storage: StorageId,
        word_offset: usize,
        word_count: usize,
    ) -> Result<Vec<u32>> {
        let map = self.storage.lock().unwrap();
        let src = map.get(&storage.0).ok_or(DispatchError::UseAfterFree)?;
        Ok(src[word_offset..word_offset + word_count].to_vec())
    }

    fn compile(&self, source: &KernelSource) -> Result<PlanId> {
        let program = self
            .programs
            .lock()
            .unwrap()
            .get(&source.entry_point)
            .cloned()
            .ok_or_else(|| {
                DispatchError::ShaderCompilation(format!(
                    "entry point '{}' not found",
                    source.entry_point
                ))
            })?;
        let id = self.next_id();
        self.plans.lock().unwrap().insert(id, MockPlan { program });
        self.compile_count.fetch_add(1, Ordering::AcqRel);
        Ok(PlanId(id))
    }

    fn release_plan(&self, plan: PlanId) {
        self.plans.lock().unwrap().remove(&plan.0);
    }

    fn execute(
        &self,
        plan: PlanId,
        bindings: &[(u32, StorageId)],
        groups: (u32, u32, u32),
    ) -> Result<()> {
        let delay = *self.execute_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        self.execute_count.fetch_add(1, Ordering::AcqRel);

        {
            let mut armed = self.fail_execute_in.lock().unwrap();
            match *armed {
                Some(0) => {
                    *armed = None;
                    return Err(DispatchError::Execution(
                        "injected execution error".to_string(),
                    ));
                }
                Some(n) => *armed = Some(n - 1),
                None => {}
            }
        }

        let program = self
            .plans
            .lock()
            .unwrap()
            .get(&plan.0)
            .map(|p| p.program.clone())
            .ok_or_else(|| DispatchError::Execution("unknown plan".to_string()))?;

        // Snapshot bound storage in, run, write back.
        let mut dispatch = MockDispatch {
            groups,
            buffers: Vec::with_capacity(bindings.len()),
        };
        {
            let map = self.storage.lock().unwrap();
            for &(slot, storage) in bindings {
                let words = map
                    .get(&storage.0)
                    .ok_or(DispatchError::UseAfterFree)?
                    .clone();
                dispatch.buffers.push((slot, words));
            }
        }

        program(&mut dispatch);

        {
            let mut map = self.storage.lock().unwrap();
            for (i, &(_, storage)) in bindings.iter().enumerate() {
                let words = &dispatch.buffers[i].1;
                if let Some(dst) = map.get_mut(&storage.0) {
                    dst.clone_from(words);
                }
            }
        }
        Ok(())
    }
}
