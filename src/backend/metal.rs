//! Metal device backend.
//!
//! One `MTLDevice` + `MTLCommandQueue` pair, storage as `StorageModeShared`
//! buffers, and kernel source compiled at runtime through
//! `newLibraryWithSource`. `execute` encodes a single compute pass, commits,
//! and blocks on `waitUntilCompleted`, reporting the command buffer status
//! so the scheduler can distinguish success from device-level failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::NSString;
use objc2_metal::{
    MTLBuffer, MTLCommandBuffer, MTLCommandBufferStatus, MTLCommandEncoder, MTLCommandQueue,
    MTLComputeCommandEncoder, MTLComputePipelineState, MTLCreateSystemDefaultDevice, MTLDevice,
    MTLLibrary, MTLResourceOptions, MTLSize,
};

use crate::backend::{DeviceBackend, PlanId, StorageId};
use crate::error::{DispatchError, Result};
use crate::types::KernelSource;

/// Metal implementation of the device boundary.
pub struct MetalBackend {
    device: Retained<ProtocolObject<dyn MTLDevice>>,
    queue: Retained<ProtocolObject<dyn MTLCommandQueue>>,
    buffers: Mutex<HashMap<u64, Retained<ProtocolObject<dyn MTLBuffer>>>>,
    plans: Mutex<HashMap<u64, Retained<ProtocolObject<dyn MTLComputePipelineState>>>>,
    next_id: AtomicU64,
}

// SAFETY: Metal objects are reference-counted Objective-C objects, thread-safe
// for retain/release. Devices, command queues, buffers, and pipeline states
// are documented as safe to use from any thread; encoding happens only on the
// submission thread.
unsafe impl Send for MetalBackend {}
unsafe impl Sync for MetalBackend {}

impl MetalBackend {
    /// Acquire the system default device and create a command queue.
    pub fn new() -> Result<Self> {
        let device = MTLCreateSystemDefaultDevice()
            .ok_or_else(|| DispatchError::DeviceLost("no Metal device available".into()))?;
        let queue = device
            .newCommandQueue()
            .ok_or_else(|| DispatchError::DeviceLost("failed to create command queue".into()))?;
        Ok(Self {
            device,
            queue,
            buffers: Mutex::new(HashMap::new()),
            plans: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn buffer(&self, storage: StorageId) -> Result<Retained<ProtocolObject<dyn MTLBuffer>>> {
        self.buffers
            .lock()
            .unwrap()
            .get(&storage.0)
            .cloned()
            .ok_or(DispatchError::UseAfterFree)
    }
}

impl DeviceBackend for MetalBackend {
    fn name(&self) -> String {
        self.device.name().to_string()
    }

    fn alloc(&self, word_count: usize) -> Result<StorageId> {
        // Metal rejects zero-length buffers; keep one word backing empties.
        let byte_len = word_count.max(1) * 4;
        let options = MTLResourceOptions::StorageModeShared;
        let buffer = self
            .device
            .newBufferWithLength_options(byte_len, options)
            .ok_or(DispatchError::AllocationFailed { words: word_count })?;

        let id = self.next_id();
        self.buffers.lock().unwrap().insert(id, buffer);
        Ok(StorageId(id))
    }

    fn release(&self, storage: StorageId) {
        self.buffers.lock().unwrap().remove(&storage.0);
    }

    fn write_words(&self, storage: StorageId, word_offset: usize, words: &[u32]) -> Result<()> {
        let buffer = self.buffer(storage)?;
        unsafe {
            let ptr = (buffer.contents().as_ptr() as *mut u32).add(word_offset);
            std::ptr::copy_nonoverlapping(words.as_ptr(), ptr, words.len());
        }
        Ok(())
    }

    fn read_words(
        &self,
        storage: StorageId,
        word_offset: usize,
        word_count: usize,
    ) -> Result<Vec<u32>> {
        let buffer = self.buffer(storage)?;
        unsafe {
            let ptr = (buffer.contents().as_ptr() as *const u32).add(word_offset);
            let slice = std::slice::from_raw_parts(ptr, word_count);
            Ok(slice.to_vec())
        }
    }

    fn compile(&self, source: &KernelSource) -> Result<PlanId> {
        let ns_source = NSString::from_str(&source.text);
        let library = self
            .device
            .newLibraryWithSource_options_error(&ns_source, None)
            .map_err(|e| DispatchError::ShaderCompilation(format!("{}", e)))?;

        let fn_name = NSString::from_str(&source.entry_point);
        #[allow(deprecated)]
        let function = library.newFunctionWithName(&fn_name).ok_or_else(|| {
            DispatchError::ShaderCompilation(format!(
                "entry point '{}' not found",
                source.entry_point
            ))
        })?;

        let pso = self
            .device
            .newComputePipelineStateWithFunction_error(&function)
            .map_err(|e| DispatchError::ShaderCompilation(format!("{}", e)))?;

        let id = self.next_id();
        self.plans.lock().unwrap().insert(id, pso);
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
        let pso = self
            .plans
            .lock()
            .unwrap()
            .get(&plan.0)
            .cloned()
            .ok_or_else(|| DispatchError::Execution("unknown plan".into()))?;
        let bound: Vec<_> = bindings
            .iter()
            .map(|&(slot, storage)| self.buffer(storage).map(|b| (slot, b)))
            .collect::<Result<_>>()?;

        let cmd = self
            .queue
            .commandBuffer()
            .ok_or_else(|| DispatchError::DeviceLost("command buffer creation failed".into()))?;
        let encoder = cmd
            .computeCommandEncoder()
            .ok_or_else(|| DispatchError::DeviceLost("compute encoder creation failed".into()))?;

        encoder.setComputePipelineState(&pso);
        unsafe {
            for (slot, buffer) in &bound {
                encoder.setBuffer_offset_atIndex(Some(&**buffer), 0, *slot as usize);
            }
        }

        let width = pso.maxTotalThreadsPerThreadgroup().min(256);
        let grid = MTLSize {
            width: groups.0 as usize,
            height: groups.1 as usize,
            depth: groups.2 as usize,
        };
        let tg = MTLSize {
            width,
            height: 1,
            depth: 1,
        };
        encoder.dispatchThreadgroups_threadsPerThreadgroup(grid, tg);
        encoder.endEncoding();

        cmd.commit();
        cmd.waitUntilCompleted();

        if cmd.status() == MTLCommandBufferStatus::Error {
            let msg = unsafe { cmd.error() }
                .map(|e| e.localizedDescription().to_string())
                .unwrap_or_else(|| "command buffer failed".into());
            return Err(DispatchError::Execution(msg));
        }
        Ok(())
    }
}
