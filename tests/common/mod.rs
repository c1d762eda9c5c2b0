//! Shared helpers for the integration suites: a mock-backed context and the
//! small set of test programs the suites dispatch.
#![allow(dead_code)]

use std::sync::Arc;

use gpu_dispatch::{DeviceContext, ElementType, KernelSource, MockBackend, SlotDecl};

/// A context over a fresh mock backend, returning both so tests can reach
/// the backend's counters and fault injection.
pub fn mock_context() -> (Arc<MockBackend>, DeviceContext) {
    let backend = Arc::new(MockBackend::new());
    let ctx = DeviceContext::init(backend.clone()).expect("context init");
    (backend, ctx)
}

/// Source for a two-slot copy kernel: slot 0 -> slot 1, same element type.
pub fn copy_source(entry: &str, ty: ElementType) -> KernelSource {
    KernelSource::new(
        entry,
        format!("kernel {}: copy slot 0 to slot 1", entry),
        vec![
            SlotDecl {
                slot: 0,
                element_type: ty,
            },
            SlotDecl {
                slot: 1,
                element_type: ty,
            },
        ],
    )
}

/// Register the word-level copy program behind `entry`.
pub fn register_copy(backend: &MockBackend, entry: &str) {
    backend.register_program(entry, |d| {
        let input = d.slot(0).to_vec();
        let out = d.slot_mut(1);
        let n = input.len().min(out.len());
        out[..n].copy_from_slice(&input[..n]);
    });
}

/// Register a program that adds 1 to every word of slot 0 in place.
#[allow(dead_code)]
pub fn register_increment(backend: &MockBackend, entry: &str) {
    backend.register_program(entry, |d| {
        for word in d.slot_mut(0).iter_mut() {
            *word = word.wrapping_add(1);
        }
    });
}

/// Source for the one-slot increment kernel.
#[allow(dead_code)]
pub fn increment_source(entry: &str, ty: ElementType) -> KernelSource {
    KernelSource::new(
        entry,
        format!("kernel {}: increment slot 0 in place", entry),
        vec![SlotDecl {
            slot: 0,
            element_type: ty,
        }],
    )
}
