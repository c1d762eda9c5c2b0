//! Submission ordering: reads observe earlier dispatches, completions
//! resolve FIFO, and writes to busy buffers are ordered rather than racing.

mod common;

use std::time::Duration;

use common::{copy_source, increment_source, mock_context, register_copy, register_increment};
use gpu_dispatch::ElementType;

#[test]
fn test_read_after_write_observes_dispatch() {
    let (backend, ctx) = mock_context();
    register_copy(&backend, "copy_u32");

    let input = ctx.create_buffer(ElementType::U32, 64).unwrap();
    let output = ctx.create_buffer(ElementType::U32, 64).unwrap();
    let data: Vec<u32> = (0..64).map(|i| i * 3 + 1).collect();
    input.write(&data, 0).unwrap();

    let kernel = ctx.create_kernel().unwrap();
    kernel
        .load_source(copy_source("copy_u32", ElementType::U32))
        .unwrap();
    kernel.bind(0, &input).unwrap();
    kernel.bind(1, &output).unwrap();

    // Read issued immediately after dispatch, without waiting on it first:
    // it must still observe the dispatch's effects.
    let _pending = kernel.dispatch(1, 1, 1).unwrap();
    let got = output.read::<u32>(64, 0).unwrap().wait().unwrap();
    assert_eq!(got, data);
}

#[test]
fn test_read_after_write_under_concurrent_unrelated_dispatches() {
    let (backend, ctx) = mock_context();
    register_copy(&backend, "copy_u32");
    register_increment(&backend, "increment_u32");
    backend.set_execute_delay(Duration::from_millis(5));

    let input = ctx.create_buffer(ElementType::U32, 16).unwrap();
    let output = ctx.create_buffer(ElementType::U32, 16).unwrap();
    let unrelated = ctx.create_buffer(ElementType::U32, 16).unwrap();
    let data: Vec<u32> = (100..116).collect();
    input.write(&data, 0).unwrap();

    let copy = ctx.create_kernel().unwrap();
    copy.load_source(copy_source("copy_u32", ElementType::U32))
        .unwrap();
    copy.bind(0, &input).unwrap();
    copy.bind(1, &output).unwrap();

    let noise = ctx.create_kernel().unwrap();
    noise
        .load_source(increment_source("increment_u32", ElementType::U32))
        .unwrap();
    noise.bind(0, &unrelated).unwrap();

    // Interleave unrelated dispatches around the copy.
    let _n1 = noise.dispatch(1, 1, 1).unwrap();
    let _pending = copy.dispatch(1, 1, 1).unwrap();
    let _n2 = noise.dispatch(1, 1, 1).unwrap();

    let got = output.read::<u32>(16, 0).unwrap().wait().unwrap();
    assert_eq!(got, data);
}

#[test]
fn test_completions_resolve_fifo() {
    let (backend, ctx) = mock_context();
    register_increment(&backend, "increment_u32");
    backend.set_execute_delay(Duration::from_millis(10));

    let buffer = ctx.create_buffer(ElementType::U32, 4).unwrap();
    let kernel = ctx.create_kernel().unwrap();
    kernel
        .load_source(increment_source("increment_u32", ElementType::U32))
        .unwrap();
    kernel.bind(0, &buffer).unwrap();

    let first = kernel.dispatch(1, 1, 1).unwrap();
    let second = kernel.dispatch(1, 1, 1).unwrap();
    let third = kernel.dispatch(1, 1, 1).unwrap();

    // When the last completes, everything submitted before it has resolved.
    third.wait().unwrap();
    assert!(first.is_resolved(), "first dispatch resolved after third");
    assert!(second.is_resolved(), "second dispatch resolved after third");
}

#[test]
fn test_write_to_busy_buffer_is_ordered() {
    let (backend, ctx) = mock_context();
    register_copy(&backend, "copy_u32");
    backend.set_execute_delay(Duration::from_millis(30));

    let input = ctx.create_buffer(ElementType::U32, 8).unwrap();
    let output = ctx.create_buffer(ElementType::U32, 8).unwrap();
    input.write(&[1u32; 8], 0).unwrap();

    let kernel = ctx.create_kernel().unwrap();
    kernel
        .load_source(copy_source("copy_u32", ElementType::U32))
        .unwrap();
    kernel.bind(0, &input).unwrap();
    kernel.bind(1, &output).unwrap();

    // Dispatch copies the ones; the overlapping write of twos is queued
    // behind it, so the copy sees the old contents and the final read sees
    // the new ones (last submitted wins).
    let pending = kernel.dispatch(1, 1, 1).unwrap();
    input.write(&[2u32; 8], 0).unwrap();

    pending.wait().unwrap();
    assert_eq!(
        output.read::<u32>(8, 0).unwrap().wait().unwrap(),
        vec![1u32; 8],
        "dispatch should have copied the pre-write contents"
    );
    assert_eq!(
        input.read::<u32>(8, 0).unwrap().wait().unwrap(),
        vec![2u32; 8],
        "queued write should land after the dispatch"
    );
}

#[test]
fn test_concurrent_dispatch_from_many_threads() {
    let (backend, ctx) = mock_context();
    register_increment(&backend, "increment_u32");

    let buffer = ctx.create_buffer(ElementType::U32, 1).unwrap();
    buffer.write(&[0u32], 0).unwrap();

    let kernel = ctx.create_kernel().unwrap();
    kernel
        .load_source(increment_source("increment_u32", ElementType::U32))
        .unwrap();
    kernel.bind(0, &buffer).unwrap();

    // Callers race; encoding is serialized, so every increment lands.
    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..10 {
                    kernel.dispatch(1, 1, 1).unwrap().wait().unwrap();
                }
            });
        }
    });

    assert_eq!(
        buffer.read::<u32>(1, 0).unwrap().wait().unwrap(),
        vec![80u32]
    );
}

#[test]
fn test_wait_timeout_is_caller_side_only() {
    let (backend, ctx) = mock_context();
    register_increment(&backend, "increment_u32");
    backend.set_execute_delay(Duration::from_millis(80));

    let buffer = ctx.create_buffer(ElementType::U32, 1).unwrap();
    let kernel = ctx.create_kernel().unwrap();
    kernel
        .load_source(increment_source("increment_u32", ElementType::U32))
        .unwrap();
    kernel.bind(0, &buffer).unwrap();

    let pending = kernel.dispatch(1, 1, 1).unwrap();
    // Deadline expires before the device finishes.
    let pending = match pending.wait_timeout(Duration::from_millis(5)) {
        Err(handle) => handle,
        Ok(_) => panic!("dispatch should not resolve within 5ms"),
    };
    // The dispatch was not cancelled and still resolves.
    pending.wait().unwrap();
    assert_eq!(
        buffer.read::<u32>(1, 0).unwrap().wait().unwrap(),
        vec![1u32]
    );
}
