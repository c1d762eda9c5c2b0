//! One-shot completion handles for submitted device work.
//!
//! Each submission gets a `(Completer, CompletionHandle)` pair around a
//! shared Mutex/Condvar slot. The scheduler resolves through the completer;
//! the caller blocks on the handle. Dropping the handle abandons the result
//! but never blocks resolution: the scheduler still resolves the slot and
//! releases the submission's resource holds when the device finishes.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::Result;

struct Slot<T> {
    value: Mutex<Option<Result<T>>>,
    cond: Condvar,
}

/// Resolver side, held by the scheduler.
pub(crate) struct Completer<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Completer<T> {
    /// Resolve the paired handle. Later calls on an already resolved slot
    /// are ignored (first resolution wins).
    pub(crate) fn resolve(&self, result: Result<T>) {
        let mut value = self.slot.value.lock().unwrap();
        if value.is_none() {
            *value = Some(result);
            self.slot.cond.notify_all();
        }
    }
}

/// Caller side of a pending submission.
///
/// Consuming `wait` blocks until the scheduler resolves the slot.
/// `wait_timeout` implements caller-side deadlines without disturbing the
/// runtime: on timeout the handle is returned so the caller can keep
/// waiting, and the underlying operation still runs to completion.
pub struct CompletionHandle<T> {
    slot: Arc<Slot<T>>,
}

impl<T> std::fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl<T> PartialEq for CompletionHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<T> CompletionHandle<T> {
    /// Block until resolved.
    pub fn wait(self) -> Result<T> {
        let mut value = self.slot.value.lock().unwrap();
        loop {
            if let Some(result) = value.take() {
                return result;
            }
            value = self.slot.cond.wait(value).unwrap();
        }
    }

    /// Take the result if already resolved, otherwise hand the handle back.
    pub fn try_wait(self) -> std::result::Result<Result<T>, Self> {
        {
            let mut value = self.slot.value.lock().unwrap();
            if let Some(result) = value.take() {
                return Ok(result);
            }
        }
        Err(self)
    }

    /// Wait up to `timeout`. On expiry the handle is returned unresolved;
    /// this is a caller-side deadline only and does not cancel or release
    /// anything inside the runtime.
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<Result<T>, Self> {
        {
            let mut value = self.slot.value.lock().unwrap();
            let deadline = std::time::Instant::now() + timeout;
            loop {
                if let Some(result) = value.take() {
                    return Ok(result);
                }
                let now = std::time::Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, timed_out) = self
                    .slot
                    .cond
                    .wait_timeout(value, deadline - now)
                    .unwrap();
                value = guard;
                if timed_out.timed_out() {
                    if let Some(result) = value.take() {
                        return Ok(result);
                    }
                    break;
                }
            }
        }
        Err(self)
    }

    /// Whether the scheduler has resolved this submission yet.
    pub fn is_resolved(&self) -> bool {
        self.slot.value.lock().unwrap().is_some()
    }
}

/// Create a linked resolver/handle pair.
pub(crate) fn completion_pair<T>() -> (Completer<T>, CompletionHandle<T>) {
    let slot = Arc::new(Slot {
        value: Mutex::new(None),
        cond: Condvar::new(),
    });
    (
        Completer { slot: slot.clone() },
        CompletionHandle { slot },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;

    #[test]
    fn test_resolve_then_wait() {
        let (tx, rx) = completion_pair::<u32>();
        tx.resolve(Ok(7));
        assert_eq!(rx.wait().unwrap(), 7);
    }

    #[test]
    fn test_wait_blocks_until_resolved() {
        let (tx, rx) = completion_pair::<u32>();
        let waiter = std::thread::spawn(move || rx.wait());
        std::thread::sleep(Duration::from_millis(20));
        tx.resolve(Ok(99));
        assert_eq!(waiter.join().unwrap().unwrap(), 99);
    }

    #[test]
    fn test_try_wait_unresolved() {
        let (tx, rx) = completion_pair::<u32>();
        let rx = match rx.try_wait() {
            Err(rx) => rx,
            Ok(_) => panic!("slot should not be resolved yet"),
        };
        tx.resolve(Err(DispatchError::UseAfterFree));
        assert_eq!(rx.wait(), Err(DispatchError::UseAfterFree));
    }

    #[test]
    fn test_wait_timeout_expires_and_recovers() {
        let (tx, rx) = completion_pair::<u32>();
        let rx = match rx.wait_timeout(Duration::from_millis(10)) {
            Err(rx) => rx,
            Ok(_) => panic!("should time out"),
        };
        tx.resolve(Ok(1));
        assert_eq!(rx.wait().unwrap(), 1);
    }

    #[test]
    fn test_first_resolution_wins() {
        let (tx, rx) = completion_pair::<u32>();
        tx.resolve(Ok(1));
        tx.resolve(Ok(2));
        assert_eq!(rx.wait().unwrap(), 1);
    }

    #[test]
    fn test_abandoned_handle_resolution_is_safe() {
        let (tx, rx) = completion_pair::<u32>();
        drop(rx);
        tx.resolve(Ok(5));
    }
}
