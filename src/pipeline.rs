//! Compiled-plan cache key and per-kernel cache bookkeeping.
//!
//! A plan is valid for exactly one combination of kernel source and ordered
//! binding identities. The key hashes the source text but keeps the binding
//! sequence verbatim: `(slot, buffer id, element type)` in declared-slot
//! order. That makes the three rebind cases cheap to distinguish:
//!
//! - same handle rebound to the same slot: key unchanged, cache hit
//! - different handle, same slot: key differs, rebuild
//! - same handle, different slot: key differs, rebuild
//!
//! Element types ride along so a type-changing rebind can never alias a
//! stale plan, and the full ordered sequence keys slot count and order.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::backend::PlanId;
use crate::types::{BufferId, ElementType, KernelSource};

/// Content hash of kernel source: entry point plus program text.
pub(crate) fn source_hash(source: &KernelSource) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.entry_point.hash(&mut hasher);
    source.text.hash(&mut hasher);
    hasher.finish()
}

/// Identity of a compiled plan: source content plus the exact ordered
/// binding set it was built against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlanKey {
    pub source_hash: u64,
    pub bindings: Vec<(u32, BufferId, ElementType)>,
}

/// A cached compiled plan and the key it was built under.
#[derive(Debug, Clone)]
pub(crate) struct CachedPlan {
    pub key: PlanKey,
    pub plan: PlanId,
}

/// Per-kernel cache counters, exposed for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Dispatches that reused the cached plan.
    pub hits: u64,
    /// Dispatches that found no usable cached plan.
    pub misses: u64,
    /// Plans compiled (equals misses unless compilation failed).
    pub compiles: u64,
    /// Explicit invalidations from source or binding changes.
    pub invalidations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SlotDecl;

    fn src(text: &str) -> KernelSource {
        KernelSource::new(
            "main",
            text,
            vec![SlotDecl {
                slot: 0,
                element_type: ElementType::U32,
            }],
        )
    }

    #[test]
    fn test_source_hash_stable_and_content_sensitive() {
        let a = src("kernel A");
        assert_eq!(source_hash(&a), source_hash(&a));
        assert_ne!(source_hash(&a), source_hash(&src("kernel B")));

        // Entry point participates in the hash.
        let mut renamed = src("kernel A");
        renamed.entry_point = "other".into();
        assert_ne!(source_hash(&a), source_hash(&renamed));
    }

    #[test]
    fn test_key_same_handle_same_slot_matches() {
        let h = source_hash(&src("k"));
        let a = PlanKey {
            source_hash: h,
            bindings: vec![(0, BufferId(1), ElementType::F32)],
        };
        let b = PlanKey {
            source_hash: h,
            bindings: vec![(0, BufferId(1), ElementType::F32)],
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_different_handle_same_slot_differs() {
        let h = source_hash(&src("k"));
        let a = PlanKey {
            source_hash: h,
            bindings: vec![(0, BufferId(1), ElementType::F32)],
        };
        let b = PlanKey {
            source_hash: h,
            bindings: vec![(0, BufferId(2), ElementType::F32)],
        };
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_same_handle_different_slot_differs() {
        let h = source_hash(&src("k"));
        let a = PlanKey {
            source_hash: h,
            bindings: vec![(0, BufferId(1), ElementType::F32), (1, BufferId(2), ElementType::F32)],
        };
        // Ping-pong swap: identical handle set, swapped slots.
        let b = PlanKey {
            source_hash: h,
            bindings: vec![(0, BufferId(2), ElementType::F32), (1, BufferId(1), ElementType::F32)],
        };
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_slot_count_differs() {
        let h = source_hash(&src("k"));
        let a = PlanKey {
            source_hash: h,
            bindings: vec![(0, BufferId(1), ElementType::F32)],
        };
        let b = PlanKey {
            source_hash: h,
            bindings: vec![(0, BufferId(1), ElementType::F32), (1, BufferId(2), ElementType::F32)],
        };
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_element_type_differs() {
        let h = source_hash(&src("k"));
        let a = PlanKey {
            source_hash: h,
            bindings: vec![(0, BufferId(1), ElementType::F32)],
        };
        let b = PlanKey {
            source_hash: h,
            bindings: vec![(0, BufferId(1), ElementType::U32)],
        };
        assert_ne!(a, b);
    }
}
