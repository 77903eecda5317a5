//! Service metrics collection
//!
//! Counters for the coordinator's externally observable behaviour. Per-level
//! hit/miss/eviction counts live on the levels themselves; this collector
//! tracks the cross-level facts the single-flight and presign guarantees are
//! verified against.

use std::sync::atomic::{AtomicU64, Ordering};

/// Coordinator-wide counters.
#[derive(Debug, Default)]
pub struct ServiceMetrics {
    derivations: AtomicU64,
    derivation_failures: AtomicU64,
    store_fetches: AtomicU64,
    flight_joins: AtomicU64,
    uploads: AtomicU64,
    invalidations: AtomicU64,
    presigns_issued: AtomicU64,
    presigns_reused: AtomicU64,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_derivation(&self) {
        self.derivations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_derivation_failure(&self) {
        self.derivation_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A GET against the originals container.
    pub fn record_store_fetch(&self) {
        self.store_fetches.fetch_add(1, Ordering::Relaxed);
    }

    /// A resolve collapsed onto another request's in-flight derivation.
    pub fn record_flight_join(&self) {
        self.flight_joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self, entries: u64) {
        self.invalidations.fetch_add(entries, Ordering::Relaxed);
    }

    pub fn record_presign_issued(&self) {
        self.presigns_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_presign_reused(&self) {
        self.presigns_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn derivations(&self) -> u64 {
        self.derivations.load(Ordering::Relaxed)
    }

    pub fn store_fetches(&self) -> u64 {
        self.store_fetches.load(Ordering::Relaxed)
    }

    pub fn flight_joins(&self) -> u64 {
        self.flight_joins.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            derivations: self.derivations.load(Ordering::Relaxed),
            derivation_failures: self.derivation_failures.load(Ordering::Relaxed),
            store_fetches: self.store_fetches.load(Ordering::Relaxed),
            flight_joins: self.flight_joins.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            presigns_issued: self.presigns_issued.load(Ordering::Relaxed),
            presigns_reused: self.presigns_reused.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub derivations: u64,
    pub derivation_failures: u64,
    pub store_fetches: u64,
    pub flight_joins: u64,
    pub uploads: u64,
    pub invalidations: u64,
    pub presigns_issued: u64,
    pub presigns_reused: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = ServiceMetrics::new();
        metrics.record_derivation();
        metrics.record_derivation();
        metrics.record_store_fetch();
        metrics.record_flight_join();
        metrics.record_invalidation(3);

        let snap = metrics.snapshot();
        assert_eq!(snap.derivations, 2);
        assert_eq!(snap.store_fetches, 1);
        assert_eq!(snap.flight_joins, 1);
        assert_eq!(snap.invalidations, 3);
        assert_eq!(snap.uploads, 0);
    }
}
