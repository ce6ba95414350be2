//! Cumulative reconciler counters.
//!
//! Updated with relaxed atomics from scan threads and the owning context;
//! read as a point-in-time [`MetricsSnapshot`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ReconcilerMetrics {
    pub scans: AtomicU64,
    pub scans_throttled: AtomicU64,
    pub scans_not_ready: AtomicU64,
    pub records_observed: AtomicU64,
    pub records_removed: AtomicU64,
    pub degraded_first_seen: AtomicU64,
    pub creation_requests: AtomicU64,
    pub removal_requests: AtomicU64,
    pub link_clear_requests: AtomicU64,
    pub flushes: AtomicU64,
    pub flushes_deferred: AtomicU64,
    pub flush_failures: AtomicU64,
    pub guards_created: AtomicU64,
    pub guards_removed: AtomicU64,
    pub guards_repaired: AtomicU64,
    pub links_cleared: AtomicU64,
    pub links_adopted: AtomicU64,
    pub stale_dropped: AtomicU64,
    pub host_errors: AtomicU64,
    pub bootstrap_passes: AtomicU64,
}

impl ReconcilerMetrics {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        if value > 0 {
            counter.fetch_add(value, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            scans: load(&self.scans),
            scans_throttled: load(&self.scans_throttled),
            scans_not_ready: load(&self.scans_not_ready),
            records_observed: load(&self.records_observed),
            records_removed: load(&self.records_removed),
            degraded_first_seen: load(&self.degraded_first_seen),
            creation_requests: load(&self.creation_requests),
            removal_requests: load(&self.removal_requests),
            link_clear_requests: load(&self.link_clear_requests),
            flushes: load(&self.flushes),
            flushes_deferred: load(&self.flushes_deferred),
            flush_failures: load(&self.flush_failures),
            guards_created: load(&self.guards_created),
            guards_removed: load(&self.guards_removed),
            guards_repaired: load(&self.guards_repaired),
            links_cleared: load(&self.links_cleared),
            links_adopted: load(&self.links_adopted),
            stale_dropped: load(&self.stale_dropped),
            host_errors: load(&self.host_errors),
            bootstrap_passes: load(&self.bootstrap_passes),
        }
    }
}

/// Point-in-time copy of [`ReconcilerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub scans: u64,
    pub scans_throttled: u64,
    pub scans_not_ready: u64,
    pub records_observed: u64,
    pub records_removed: u64,
    pub degraded_first_seen: u64,
    pub creation_requests: u64,
    pub removal_requests: u64,
    pub link_clear_requests: u64,
    pub flushes: u64,
    pub flushes_deferred: u64,
    pub flush_failures: u64,
    pub guards_created: u64,
    pub guards_removed: u64,
    pub guards_repaired: u64,
    pub links_cleared: u64,
    pub links_adopted: u64,
    pub stale_dropped: u64,
    pub host_errors: u64,
    pub bootstrap_passes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = ReconcilerMetrics::default();
        ReconcilerMetrics::bump(&metrics.scans);
        ReconcilerMetrics::bump(&metrics.scans);
        ReconcilerMetrics::add(&metrics.guards_created, 3);
        let snap = metrics.snapshot();
        assert_eq!(snap.scans, 2);
        assert_eq!(snap.guards_created, 3);
        assert_eq!(snap.flushes, 0);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let snap = MetricsSnapshot {
            flushes: 4,
            ..MetricsSnapshot::default()
        };
        let json = serde_json::to_value(snap).unwrap();
        assert_eq!(json["flushes"], 4);
    }
}
