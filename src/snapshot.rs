//! # Snapshot Cache
//!
//! Last-observed `(owner, guard)` per claim record plus the membership set
//! each partition had on its previous scan. Entries are created on first
//! sighting, replaced on change, and pruned when a record disappears from
//! its partition or the partition unloads. Nothing here is persisted; a cold
//! cache is always safe because the bootstrap pass re-establishes the
//! invariants on load.
//!
//! Both maps are sharded concurrent maps: scans of different partitions
//! touch disjoint keys and never wait on a global lock.

use crate::model::{GuardId, OwnerId, PartitionKey, RecordKey};
use dashmap::DashMap;
use rustc_hash::FxHashSet;

/// Cached last observation of one claim record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub owner: Option<OwnerId>,
    pub guard: Option<GuardId>,
    pub partition: PartitionKey,
}

pub type Membership = FxHashSet<RecordKey>;

#[derive(Debug, Default)]
pub struct SnapshotCache {
    records: DashMap<RecordKey, Snapshot>,
    members: DashMap<PartitionKey, Membership>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, record: RecordKey) -> Option<Snapshot> {
        self.records.get(&record).map(|entry| *entry)
    }

    pub fn put(&self, record: RecordKey, snapshot: Snapshot) {
        self.records.insert(record, snapshot);
    }

    pub fn remove(&self, record: RecordKey) -> Option<Snapshot> {
        self.records.remove(&record).map(|(_, snapshot)| snapshot)
    }

    /// Remove a record's snapshot only if it was taken in `partition`. An
    /// identity reused elsewhere keeps its newer snapshot.
    pub fn remove_from(&self, record: RecordKey, partition: PartitionKey) -> Option<Snapshot> {
        self.records
            .remove_if(&record, |_, snapshot| snapshot.partition == partition)
            .map(|(_, snapshot)| snapshot)
    }

    /// Install this pass's membership for a partition and return the
    /// previous pass's, in one map operation.
    pub fn replace_membership(
        &self,
        partition: PartitionKey,
        seen: Membership,
    ) -> Option<Membership> {
        self.members.insert(partition, seen)
    }

    /// Drop everything cached for an unloaded partition. Returns the number
    /// of record snapshots pruned.
    pub fn forget_partition(&self, partition: PartitionKey) -> usize {
        self.members.remove(&partition);
        // Scan by partition tag rather than by membership: a scan interrupted
        // before committing its membership set still leaves snapshots behind.
        let mut pruned = 0;
        self.records.retain(|_, snap| {
            let keep = snap.partition != partition;
            if !keep {
                pruned += 1;
            }
            keep
        });
        pruned
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn partition_count(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(partition: u64) -> Snapshot {
        Snapshot {
            owner: Some(OwnerId::random()),
            guard: None,
            partition: PartitionKey(partition),
        }
    }

    #[test]
    fn replace_membership_returns_previous_pass() {
        let cache = SnapshotCache::new();
        let first: Membership = [RecordKey(1), RecordKey(2)].into_iter().collect();
        assert!(cache.replace_membership(PartitionKey(7), first.clone()).is_none());

        let second: Membership = [RecordKey(2)].into_iter().collect();
        let previous = cache.replace_membership(PartitionKey(7), second).unwrap();
        assert_eq!(previous, first);
    }

    #[test]
    fn forget_partition_leaves_other_partitions_alone() {
        let cache = SnapshotCache::new();
        cache.put(RecordKey(1), snap(1));
        cache.put(RecordKey(2), snap(1));
        cache.put(RecordKey(3), snap(2));
        cache.replace_membership(PartitionKey(1), [RecordKey(1)].into_iter().collect());
        cache.replace_membership(PartitionKey(2), [RecordKey(3)].into_iter().collect());

        assert_eq!(cache.forget_partition(PartitionKey(1)), 2);
        assert!(cache.get(RecordKey(1)).is_none());
        assert!(cache.get(RecordKey(2)).is_none());
        assert!(cache.get(RecordKey(3)).is_some());
        assert_eq!(cache.partition_count(), 1);
    }

    #[test]
    fn remove_from_ignores_snapshots_taken_elsewhere() {
        let cache = SnapshotCache::new();
        cache.put(RecordKey(4), snap(2));
        assert!(cache.remove_from(RecordKey(4), PartitionKey(1)).is_none());
        assert!(cache.get(RecordKey(4)).is_some());
        assert!(cache.remove_from(RecordKey(4), PartitionKey(2)).is_some());
        assert_eq!(cache.record_count(), 0);
    }
}
