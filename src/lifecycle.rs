//! # Guard Lifecycle Manager
//!
//! Executes queued requests against the guard store. Runs only on the
//! owning context, inside a flush that holds the single-flight permit, so
//! nothing here needs locking.
//!
//! Every request re-validates against current state before acting. A request
//! whose precondition no longer holds is dropped, not retried: the scan that
//! produced it has been overtaken by events and a later scan (or the
//! bootstrap pass) will produce whatever is needed now.

use crate::config::ReconcilerConfig;
use crate::host::{CapabilityProvider, ClaimStore, GuardStore};
use crate::metrics::ReconcilerMetrics;
use crate::model::{BlockPos, GuardId, GuardMarker, GuardSpec, Link, OwnerId, RecordKey};
use crate::queue::{CreateRequest, DeferredQueue};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// The guard capability was missing; every creation stayed queued.
    pub creates_deferred: bool,
    pub created: usize,
    /// Creation skipped because a live guard was already linked.
    pub already_guarded: usize,
    pub stale_dropped: usize,
    pub removed: usize,
    /// Removal target didn't resolve (already gone or unloaded).
    pub removal_missing: usize,
    pub links_cleared: usize,
    pub errors: usize,
}

impl FlushReport {
    pub fn is_noop(&self) -> bool {
        *self == FlushReport::default()
    }
}

/// Spawns guards and links them to their claim records.
#[derive(Debug, Clone)]
pub struct GuardFactory {
    suppression_id: String,
    marker: GuardMarker,
}

impl GuardFactory {
    pub fn new(config: &ReconcilerConfig) -> Self {
        Self {
            suppression_id: config.suppression_id.clone(),
            marker: GuardMarker::new(config.marker_prefix.clone()),
        }
    }

    pub fn marker(&self) -> &GuardMarker {
        &self.marker
    }

    pub fn suppression_id(&self) -> &str {
        &self.suppression_id
    }

    /// Spawn a guard for `owner` at the centre of `block` and link it to
    /// `record`. If the link can't be written the guard is destroyed again,
    /// so a failure never leaves an unlinked guard behind.
    pub fn spawn_linked(
        &self,
        claims: &dyn ClaimStore,
        guards: &dyn GuardStore,
        record: RecordKey,
        owner: OwnerId,
        block: BlockPos,
    ) -> anyhow::Result<GuardId> {
        let guard = guards.spawn(GuardSpec {
            position: block.center(),
            suppression_id: self.suppression_id.clone(),
            marker: self.marker.for_owner(owner),
        })?;

        if let Err(err) = claims.write_link(record, Link::new(owner, guard)) {
            if let Some(handle) = guards.resolve(guard) {
                if let Err(rollback) = guards.despawn(handle) {
                    warn!(
                        %guard,
                        error = %rollback,
                        "rollback despawn failed; sweep will collect it"
                    );
                }
            }
            return Err(err.context(format!("linking {guard} to {record}")));
        }
        Ok(guard)
    }
}

pub struct GuardLifecycle {
    config: Arc<ReconcilerConfig>,
    factory: GuardFactory,
    metrics: Arc<ReconcilerMetrics>,
}

impl GuardLifecycle {
    pub fn new(config: Arc<ReconcilerConfig>, metrics: Arc<ReconcilerMetrics>) -> Self {
        Self {
            factory: GuardFactory::new(&config),
            config,
            metrics,
        }
    }

    /// Drain the queues once. Requests pushed while this runs are left for
    /// the next flush.
    #[instrument(skip_all, level = "debug")]
    pub fn flush(
        &self,
        queue: &DeferredQueue,
        claims: &dyn ClaimStore,
        guards: &dyn GuardStore,
        capability: &dyn CapabilityProvider,
    ) -> FlushReport {
        let mut report = FlushReport::default();
        let stats = queue.stats();

        if capability.guard_capability_available() {
            for _ in 0..self.budget(stats.pending_creates) {
                let Some(request) = queue.pop_create() else {
                    break;
                };
                self.create_one(request, claims, guards, &mut report);
            }
        } else if stats.pending_creates > 0 {
            // The capability gate is global: defer the whole batch.
            report.creates_deferred = true;
            ReconcilerMetrics::bump(&self.metrics.flushes_deferred);
            debug!(
                pending = stats.pending_creates,
                "guard capability unavailable, creations stay queued"
            );
        }

        for _ in 0..self.budget(stats.pending_removals) {
            let Some(request) = queue.pop_removal() else {
                break;
            };
            match guards.resolve(request.guard) {
                Some(handle) => match guards.despawn(handle) {
                    Ok(()) => {
                        report.removed += 1;
                        debug!(guard = %request.guard, "guard removed");
                    }
                    Err(err) => {
                        report.errors += 1;
                        warn!(guard = %request.guard, error = %err, "failed to remove guard");
                    }
                },
                None => report.removal_missing += 1,
            }
        }

        for _ in 0..self.budget(stats.pending_link_clears) {
            let Some(request) = queue.pop_link_clear() else {
                break;
            };
            let Some(view) = claims.claim(request.record) else {
                report.stale_dropped += 1;
                continue;
            };
            if view.owner.is_some() || view.link.is_none() {
                // Reclaimed since, or already clear.
                report.stale_dropped += 1;
                continue;
            }
            match claims.clear_link(request.record) {
                Ok(()) => report.links_cleared += 1,
                Err(err) => {
                    report.errors += 1;
                    warn!(record = %request.record, error = %err, "failed to clear link");
                }
            }
        }

        self.record(&report);
        if report.created > 0 || report.removed > 0 || report.links_cleared > 0 {
            info!(
                created = report.created,
                removed = report.removed,
                links_cleared = report.links_cleared,
                stale = report.stale_dropped,
                "flushed deferred guard mutations"
            );
        }
        report
    }

    fn budget(&self, pending: usize) -> usize {
        match self.config.max_flush_batch {
            0 => pending,
            max => pending.min(max),
        }
    }

    fn create_one(
        &self,
        request: CreateRequest,
        claims: &dyn ClaimStore,
        guards: &dyn GuardStore,
        report: &mut FlushReport,
    ) {
        let Some(view) = claims.claim(request.record) else {
            report.stale_dropped += 1;
            return;
        };
        if view.owner != Some(request.owner) {
            report.stale_dropped += 1;
            debug!(record = %request.record, "owner changed before flush, dropping creation");
            return;
        }
        if let Some(existing) = view.linked_guard() {
            if request.replaces != Some(existing) && guards.resolve(existing).is_some() {
                report.already_guarded += 1;
                return;
            }
        }
        let Some(position) = view.position else {
            report.stale_dropped += 1;
            return;
        };

        let created =
            self.factory
                .spawn_linked(claims, guards, request.record, request.owner, position);
        let guard = match created {
            Ok(guard) => guard,
            Err(err) => {
                report.errors += 1;
                warn!(record = %request.record, error = %err, "failed to create guard");
                return;
            }
        };

        report.created += 1;
        info!(
            event = "creation",
            record = %request.record,
            partition = %request.partition,
            owner = %request.owner,
            %guard,
            position = %position,
            "guard created"
        );
    }

    fn record(&self, report: &FlushReport) {
        let m = &self.metrics;
        ReconcilerMetrics::add(&m.guards_created, report.created as u64);
        ReconcilerMetrics::add(&m.guards_removed, report.removed as u64);
        ReconcilerMetrics::add(&m.links_cleared, report.links_cleared as u64);
        ReconcilerMetrics::add(&m.stale_dropped, report.stale_dropped as u64);
        ReconcilerMetrics::add(&m.host_errors, report.errors as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PartitionKey;
    use crate::queue::{LinkClearRequest, RemovalRequest};
    use crate::test_support::{MemoryWorld, RawGuard};

    struct Fixture {
        world: MemoryWorld,
        queue: DeferredQueue,
        lifecycle: GuardLifecycle,
        marker: GuardMarker,
    }

    fn fixture(config: ReconcilerConfig) -> Fixture {
        let marker = GuardMarker::new(config.marker_prefix.clone());
        Fixture {
            world: MemoryWorld::new(),
            queue: DeferredQueue::new(),
            lifecycle: GuardLifecycle::new(
                Arc::new(config),
                Arc::new(ReconcilerMetrics::default()),
            ),
            marker,
        }
    }

    impl Fixture {
        fn flush(&self) -> FlushReport {
            self.lifecycle
                .flush(&self.queue, &self.world, &self.world, &self.world)
        }

        fn request(&self, record: crate::model::RecordKey, owner: OwnerId) -> CreateRequest {
            CreateRequest {
                record,
                owner,
                partition: self.world.record(record).unwrap().partition,
                replaces: None,
            }
        }
    }

    #[test]
    fn creation_spawns_at_block_centre_and_links() {
        let f = fixture(ReconcilerConfig::default());
        let owner = OwnerId::random();
        let pos = BlockPos::new(5, 64, 9);
        let record = f.world.add_claim(pos, Some(owner));
        f.queue.push_create(f.request(record, owner));

        let report = f.flush();
        assert_eq!(report.created, 1);

        let guards = f.world.guards_at(pos, &f.marker);
        assert_eq!(guards.len(), 1);
        assert_eq!(guards[0].position, Some(pos.center()));
        assert_eq!(guards[0].marker.as_deref(), Some(f.marker.for_owner(owner).as_str()));
        let link = f.world.record(record).unwrap().link.unwrap();
        assert_eq!(link, Link::new(owner, guards[0].id.unwrap()));
    }

    #[test]
    fn creation_for_a_superseded_owner_is_dropped() {
        let f = fixture(ReconcilerConfig::default());
        let (a, b) = (OwnerId::random(), OwnerId::random());
        let record = f.world.add_claim(BlockPos::new(1, 1, 1), Some(a));
        f.queue.push_create(f.request(record, a));
        f.world.set_owner(record, Some(b));

        let report = f.flush();
        assert_eq!(report.created, 0);
        assert_eq!(report.stale_dropped, 1);
        assert_eq!(f.world.spawn_count(), 0);
    }

    #[test]
    fn creation_is_skipped_when_a_live_guard_is_linked() {
        let f = fixture(ReconcilerConfig::default());
        let owner = OwnerId::random();
        let record = f.world.add_claim(BlockPos::new(2, 2, 2), Some(owner));
        f.queue.push_create(f.request(record, owner));
        f.queue.push_create(f.request(record, owner));

        let report = f.flush();
        assert_eq!(report.created, 1);
        assert_eq!(report.already_guarded, 1);
    }

    #[test]
    fn replacement_ignores_the_guard_it_replaces() {
        let f = fixture(ReconcilerConfig::default());
        let (a, b) = (OwnerId::random(), OwnerId::random());
        let pos = BlockPos::new(3, 3, 3);
        let record = f.world.add_claim(pos, Some(b));
        let partition = f.world.record(record).unwrap().partition;
        let raw = RawGuard::ours(pos, a, &f.marker);
        let old = raw.id.unwrap();
        f.world.insert_guard(partition, raw);
        f.world.set_link(record, Some(Link::new(a, old)));

        f.queue.push_removal(RemovalRequest { guard: old });
        f.queue.push_create(CreateRequest {
            replaces: Some(old),
            ..f.request(record, b)
        });
        let report = f.flush();
        assert_eq!((report.created, report.removed), (1, 1));
        assert!(f.world.quiescence_violations(&f.marker).is_empty());
    }

    #[test]
    fn missing_capability_defers_creations_only() {
        let f = fixture(ReconcilerConfig::default());
        let owner = OwnerId::random();
        let record = f.world.add_claim(BlockPos::new(4, 4, 4), Some(owner));
        f.world.set_capability(false);
        f.queue.push_create(f.request(record, owner));
        f.queue.push_removal(RemovalRequest {
            guard: GuardId::random(),
        });

        let report = f.flush();
        assert!(report.creates_deferred);
        assert_eq!(report.removal_missing, 1);
        assert_eq!(f.queue.stats().pending_creates, 1);

        f.world.set_capability(true);
        assert_eq!(f.flush().created, 1);
    }

    #[test]
    fn failed_link_write_rolls_the_guard_back() {
        let f = fixture(ReconcilerConfig::default());
        let owner = OwnerId::random();
        let pos = BlockPos::new(6, 6, 6);
        let record = f.world.add_claim(pos, Some(owner));
        f.world.fail_link_writes(true);
        f.queue.push_create(f.request(record, owner));

        let report = f.flush();
        assert_eq!(report.created, 0);
        assert_eq!(report.errors, 1);
        assert_eq!(f.world.spawn_count(), 1);
        assert_eq!(f.world.despawn_count(), 1);
        assert!(f.world.guards_at(pos, &f.marker).is_empty());
    }

    #[test]
    fn link_clear_is_skipped_for_reclaimed_records() {
        let f = fixture(ReconcilerConfig::default());
        let owner = OwnerId::random();
        let record = f.world.add_claim(BlockPos::new(7, 7, 7), None);
        f.world.set_link(record, Some(Link::new(owner, GuardId::random())));

        f.queue.push_link_clear(LinkClearRequest { record });
        assert_eq!(f.flush().links_cleared, 1);
        assert!(f.world.record(record).unwrap().link.is_none());

        f.world.set_owner(record, Some(owner));
        f.world.set_link(record, Some(Link::new(owner, GuardId::random())));
        f.queue.push_link_clear(LinkClearRequest { record });
        let report = f.flush();
        assert_eq!(report.links_cleared, 0);
        assert_eq!(report.stale_dropped, 1);
    }

    #[test]
    fn batch_limit_leaves_the_rest_for_the_next_flush() {
        let f = fixture(ReconcilerConfig {
            max_flush_batch: 2,
            ..ReconcilerConfig::default()
        });
        for _ in 0..5 {
            f.queue.push_removal(RemovalRequest {
                guard: GuardId::random(),
            });
        }
        assert_eq!(f.flush().removal_missing, 2);
        assert_eq!(f.queue.stats().pending_removals, 3);
        assert_eq!(f.flush().removal_missing, 2);
        assert_eq!(f.flush().removal_missing, 1);
        assert!(f.flush().is_noop());
    }

    #[test]
    fn unloaded_record_drops_its_creation() {
        let f = fixture(ReconcilerConfig::default());
        let owner = OwnerId::random();
        let record = f.world.add_claim(BlockPos::new(40, 1, 1), Some(owner));
        let request = f.request(record, owner);
        f.world.unload_partition(PartitionKey::from_column(BlockPos::new(40, 1, 1).column()));
        f.queue.push_create(request);
        assert_eq!(f.flush().stale_dropped, 1);
    }
}
