//! # Bootstrap Reconciler
//!
//! Full pass over one partition that re-establishes the guard invariants
//! from scratch, without consulting the snapshot cache. Run when a
//! partition loads, periodically as a safety net, and (in teardown mode) on
//! shutdown.
//!
//! Two phases:
//!
//! 1. **Sweep** every attributable guard in the partition and destroy the
//!    ones that shouldn't exist: no claim under them, claim unowned, owner
//!    mismatch with the marker, or a second guard on the same block. Guards
//!    missing their identity are replaced in place.
//! 2. **Discover** every claim record: owned records without a live guard
//!    get one (or adopt the one already standing there), unowned records
//!    with a leftover link get it cleared.
//!
//! Owning-context only; the facade takes care of the hop.

use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, Result};
use crate::host::{CapabilityProvider, ClaimStore, GuardStore};
use crate::lifecycle::GuardFactory;
use crate::metrics::ReconcilerMetrics;
use crate::model::{
    BlockPos, ClaimView, EntityHandle, GuardEntity, GuardId, Link, OwnerId, PartitionKey,
};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootstrapMode {
    /// Sweep and discover.
    Reconcile,
    /// Destroy every attributable guard and stop.
    Teardown,
}

/// Counts from one bootstrap pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapReport {
    pub partition: PartitionKey,
    pub mode: BootstrapMode,
    pub kept: usize,
    /// Guards destroyed by the sweep, for any reason.
    pub removed: usize,
    pub mismatched: usize,
    pub duplicates: usize,
    /// Guards without identity that were replaced in place.
    pub repaired: usize,
    pub created: usize,
    pub adopted: usize,
    pub links_cleared: usize,
    pub errors: usize,
}

impl BootstrapReport {
    fn new(partition: PartitionKey, mode: BootstrapMode) -> Self {
        Self {
            partition,
            mode,
            kept: 0,
            removed: 0,
            mismatched: 0,
            duplicates: 0,
            repaired: 0,
            created: 0,
            adopted: 0,
            links_cleared: 0,
            errors: 0,
        }
    }

    /// Whether the pass changed anything.
    pub fn changed(&self) -> bool {
        self.removed + self.repaired + self.created + self.adopted + self.links_cleared > 0
    }
}

/// A guard the sweep decided to keep, keyed by its block.
#[derive(Debug, Clone, Copy)]
struct Standing {
    guard: GuardId,
    handle: EntityHandle,
    repaired: bool,
}

/// The owned claim a guard stands on.
#[derive(Debug, Clone, Copy)]
struct Placement {
    claim: ClaimView,
    owner: OwnerId,
    block: BlockPos,
}

const OWNER_MISMATCH: &str = "owner mismatch";

pub struct BootstrapReconciler {
    factory: GuardFactory,
    metrics: Arc<ReconcilerMetrics>,
}

impl BootstrapReconciler {
    pub fn new(config: &ReconcilerConfig, metrics: Arc<ReconcilerMetrics>) -> Self {
        Self {
            factory: GuardFactory::new(config),
            metrics,
        }
    }

    #[instrument(
        skip(self, claims, guards, capability),
        level = "debug",
        fields(partition = %partition, mode = ?mode)
    )]
    pub fn reconcile_partition(
        &self,
        partition: PartitionKey,
        mode: BootstrapMode,
        claims: &dyn ClaimStore,
        guards: &dyn GuardStore,
        capability: &dyn CapabilityProvider,
    ) -> Result<BootstrapReport> {
        if !capability.guard_capability_available() {
            return Err(ReconcileError::NotReady("guard capability"));
        }
        if !claims.schema_ready() {
            return Err(ReconcileError::NotReady("claim schema"));
        }

        let mut report = BootstrapReport::new(partition, mode);
        let standing = self.sweep(partition, mode, claims, guards, &mut report);
        if mode == BootstrapMode::Reconcile {
            self.discover(partition, &standing, claims, guards, &mut report);
        }

        self.record(&report);
        if report.changed() || report.errors > 0 {
            info!(
                event = "bootstrap",
                kept = report.kept,
                removed = report.removed,
                repaired = report.repaired,
                created = report.created,
                adopted = report.adopted,
                links_cleared = report.links_cleared,
                errors = report.errors,
                "partition reconciled"
            );
        }
        Ok(report)
    }

    fn sweep(
        &self,
        partition: PartitionKey,
        mode: BootstrapMode,
        claims: &dyn ClaimStore,
        guards: &dyn GuardStore,
        report: &mut BootstrapReport,
    ) -> FxHashMap<u64, Standing> {
        let mut standing: FxHashMap<u64, Standing> = FxHashMap::default();
        let marker = self.factory.marker();

        for entity in guards.guards_in_partition(partition, self.factory.suppression_id()) {
            // Tagged entities without our marker belong to someone else.
            let Some(marker_text) = entity.marker.as_deref().filter(|m| marker.is_ours(m)) else {
                continue;
            };
            if mode == BootstrapMode::Teardown {
                self.destroy(guards, entity.handle, entity.id, "teardown", report);
                continue;
            }

            let placement = match self.place(marker_text, &entity, claims) {
                Ok(placement) => placement,
                Err(reason) => {
                    if reason == OWNER_MISMATCH {
                        report.mismatched += 1;
                    }
                    self.destroy(guards, entity.handle, entity.id, reason, report);
                    continue;
                }
            };

            let key = placement.block.packed();
            if let Some(existing) = standing.get(&key).copied() {
                report.duplicates += 1;
                // Prefer whichever one the record links to.
                let linked = placement.claim.linked_guard();
                if entity.id.is_none() || entity.id != linked {
                    self.destroy(guards, entity.handle, entity.id, "duplicate", report);
                    continue;
                }
                self.destroy(guards, existing.handle, Some(existing.guard), "duplicate", report);
                standing.remove(&key);
            }

            let kept = match entity.id {
                Some(guard) => Some(Standing {
                    guard,
                    handle: entity.handle,
                    repaired: false,
                }),
                None => self.replace_anonymous(claims, guards, &entity, &placement, report),
            };
            if let Some(kept) = kept {
                standing.insert(key, kept);
            }
        }

        report.kept = standing.values().filter(|s| !s.repaired).count();
        standing
    }

    /// Find the owned claim a guard belongs on, or the reason it must go.
    fn place(
        &self,
        marker_text: &str,
        entity: &GuardEntity,
        claims: &dyn ClaimStore,
    ) -> std::result::Result<Placement, &'static str> {
        let block = entity.position.ok_or("no position")?.block();
        let claim = claims.claim_at(block).ok_or("no claim")?;
        let owner = claim.owner.ok_or("claim unowned")?;
        if self.factory.marker().owner_of(marker_text) != Some(owner) {
            return Err(OWNER_MISMATCH);
        }
        Ok(Placement {
            claim,
            owner,
            block,
        })
    }

    fn replace_anonymous(
        &self,
        claims: &dyn ClaimStore,
        guards: &dyn GuardStore,
        entity: &GuardEntity,
        placement: &Placement,
        report: &mut BootstrapReport,
    ) -> Option<Standing> {
        let record = placement.claim.record;
        if let Err(err) = guards.despawn(entity.handle) {
            report.errors += 1;
            warn!(handle = ?entity.handle, error = %err, "failed to remove guard without identity");
            return None;
        }
        let created =
            self.factory
                .spawn_linked(claims, guards, record, placement.owner, placement.block);
        match created {
            Ok(guard) => {
                report.repaired += 1;
                debug!(%record, %guard, "replaced guard without identity");
                guards.resolve(guard).map(|handle| Standing {
                    guard,
                    handle,
                    repaired: true,
                })
            }
            Err(err) => {
                report.removed += 1;
                report.errors += 1;
                warn!(%record, error = %err, "failed to replace guard without identity");
                None
            }
        }
    }

    fn discover(
        &self,
        partition: PartitionKey,
        standing: &FxHashMap<u64, Standing>,
        claims: &dyn ClaimStore,
        guards: &dyn GuardStore,
        report: &mut BootstrapReport,
    ) {
        let mut views = Vec::new();
        claims.for_each_claim(partition, &mut |view: ClaimView| {
            if view.partition == partition {
                views.push(view);
            }
        });

        for view in views {
            let Some(owner) = view.owner else {
                if view.link.is_some() {
                    match claims.clear_link(view.record) {
                        Ok(()) => report.links_cleared += 1,
                        Err(err) => {
                            report.errors += 1;
                            warn!(
                                record = %view.record,
                                error = %err,
                                "failed to clear leftover link"
                            );
                        }
                    }
                }
                continue;
            };
            let Some(block) = view.position else {
                continue;
            };

            if let Some(existing) = standing.get(&block.packed()) {
                let wanted = Link::new(owner, existing.guard);
                if view.link != Some(wanted) {
                    match claims.write_link(view.record, wanted) {
                        Ok(()) => {
                            report.adopted += 1;
                            debug!(
                                record = %view.record,
                                guard = %existing.guard,
                                "adopted standing guard"
                            );
                        }
                        Err(err) => {
                            report.errors += 1;
                            warn!(
                                record = %view.record,
                                error = %err,
                                "failed to adopt standing guard"
                            );
                        }
                    }
                }
                continue;
            }

            if view
                .linked_guard()
                .is_some_and(|guard| guards.resolve(guard).is_some())
            {
                continue;
            }

            match self
                .factory
                .spawn_linked(claims, guards, view.record, owner, block)
            {
                Ok(guard) => {
                    report.created += 1;
                    info!(
                        event = "creation",
                        record = %view.record,
                        %partition,
                        %owner,
                        %guard,
                        position = %block,
                        "guard created by bootstrap"
                    );
                }
                Err(err) => {
                    report.errors += 1;
                    warn!(record = %view.record, error = %err, "failed to create guard");
                }
            }
        }
    }

    fn destroy(
        &self,
        guards: &dyn GuardStore,
        handle: EntityHandle,
        guard: Option<GuardId>,
        reason: &'static str,
        report: &mut BootstrapReport,
    ) {
        match guards.despawn(handle) {
            Ok(()) => {
                report.removed += 1;
                debug!(?handle, guard = ?guard, reason, "guard destroyed");
            }
            Err(err) => {
                report.errors += 1;
                warn!(?handle, reason, error = %err, "failed to destroy guard");
            }
        }
    }

    fn record(&self, report: &BootstrapReport) {
        let m = &self.metrics;
        ReconcilerMetrics::bump(&m.bootstrap_passes);
        ReconcilerMetrics::add(&m.guards_removed, report.removed as u64);
        ReconcilerMetrics::add(&m.guards_created, report.created as u64);
        ReconcilerMetrics::add(&m.guards_repaired, report.repaired as u64);
        ReconcilerMetrics::add(&m.links_adopted, report.adopted as u64);
        ReconcilerMetrics::add(&m.links_cleared, report.links_cleared as u64);
        ReconcilerMetrics::add(&m.host_errors, report.errors as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GuardMarker;
    use crate::test_support::{MemoryWorld, RawGuard};

    struct Fixture {
        world: MemoryWorld,
        bootstrap: BootstrapReconciler,
        marker: GuardMarker,
    }

    fn fixture() -> Fixture {
        let config = ReconcilerConfig::default();
        Fixture {
            world: MemoryWorld::new(),
            bootstrap: BootstrapReconciler::new(&config, Arc::new(ReconcilerMetrics::default())),
            marker: GuardMarker::new(config.marker_prefix),
        }
    }

    impl Fixture {
        fn run(&self, partition: PartitionKey, mode: BootstrapMode) -> BootstrapReport {
            self.bootstrap
                .reconcile_partition(partition, mode, &self.world, &self.world, &self.world)
                .unwrap()
        }
    }

    fn partition_of(block: BlockPos) -> PartitionKey {
        PartitionKey::from_column(block.column())
    }

    #[test]
    fn refuses_to_run_without_capability() {
        let f = fixture();
        f.world.set_capability(false);
        let err = f
            .bootstrap
            .reconcile_partition(
                PartitionKey(0),
                BootstrapMode::Reconcile,
                &f.world,
                &f.world,
                &f.world,
            )
            .unwrap_err();
        assert!(matches!(err, ReconcileError::NotReady(_)));
    }

    #[test]
    fn discover_creates_missing_guards_and_is_idempotent() {
        let f = fixture();
        let owner = OwnerId::random();
        let a = BlockPos::new(1, 10, 1);
        let b = BlockPos::new(2, 10, 2);
        f.world.add_claim(a, Some(owner));
        f.world.add_claim(b, None);

        let report = f.run(partition_of(a), BootstrapMode::Reconcile);
        assert_eq!(report.created, 1);
        assert!(f.world.quiescence_violations(&f.marker).is_empty());

        let again = f.run(partition_of(a), BootstrapMode::Reconcile);
        assert!(!again.changed());
        assert_eq!(again.kept, 1);
    }

    #[test]
    fn sweep_destroys_guards_that_should_not_exist() {
        let f = fixture();
        let owner = OwnerId::random();
        let owned = BlockPos::new(3, 5, 3);
        let unowned = BlockPos::new(4, 5, 4);
        let empty = BlockPos::new(5, 5, 5);
        f.world.add_claim(owned, Some(owner));
        f.world.add_claim(unowned, None);
        let p = partition_of(owned);

        f.world.insert_guard(p, RawGuard::ours(owned, OwnerId::random(), &f.marker));
        f.world.insert_guard(p, RawGuard::ours(unowned, owner, &f.marker));
        f.world.insert_guard(p, RawGuard::ours(empty, owner, &f.marker));
        f.world.insert_guard(
            p,
            RawGuard {
                position: None,
                ..RawGuard::ours(owned, owner, &f.marker)
            },
        );

        let report = f.run(p, BootstrapMode::Reconcile);
        assert_eq!(report.removed, 4);
        assert_eq!(report.mismatched, 1);
        assert_eq!(report.created, 1);
        assert!(f.world.quiescence_violations(&f.marker).is_empty());
    }

    #[test]
    fn foreign_entities_are_left_alone() {
        let f = fixture();
        let block = BlockPos::new(6, 6, 6);
        f.world.add_claim(block, None);
        let p = partition_of(block);
        f.world.insert_guard(
            p,
            RawGuard {
                marker: Some("SomeoneElse:1".to_string()),
                ..RawGuard::ours(block, OwnerId::random(), &f.marker)
            },
        );
        let report = f.run(p, BootstrapMode::Teardown);
        assert_eq!(report.removed, 0);
        assert_eq!(f.world.guard_entities().len(), 1);
    }

    #[test]
    fn duplicates_collapse_onto_the_linked_guard() {
        let f = fixture();
        let owner = OwnerId::random();
        let block = BlockPos::new(7, 7, 7);
        let record = f.world.add_claim(block, Some(owner));
        let p = partition_of(block);
        let first = RawGuard::ours(block, owner, &f.marker);
        let second = RawGuard::ours(block, owner, &f.marker);
        let linked = second.id.unwrap();
        f.world.insert_guard(p, first);
        f.world.insert_guard(p, second);
        f.world.set_link(record, Some(Link::new(owner, linked)));

        let report = f.run(p, BootstrapMode::Reconcile);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.removed, 1);
        let left = f.world.guards_at(block, &f.marker);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, Some(linked));
    }

    #[test]
    fn standing_guard_is_adopted_instead_of_duplicated() {
        let f = fixture();
        let owner = OwnerId::random();
        let block = BlockPos::new(8, 8, 8);
        let record = f.world.add_claim(block, Some(owner));
        let raw = RawGuard::ours(block, owner, &f.marker);
        let guard = raw.id.unwrap();
        f.world.insert_guard(partition_of(block), raw);

        let report = f.run(partition_of(block), BootstrapMode::Reconcile);
        assert_eq!(report.adopted, 1);
        assert_eq!(report.created, 0);
        assert_eq!(
            f.world.record(record).unwrap().link,
            Some(Link::new(owner, guard))
        );
    }

    #[test]
    fn guard_without_identity_is_replaced_in_place() {
        let f = fixture();
        let owner = OwnerId::random();
        let block = BlockPos::new(9, 9, 9);
        f.world.add_claim(block, Some(owner));
        f.world.insert_guard(
            partition_of(block),
            RawGuard {
                id: None,
                ..RawGuard::ours(block, owner, &f.marker)
            },
        );

        let report = f.run(partition_of(block), BootstrapMode::Reconcile);
        assert_eq!(report.repaired, 1);
        assert_eq!(report.created, 0);
        let left = f.world.guards_at(block, &f.marker);
        assert_eq!(left.len(), 1);
        assert!(left[0].id.is_some());
        assert!(f.world.quiescence_violations(&f.marker).is_empty());
    }

    #[test]
    fn leftover_link_on_unowned_claim_is_cleared() {
        let f = fixture();
        let block = BlockPos::new(10, 1, 10);
        let record = f.world.add_claim(block, None);
        f.world
            .set_link(record, Some(Link::new(OwnerId::random(), GuardId::random())));
        let report = f.run(partition_of(block), BootstrapMode::Reconcile);
        assert_eq!(report.links_cleared, 1);
        assert!(f.world.record(record).unwrap().link.is_none());
    }

    #[test]
    fn teardown_destroys_every_attributable_guard() {
        let f = fixture();
        let owner = OwnerId::random();
        let block = BlockPos::new(11, 1, 11);
        f.world.add_claim(block, Some(owner));
        f.run(partition_of(block), BootstrapMode::Reconcile);
        assert_eq!(f.world.guards_at(block, &f.marker).len(), 1);

        let report = f.run(partition_of(block), BootstrapMode::Teardown);
        assert_eq!(report.removed, 1);
        assert_eq!(report.created, 0);
        assert!(f.world.guards_at(block, &f.marker).is_empty());
    }
}
