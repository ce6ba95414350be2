//! # Partition Scanner
//!
//! Invoked by the host once per loaded partition per tick. Most calls hit
//! the per-partition throttle and return immediately; the rest walk the
//! partition's claim records, diff each against the snapshot cache, and
//! park any resulting mutation in the deferred queue.
//!
//! The scanner reads the claim store only. It never touches the guard store,
//! which is what lets it run on any thread.

use crate::classify::{
    classify, classify_removal, Classification, Directive, Observation, Transition,
};
use crate::config::ReconcilerConfig;
use crate::host::ClaimStore;
use crate::metrics::ReconcilerMetrics;
use crate::model::{ClaimView, GuardId, PartitionKey, RecordKey};
use crate::queue::{CreateRequest, DeferredQueue, LinkClearRequest, RemovalRequest};
use crate::snapshot::{Membership, Snapshot, SnapshotCache};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Per-partition minimum re-scan interval on a monotonic clock.
#[derive(Debug)]
pub struct ScanThrottle {
    interval: Duration,
    next_allowed: DashMap<PartitionKey, Instant>,
}

impl ScanThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_allowed: DashMap::new(),
        }
    }

    /// Whether a scan may run at `now`. On success the next allowed time is
    /// pushed out immediately, before the scan does anything that could
    /// fail, so a partition that keeps failing is not retried every tick.
    pub fn try_acquire(&self, partition: PartitionKey, now: Instant) -> bool {
        let mut next = self.next_allowed.entry(partition).or_insert(now);
        if now < *next {
            return false;
        }
        *next = now + self.interval;
        true
    }

    pub fn forget(&self, partition: PartitionKey) {
        self.next_allowed.remove(&partition);
    }

    pub fn tracked_partitions(&self) -> usize {
        self.next_allowed.len()
    }
}

/// A transition observed on one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordEvent {
    pub record: RecordKey,
    pub transition: Transition,
}

/// What one member scan found and queued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub records_seen: usize,
    pub events: Vec<RecordEvent>,
    pub creation_requests: usize,
    pub removal_requests: usize,
    pub link_clear_requests: usize,
}

impl ScanReport {
    pub fn queued_anything(&self) -> bool {
        self.creation_requests + self.removal_requests + self.link_clear_requests > 0
    }

    pub fn transitions_for(&self, record: RecordKey) -> Vec<Transition> {
        self.events
            .iter()
            .filter(|event| event.record == record)
            .map(|event| event.transition)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The partition was scanned too recently.
    Throttled,
    /// The claim schema isn't registered yet; retried next tick.
    NotReady,
    Scanned(ScanReport),
    /// The scan panicked and was caught at the tick boundary.
    Aborted,
}

impl ScanOutcome {
    pub fn report(&self) -> Option<&ScanReport> {
        match self {
            ScanOutcome::Scanned(report) => Some(report),
            _ => None,
        }
    }
}

pub struct PartitionScanner {
    config: Arc<ReconcilerConfig>,
    throttle: ScanThrottle,
    snapshots: Arc<SnapshotCache>,
    queue: Arc<DeferredQueue>,
    metrics: Arc<ReconcilerMetrics>,
}

impl PartitionScanner {
    pub fn new(
        config: Arc<ReconcilerConfig>,
        snapshots: Arc<SnapshotCache>,
        queue: Arc<DeferredQueue>,
        metrics: Arc<ReconcilerMetrics>,
    ) -> Self {
        Self {
            throttle: ScanThrottle::new(config.scan_interval()),
            config,
            snapshots,
            queue,
            metrics,
        }
    }

    pub fn throttle(&self) -> &ScanThrottle {
        &self.throttle
    }

    pub fn scan(&self, partition: PartitionKey, claims: &dyn ClaimStore) -> ScanOutcome {
        self.scan_at(partition, claims, Instant::now())
    }

    /// Scan with an explicit clock reading.
    #[instrument(skip(self, claims, now), level = "debug", fields(partition = %partition))]
    pub fn scan_at(
        &self,
        partition: PartitionKey,
        claims: &dyn ClaimStore,
        now: Instant,
    ) -> ScanOutcome {
        if !self.throttle.try_acquire(partition, now) {
            ReconcilerMetrics::bump(&self.metrics.scans_throttled);
            return ScanOutcome::Throttled;
        }

        if !claims.schema_ready() {
            ReconcilerMetrics::bump(&self.metrics.scans_not_ready);
            debug!("claim schema not registered yet, skipping scan");
            return ScanOutcome::NotReady;
        }

        ReconcilerMetrics::bump(&self.metrics.scans);
        let mut report = ScanReport::default();
        let mut seen = Membership::default();

        claims.for_each_claim(partition, &mut |view: ClaimView| {
            if view.partition != partition {
                return;
            }
            seen.insert(view.record);
            report.records_seen += 1;

            let observed = Observation {
                owner: view.owner,
                link: view.link,
            };
            let previous = match self.snapshots.get(view.record) {
                Some(stale) if stale.partition != partition => {
                    self.retire_stale(view.record, stale, observed.guard(), &mut report);
                    None
                }
                other => other,
            };
            let classification =
                classify(previous.as_ref(), observed, partition, self.config.reassignment);
            if let Some(snapshot) = classification.snapshot {
                self.snapshots.put(view.record, snapshot);
            }
            self.apply(view.record, partition, classification, &mut report);
        });
        ReconcilerMetrics::add(&self.metrics.records_observed, report.records_seen as u64);

        // Anything seen last pass but not this one was removed while the
        // partition stayed loaded.
        if let Some(previous) = self.snapshots.replace_membership(partition, seen.clone()) {
            for record in previous.difference(&seen) {
                let Some(last) = self.snapshots.remove_from(*record, partition) else {
                    continue;
                };
                ReconcilerMetrics::bump(&self.metrics.records_removed);
                self.apply(*record, partition, classify_removal(&last), &mut report);
            }
        }

        if report.queued_anything() {
            debug!(
                creates = report.creation_requests,
                removals = report.removal_requests,
                link_clears = report.link_clear_requests,
                "scan queued deferred work"
            );
        }
        ScanOutcome::Scanned(report)
    }

    /// The identity was last seen in another partition. Whatever it linked
    /// there is orphaned, unless the new holder links the same guard.
    fn retire_stale(
        &self,
        record: RecordKey,
        stale: Snapshot,
        live_guard: Option<GuardId>,
        report: &mut ScanReport,
    ) {
        ReconcilerMetrics::bump(&self.metrics.records_removed);
        let orphan = Snapshot {
            guard: stale.guard.filter(|guard| Some(*guard) != live_guard),
            ..stale
        };
        self.apply(record, stale.partition, classify_removal(&orphan), report);
    }

    fn apply(
        &self,
        record: RecordKey,
        partition: PartitionKey,
        classification: Classification,
        report: &mut ScanReport,
    ) {
        for transition in classification.transitions {
            log_transition(record, partition, &transition);
            if matches!(transition, Transition::FirstSeenUnlinked { .. }) {
                ReconcilerMetrics::bump(&self.metrics.degraded_first_seen);
            }
            report.events.push(RecordEvent { record, transition });
        }

        match classification.directive {
            Directive::None => {}
            Directive::Create { owner } => {
                self.queue.push_create(CreateRequest {
                    record,
                    owner,
                    partition,
                    replaces: None,
                });
                self.count_create(report);
            }
            Directive::Remove { guard, clear_link } => {
                if let Some(guard) = guard {
                    self.queue.push_removal(RemovalRequest { guard });
                    self.count_removal(report);
                }
                if clear_link {
                    self.queue.push_link_clear(LinkClearRequest { record });
                    report.link_clear_requests += 1;
                    ReconcilerMetrics::bump(&self.metrics.link_clear_requests);
                }
            }
            Directive::Relink { old_guard, owner } => {
                if let Some(guard) = old_guard {
                    self.queue.push_removal(RemovalRequest { guard });
                    self.count_removal(report);
                }
                self.queue.push_create(CreateRequest {
                    record,
                    owner,
                    partition,
                    replaces: old_guard,
                });
                self.count_create(report);
            }
        }
    }

    fn count_create(&self, report: &mut ScanReport) {
        report.creation_requests += 1;
        ReconcilerMetrics::bump(&self.metrics.creation_requests);
    }

    fn count_removal(&self, report: &mut ScanReport) {
        report.removal_requests += 1;
        ReconcilerMetrics::bump(&self.metrics.removal_requests);
    }
}

fn log_transition(record: RecordKey, partition: PartitionKey, transition: &Transition) {
    let event = transition.name();
    match *transition {
        Transition::FirstSeen { owner, guard } => info!(
            event, %record, %partition, owner = ?owner, guard = ?guard,
            "claim record first seen"
        ),
        Transition::FirstSeenUnlinked { owner } => warn!(
            event, %record, %partition, %owner,
            "claimed record first seen without a guard link"
        ),
        Transition::Claimed { owner } => {
            info!(event, %record, %partition, %owner, "claim record claimed")
        }
        Transition::Unclaimed { previous_owner } => info!(
            event, %record, %partition, %previous_owner,
            "claim record owner cleared"
        ),
        Transition::Reassigned { from, to } => info!(
            event, %record, %partition, %from, %to,
            "claim record owner changed"
        ),
        Transition::Linked { guard } => {
            info!(event, %record, %partition, %guard, "guard linked")
        }
        Transition::Unlinked { previous } => {
            info!(event, %record, %partition, %previous, "guard unlinked")
        }
        Transition::Relinked { from, to } => info!(
            event, %record, %partition, %from, %to,
            "guard link changed"
        ),
        Transition::Removed { owner, guard } => info!(
            event, %record, %partition, owner = ?owner, guard = ?guard,
            "claim record removed"
        ),
    }
}
