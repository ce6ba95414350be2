//! # Reconciler Facade
//!
//! [`GuardReconciler`] wires the scanner, the deferred queue, the lifecycle
//! manager and the bootstrap pass to one set of host bindings. It is the
//! only place that knows about the owning execution context: every piece of
//! guard-store work is funnelled through [`GuardReconciler::schedule_flush`]
//! or [`GuardReconciler::bootstrap`], which hop onto the context when the
//! caller isn't already on it.
//!
//! Cloning is cheap; clones share all state.

use crate::bootstrap::{BootstrapMode, BootstrapReconciler, BootstrapReport};
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, Result};
use crate::host::{HostBindings, Task};
use crate::lifecycle::{FlushReport, GuardLifecycle};
use crate::metrics::{MetricsSnapshot, ReconcilerMetrics};
use crate::model::PartitionKey;
use crate::queue::{DeferredQueue, FlushPermit, QueueStats};
use crate::scanner::{PartitionScanner, ScanOutcome};
use crate::snapshot::SnapshotCache;
use crossbeam_channel::{bounded, select, tick, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

struct Inner {
    config: Arc<ReconcilerConfig>,
    host: HostBindings,
    snapshots: Arc<SnapshotCache>,
    queue: Arc<DeferredQueue>,
    metrics: Arc<ReconcilerMetrics>,
    scanner: PartitionScanner,
    lifecycle: GuardLifecycle,
    bootstrap: BootstrapReconciler,
}

#[derive(Clone)]
pub struct GuardReconciler {
    inner: Arc<Inner>,
}

impl GuardReconciler {
    pub fn new(config: ReconcilerConfig, host: HostBindings) -> Self {
        let config = Arc::new(config);
        let snapshots = Arc::new(SnapshotCache::new());
        let queue = Arc::new(DeferredQueue::new());
        let metrics = Arc::new(ReconcilerMetrics::default());

        let scanner = PartitionScanner::new(
            Arc::clone(&config),
            Arc::clone(&snapshots),
            Arc::clone(&queue),
            Arc::clone(&metrics),
        );
        let lifecycle = GuardLifecycle::new(Arc::clone(&config), Arc::clone(&metrics));
        let bootstrap = BootstrapReconciler::new(&config, Arc::clone(&metrics));

        info!(
            scan_interval_ms = config.scan_interval_ms,
            suppression_id = %config.suppression_id,
            reassignment = ?config.reassignment,
            "guard reconciler initialized"
        );

        Self {
            inner: Arc::new(Inner {
                config,
                host,
                snapshots,
                queue,
                metrics,
                scanner,
                lifecycle,
                bootstrap,
            }),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.inner.config
    }

    /// Per-partition tick entry point. Safe to call from any thread,
    /// concurrently for different partitions.
    pub fn tick(&self, partition: PartitionKey) -> ScanOutcome {
        self.tick_at(partition, Instant::now())
    }

    /// [`GuardReconciler::tick`] with an explicit clock reading.
    pub fn tick_at(&self, partition: PartitionKey, now: Instant) -> ScanOutcome {
        let claims = self.inner.host.claims.as_ref();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.inner.scanner.scan_at(partition, claims, now)
        }))
        .unwrap_or_else(|payload| {
            ReconcilerMetrics::bump(&self.inner.metrics.host_errors);
            let err = ReconcileError::from_panic(payload);
            error!(%partition, error = %err, "scan aborted");
            ScanOutcome::Aborted
        });
        if self.inner.queue.has_work() {
            self.schedule_flush();
        }
        outcome
    }

    /// Submit a flush to the owning context unless one is already pending.
    /// Returns whether this call scheduled it.
    pub fn schedule_flush(&self) -> bool {
        let Some(permit) = self.inner.queue.try_begin_flush() else {
            return false;
        };
        let inner = Arc::clone(&self.inner);
        let task: Task = Box::new(move || {
            // Failures are logged and counted inside.
            let _ = inner.run_flush(permit);
        });
        match self.inner.host.context.submit(task) {
            Ok(()) => true,
            Err(rejected) => {
                // Dropping the task drops the permit and reopens the slot.
                drop(rejected);
                warn!("owning context rejected flush; work stays queued");
                false
            }
        }
    }

    /// Flush synchronously. Must be called on the owning context. `Ok(None)`
    /// means another flush holds the slot and will pick the work up.
    pub fn flush_now(&self) -> Result<Option<FlushReport>> {
        if !self.inner.host.context.is_current() {
            return Err(ReconcileError::OffContext);
        }
        match self.inner.queue.try_begin_flush() {
            Some(permit) => self.inner.run_flush(permit).map(Some),
            None => Ok(None),
        }
    }

    /// Run a bootstrap pass over one partition. On the owning context it
    /// runs inline and the report comes back; anywhere else it is submitted
    /// to the context and `Ok(None)` is returned.
    pub fn bootstrap(
        &self,
        partition: PartitionKey,
        mode: BootstrapMode,
    ) -> Result<Option<BootstrapReport>> {
        if self.inner.host.context.is_current() {
            return self.inner.run_bootstrap(partition, mode).map(Some);
        }
        let inner = Arc::clone(&self.inner);
        let task: Task = Box::new(move || {
            let _ = inner.run_bootstrap(partition, mode);
        });
        self.inner
            .host
            .context
            .submit(task)
            .map(|()| None)
            .map_err(|_| ReconcileError::ContextUnavailable)
    }

    /// Host notification: a partition finished loading.
    pub fn partition_loaded(&self, partition: PartitionKey) -> Result<Option<BootstrapReport>> {
        debug!(%partition, "partition loaded");
        self.bootstrap(partition, BootstrapMode::Reconcile)
    }

    /// Host notification: a partition unloaded. Drops every snapshot and
    /// throttle entry for it; returns the number of snapshots pruned.
    pub fn partition_unloaded(&self, partition: PartitionKey) -> usize {
        let pruned = self.inner.snapshots.forget_partition(partition);
        self.inner.scanner.throttle().forget(partition);
        debug!(%partition, pruned, "partition unloaded");
        pruned
    }

    /// Destroy every guard this system created in a loaded partition.
    pub fn teardown_partition(&self, partition: PartitionKey) -> Result<Option<BootstrapReport>> {
        self.bootstrap(partition, BootstrapMode::Teardown)
    }

    /// Teardown over every loaded partition, for shutdown. Returns how many
    /// passes were run or submitted.
    pub fn teardown_loaded(&self) -> usize {
        self.for_each_loaded(BootstrapMode::Teardown)
    }

    /// Reconcile pass over every loaded partition. Returns how many passes
    /// were run or submitted.
    pub fn sweep_loaded(&self) -> usize {
        self.for_each_loaded(BootstrapMode::Reconcile)
    }

    fn for_each_loaded(&self, mode: BootstrapMode) -> usize {
        let mut started = 0;
        for partition in self.inner.host.claims.loaded_partitions() {
            match self.bootstrap(partition, mode) {
                Ok(_) => started += 1,
                Err(err) => warn!(%partition, ?mode, error = %err, "bootstrap pass not started"),
            }
        }
        started
    }

    /// Run [`GuardReconciler::sweep_loaded`] every `sweep_interval_secs` on
    /// a background thread until the handle is stopped or dropped.
    pub fn spawn_periodic_sweep(&self) -> std::io::Result<SweepHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let ticker = tick(self.inner.config.sweep_interval());
        let reconciler = self.clone();
        let join = thread::Builder::new()
            .name("claimguard-sweep".to_string())
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => {
                        let started = reconciler.sweep_loaded();
                        debug!(started, "periodic sweep");
                    }
                    recv(stop_rx) -> _ => break,
                }
            })?;
        Ok(SweepHandle {
            stop: Some(stop_tx),
            join: Some(join),
        })
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    pub fn snapshots(&self) -> &SnapshotCache {
        &self.inner.snapshots
    }

    pub fn throttled_partitions(&self) -> usize {
        self.inner.scanner.throttle().tracked_partitions()
    }
}

impl Inner {
    #[instrument(skip_all, level = "debug")]
    fn run_flush(&self, permit: FlushPermit) -> Result<FlushReport> {
        ReconcilerMetrics::bump(&self.metrics.flushes);
        let host = &self.host;
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.lifecycle.flush(
                permit.queue(),
                host.claims.as_ref(),
                host.guards.as_ref(),
                host.capability.as_ref(),
            )
        }));
        drop(permit);
        result.map_err(|payload| {
            ReconcilerMetrics::bump(&self.metrics.flush_failures);
            let err = ReconcileError::from_panic(payload);
            error!(error = %err, "flush aborted");
            err
        })
    }

    fn run_bootstrap(
        &self,
        partition: PartitionKey,
        mode: BootstrapMode,
    ) -> Result<BootstrapReport> {
        let host = &self.host;
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.bootstrap.reconcile_partition(
                partition,
                mode,
                host.claims.as_ref(),
                host.guards.as_ref(),
                host.capability.as_ref(),
            )
        }))
        .unwrap_or_else(|payload| Err(ReconcileError::from_panic(payload)));

        match &result {
            Err(ReconcileError::NotReady(what)) => {
                debug!(%partition, what, "bootstrap skipped, host not ready");
            }
            Err(err) => {
                ReconcilerMetrics::bump(&self.metrics.host_errors);
                error!(%partition, ?mode, error = %err, "bootstrap pass failed");
            }
            Ok(_) => {}
        }
        result
    }
}

/// Stops the periodic sweep when stopped or dropped.
pub struct SweepHandle {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl SweepHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.take();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("periodic sweep thread panicked");
            }
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
