//! # ClaimGuard
//!
//! An edge-triggered reconciliation engine that keeps one guard entity alive
//! for every owned claim record, and none for unowned ones.
//!
//! Scans run on any thread and only read claim records; every guard-store
//! mutation is deferred into a queue and executed by a single-flight flush on
//! the host's owning execution context. A bootstrap pass re-establishes the
//! invariants from scratch whenever a partition loads.

pub mod bootstrap;
pub mod classify;
pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod reconciler;
pub mod scanner;
pub mod snapshot;
pub mod test_support;

// Re-export main types for convenience
pub use bootstrap::{BootstrapMode, BootstrapReport};
pub use config::{ConfigError, ReassignmentPolicy, ReconcilerConfig};
pub use context::WorkerContext;
pub use error::{ReconcileError, Result};
pub use host::{CapabilityProvider, ClaimStore, GuardStore, HostBindings, OwningContext, Task};
pub use lifecycle::FlushReport;
pub use metrics::MetricsSnapshot;
pub use model::{
    BlockPos, ClaimView, ColumnCoord, EntityHandle, GuardEntity, GuardId, GuardMarker, GuardSpec,
    Link, OwnerId, PartitionKey, RecordKey, WorldPos,
};
pub use queue::QueueStats;
pub use reconciler::{GuardReconciler, SweepHandle};
pub use scanner::{ScanOutcome, ScanReport};
