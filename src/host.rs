//! # Host Boundary
//!
//! The claim store and the guard store belong to the host. Each is a
//! single-writer store; this module states what the reconciler needs from
//! them and nothing more.
//!
//! The central rule: [`GuardStore`] methods are only ever called from code
//! running on the [`OwningContext`]. The reconciler funnels every such call
//! through one hop in [`crate::reconciler`].

use crate::model::{
    BlockPos, ClaimView, EntityHandle, GuardEntity, GuardId, GuardSpec, Link, PartitionKey,
    RecordKey,
};
use anyhow::Result;
use std::sync::Arc;

/// A unit of work submitted to the owning execution context.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Read/link-write access to claim records.
///
/// Reads may happen from any scanning thread. Link writes happen either on
/// the owning context (flush, bootstrap) or through the host's own command
/// buffering.
pub trait ClaimStore: Send + Sync {
    /// Whether the claim-record schema is registered. Scans are skipped
    /// (not failed) until it is.
    fn schema_ready(&self) -> bool;

    /// Visit every claim record whose derived partition is `partition`.
    fn for_each_claim(&self, partition: PartitionKey, visit: &mut dyn FnMut(ClaimView));

    /// Current state of a record. `None` once the record is gone or its
    /// partition unloaded.
    fn claim(&self, record: RecordKey) -> Option<ClaimView>;

    /// Claim record at a block position, if one is loaded there.
    fn claim_at(&self, position: BlockPos) -> Option<ClaimView>;

    /// Replace the link on a record.
    fn write_link(&self, record: RecordKey, link: Link) -> Result<()>;

    /// Remove the link from a record. Removing an absent link is fine.
    fn clear_link(&self, record: RecordKey) -> Result<()>;

    /// Partitions currently loaded, for the periodic sweep.
    fn loaded_partitions(&self) -> Vec<PartitionKey>;
}

/// Entity creation, resolution and destruction in the guard store.
///
/// Owning-context only.
pub trait GuardStore: Send + Sync {
    /// Spawn a guard and return its identity.
    fn spawn(&self, spec: GuardSpec) -> Result<GuardId>;

    /// Resolve a guard identity to a live entity. `None` covers both
    /// "destroyed" and "not currently loaded"; callers cannot tell which.
    fn resolve(&self, id: GuardId) -> Option<EntityHandle>;

    /// Destroy a live entity.
    fn despawn(&self, handle: EntityHandle) -> Result<()>;

    /// Every entity in a partition carrying the given suppression tag.
    fn guards_in_partition(&self, partition: PartitionKey, suppression_id: &str)
        -> Vec<GuardEntity>;
}

/// Supplies the capability that turns an entity into a guard. May be
/// missing early in host startup.
pub trait CapabilityProvider: Send + Sync {
    fn guard_capability_available(&self) -> bool;
}

/// Serializes work onto the guard store's owning thread.
pub trait OwningContext: Send + Sync {
    /// Queue a task. Returns the task back when the context is shut down.
    fn submit(&self, task: Task) -> std::result::Result<(), Task>;

    /// Whether the caller is already running on this context.
    fn is_current(&self) -> bool;
}

/// The host collaborators a reconciler is bound to.
#[derive(Clone)]
pub struct HostBindings {
    pub claims: Arc<dyn ClaimStore>,
    pub guards: Arc<dyn GuardStore>,
    pub capability: Arc<dyn CapabilityProvider>,
    pub context: Arc<dyn OwningContext>,
}

impl HostBindings {
    pub fn new(
        claims: Arc<dyn ClaimStore>,
        guards: Arc<dyn GuardStore>,
        capability: Arc<dyn CapabilityProvider>,
        context: Arc<dyn OwningContext>,
    ) -> Self {
        Self {
            claims,
            guards,
            capability,
            context,
        }
    }
}
