//! In-memory host for tests, benches and the soak binary.
//!
//! [`MemoryWorld`] plays both stores and the capability provider;
//! [`ManualContext`] is an owning context that only runs tasks when told to,
//! which makes flush timing deterministic.

use crate::host::{CapabilityProvider, ClaimStore, GuardStore, HostBindings, OwningContext, Task};
use crate::model::{
    BlockPos, ClaimView, EntityHandle, GuardEntity, GuardId, GuardMarker, GuardSpec, Link,
    OwnerId, PartitionKey, RecordKey, WorldPos,
};
use anyhow::{anyhow, bail};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

pub const TEST_SUPPRESSION_ID: &str = crate::config::DEFAULT_SUPPRESSION_ID;

#[derive(Debug, Clone)]
struct ClaimRow {
    position: BlockPos,
    partition: PartitionKey,
    owner: Option<OwnerId>,
    link: Option<Link>,
}

#[derive(Debug, Clone)]
struct GuardRow {
    partition: PartitionKey,
    entity: GuardEntity,
}

#[derive(Debug, Default)]
struct WorldState {
    claims: FxHashMap<RecordKey, ClaimRow>,
    by_position: FxHashMap<BlockPos, RecordKey>,
    guards: FxHashMap<EntityHandle, GuardRow>,
    loaded: FxHashSet<PartitionKey>,
    next_record: u64,
    next_handle: u64,
}

impl WorldState {
    fn view(&self, record: RecordKey, row: &ClaimRow) -> ClaimView {
        ClaimView {
            record,
            partition: row.partition,
            owner: row.owner,
            link: row.link,
            position: Some(row.position),
        }
    }

    fn loaded_claim(&self, record: RecordKey) -> Option<&ClaimRow> {
        self.claims
            .get(&record)
            .filter(|row| self.loaded.contains(&row.partition))
    }

    fn find_guard(&self, id: GuardId) -> Option<EntityHandle> {
        self.guards
            .iter()
            .find(|(_, row)| row.entity.id == Some(id) && self.loaded.contains(&row.partition))
            .map(|(handle, _)| *handle)
    }
}

/// Raw entity fields for [`MemoryWorld::insert_guard`].
#[derive(Debug, Clone, Default)]
pub struct RawGuard {
    pub id: Option<GuardId>,
    pub position: Option<WorldPos>,
    pub suppression_id: Option<String>,
    pub marker: Option<String>,
}

impl RawGuard {
    /// A guard as this crate would have spawned it for `owner` at `block`.
    pub fn ours(block: BlockPos, owner: OwnerId, marker: &GuardMarker) -> Self {
        Self {
            id: Some(GuardId::random()),
            position: Some(block.center()),
            suppression_id: Some(TEST_SUPPRESSION_ID.to_string()),
            marker: Some(marker.for_owner(owner)),
        }
    }
}

/// Both host stores in one lock.
pub struct MemoryWorld {
    state: RwLock<WorldState>,
    schema_ready: AtomicBool,
    capability: AtomicBool,
    fail_link_writes: AtomicBool,
    fail_spawns: AtomicBool,
    owning_thread: Mutex<Option<ThreadId>>,
    spawns: AtomicU64,
    despawns: AtomicU64,
    off_context_calls: AtomicU64,
}

impl Default for MemoryWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(WorldState::default()),
            schema_ready: AtomicBool::new(true),
            capability: AtomicBool::new(true),
            fail_link_writes: AtomicBool::new(false),
            fail_spawns: AtomicBool::new(false),
            owning_thread: Mutex::new(None),
            spawns: AtomicU64::new(0),
            despawns: AtomicU64::new(0),
            off_context_calls: AtomicU64::new(0),
        }
    }

    pub fn set_schema_ready(&self, ready: bool) {
        self.schema_ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_capability(&self, available: bool) {
        self.capability.store(available, Ordering::SeqCst);
    }

    pub fn fail_link_writes(&self, fail: bool) {
        self.fail_link_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.fail_spawns.store(fail, Ordering::SeqCst);
    }

    /// Count guard-store calls made from any thread other than `thread`.
    pub fn bind_owning_thread(&self, thread: Option<ThreadId>) {
        *self.owning_thread.lock() = thread;
    }

    pub fn off_context_calls(&self) -> u64 {
        self.off_context_calls.load(Ordering::SeqCst)
    }

    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn despawn_count(&self) -> u64 {
        self.despawns.load(Ordering::SeqCst)
    }

    pub fn load_partition(&self, partition: PartitionKey) {
        self.state.write().loaded.insert(partition);
    }

    pub fn unload_partition(&self, partition: PartitionKey) {
        self.state.write().loaded.remove(&partition);
    }

    /// Place a claim record at `position`, loading its partition.
    pub fn add_claim(&self, position: BlockPos, owner: Option<OwnerId>) -> RecordKey {
        let partition = PartitionKey::from_column(position.column());
        let mut state = self.state.write();
        state.next_record += 1;
        let record = RecordKey(state.next_record);
        state.loaded.insert(partition);
        state.by_position.insert(position, record);
        state.claims.insert(
            record,
            ClaimRow {
                position,
                partition,
                owner,
                link: None,
            },
        );
        record
    }

    pub fn remove_claim(&self, record: RecordKey) {
        let mut state = self.state.write();
        if let Some(row) = state.claims.remove(&record) {
            state.by_position.remove(&row.position);
        }
    }

    /// Hand an existing record identity to a claim at another position, the
    /// way a host recycles identities across partitions.
    pub fn move_claim(&self, record: RecordKey, position: BlockPos) {
        let partition = PartitionKey::from_column(position.column());
        let mut guard = self.state.write();
        let state = &mut *guard;
        let Some(row) = state.claims.get_mut(&record) else {
            return;
        };
        state.by_position.remove(&row.position);
        row.position = position;
        row.partition = partition;
        state.by_position.insert(position, record);
        state.loaded.insert(partition);
    }

    pub fn set_owner(&self, record: RecordKey, owner: Option<OwnerId>) {
        if let Some(row) = self.state.write().claims.get_mut(&record) {
            row.owner = owner;
        }
    }

    /// Overwrite a link directly, bypassing failure injection.
    pub fn set_link(&self, record: RecordKey, link: Option<Link>) {
        if let Some(row) = self.state.write().claims.get_mut(&record) {
            row.link = link;
        }
    }

    /// Raw view of a record, ignoring load state.
    pub fn record(&self, record: RecordKey) -> Option<ClaimView> {
        let state = self.state.read();
        state.claims.get(&record).map(|row| state.view(record, row))
    }

    pub fn insert_guard(&self, partition: PartitionKey, raw: RawGuard) -> EntityHandle {
        let mut state = self.state.write();
        state.next_handle += 1;
        let handle = EntityHandle(state.next_handle);
        state.guards.insert(
            handle,
            GuardRow {
                partition,
                entity: GuardEntity {
                    handle,
                    id: raw.id,
                    position: raw.position,
                    suppression_id: raw.suppression_id,
                    marker: raw.marker,
                },
            },
        );
        handle
    }

    /// Destroy a guard behind the reconciler's back.
    pub fn destroy_guard(&self, id: GuardId) -> bool {
        let mut state = self.state.write();
        let before = state.guards.len();
        state.guards.retain(|_, row| row.entity.id != Some(id));
        state.guards.len() != before
    }

    pub fn guard_entities(&self) -> Vec<GuardEntity> {
        let mut guards: Vec<_> = self
            .state
            .read()
            .guards
            .values()
            .map(|row| row.entity.clone())
            .collect();
        guards.sort_by_key(|guard| guard.handle);
        guards
    }

    /// Guards of ours standing on `block`.
    pub fn guards_at(&self, block: BlockPos, marker: &GuardMarker) -> Vec<GuardEntity> {
        self.state
            .read()
            .guards
            .values()
            .filter(|row| is_ours(&row.entity, marker))
            .filter(|row| row.entity.position.map(|p| p.block()) == Some(block))
            .map(|row| row.entity.clone())
            .collect()
    }

    /// Every invariant that must hold once scans and flushes have settled,
    /// checked over loaded partitions. Returns one line per violation.
    pub fn quiescence_violations(&self, marker: &GuardMarker) -> Vec<String> {
        let state = self.state.read();
        let mut violations = Vec::new();

        let mut ours_by_block: FxHashMap<BlockPos, Vec<&GuardEntity>> = FxHashMap::default();
        for row in state.guards.values() {
            if !state.loaded.contains(&row.partition) || !is_ours(&row.entity, marker) {
                continue;
            }
            match row.entity.position {
                Some(pos) => ours_by_block.entry(pos.block()).or_default().push(&row.entity),
                None => violations.push(format!("guard {:?} has no position", row.entity.handle)),
            }
        }

        for (record, row) in &state.claims {
            if !state.loaded.contains(&row.partition) {
                continue;
            }
            let here = ours_by_block.remove(&row.position).unwrap_or_default();
            match row.owner {
                Some(owner) => {
                    if here.len() != 1 {
                        violations.push(format!(
                            "{record} owned by {owner} has {} guards",
                            here.len()
                        ));
                        continue;
                    }
                    let linked = row.link.and_then(|link| link.guard);
                    if linked.is_none() || linked != here[0].id {
                        violations.push(format!("{record} link does not name its guard"));
                    }
                }
                None => {
                    if !here.is_empty() {
                        violations.push(format!("{record} unowned but guarded"));
                    }
                    if row.link.is_some() {
                        violations.push(format!("{record} unowned but still linked"));
                    }
                }
            }
        }

        for (block, guards) in ours_by_block {
            violations.push(format!("{} orphan guard(s) at {block}", guards.len()));
        }
        violations
    }

    fn note_guard_call(&self) {
        if let Some(owner) = *self.owning_thread.lock() {
            if thread::current().id() != owner {
                self.off_context_calls.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

fn is_ours(entity: &GuardEntity, marker: &GuardMarker) -> bool {
    entity.suppression_id.as_deref() == Some(TEST_SUPPRESSION_ID)
        && entity.marker.as_deref().is_some_and(|m| marker.is_ours(m))
}

impl ClaimStore for MemoryWorld {
    fn schema_ready(&self) -> bool {
        self.schema_ready.load(Ordering::SeqCst)
    }

    fn for_each_claim(&self, partition: PartitionKey, visit: &mut dyn FnMut(ClaimView)) {
        // Collect first so the visitor never runs under the lock.
        let views: Vec<ClaimView> = {
            let state = self.state.read();
            if !state.loaded.contains(&partition) {
                return;
            }
            state
                .claims
                .iter()
                .filter(|(_, row)| row.partition == partition)
                .map(|(record, row)| state.view(*record, row))
                .collect()
        };
        for view in views {
            visit(view);
        }
    }

    fn claim(&self, record: RecordKey) -> Option<ClaimView> {
        let state = self.state.read();
        state
            .loaded_claim(record)
            .map(|row| state.view(record, row))
    }

    fn claim_at(&self, position: BlockPos) -> Option<ClaimView> {
        let state = self.state.read();
        let record = *state.by_position.get(&position)?;
        state
            .loaded_claim(record)
            .map(|row| state.view(record, row))
    }

    fn write_link(&self, record: RecordKey, link: Link) -> anyhow::Result<()> {
        if self.fail_link_writes.load(Ordering::SeqCst) {
            bail!("link write rejected for {record}");
        }
        let mut guard = self.state.write();
        let state = &mut *guard;
        let row = state
            .claims
            .get_mut(&record)
            .filter(|row| state.loaded.contains(&row.partition))
            .ok_or_else(|| anyhow!("{record} is not loaded"))?;
        row.link = Some(link);
        Ok(())
    }

    fn clear_link(&self, record: RecordKey) -> anyhow::Result<()> {
        if let Some(row) = self.state.write().claims.get_mut(&record) {
            row.link = None;
        }
        Ok(())
    }

    fn loaded_partitions(&self) -> Vec<PartitionKey> {
        let mut partitions: Vec<_> = self.state.read().loaded.iter().copied().collect();
        partitions.sort();
        partitions
    }
}

impl GuardStore for MemoryWorld {
    fn spawn(&self, spec: GuardSpec) -> anyhow::Result<GuardId> {
        self.note_guard_call();
        if self.fail_spawns.load(Ordering::SeqCst) {
            bail!("spawn rejected at {}", spec.position.block());
        }
        let id = GuardId::random();
        let partition = PartitionKey::from_column(spec.position.block().column());
        self.insert_guard(
            partition,
            RawGuard {
                id: Some(id),
                position: Some(spec.position),
                suppression_id: Some(spec.suppression_id),
                marker: Some(spec.marker),
            },
        );
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    fn resolve(&self, id: GuardId) -> Option<EntityHandle> {
        self.note_guard_call();
        self.state.read().find_guard(id)
    }

    fn despawn(&self, handle: EntityHandle) -> anyhow::Result<()> {
        self.note_guard_call();
        self.state
            .write()
            .guards
            .remove(&handle)
            .ok_or_else(|| anyhow!("no entity {:?}", handle))?;
        self.despawns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn guards_in_partition(
        &self,
        partition: PartitionKey,
        suppression_id: &str,
    ) -> Vec<GuardEntity> {
        self.note_guard_call();
        let state = self.state.read();
        if !state.loaded.contains(&partition) {
            return Vec::new();
        }
        let mut guards: Vec<_> = state
            .guards
            .values()
            .filter(|row| row.partition == partition)
            .filter(|row| row.entity.suppression_id.as_deref() == Some(suppression_id))
            .map(|row| row.entity.clone())
            .collect();
        guards.sort_by_key(|guard| guard.handle);
        guards
    }
}

impl CapabilityProvider for MemoryWorld {
    fn guard_capability_available(&self) -> bool {
        self.capability.load(Ordering::SeqCst)
    }
}

/// Owning context that queues tasks until [`ManualContext::run_pending`].
#[derive(Default)]
pub struct ManualContext {
    pending: Mutex<VecDeque<Task>>,
    running_on: Mutex<Option<ThreadId>>,
    closed: AtomicBool,
}

impl ManualContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run queued tasks, including any they submit, until none remain.
    /// Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let Some(task) = self.pending.lock().pop_front() else {
                break;
            };
            *self.running_on.lock() = Some(thread::current().id());
            task();
            *self.running_on.lock() = None;
            ran += 1;
        }
        ran
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl OwningContext for ManualContext {
    fn submit(&self, task: Task) -> Result<(), Task> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(task);
        }
        self.pending.lock().push_back(task);
        Ok(())
    }

    fn is_current(&self) -> bool {
        *self.running_on.lock() == Some(thread::current().id())
    }
}

/// Bind a world to a context.
pub fn bindings(world: &Arc<MemoryWorld>, context: Arc<dyn OwningContext>) -> HostBindings {
    HostBindings::new(world.clone(), world.clone(), world.clone(), context)
}

/// A world plus a manual context, already bound.
pub fn manual_host() -> (Arc<MemoryWorld>, Arc<ManualContext>, HostBindings) {
    let world = Arc::new(MemoryWorld::new());
    let context = Arc::new(ManualContext::new());
    let host = bindings(&world, context.clone());
    (world, context, host)
}

/// Scatter `count` claim records over a `side x side` block of partitions,
/// roughly `owned_ratio` of them owned by one of `owners`.
pub fn populate(
    world: &MemoryWorld,
    side: i32,
    count: usize,
    owners: &[OwnerId],
    owned_ratio: f64,
    seed: u64,
) -> Vec<RecordKey> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut used = FxHashSet::default();
    let mut records = Vec::with_capacity(count);
    while records.len() < count {
        let position = BlockPos::new(
            rng.random_range(0..side * crate::model::COLUMN_WIDTH),
            rng.random_range(0..128),
            rng.random_range(0..side * crate::model::COLUMN_WIDTH),
        );
        if !used.insert(position) {
            continue;
        }
        let owner = (!owners.is_empty() && rng.random_bool(owned_ratio))
            .then(|| owners[rng.random_range(0..owners.len())]);
        records.push(world.add_claim(position, owner));
    }
    records
}
