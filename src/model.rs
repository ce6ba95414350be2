//! # Data Model
//!
//! Identities, geometry and the small value types shared by the claim store
//! and the guard store. Nothing here owns state; both stores are external.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Width of a partition column in blocks along x and z.
pub const COLUMN_WIDTH: i32 = 32;

const COLUMN_MASK: i32 = COLUMN_WIDTH - 1;
const COLUMN_SHIFT: u32 = 5;

/// Stable identity of a claim record.
///
/// Only meaningful while the record's partition is loaded; the host may
/// reuse the value after an unload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey(pub u64);

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Identity of a loaded spatial partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey(pub u64);

impl PartitionKey {
    /// Pack column coordinates into a key. Hosts that already have an opaque
    /// partition reference can construct `PartitionKey` directly instead.
    pub fn from_column(column: ColumnCoord) -> Self {
        Self(((column.x as u32 as u64) << 32) | column.z as u32 as u64)
    }

    /// Inverse of [`PartitionKey::from_column`].
    pub fn column(&self) -> ColumnCoord {
        ColumnCoord {
            x: (self.0 >> 32) as u32 as i32,
            z: self.0 as u32 as i32,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Identity of the player (or other principal) that owns a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub Uuid);

impl OwnerId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Persistent identity component of a guard entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GuardId(pub Uuid);

impl GuardId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for GuardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Transient slot of a live entity inside the guard store. Unlike
/// [`GuardId`] this exists even for entities missing their identity
/// component, which is what the sweep needs to repair them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityHandle(pub u64);

/// Column coordinates of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnCoord {
    pub x: i32,
    pub z: i32,
}

impl ColumnCoord {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
}

/// Integer block position in world space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Decode a local block index inside a column.
    ///
    /// Layout: `x = i & 31`, `z = (i >> 5) & 31`, `y = i >> 10`.
    pub fn from_column_index(column: ColumnCoord, index: u32) -> Self {
        let index = index as i32;
        let local_x = index & COLUMN_MASK;
        let local_z = (index >> COLUMN_SHIFT) & COLUMN_MASK;
        let y = index >> (COLUMN_SHIFT * 2);
        Self {
            x: (column.x << COLUMN_SHIFT) | local_x,
            y,
            z: (column.z << COLUMN_SHIFT) | local_z,
        }
    }

    /// Encode back into a column-local index.
    pub fn column_index(&self) -> u32 {
        let local_x = self.x & COLUMN_MASK;
        let local_z = self.z & COLUMN_MASK;
        ((self.y << (COLUMN_SHIFT * 2)) | (local_z << COLUMN_SHIFT) | local_x) as u32
    }

    /// Column this block belongs to.
    pub fn column(&self) -> ColumnCoord {
        ColumnCoord {
            x: self.x >> COLUMN_SHIFT,
            z: self.z >> COLUMN_SHIFT,
        }
    }

    /// Centre of the block, where guards are placed.
    pub fn center(&self) -> WorldPos {
        WorldPos {
            x: self.x as f64 + 0.5,
            y: self.y as f64 + 0.5,
            z: self.z as f64 + 0.5,
        }
    }

    /// Pack into a single `u64` for position-keyed sets.
    ///
    /// 26 bits of x, 12 bits of y, 26 bits of z. Collisions need coordinates
    /// 2^25 blocks apart, far outside a single partition scan.
    pub fn packed(&self) -> u64 {
        ((self.x as i64 as u64 & 0x3FF_FFFF) << 38)
            | ((self.y as i64 as u64 & 0xFFF) << 26)
            | (self.z as i64 as u64 & 0x3FF_FFFF)
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Continuous position of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldPos {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl WorldPos {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Block containing this position.
    pub fn block(&self) -> BlockPos {
        BlockPos {
            x: self.x.floor() as i32,
            y: self.y.floor() as i32,
            z: self.z.floor() as i32,
        }
    }
}

/// The persisted `{owner, guard}` pair attached to a claim record.
///
/// Both halves are independently optional. A non-null `guard` should
/// reference a live guard, but the reconciler repairs links that don't.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Link {
    pub owner: Option<OwnerId>,
    pub guard: Option<GuardId>,
}

impl Link {
    pub fn new(owner: OwnerId, guard: GuardId) -> Self {
        Self {
            owner: Some(owner),
            guard: Some(guard),
        }
    }
}

/// A read of one claim record as delivered by the claim store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimView {
    pub record: RecordKey,
    pub partition: PartitionKey,
    pub owner: Option<OwnerId>,
    pub link: Option<Link>,
    /// Derived from partition + local index. `None` when the host cannot
    /// resolve the record's location yet.
    pub position: Option<BlockPos>,
}

impl ClaimView {
    /// Guard referenced by the record's link, if any.
    pub fn linked_guard(&self) -> Option<GuardId> {
        self.link.and_then(|link| link.guard)
    }
}

/// Everything needed to spawn a guard entity.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardSpec {
    pub position: WorldPos,
    /// Capability tag value that makes the entity suppress activity.
    pub suppression_id: String,
    /// Attribution marker; see [`GuardMarker`].
    pub marker: String,
}

/// A live entity in the guard store, as seen by the sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardEntity {
    pub handle: EntityHandle,
    /// Missing when a prior creation was interrupted.
    pub id: Option<GuardId>,
    pub position: Option<WorldPos>,
    pub suppression_id: Option<String>,
    pub marker: Option<String>,
}

/// Attribution marker written onto every guard this crate creates:
/// `<prefix><owner uuid>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardMarker {
    prefix: String,
}

impl GuardMarker {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn for_owner(&self, owner: OwnerId) -> String {
        format!("{}{}", self.prefix, owner)
    }

    /// Whether the marker was written by us.
    pub fn is_ours(&self, marker: &str) -> bool {
        marker.starts_with(&self.prefix)
    }

    /// Owner embedded in one of our markers. `None` for foreign or
    /// malformed markers.
    pub fn owner_of(&self, marker: &str) -> Option<OwnerId> {
        marker
            .strip_prefix(&self.prefix)
            .and_then(|rest| Uuid::parse_str(rest).ok())
            .map(OwnerId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_index_round_trips_through_block_pos() {
        let column = ColumnCoord::new(-3, 7);
        let pos = BlockPos::from_column_index(column, (64 << 10) | (9 << 5) | 31);
        assert_eq!(pos, BlockPos::new(-3 * 32 + 31, 64, 7 * 32 + 9));
        assert_eq!(pos.column(), column);
        assert_eq!(pos.column_index(), (64 << 10) | (9 << 5) | 31);
    }

    #[test]
    fn center_floors_back_to_the_same_block() {
        for pos in [BlockPos::new(0, 0, 0), BlockPos::new(-1, 70, -33)] {
            assert_eq!(pos.center().block(), pos);
        }
    }

    #[test]
    fn packed_keys_distinguish_neighbours() {
        let a = BlockPos::new(10, 64, 10);
        assert_ne!(a.packed(), BlockPos::new(11, 64, 10).packed());
        assert_ne!(a.packed(), BlockPos::new(10, 65, 10).packed());
        assert_ne!(a.packed(), BlockPos::new(10, 64, 11).packed());
        assert_ne!(
            BlockPos::new(-1, 0, 0).packed(),
            BlockPos::new(0, 0, -1).packed()
        );
    }

    #[test]
    fn partition_key_round_trips_negative_columns() {
        let column = ColumnCoord::new(-12, 40);
        assert_eq!(PartitionKey::from_column(column).column(), column);
    }

    #[test]
    fn marker_embeds_and_recovers_owner() {
        let marker = GuardMarker::new("ClaimGuard:");
        let owner = OwnerId::random();
        let text = marker.for_owner(owner);
        assert!(marker.is_ours(&text));
        assert_eq!(marker.owner_of(&text), Some(owner));
        assert!(!marker.is_ours("SomeoneElse:abc"));
        assert_eq!(marker.owner_of("ClaimGuard:not-a-uuid"), None);
    }
}
