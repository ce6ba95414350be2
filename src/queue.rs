//! # Deferred Mutation Queue
//!
//! Scans run on threads that must never touch the guard store, so whatever a
//! scan decides is parked here and executed later by a flush on the owning
//! context. Three unbounded lock-free queues (creations, guard removals, link
//! clears) accept pushes from any number of scanning threads; only a flush
//! drains them.
//!
//! A single atomic flag guarantees at most one flush is scheduled at a time.
//! The flag is held by a [`FlushPermit`] and released when the permit drops,
//! which covers normal completion, early return, and unwinding alike.

use crate::model::{GuardId, OwnerId, PartitionKey, RecordKey};
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Create a guard for a record, if still appropriate at flush time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateRequest {
    pub record: RecordKey,
    pub owner: OwnerId,
    pub partition: PartitionKey,
    /// Guard this creation supersedes; a live link to it does not count as
    /// "already satisfied".
    pub replaces: Option<GuardId>,
}

/// Destroy a guard, if it still resolves at flush time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalRequest {
    pub guard: GuardId,
}

/// Clear the link of a record whose owner went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkClearRequest {
    pub record: RecordKey,
}

#[derive(Debug, Default)]
pub struct DeferredQueue {
    creates: SegQueue<CreateRequest>,
    removals: SegQueue<RemovalRequest>,
    link_clears: SegQueue<LinkClearRequest>,
    flush_scheduled: AtomicBool,
    total_enqueued: AtomicU64,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push_create(&self, request: CreateRequest) {
        self.creates.push(request);
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn push_removal(&self, request: RemovalRequest) {
        self.removals.push(request);
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn push_link_clear(&self, request: LinkClearRequest) {
        self.link_clears.push(request);
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pop_create(&self) -> Option<CreateRequest> {
        self.creates.pop()
    }

    pub fn pop_removal(&self) -> Option<RemovalRequest> {
        self.removals.pop()
    }

    pub fn pop_link_clear(&self) -> Option<LinkClearRequest> {
        self.link_clears.pop()
    }

    pub fn has_work(&self) -> bool {
        !self.creates.is_empty() || !self.removals.is_empty() || !self.link_clears.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending_creates: self.creates.len(),
            pending_removals: self.removals.len(),
            pending_link_clears: self.link_clears.len(),
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            flush_scheduled: self.flush_scheduled.load(Ordering::Acquire),
        }
    }

    /// Claim the single-flight flag. `None` means a flush is already
    /// scheduled or running; whatever the caller enqueued will be seen by it
    /// or by the next one.
    pub fn try_begin_flush(self: &Arc<Self>) -> Option<FlushPermit> {
        self.flush_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlushPermit {
                queue: Arc::clone(self),
            })
    }
}

/// Proof that the holder owns the single flush slot. Dropping it reopens
/// the slot.
#[derive(Debug)]
pub struct FlushPermit {
    queue: Arc<DeferredQueue>,
}

impl FlushPermit {
    pub fn queue(&self) -> &DeferredQueue {
        &self.queue
    }
}

impl Drop for FlushPermit {
    fn drop(&mut self) {
        self.queue.flush_scheduled.store(false, Ordering::Release);
    }
}

/// Queue statistics for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending_creates: usize,
    pub pending_removals: usize,
    pub pending_link_clears: usize,
    pub total_enqueued: u64,
    pub flush_scheduled: bool,
}
