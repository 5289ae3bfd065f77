//! Event counters and the [`AllocatorStats`] snapshot.
//!
//! Counters are bumped with `Relaxed` ordering on slow paths only, so a
//! snapshot taken while other threads run may mix older and newer values.
//! Nothing reads them to make allocation decisions; the physical budget
//! keeps its own exact count.

use crate::sync::atomic::{AtomicUsize, Ordering};

/// Monotonic count of slow-path events.
pub struct Counter(AtomicUsize);

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[inline]
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-allocator diagnostic counters bumped on slow paths.
#[derive(Default)]
pub(crate) struct AllocCounters {
    /// Frees pushed onto a foreign shard's remote queue.
    pub remote_frees: Counter,
    /// Remote queues drained back into a local list by the owning shard's handles.
    pub remote_drains: Counter,
    /// Handles that moved to another shard after theirs ran out of space.
    pub migrations: Counter,
    /// `alloc` calls that returned null.
    pub failed_allocs: Counter,
    /// Blocks above the largest class, served from whole shards.
    pub large_allocs: Counter,
}

/// Point-in-time view of one allocator's budgets and activity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocatorStats {
    pub physical_budget: usize,
    pub virtual_budget: usize,
    /// Bytes currently charged against the physical budget.
    pub committed_physical: usize,
    /// Bytes of address space covered by shards.
    pub reserved_virtual: usize,
    pub shard_count: usize,
    pub shards_claimed: usize,
    pub shards_exhausted: usize,
    pub remote_frees: usize,
    pub remote_drains: usize,
    pub migrations: usize,
    pub failed_allocs: usize,
    pub large_allocs: usize,
}
