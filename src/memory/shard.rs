use super::remote::RemoteQueue;
use super::size_class::{CLASS_COUNT, SizeClass};
use crate::sync::atomic::{AtomicUsize, Ordering};

/// Claim state of a shard slot, stored as a `u32` in the allocator's slot table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum ShardState {
    /// Address space reserved, header not yet committed.
    Unclaimed = 0,
    /// One thread is committing and writing the header; others spin.
    Claiming = 1,
    /// Header live, cursor has room.
    Ready = 2,
    /// Header live, cursor can no longer fit a chunk. Remote queues still work.
    Exhausted = 3,
    /// No header; the slot is part of a large block's run of whole shards.
    /// Goes back to `Unclaimed` when the block is freed.
    Large = 4,
}

impl ShardState {
    #[inline]
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::Unclaimed,
            1 => Self::Claiming,
            2 => Self::Ready,
            3 => Self::Exhausted,
            _ => Self::Large,
        }
    }
}

/// Shared per-shard state.
///
/// The header is placed in the last page(s) of the shard's own slice of the
/// reservation and committed when the shard is first claimed, so unclaimed
/// shards cost no memory beyond one `u32` of state. The arena window
/// `[base, limit)` is everything in the slice below the header; `base` is
/// aligned to the shard size, which keeps chunk claims naturally aligned.
///
/// Every mutable field is atomic: any number of handles may share a shard.
#[repr(C, align(64))]
pub(crate) struct Shard {
    base: usize,
    limit: usize,
    /// Next unclaimed address. Only ever moves forward, never past `limit`.
    cursor: AtomicUsize,
    /// Highest committed end address (or `base` if nothing is committed).
    committed_high_water: AtomicUsize,
    /// Bytes committed inside the window; alignment gaps are not counted.
    committed: AtomicUsize,
    remote: [RemoteQueue; CLASS_COUNT],
}

impl Shard {
    pub fn new(base: usize, limit: usize) -> Self {
        debug_assert!(base <= limit);
        Self {
            base,
            limit,
            cursor: AtomicUsize::new(base),
            committed_high_water: AtomicUsize::new(base),
            committed: AtomicUsize::new(0),
            remote: std::array::from_fn(|_| RemoteQueue::new()),
        }
    }

    /// Carve `len` bytes aligned to `align` off the cursor.
    ///
    /// Returns the start address, or `None` when the window cannot fit the
    /// request. The cursor only partitions address space; the claimer commits
    /// and publishes the range itself, so `Relaxed` suffices.
    pub fn claim(&self, len: usize, align: usize) -> Option<usize> {
        debug_assert!(align.is_power_of_two());
        let mut cur = self.cursor.load(Ordering::Relaxed);
        loop {
            let start = cur.checked_next_multiple_of(align)?;
            let end = start.checked_add(len)?;
            if end > self.limit {
                return None;
            }
            match self
                .cursor
                .compare_exchange_weak(cur, end, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Some(start),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Whether a `claim(len, align)` issued now would succeed.
    pub fn can_fit(&self, len: usize, align: usize) -> bool {
        let cur = self.cursor.load(Ordering::Relaxed);
        cur.checked_next_multiple_of(align)
            .and_then(|start| start.checked_add(len))
            .is_some_and(|end| end <= self.limit)
    }

    /// Record that `[start, start + len)` is now backed by physical memory.
    pub fn record_commit(&self, start: usize, len: usize) {
        self.committed.fetch_add(len, Ordering::Relaxed);
        self.committed_high_water.fetch_max(start + len, Ordering::Relaxed);
    }

    #[inline]
    pub fn remote(&self, class: SizeClass) -> &RemoteQueue {
        &self.remote[class.index()]
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        (self.base..self.limit).contains(&addr)
    }

    #[cfg(test)]
    pub fn base(&self) -> usize {
        self.base
    }

    #[cfg(test)]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes of the window already handed out (including alignment gaps).
    #[cfg(test)]
    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Relaxed) - self.base
    }

    /// Offset of the committed high-water mark from `base`.
    #[cfg(test)]
    pub fn committed_high_water(&self) -> usize {
        self.committed_high_water.load(Ordering::Relaxed) - self.base
    }

    #[cfg(test)]
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }
}
