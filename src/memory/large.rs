//! Blocks too big for any size class.
//!
//! A large block takes a run of whole shards that no handle has claimed and
//! marks them in the shard table, so neither handles nor other large blocks
//! touch the run until it is freed. There is no header: `free` recomputes the
//! run length from `size`. Pages are committed exactly on allocation and
//! decommitted on free, so a freed block costs nothing physical.

use super::arena::Allocator;
use super::shard::ShardState;
use super::vm::{PlatformVmOps, VmOps};
use std::ptr::NonNull;

impl Allocator {
    /// Number of shards a block of `size` bytes spans.
    #[inline]
    fn large_run(&self, size: usize) -> usize {
        size.div_ceil(self.shard_size())
    }

    /// Allocate a block above the largest size class.
    pub(crate) fn alloc_large(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let Some(block) = self.try_alloc_large(size, align) else {
            tracing::debug!(size, align, committed = self.committed_physical(), "large allocation failed");
            self.counters.failed_allocs.incr();
            return None;
        };
        self.counters.large_allocs.incr();
        #[cfg(debug_assertions)]
        self.debug_track_alloc(block, align);
        Some(block)
    }

    fn try_alloc_large(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let len = size.checked_next_multiple_of(PlatformVmOps::page_size())?;
        let runs = self.large_run(size);
        let first = self.claim_run(runs, align)?;
        let start = self.shard_start(first);
        if let Err(err) = self.commit_owned(start, len) {
            tracing::debug!(?err, size, "large block not committed");
            self.release_run(first, runs);
            return None;
        }
        NonNull::new(start as *mut u8)
    }

    /// Return a large block's pages and shards.
    ///
    /// # Safety
    /// `ptr` must be a live block from `alloc_large` with the same `size`.
    pub(crate) unsafe fn free_large(&self, size: usize, ptr: NonNull<u8>) {
        let start = ptr.as_ptr() as usize;
        let Some(first) = self.shard_index_of(start) else {
            debug_assert!(false, "free of {ptr:p}, which this allocator does not own");
            return;
        };
        debug_assert!(
            start == self.shard_start(first) && self.state(first) == ShardState::Large,
            "free of {ptr:p}, which is not a large block"
        );

        #[cfg(debug_assertions)]
        self.debug_track_free(ptr);

        let len = size.next_multiple_of(PlatformVmOps::page_size());
        // Safety: the run is the caller's until released below.
        if let Err(e) = unsafe { self.decommit_owned(start, len) } {
            // Still charged, so the run stays out of circulation.
            tracing::warn!(error = %e, size, "large block decommit failed");
            return;
        }
        self.release_run(first, self.large_run(size));
    }
}
