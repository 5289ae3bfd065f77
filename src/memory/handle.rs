//! Per-thread allocation state and the `alloc`/`free` paths.
//!
//! A [`Handle`] owns one private free list per size class plus a bump chunk.
//! The hot path touches nothing but the handle: pop the class list, else bump
//! the chunk. Shared state (shard cursor, remote queues, physical budget) is
//! only reached on a local miss and on frees of blocks owned
//! by another shard.

use super::arena::{Allocator, GrowError};
use super::shard::Shard;
use super::size_class::{CLASS_COUNT, SizeClass};
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Classes whose list heads live inline in the handle (16 B to 1 KiB).
pub(crate) const HOT_CLASSES: usize = 7;
const COLD_CLASSES: usize = CLASS_COUNT - HOT_CLASSES;

/// Bytes carved off the start of a handle's first chunk for the cold heads.
pub(crate) const COLD_TABLE_BYTES: usize = COLD_CLASSES * std::mem::size_of::<usize>();

/// Words in a handle. Fixed: C callers embed it by value.
pub const HANDLE_WORDS: usize = 11;

/// Thread-local allocation state, bound to one shard of one [`Allocator`].
///
/// Obtain one from [`Allocator::init_handle`] and pass it by `&mut` to every
/// `alloc`/`free`. The handle is `!Send` and `!Sync`; a thread that wants
/// another handle creates one.
///
/// Handles cannot be destroyed. Letting one go leaks its private lists and
/// the unused tail of its chunk: at most one chunk of physical memory plus
/// whatever blocks it had cached. Its shard stays usable by other handles.
///
/// The layout is `#[repr(C)]` and exactly [`HANDLE_WORDS`] machine words so
/// that C code can hold it in an opaque `uint64_t[11]`. Moving the bytes
/// moves the handle; copying them and using both copies corrupts the lists.
#[repr(C)]
pub struct Handle<'a> {
    shard: u32,
    /// Migrations this handle went through.
    hops: u32,
    cursor: usize,
    limit: usize,
    /// Heads for classes `HOT_CLASSES..`, stored in the first chunk.
    cold: NonNull<[usize; COLD_CLASSES]>,
    hot: [usize; HOT_CLASSES],
    _allocator: PhantomData<&'a Allocator>,
}

const _: () = assert!(std::mem::size_of::<Handle<'static>>() == HANDLE_WORDS * 8);
const _: () = assert!(std::mem::align_of::<Handle<'static>>() == 8);

impl Handle<'_> {
    /// Build a handle around its first chunk, carving the cold heads off its
    /// start.
    ///
    /// # Safety
    /// `chunk` must be committed, at least `chunk_len` bytes, aligned to 64,
    /// and owned exclusively by the new handle.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) unsafe fn new(shard: usize, chunk: NonNull<u8>, chunk_len: usize) -> Self {
        debug_assert!(chunk_len > COLD_TABLE_BYTES);
        let cold = chunk.cast::<[usize; COLD_CLASSES]>();
        // Safety: committed, exclusively owned, aligned.
        unsafe { cold.write([0; COLD_CLASSES]) };
        let start = chunk.as_ptr() as usize;
        Self {
            shard: shard as u32,
            hops: 0,
            cursor: start + COLD_TABLE_BYTES,
            limit: start + chunk_len,
            cold,
            hot: [0; HOT_CLASSES],
            _allocator: PhantomData,
        }
    }

    /// Shard this handle allocates from.
    #[inline]
    pub fn shard_index(&self) -> usize {
        self.shard as usize
    }

    /// Number of times this handle moved to a new shard.
    #[inline]
    pub fn migrations(&self) -> u32 {
        self.hops
    }

    #[inline]
    fn head_mut(&mut self, class: SizeClass) -> &mut usize {
        let i = class.index();
        if i < HOT_CLASSES {
            &mut self.hot[i]
        } else {
            // Safety: the cold table sits in this handle's first chunk, which
            // is never released while the allocator lives and is reachable
            // only through this handle.
            unsafe { &mut (*self.cold.as_ptr())[i - HOT_CLASSES] }
        }
    }

    /// Pop the private list for `class`.
    #[inline]
    pub(crate) fn pop(&mut self, class: SizeClass) -> Option<NonNull<u8>> {
        let head = self.head_mut(class);
        let block = NonNull::new(*head as *mut u8)?;
        // Safety: listed blocks are free, committed and start with a link.
        *head = unsafe { block.as_ptr().cast::<usize>().read() };
        Some(block)
    }

    /// Push a freed block of `class` onto the private list.
    ///
    /// # Safety
    /// `block` must be a free block of `class`, owned by the caller.
    #[inline]
    pub(crate) unsafe fn push(&mut self, class: SizeClass, block: NonNull<u8>) {
        let head = self.head_mut(class);
        // Safety: blocks are at least 16 bytes and class-aligned.
        unsafe { block.as_ptr().cast::<usize>().write(*head) };
        *head = block.as_ptr() as usize;
    }

    /// Install a chain detached from a remote queue as the `class` list.
    ///
    /// Only called after a local miss, so the list is empty and the chain
    /// can be adopted as-is. Its links have the layout of a plain `usize`.
    #[inline]
    pub(crate) fn adopt(&mut self, class: SizeClass, chain: NonNull<u8>) {
        let head = self.head_mut(class);
        debug_assert_eq!(*head, 0, "adopting into a non-empty list");
        *head = chain.as_ptr() as usize;
    }

    /// Bump a class-aligned block of `size` bytes from the private chunk.
    #[inline]
    pub(crate) fn bump(&mut self, size: usize) -> Option<NonNull<u8>> {
        let start = self.cursor.next_multiple_of(size);
        let end = start.checked_add(size)?;
        if end > self.limit {
            return None;
        }
        self.cursor = end;
        NonNull::new(start as *mut u8)
    }

    /// Switch to a fresh chunk. The old chunk's tail is abandoned.
    #[inline]
    pub(crate) fn refill(&mut self, chunk: NonNull<u8>, chunk_len: usize) {
        self.cursor = chunk.as_ptr() as usize;
        self.limit = self.cursor + chunk_len;
    }

    /// Rebind to another shard. The current chunk belongs to the old shard,
    /// so it is dropped; cached blocks stay and are handed out as usual.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn rebind(&mut self, shard: usize) {
        self.shard = shard as u32;
        self.hops = self.hops.saturating_add(1);
        self.cursor = self.limit;
    }
}

impl std::fmt::Debug for Handle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("shard", &self.shard)
            .field("migrations", &self.hops)
            .field("chunk_remaining", &(self.limit - self.cursor))
            .finish_non_exhaustive()
    }
}

#[inline]
fn dangling_for_align(align: usize) -> NonNull<u8> {
    // Non-dereferenceable pointer used for zero-sized allocations.
    // Safety: align is a power of two, hence non-zero.
    unsafe { NonNull::new_unchecked(align as *mut u8) }
}

impl Allocator {
    /// Allocate `size` bytes aligned to `align` through `handle`.
    ///
    /// `size == 0` yields a non-null dangling pointer aligned to `align`
    /// that must not be dereferenced. Requests above
    /// [`MAX_CLASS_SIZE`](super::size_class::MAX_CLASS_SIZE) get whole
    /// shards of their own. Returns `None` when `align` is not a power of
    /// two or the physical or virtual budget has no room left.
    ///
    /// Memory is not zeroed.
    #[inline]
    pub fn alloc(&self, handle: &mut Handle<'_>, size: usize, align: usize) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() {
            self.counters.failed_allocs.incr();
            return None;
        }
        if size == 0 {
            return Some(dangling_for_align(align));
        }
        let Some(class) = SizeClass::of(size, align) else {
            return self.alloc_large(size, align);
        };

        let block = match handle.pop(class) {
            Some(block) => Some(block),
            None if self.is_chunked(class.size()) => handle
                .bump(class.size())
                .or_else(|| self.alloc_slow(handle, class)),
            None => self.alloc_slow(handle, class),
        };

        #[cfg(debug_assertions)]
        if let Some(block) = block {
            self.debug_track_alloc(block, class.size());
        }
        block
    }

    /// Local list and chunk are both empty: reclaim remote frees, then grow,
    /// then migrate, then reclaim frees stranded on other shards.
    #[cold]
    fn alloc_slow(&self, handle: &mut Handle<'_>, class: SizeClass) -> Option<NonNull<u8>> {
        let chunk = self.chunk_size();
        let mut hops_left = self.shard_count();
        loop {
            let idx = handle.shard_index();
            let shard = self.shard_of(handle);

            if let Some(chain) = shard.remote(class).take_all() {
                handle.adopt(class, chain);
                self.counters.remote_drains.incr();
                return handle.pop(class);
            }

            if !self.is_chunked(class.size()) {
                // Direct blocks leave the handle and its chunk where they are.
                match self.grow(shard, class.size(), class.size()) {
                    Ok(block) => return Some(block),
                    Err(GrowError::Virtual) => {
                        if !shard.can_fit(chunk, chunk) {
                            self.mark_exhausted(idx);
                        }
                        if let Ok(block) = self.grow_elsewhere(idx, class.size(), class.size()) {
                            return Some(block);
                        }
                    }
                    Err(_) => {}
                }
                break;
            }

            match self.grow(shard, chunk, chunk) {
                Ok(fresh) => {
                    handle.refill(fresh, chunk);
                    if let Some(block) = handle.bump(class.size()) {
                        return Some(block);
                    }
                    break;
                }
                Err(GrowError::Virtual) if hops_left > 0 => {
                    hops_left -= 1;
                    self.mark_exhausted(idx);
                    if !self.migrate(handle) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        if let Some(block) = self.reclaim_stranded(handle, class) {
            return Some(block);
        }
        tracing::debug!(
            shard = handle.shard_index(),
            class_size = class.size(),
            committed = self.committed_physical(),
            "allocation failed"
        );
        self.counters.failed_allocs.incr();
        None
    }

    /// Adopt remote frees of `class` queued on some other claimed shard.
    ///
    /// Handles only drain their own shard's queues, so blocks freed into a
    /// shard all of whose handles moved on are otherwise lost. Runs only
    /// when every other source has failed.
    fn reclaim_stranded(&self, handle: &mut Handle<'_>, class: SizeClass) -> Option<NonNull<u8>> {
        let count = self.shard_count();
        let from = handle.shard_index();
        for step in 1..count {
            let Some(shard) = self.claimed_shard((from + step) % count) else {
                continue;
            };
            if let Some(chain) = shard.remote(class).take_all() {
                handle.adopt(class, chain);
                self.counters.remote_drains.incr();
                return handle.pop(class);
            }
        }
        None
    }

    /// Return a block to the allocator through `handle`.
    ///
    /// `size` and `align` must be the values passed to `alloc`; the class is
    /// recomputed from them. `size == 0` is a no-op. Blocks from the handle's
    /// own shard go onto its private list; others are queued on the owning
    /// shard for its handles to reclaim.
    ///
    /// # Safety
    /// `ptr` must come from `alloc` on this allocator with the same `size`
    /// and `align`, must not have been freed since, and must not be used
    /// afterwards.
    pub unsafe fn free(&self, handle: &mut Handle<'_>, size: usize, align: usize, ptr: NonNull<u8>) {
        // Safety: forwarded contract.
        let Some((class, owner, shard)) = (unsafe { self.route_free(size, align, ptr) }) else {
            return;
        };
        if owner == handle.shard_index() {
            // Safety: caller hands the block back to us.
            unsafe { handle.push(class, ptr) };
        } else {
            // Safety: same as above; the owner's handles reclaim it.
            unsafe { shard.remote(class).push(ptr) };
            self.counters.remote_frees.incr();
        }
    }

    /// [`free`](Self::free) for callers without a handle: every class block
    /// goes to its owning shard's remote queue.
    ///
    /// # Safety
    /// Same as [`free`](Self::free).
    pub(crate) unsafe fn free_detached(&self, size: usize, align: usize, ptr: NonNull<u8>) {
        // Safety: forwarded contract.
        if let Some((class, _, shard)) = unsafe { self.route_free(size, align, ptr) } {
            // Safety: the owner's handles reclaim it.
            unsafe { shard.remote(class).push(ptr) };
            self.counters.remote_frees.incr();
        }
    }

    /// Common front of both free paths. Finishes zero-size and large frees
    /// itself; for class blocks, returns where the block goes.
    ///
    /// # Safety
    /// Same as [`free`](Self::free).
    unsafe fn route_free(&self, size: usize, align: usize, ptr: NonNull<u8>) -> Option<(SizeClass, usize, &Shard)> {
        if size == 0 {
            return None;
        }
        let Some(class) = SizeClass::of(size, align) else {
            // Safety: `alloc` took the same route for this `(size, align)`.
            unsafe { self.free_large(size, ptr) };
            return None;
        };

        #[cfg(debug_assertions)]
        self.debug_track_free(ptr);

        let Some((owner, shard)) = self.owner_of(ptr.as_ptr() as usize) else {
            debug_assert!(false, "free of {ptr:p}, which this allocator does not own");
            return None;
        };
        debug_assert!(shard.contains(ptr.as_ptr() as usize), "free of {ptr:p} inside a shard header");
        Some((class, owner, shard))
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::arena::VirtualAllocConfig;
    use crate::memory::remote::RemoteQueue;
    use crate::memory::size_class::MAX_CLASS_SIZE;
    use crate::memory::vm::{PlatformVmOps, VmOps};

    const MB: usize = 1024 * 1024;

    fn chain_len(mut node: Option<NonNull<u8>>) -> usize {
        let mut n = 0;
        while let Some(cur) = node {
            n += 1;
            // Safety: Test code; walk of a detached chain.
            node = unsafe { RemoteQueue::next(cur) };
        }
        n
    }

    /// Two handles bound to different shards.
    fn two_handles(alloc: &Allocator) -> (Handle<'_>, Handle<'_>) {
        let h1 = alloc.init_handle(0).unwrap();
        let h2 = (1..)
            .map(|seed| alloc.init_handle(seed).unwrap())
            .find(|h| h.shard_index() != h1.shard_index())
            .unwrap();
        (h1, h2)
    }

    #[test]
    fn test_handle_is_eleven_words() {
        assert_eq!(std::mem::size_of::<Handle<'_>>(), 88);
        assert_eq!(COLD_TABLE_BYTES, 96);
    }

    #[test]
    fn test_zero_size_is_dangling_and_aligned() {
        let alloc = Allocator::new(64 * MB, 64 * MB).unwrap();
        let mut h = alloc.init_handle(1).unwrap();
        let committed = alloc.committed_physical();
        for align in [1, 8, 64, 4096] {
            let p = alloc.alloc(&mut h, 0, align).unwrap();
            assert_eq!(p.as_ptr() as usize, align);
            // Safety: Test code; zero-size free is a no-op.
            unsafe { alloc.free(&mut h, 0, align, p) };
        }
        assert_eq!(alloc.committed_physical(), committed);
    }

    #[test]
    fn test_blocks_are_aligned_and_writable() {
        let alloc = Allocator::new(256 * MB, 256 * MB).unwrap();
        let mut h = alloc.init_handle(7).unwrap();
        let mut live = Vec::new();
        for (size, align) in [(1, 1), (24, 8), (100, 64), (3000, 16), (5000, 4096), (700_000, 8), (3 * MB, 8)] {
            let p = alloc.alloc(&mut h, size, align).unwrap();
            let class = SizeClass::of(size, align).unwrap().size();
            assert!((p.as_ptr() as usize).is_multiple_of(class), "{size}/{align} at {p:p}");
            // Safety: Test code; block spans `size` bytes.
            unsafe { p.as_ptr().write_bytes(0xAB, size) };
            live.push((p, size, align));
        }
        for (p, size, align) in live {
            // Safety: Test code.
            unsafe {
                assert_eq!(*p.as_ptr().add(size - 1), 0xAB);
                alloc.free(&mut h, size, align, p);
            }
        }
    }

    #[test]
    fn test_free_then_alloc_reuses_block() {
        let alloc = Allocator::new(64 * MB, 64 * MB).unwrap();
        let mut h = alloc.init_handle(3).unwrap();
        let a = alloc.alloc(&mut h, 128, 8).unwrap();
        let b = alloc.alloc(&mut h, 128, 8).unwrap();
        assert_ne!(a, b);
        // Safety: Test code.
        unsafe {
            alloc.free(&mut h, 128, 8, a);
            alloc.free(&mut h, 128, 8, b);
        }
        // LIFO, and 100 and 128 share a class.
        assert_eq!(alloc.alloc(&mut h, 100, 8), Some(b));
        assert_eq!(alloc.alloc(&mut h, 128, 16), Some(a));
    }

    #[test]
    fn test_bad_alignment_returns_none() {
        let alloc = Allocator::new(64 * MB, 64 * MB).unwrap();
        let mut h = alloc.init_handle(3).unwrap();
        assert!(alloc.alloc(&mut h, 64, 3).is_none());
        assert!(alloc.alloc(&mut h, 0, 12).is_none());
        assert_eq!(alloc.stats().failed_allocs, 2);
    }

    #[test]
    fn test_requests_above_largest_class_are_served() {
        let alloc = Allocator::new(64 * MB, 64 * MB).unwrap();
        let mut h = alloc.init_handle(3).unwrap();
        let p = alloc.alloc(&mut h, MAX_CLASS_SIZE + 1, 8).unwrap();
        // Safety: Test code.
        unsafe {
            p.as_ptr().add(MAX_CLASS_SIZE).write(9);
            alloc.free(&mut h, MAX_CLASS_SIZE + 1, 8, p);
        }
        let stats = alloc.stats();
        assert_eq!(stats.large_allocs, 1);
        assert_eq!(stats.failed_allocs, 0);
    }

    #[test]
    fn test_large_class_is_committed_exactly() {
        let alloc = Allocator::new(64 * MB, 64 * MB).unwrap();
        let mut h = alloc.init_handle(9).unwrap();
        let before = alloc.committed_physical();
        let p = alloc.alloc(&mut h, MAX_CLASS_SIZE, 8).unwrap();
        assert_eq!(alloc.committed_physical() - before, MAX_CLASS_SIZE);
        // Safety: Test code.
        unsafe {
            p.as_ptr().write_bytes(1, MAX_CLASS_SIZE);
            alloc.free(&mut h, MAX_CLASS_SIZE, 8, p);
        }
        assert_eq!(alloc.alloc(&mut h, MAX_CLASS_SIZE, 8), Some(p));
        assert_eq!(alloc.committed_physical() - before, MAX_CLASS_SIZE);
    }

    #[test]
    fn test_physical_budget_exhaustion_and_recovery() {
        // Budget: one header page plus two chunks.
        let page = PlatformVmOps::page_size();
        let physical = page + 2 * alloc_chunk();
        let alloc = Allocator::new(physical, 64 * MB).unwrap();
        let mut h = alloc.init_handle(0).unwrap();

        // First chunk holds one 1MB block (its head holds the cold table),
        // the second holds two.
        let blocks: Vec<_> = (0..3).map(|_| alloc.alloc(&mut h, MB, 8).unwrap()).collect();
        assert!(alloc.alloc(&mut h, MB, 8).is_none());
        let stats = alloc.stats();
        assert_eq!(stats.committed_physical, physical);
        assert!(stats.committed_physical <= stats.physical_budget);
        assert_eq!(stats.failed_allocs, 1);

        // Safety: Test code.
        unsafe { alloc.free(&mut h, MB, 8, blocks[1]) };
        assert_eq!(alloc.alloc(&mut h, MB, 8), Some(blocks[1]));
        assert_eq!(alloc.committed_physical(), physical);
    }

    fn alloc_chunk() -> usize {
        VirtualAllocConfig::default().chunk_size
    }

    #[test]
    fn test_virtual_exhaustion_migrates_then_fails() {
        // Two shards of 16MB, each fitting seven 2MB chunks below its header.
        let alloc = Allocator::new(1 << 30, 32 * MB).unwrap();
        let mut h = alloc.init_handle(0).unwrap();
        let first = h.shard_index();

        let mut blocks = Vec::new();
        while let Some(p) = alloc.alloc(&mut h, MB, 8) {
            blocks.push(p);
        }
        // 1 + 6 * 2 in the first shard, 7 * 2 in the second.
        assert_eq!(blocks.len(), 27);
        assert_ne!(h.shard_index(), first);
        assert_eq!(h.migrations(), 1);

        let stats = alloc.stats();
        assert_eq!(stats.shards_claimed, 2);
        assert_eq!(stats.shards_exhausted, 2);
        assert_eq!(stats.migrations, 1);
        assert!(alloc.init_handle(99).is_none());

        // Freeing into the current shard makes room locally; freeing into the
        // old one goes through its remote queue.
        let last = blocks.pop().unwrap();
        let oldest = blocks[0];
        // Safety: Test code.
        unsafe {
            alloc.free(&mut h, MB, 8, last);
            alloc.free(&mut h, MB, 8, oldest);
        }
        assert_eq!(alloc.stats().remote_frees, 1);
        assert_eq!(alloc.alloc(&mut h, MB, 8), Some(last));
    }

    #[test]
    fn test_frees_left_behind_on_an_old_shard_come_back() {
        let alloc = Allocator::new(1 << 30, 32 * MB).unwrap();
        let mut h = alloc.init_handle(0).unwrap();
        let mut blocks = Vec::new();
        while let Some(p) = alloc.alloc(&mut h, MB, 8) {
            blocks.push(p);
        }
        assert_eq!(blocks.len(), 27);

        // The handle sits on the second shard now; the first shard's 13
        // blocks land on its remote queue, which no handle drains.
        for &p in &blocks {
            // Safety: Test code.
            unsafe { alloc.free(&mut h, MB, 8, p) };
        }
        assert_eq!(alloc.stats().remote_frees, 13);

        let mut again = 0;
        while alloc.alloc(&mut h, MB, 8).is_some() {
            again += 1;
        }
        assert_eq!(again, 27);
        assert_eq!(alloc.stats().remote_drains, 1);
    }

    #[test]
    fn test_direct_class_spills_to_another_shard_without_moving() {
        let alloc = Allocator::new(1 << 30, 32 * MB).unwrap();
        let mut h = alloc.init_handle(0).unwrap();
        let home = h.shard_index();
        let small = alloc.alloc(&mut h, 16, 8).unwrap();

        // Two 4MB blocks fit above the first chunk; the third does not.
        let big: Vec<_> = (0..3).map(|_| alloc.alloc(&mut h, 4 * MB, 8).unwrap()).collect();
        let owner = |p: NonNull<u8>| alloc.shard_index_of(p.as_ptr() as usize).unwrap();
        assert_eq!(owner(big[1]), home);
        assert_ne!(owner(big[2]), home);
        assert_eq!(h.shard_index(), home);
        assert_eq!(h.migrations(), 0);

        // The chunk survived, so small blocks cost nothing new.
        let committed = alloc.committed_physical();
        let next = alloc.alloc(&mut h, 16, 8).unwrap();
        assert_eq!(next.as_ptr() as usize, small.as_ptr() as usize + 16);
        assert_eq!(alloc.committed_physical(), committed);
        assert_eq!(alloc.stats().migrations, 0);
    }

    #[test]
    fn test_direct_class_failure_keeps_chunk() {
        let alloc = Allocator::new(1 << 30, 16 * MB).unwrap();
        let mut h = alloc.init_handle(0).unwrap();
        alloc.alloc(&mut h, 16, 8).unwrap();
        assert!(alloc.alloc(&mut h, 4 * MB, 8).is_some());
        assert!(alloc.alloc(&mut h, 4 * MB, 8).is_some());
        assert!(alloc.alloc(&mut h, 4 * MB, 8).is_none());

        let committed = alloc.committed_physical();
        assert!(alloc.alloc(&mut h, 16, 8).is_some());
        assert_eq!(alloc.committed_physical(), committed);
        let stats = alloc.stats();
        assert_eq!(stats.migrations, 0);
        assert_eq!(stats.shards_exhausted, 0);
        assert_eq!(stats.failed_allocs, 1);
    }

    #[test]
    fn test_detached_free_goes_to_owner_queue() {
        let alloc = Allocator::new(1 << 30, 1 << 30).unwrap();
        let mut h = alloc.init_handle(3).unwrap();
        let p = alloc.alloc(&mut h, 256, 8).unwrap();
        // Safety: Test code.
        unsafe { alloc.free_detached(256, 8, p) };
        assert_eq!(alloc.stats().remote_frees, 1);
        let class = SizeClass::of(256, 8).unwrap();
        assert_eq!(chain_len(alloc.shard_of(&h).remote(class).take_all()), 1);
    }

    #[test]
    fn test_remote_free_is_reclaimed_by_owner() {
        let alloc = Allocator::new(1 << 30, 1 << 30).unwrap();
        let (mut h1, mut h2) = two_handles(&alloc);

        // 512KB blocks: three fit in h1's first chunk after the cold table.
        let size = 512 * 1024;
        let ptrs: Vec<_> = (0..3).map(|_| alloc.alloc(&mut h1, size, 8).unwrap()).collect();

        // Safety: Test code; h2 frees a block owned by h1's shard.
        unsafe { alloc.free(&mut h2, size, 8, ptrs[0]) };
        let stats = alloc.stats();
        assert_eq!(stats.remote_frees, 1);
        assert_eq!(stats.remote_drains, 0);

        // h1's chunk is spent, so the next miss drains the remote queue.
        let committed = alloc.committed_physical();
        assert_eq!(alloc.alloc(&mut h1, size, 8), Some(ptrs[0]));
        assert_eq!(alloc.stats().remote_drains, 1);
        assert_eq!(alloc.committed_physical(), committed);
    }

    #[test]
    fn test_remote_chain_is_linked() {
        let alloc = Allocator::new(1 << 30, 1 << 30).unwrap();
        let (mut h1, mut h2) = two_handles(&alloc);
        let ptrs: Vec<_> = (0..4).map(|_| alloc.alloc(&mut h1, 32, 8).unwrap()).collect();
        for &p in &ptrs {
            // Safety: Test code.
            unsafe { alloc.free(&mut h2, 32, 8, p) };
        }
        let class = SizeClass::of(32, 8).unwrap();
        let shard = alloc.shard_of(&h1);
        assert_eq!(chain_len(shard.remote(class).take_all()), 4);
    }

    #[test]
    fn test_small_and_large_classes_do_not_overlap() {
        let config = VirtualAllocConfig::new(1 << 30, 64 * MB);
        let alloc = Allocator::with_config(config).unwrap();
        let mut h = alloc.init_handle(5).unwrap();
        let mut ranges = Vec::new();
        for i in 0..200usize {
            let size = 16 << (i % 19);
            if let Some(p) = alloc.alloc(&mut h, size, 8) {
                ranges.push((p.as_ptr() as usize, size));
            }
        }
        ranges.sort_unstable();
        for w in ranges.windows(2) {
            assert!(w[0].0 + w[0].1 <= w[1].0, "overlap: {w:?}");
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_is_caught_in_debug() {
        let alloc = Allocator::new(64 * MB, 64 * MB).unwrap();
        let mut h = alloc.init_handle(3).unwrap();
        let p = alloc.alloc(&mut h, 64, 8).unwrap();
        // Safety: Test code; the second free is the bug under test.
        unsafe {
            alloc.free(&mut h, 64, 8, p);
            alloc.free(&mut h, 64, 8, p);
        }
    }
}
