use super::handle::Handle;
use super::shard::{Shard, ShardState};
use super::stats::{AllocCounters, AllocatorStats};
use super::vm::{PlatformVmOps, Reservation, VmError, VmOps};
use crate::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use crate::sync::hint;
#[cfg(debug_assertions)]
use crate::sync::{Mutex, OnceLock};
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Virtual slice per shard. A leaked handle strands at most one shard's
/// worth of address space.
pub const DEFAULT_SHARD_SIZE: usize = 16 * 1024 * 1024;

/// Private bump chunk a handle claims from its shard. Committed in one go,
/// so this is also the physical cost of a leaked handle.
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Upper bound on the shard table; 16 TiB of address space at the default
/// shard size.
pub(crate) const MAX_SHARDS: usize = 1 << 20;

/// Configuration for [`Allocator`]. Budgets are required; the geometry has
/// sensible defaults.
#[derive(Clone, Debug)]
pub struct VirtualAllocConfig {
    /// Hard ceiling on bytes ever committed.
    pub physical_budget: usize,

    /// Ceiling on address space reserved. Rounded down to whole shards.
    pub virtual_budget: usize,

    /// Bytes of address space per shard. Power of two. Default: 16 MiB.
    pub shard_size: usize,

    /// Bytes per handle bump chunk. Power of two, page multiple, at most a
    /// quarter of `shard_size`. Default: 2 MiB.
    pub chunk_size: usize,
}

impl Default for VirtualAllocConfig {
    fn default() -> Self {
        Self {
            physical_budget: 1 << 30,
            virtual_budget: 1 << 40,
            shard_size: DEFAULT_SHARD_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl VirtualAllocConfig {
    #[must_use]
    pub fn new(physical_budget: usize, virtual_budget: usize) -> Self {
        Self {
            physical_budget,
            virtual_budget,
            ..Self::default()
        }
    }

    fn validate(&self, page_size: usize) -> Result<(), VmError> {
        if !self.shard_size.is_power_of_two() {
            return Err(VmError::InitializationFailed(format!(
                "shard_size {} is not a power of two",
                self.shard_size
            )));
        }
        if !self.chunk_size.is_power_of_two() || self.chunk_size < page_size {
            return Err(VmError::InitializationFailed(format!(
                "chunk_size {} must be a power of two and at least one page ({page_size})",
                self.chunk_size
            )));
        }
        if self.chunk_size > self.shard_size / 4 {
            return Err(VmError::InitializationFailed(format!(
                "chunk_size {} exceeds a quarter of shard_size {}",
                self.chunk_size, self.shard_size
            )));
        }
        if self.virtual_budget < self.shard_size {
            return Err(VmError::InitializationFailed(format!(
                "virtual_budget {} is smaller than one shard ({})",
                self.virtual_budget, self.shard_size
            )));
        }
        Ok(())
    }
}

/// Hard physical ceiling. Unlike the diagnostic counters this one is exact:
/// every commit path charges it before touching the OS.
pub(crate) struct PhysicalBudget {
    limit: usize,
    committed: AtomicUsize,
}

impl PhysicalBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            committed: AtomicUsize::new(0),
        }
    }

    /// Atomically charge `bytes`. Fails without side effects if the charge
    /// would cross the limit.
    pub fn try_charge(&self, bytes: usize) -> bool {
        let mut cur = self.committed.load(Ordering::Relaxed);
        loop {
            let Some(next) = cur.checked_add(bytes).filter(|&n| n <= self.limit) else {
                return false;
            };
            match self
                .committed
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Undo a charge whose OS commit or virtual claim failed.
    pub fn refund(&self, bytes: usize) {
        let prev = self.committed.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "physical budget refund underflow");
    }

    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Why fresh memory could not be produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GrowError {
    /// Charging the physical budget would cross its limit.
    Physical,
    /// The shard's window cannot fit the request.
    Virtual,
    /// The OS refused to back the range.
    Commit,
}

/// The Budget & Arena Manager: one virtual reservation split into shards,
/// plus the physical budget every commit is charged against.
///
/// Handles borrow the allocator, so none can outlive it. Dropping it releases
/// the whole reservation; the process-wide instance behind
/// [`GlobalVirtualAlloc`](super::global::GlobalVirtualAlloc) is never dropped.
pub struct Allocator {
    budget: PhysicalBudget,
    virtual_budget: usize,
    /// Shard-aligned window holding every shard back to back.
    arena: Reservation,
    /// Start of shard 0, cached from `arena`.
    base: usize,
    shard_size: usize,
    shard_shift: u32,
    chunk_size: usize,
    /// Bytes at the top of each shard holding its `Shard` header.
    header_size: usize,
    states: Box<[AtomicU32]>,
    claimed: AtomicUsize,
    exhausted: AtomicUsize,
    pub(crate) counters: AllocCounters,
    /// Debug-only map of live block starts per shard, at 16-byte granularity.
    #[cfg(debug_assertions)]
    live: Box<[OnceLock<Mutex<FixedBitSet>>]>,
}

impl Allocator {
    /// Reserve an arena with default geometry.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the budgets are unusable or the reservation fails.
    pub fn new(physical_budget: usize, virtual_budget: usize) -> Result<Self, VmError> {
        Self::with_config(VirtualAllocConfig::new(physical_budget, virtual_budget))
    }

    /// Reserve an arena with custom geometry.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` for invalid configuration and
    /// `VmError::ReservationFailed` if the OS refuses the address space.
    pub fn with_config(config: VirtualAllocConfig) -> Result<Self, VmError> {
        let page_size = PlatformVmOps::page_size();
        config.validate(page_size)?;

        let shard_size = config.shard_size;
        let shard_count = (config.virtual_budget / shard_size).min(MAX_SHARDS);
        let arena = Reservation::aligned(shard_count * shard_size, shard_size)?;
        let base = arena.base();

        let header_size = std::mem::size_of::<Shard>().next_multiple_of(page_size);
        let states = (0..shard_count)
            .map(|_| AtomicU32::new(ShardState::Unclaimed as u32))
            .collect();

        tracing::info!(
            physical_budget = config.physical_budget,
            virtual_budget = config.virtual_budget,
            shard_count,
            shard_size,
            chunk_size = config.chunk_size,
            "reserved allocator arena"
        );

        Ok(Self {
            budget: PhysicalBudget::new(config.physical_budget),
            virtual_budget: config.virtual_budget,
            arena,
            base,
            shard_size,
            shard_shift: shard_size.trailing_zeros(),
            chunk_size: config.chunk_size,
            header_size,
            states,
            claimed: AtomicUsize::new(0),
            exhausted: AtomicUsize::new(0),
            counters: AllocCounters::default(),
            #[cfg(debug_assertions)]
            live: (0..shard_count).map(|_| OnceLock::new()).collect(),
        })
    }

    /// Create a handle bound to the shard `seed` hashes to.
    ///
    /// Probes past exhausted shards. Claims the handle's first chunk, so a
    /// handle costs one chunk of physical memory up front (plus one header
    /// page if its shard was never used). Returns `None` when no shard can
    /// supply a chunk or the physical budget cannot cover one.
    ///
    /// Handles are never destroyed; see [`Handle`] for the leak bound.
    pub fn init_handle(&self, seed: u64) -> Option<Handle<'_>> {
        let count = self.shard_count();
        #[allow(clippy::cast_possible_truncation)]
        let start = (mix_seed(seed) % count as u64) as usize;
        for step in 0..count {
            if self.exhausted.load(Ordering::Relaxed) >= count {
                break;
            }
            let idx = (start + step) % count;
            if self.state(idx) == ShardState::Exhausted {
                continue;
            }
            let shard = match self.claim_shard(idx) {
                Ok(shard) => shard,
                // Part of a large block.
                Err(GrowError::Virtual) => continue,
                Err(err) => {
                    tracing::debug!(shard = idx, ?err, "handle init failed");
                    return None;
                }
            };
            match self.grow(shard, self.chunk_size, self.chunk_size) {
                Ok(chunk) => {
                    // Safety: chunk was just committed, is chunk-aligned and
                    // exclusively ours.
                    return Some(unsafe { Handle::new(idx, chunk, self.chunk_size) });
                }
                Err(GrowError::Virtual) => self.mark_exhausted(idx),
                Err(err) => {
                    tracing::debug!(shard = idx, ?err, "handle init failed");
                    return None;
                }
            }
        }
        tracing::debug!(seed, "no shard capacity left for a new handle");
        None
    }

    /// Charge, claim and commit `len` bytes aligned to `align` from `shard`.
    pub(crate) fn grow(&self, shard: &Shard, len: usize, align: usize) -> Result<NonNull<u8>, GrowError> {
        if !self.budget.try_charge(len) {
            return Err(GrowError::Physical);
        }
        let Some(start) = shard.claim(len, align) else {
            self.budget.refund(len);
            return Err(GrowError::Virtual);
        };
        // Safety: [start, start + len) was just claimed and is exclusively ours.
        if let Err(e) = unsafe { self.arena.commit(start, len) } {
            // The claimed range stays as a gap; only the charge is returned.
            self.budget.refund(len);
            tracing::warn!(error = %e, len, "commit failed");
            return Err(GrowError::Commit);
        }
        shard.record_commit(start, len);
        // Safety: claimed addresses lie inside the reservation, which never
        // starts at null.
        Ok(unsafe { NonNull::new_unchecked(start as *mut u8) })
    }

    /// Charge, claim and commit `len` bytes aligned to `align` from the
    /// first shard after `from` that has room, claiming shards on the way.
    ///
    /// Serves direct-class blocks once the caller's own shard is full. The
    /// caller's handle stays where it is.
    pub(crate) fn grow_elsewhere(&self, from: usize, len: usize, align: usize) -> Result<NonNull<u8>, GrowError> {
        let count = self.shard_count();
        for step in 1..count {
            let idx = (from + step) % count;
            if matches!(self.state(idx), ShardState::Exhausted | ShardState::Large) {
                continue;
            }
            let shard = match self.claim_shard(idx) {
                Ok(shard) => shard,
                Err(GrowError::Virtual) => continue,
                Err(err) => return Err(err),
            };
            match self.grow(shard, len, align) {
                Err(GrowError::Virtual) => {
                    if !shard.can_fit(self.chunk_size, self.chunk_size) {
                        self.mark_exhausted(idx);
                    }
                }
                grown => return grown,
            }
        }
        Err(GrowError::Virtual)
    }

    /// Move `handle` to the next shard that still has room.
    ///
    /// Linear probing from the current shard keeps migrating handles spread
    /// the same way their seeds spread them. The current shard is never a
    /// candidate.
    pub(crate) fn migrate(&self, handle: &mut Handle<'_>) -> bool {
        let count = self.shard_count();
        let from = handle.shard_index();
        for step in 1..count {
            if self.exhausted.load(Ordering::Relaxed) >= count {
                return false;
            }
            let idx = (from + step) % count;
            if matches!(self.state(idx), ShardState::Exhausted | ShardState::Large) {
                continue;
            }
            match self.claim_shard(idx) {
                Ok(_) => {}
                Err(GrowError::Virtual) => continue,
                Err(_) => return false,
            }
            handle.rebind(idx);
            self.counters.migrations.incr();
            tracing::debug!(from, to = idx, "handle migrated to a new shard");
            return true;
        }
        false
    }

    /// Header of a shard, committing and initialising it on first use.
    ///
    /// The first claimer commits the header page and publishes it with a
    /// Release store; concurrent claimers spin until then. Setup is a
    /// single commit, so the spin is short and happens once per shard.
    pub(crate) fn claim_shard(&self, idx: usize) -> Result<&Shard, GrowError> {
        let slot = &self.states[idx];
        loop {
            match ShardState::from_u32(slot.load(Ordering::Acquire)) {
                ShardState::Ready | ShardState::Exhausted => {
                    // Safety: header initialised before the Ready store we
                    // just acquired.
                    return Ok(unsafe { &*self.shard_ptr(idx) });
                }
                ShardState::Claiming => hint::spin_loop(),
                ShardState::Large => return Err(GrowError::Virtual),
                ShardState::Unclaimed => {
                    if slot
                        .compare_exchange(
                            ShardState::Unclaimed as u32,
                            ShardState::Claiming as u32,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    match self.init_shard(idx) {
                        Ok(shard) => {
                            slot.store(ShardState::Ready as u32, Ordering::Release);
                            self.claimed.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(shard = idx, "claimed shard");
                            return Ok(shard);
                        }
                        Err(err) => {
                            slot.store(ShardState::Unclaimed as u32, Ordering::Release);
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    fn init_shard(&self, idx: usize) -> Result<&Shard, GrowError> {
        if !self.budget.try_charge(self.header_size) {
            return Err(GrowError::Physical);
        }
        let header = self.shard_ptr(idx);
        // Safety: only the thread in Claiming state touches this page.
        if let Err(e) = unsafe { self.arena.commit(header as usize, self.header_size) } {
            self.budget.refund(self.header_size);
            tracing::warn!(error = %e, shard = idx, "shard header commit failed");
            return Err(GrowError::Commit);
        }
        let start = self.shard_start(idx);
        // Safety: page committed above, aligned for Shard, exclusively ours.
        unsafe { header.write(Shard::new(start, header as usize)) };
        // Safety: just initialised.
        Ok(unsafe { &*header })
    }

    /// Shard the handle is currently bound to. Always claimed.
    #[inline]
    pub(crate) fn shard_of(&self, handle: &Handle<'_>) -> &Shard {
        let idx = handle.shard_index();
        debug_assert!(
            matches!(self.state(idx), ShardState::Ready | ShardState::Exhausted),
            "handle bound to unclaimed shard {idx}"
        );
        // Safety: a handle is only ever bound to a claimed shard, and claimed
        // shards are never released while the allocator lives.
        unsafe { &*self.shard_ptr(idx) }
    }

    /// Header of the shard owning `addr`, if `addr` lies in a claimed shard.
    #[inline]
    pub(crate) fn owner_of(&self, addr: usize) -> Option<(usize, &Shard)> {
        let idx = self.shard_index_of(addr)?;
        Some((idx, self.claimed_shard(idx)?))
    }

    /// Header of shard `idx` if it has one.
    #[inline]
    pub(crate) fn claimed_shard(&self, idx: usize) -> Option<&Shard> {
        if !matches!(self.state(idx), ShardState::Ready | ShardState::Exhausted) {
            return None;
        }
        // Safety: Ready and Exhausted shards have a live header.
        Some(unsafe { &*self.shard_ptr(idx) })
    }

    /// Whether `ptr` lies inside this allocator's reservation.
    #[inline]
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.shard_index_of(ptr as usize).is_some()
    }

    #[inline]
    pub(crate) fn shard_index_of(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)?;
        let idx = offset >> self.shard_shift;
        (idx < self.states.len()).then_some(idx)
    }

    pub(crate) fn mark_exhausted(&self, idx: usize) {
        if self.states[idx]
            .compare_exchange(
                ShardState::Ready as u32,
                ShardState::Exhausted as u32,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            let total = self.exhausted.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(shard = idx, exhausted = total, "shard address space exhausted");
        }
    }

    #[inline]
    pub(crate) fn state(&self, idx: usize) -> ShardState {
        ShardState::from_u32(self.states[idx].load(Ordering::Acquire))
    }

    /// Claim `runs` consecutive never-claimed shards for a large block. The
    /// first one starts at a multiple of `align`; its index is returned.
    ///
    /// Shards are taken one CAS at a time. A partial run is handed back and
    /// the search resumes at the next aligned start past the blocking shard.
    pub(crate) fn claim_run(&self, runs: usize, align: usize) -> Option<usize> {
        debug_assert!(runs > 0 && align.is_power_of_two());
        let count = self.shard_count();
        let step = (align >> self.shard_shift).max(1);
        let mut first = (self.base.checked_next_multiple_of(align)? - self.base) >> self.shard_shift;
        while first.checked_add(runs)? <= count {
            match (first..first + runs).find(|&idx| !self.take_for_large(idx)) {
                None => return Some(first),
                Some(blocked) => {
                    self.release_run(first, blocked - first);
                    first += (blocked - first) / step * step + step;
                }
            }
        }
        None
    }

    fn take_for_large(&self, idx: usize) -> bool {
        self.states[idx]
            .compare_exchange(
                ShardState::Unclaimed as u32,
                ShardState::Large as u32,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Hand shards `first..first + runs` back as unclaimed.
    pub(crate) fn release_run(&self, first: usize, runs: usize) {
        for slot in &self.states[first..first + runs] {
            debug_assert_eq!(ShardState::from_u32(slot.load(Ordering::Relaxed)), ShardState::Large);
            slot.store(ShardState::Unclaimed as u32, Ordering::Release);
        }
    }

    /// Charge and commit `[start, start + len)` of a range the caller
    /// already holds exclusively.
    pub(crate) fn commit_owned(&self, start: usize, len: usize) -> Result<(), GrowError> {
        if !self.budget.try_charge(len) {
            return Err(GrowError::Physical);
        }
        // Safety: the caller holds the range.
        if let Err(e) = unsafe { self.arena.commit(start, len) } {
            self.budget.refund(len);
            tracing::warn!(error = %e, len, "commit failed");
            return Err(GrowError::Commit);
        }
        Ok(())
    }

    /// Undo `commit_owned`: give the pages back and refund the charge.
    ///
    /// # Safety
    /// Nothing may touch the range afterwards until it is committed again.
    pub(crate) unsafe fn decommit_owned(&self, start: usize, len: usize) -> Result<(), VmError> {
        // Safety: upheld by caller.
        unsafe { self.arena.decommit(start, len)? };
        self.budget.refund(len);
        Ok(())
    }

    #[inline]
    pub(crate) fn shard_start(&self, idx: usize) -> usize {
        self.base + (idx << self.shard_shift)
    }

    #[inline]
    fn shard_ptr(&self, idx: usize) -> *mut Shard {
        (self.shard_start(idx) + self.shard_size - self.header_size) as *mut Shard
    }

    /// Whether blocks of `class_size` are bump-allocated from handle chunks
    /// (as opposed to claimed straight from the shard).
    #[inline]
    pub(crate) fn is_chunked(&self, class_size: usize) -> bool {
        class_size <= self.chunk_size / 2
    }

    #[inline]
    pub fn shard_count(&self) -> usize {
        self.states.len()
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn shard_size(&self) -> usize {
        self.shard_size
    }

    /// Bytes currently charged against the physical budget.
    #[inline]
    pub fn committed_physical(&self) -> usize {
        self.budget.committed()
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            physical_budget: self.budget.limit(),
            virtual_budget: self.virtual_budget,
            committed_physical: self.budget.committed(),
            reserved_virtual: self.arena.len(),
            shard_count: self.shard_count(),
            shards_claimed: self.claimed.load(Ordering::Relaxed),
            shards_exhausted: self.exhausted.load(Ordering::Relaxed),
            remote_frees: self.counters.remote_frees.get(),
            remote_drains: self.counters.remote_drains.get(),
            migrations: self.counters.migrations.get(),
            failed_allocs: self.counters.failed_allocs.get(),
            large_allocs: self.counters.large_allocs.get(),
        }
    }

    #[cfg(debug_assertions)]
    fn live_map(&self, addr: usize) -> Option<(&Mutex<FixedBitSet>, usize)> {
        let idx = self.shard_index_of(addr)?;
        let map = self.live[idx].get_or_init(|| {
            Mutex::new(FixedBitSet::with_capacity(
                self.shard_size / super::size_class::MIN_CLASS_SIZE,
            ))
        });
        let bit = (addr - self.shard_start(idx)) / super::size_class::MIN_CLASS_SIZE;
        Some((map, bit))
    }

    /// Debug-only: assert `ptr` is not already live, then mark it live.
    #[cfg(debug_assertions)]
    pub(crate) fn debug_track_alloc(&self, ptr: NonNull<u8>, class_size: usize) {
        let addr = ptr.as_ptr() as usize;
        assert!(
            addr.is_multiple_of(class_size),
            "block {ptr:p} is not aligned to its class size {class_size}"
        );
        let Some((map, bit)) = self.live_map(addr) else {
            panic!("block {ptr:p} handed out from outside the reservation");
        };
        let mut live = map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        assert!(!live.contains(bit), "block {ptr:p} handed out twice");
        live.insert(bit);
    }

    /// Debug-only: assert `ptr` is live, then mark it free.
    #[cfg(debug_assertions)]
    pub(crate) fn debug_track_free(&self, ptr: NonNull<u8>) {
        let Some((map, bit)) = self.live_map(ptr.as_ptr() as usize) else {
            panic!("free of {ptr:p}, which is outside the reservation");
        };
        let mut live = map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        assert!(live.contains(bit), "double free or foreign pointer: {ptr:p}");
        live.set(bit, false);
    }
}

/// SplitMix64 finalizer: spreads sequential seeds across shards.
#[inline]
pub(crate) const fn mix_seed(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
