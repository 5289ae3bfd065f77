use super::arena::{Allocator, VirtualAllocConfig};
use super::handle::Handle;
use super::vm::VmError;
use crate::sync::OnceLock;
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::cell::UnsafeCell;
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::ptr::NonNull;

static GLOBAL_VIRTUAL_INSTANCE: OnceLock<Allocator> = OnceLock::new();

// Seeds for lazily created thread handles; consecutive seeds are spread over
// the shards by the seed mixer.
crate::sync::static_atomic! {
    static NEXT_THREAD_SEED: AtomicU64 = AtomicU64::new(0);
}

// No destructor: the slot stays reachable while other TLS destructors run
// and free memory through it.
#[cfg(not(loom))]
thread_local! {
    static THREAD_HANDLE: ThreadHandleSlot = const { ThreadHandleSlot::new() };
}

#[cfg(loom)]
thread_local! {
    static THREAD_HANDLE: ThreadHandleSlot = ThreadHandleSlot::new();
}

/// Per-thread slot holding the lazily created handle.
///
/// # Safety
///
/// `handle` is only reached from the owning thread via TLS. `busy` rejects
/// re-entrant calls (a tracing subscriber allocating from inside
/// `init_handle`, say), so no two `&mut` to the handle ever coexist.
struct ThreadHandleSlot {
    handle: UnsafeCell<Option<Handle<'static>>>,
    busy: Cell<bool>,
}

impl ThreadHandleSlot {
    #[cfg(not(loom))]
    const fn new() -> Self {
        Self {
            handle: UnsafeCell::new(None),
            busy: Cell::new(false),
        }
    }

    #[cfg(loom)]
    fn new() -> Self {
        Self {
            handle: UnsafeCell::new(None),
            busy: Cell::new(false),
        }
    }

    /// Run `f` with this thread's handle, creating it on first use.
    ///
    /// The outer `None` means the slot is already in use further up this
    /// thread's stack; the inner one that no handle could be created.
    #[inline]
    fn with_handle<R>(
        &self,
        allocator: &'static Allocator,
        f: impl FnOnce(&mut Handle<'static>) -> R,
    ) -> Option<Option<R>> {
        if self.busy.replace(true) {
            return None;
        }
        // Safety: single-threaded TLS access, re-entry excluded by `busy`.
        let slot = crate::sync::unsafe_cell_get_mut!(self.handle);
        if slot.is_none() {
            let seed = NEXT_THREAD_SEED.fetch_add(1, Ordering::Relaxed);
            *slot = allocator.init_handle(seed);
        }
        let out = slot.as_mut().map(f);
        self.busy.set(false);
        Some(out)
    }
}

/// Process-wide allocator instance with an implicit handle per thread.
///
/// Use it through [`alloc`](Self::alloc)/[`free`](Self::free), or install
/// it as `#[global_allocator]`. Until [`init`](Self::init) runs, and
/// whenever a thread cannot reach its handle (re-entry from inside the
/// allocator, TLS already gone), `GlobalAlloc` requests are served by
/// [`System`]. `dealloc` tells the two apart by address.
pub struct GlobalVirtualAlloc;

impl GlobalVirtualAlloc {
    /// Initialize the global allocator.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` if the allocator is already
    /// initialized, or any error from [`Allocator::new`].
    pub fn init(physical_budget: usize, virtual_budget: usize) -> Result<(), VmError> {
        Self::init_with_config(VirtualAllocConfig::new(physical_budget, virtual_budget))
    }

    /// Initialize the global allocator with custom geometry.
    ///
    /// # Errors
    ///
    /// See [`init`](Self::init).
    pub fn init_with_config(config: VirtualAllocConfig) -> Result<(), VmError> {
        if GLOBAL_VIRTUAL_INSTANCE.get().is_some() {
            return Err(VmError::InitializationFailed("Already initialized".to_string()));
        }
        GLOBAL_VIRTUAL_INSTANCE
            .set(Allocator::with_config(config)?)
            .map_err(|_| VmError::InitializationFailed("Already initialized".to_string()))
    }

    /// Returns a reference to the initialized global allocator.
    ///
    /// # Panics
    ///
    /// Panics if the global allocator has not been initialized via [`init`](Self::init).
    pub fn get() -> &'static Allocator {
        GLOBAL_VIRTUAL_INSTANCE
            .get()
            .expect("GlobalVirtualAlloc not initialized")
    }

    #[inline]
    pub fn try_get() -> Option<&'static Allocator> {
        GLOBAL_VIRTUAL_INSTANCE.get()
    }

    /// Explicit handle on the global allocator, for callers that manage
    /// their own per-thread state.
    pub fn init_handle(seed: u64) -> Option<Handle<'static>> {
        Self::try_get()?.init_handle(seed)
    }

    /// Run `f` on the calling thread's handle. `None` when the allocator is
    /// not initialized, the thread's TLS is gone, or the call re-enters.
    #[inline]
    fn with_thread_handle<R>(
        f: impl FnOnce(&'static Allocator, &mut Handle<'static>) -> R,
    ) -> Option<Option<R>> {
        let allocator = Self::try_get()?;
        THREAD_HANDLE
            .try_with(|slot| slot.with_handle(allocator, |h| f(allocator, h)))
            .ok()
            .flatten()
    }

    /// Allocate through the calling thread's implicit handle.
    ///
    /// Returns `None` if the allocator is not initialized, the thread's
    /// handle cannot be created, or the request fails.
    pub fn alloc(size: usize, align: usize) -> Option<NonNull<u8>> {
        Self::with_thread_handle(|allocator, h| allocator.alloc(h, size, align))
            .flatten()
            .flatten()
    }

    /// Free through the calling thread's implicit handle. Without one, the
    /// block goes straight to its owning shard.
    ///
    /// # Safety
    /// - `ptr` must come from [`alloc`](Self::alloc) (on any thread) with the
    ///   same `size` and `align`.
    /// - `ptr` must not have been freed already.
    pub unsafe fn free(size: usize, align: usize, ptr: NonNull<u8>) {
        let Some(allocator) = Self::try_get() else {
            return;
        };
        let freed = Self::with_thread_handle(|allocator, h| {
            // Safety: upheld by caller.
            unsafe { allocator.free(h, size, align, ptr) }
        });
        if freed.flatten().is_none() {
            // Safety: upheld by caller.
            unsafe { allocator.free_detached(size, align, ptr) };
        }
    }
}

// Safety: blocks come either from the arena or from `System`, and `dealloc`
// returns each to where it came from by checking the address range.
unsafe impl GlobalAlloc for GlobalVirtualAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match Self::with_thread_handle(|allocator, h| allocator.alloc(h, layout.size(), layout.align())) {
            Some(block) => block.flatten().map_or(std::ptr::null_mut(), NonNull::as_ptr),
            // Safety: forwarded caller contract.
            None => unsafe { System.alloc(layout) },
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(block) = NonNull::new(ptr) else {
            return;
        };
        if Self::try_get().is_some_and(|allocator| allocator.owns(ptr)) {
            // Safety: allocated by us with this layout.
            unsafe { Self::free(layout.size(), layout.align(), block) }
        } else {
            // Safety: not ours, so it came from `System`.
            unsafe { System.dealloc(ptr, layout) }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::thread;

    const MB: usize = 1024 * 1024;

    fn ensure_init() -> &'static Allocator {
        drop(GlobalVirtualAlloc::init(1 << 30, 1 << 40));
        GlobalVirtualAlloc::get()
    }

    #[test]
    fn test_global_double_init_is_rejected() {
        ensure_init();
        assert!(matches!(
            GlobalVirtualAlloc::init(MB, MB),
            Err(VmError::InitializationFailed(_))
        ));
    }

    #[test]
    fn test_global_alloc_free_roundtrip() {
        ensure_init();
        for _ in 0..10_000 {
            let p = GlobalVirtualAlloc::alloc(128, 8).unwrap();
            // Safety: Test code.
            unsafe {
                p.as_ptr().write_bytes(0x42, 128);
                GlobalVirtualAlloc::free(128, 8, p);
            }
        }
    }

    #[test]
    fn test_global_alloc_trait() {
        ensure_init();
        let layout = Layout::from_size_align(256, 64).unwrap();
        // Safety: Test code.
        unsafe {
            let p = GlobalAlloc::alloc(&GlobalVirtualAlloc, layout);
            assert!(!p.is_null());
            assert!((p as usize).is_multiple_of(64));
            p.write_bytes(7, 256);
            GlobalAlloc::dealloc(&GlobalVirtualAlloc, p, layout);
        }
    }

    #[test]
    fn test_global_cross_thread_free() {
        ensure_init();
        let ptrs: Vec<usize> = thread::spawn(|| {
            (0..64)
                .map(|_| GlobalVirtualAlloc::alloc(48, 16).unwrap().as_ptr() as usize)
                .collect()
        })
        .join()
        .unwrap();
        for p in ptrs {
            // Safety: Test code; blocks allocated on the other thread.
            unsafe { GlobalVirtualAlloc::free(48, 16, NonNull::new(p as *mut u8).unwrap()) };
        }
    }

    #[test]
    fn test_reentrant_slot_use_is_refused() {
        let allocator = ensure_init();
        let slot = ThreadHandleSlot::new();
        let nested = slot.with_handle(allocator, |_| slot.with_handle(allocator, |_| ()));
        assert_eq!(nested, Some(Some(None)));
        // Released again afterwards.
        assert_eq!(slot.with_handle(allocator, |_| 1), Some(Some(1)));
    }

    #[test]
    fn test_foreign_pointers_go_back_to_system() {
        let allocator = ensure_init();
        let layout = Layout::from_size_align(64, 8).unwrap();
        // Safety: Test code; the block comes from `System`, as it would
        // before `init`.
        unsafe {
            let p = System.alloc(layout);
            assert!(!p.is_null());
            assert!(!allocator.owns(p));
            GlobalAlloc::dealloc(&GlobalVirtualAlloc, p, layout);
        }
    }

    #[test]
    fn test_global_large_block_round_trip() {
        let allocator = ensure_init();
        let layout = Layout::from_size_align(24 * MB, 8).unwrap();
        // Safety: Test code.
        unsafe {
            let p = GlobalAlloc::alloc(&GlobalVirtualAlloc, layout);
            assert!(allocator.owns(p));
            p.add(24 * MB - 1).write(3);
            GlobalAlloc::dealloc(&GlobalVirtualAlloc, p, layout);
        }
    }

    #[test]
    fn test_explicit_global_handle() {
        let allocator = ensure_init();
        let mut h = GlobalVirtualAlloc::init_handle(12345).unwrap();
        let p = allocator.alloc(&mut h, 4096, 4096).unwrap();
        // Safety: Test code.
        unsafe { allocator.free(&mut h, 4096, 4096, p) };
    }
}
