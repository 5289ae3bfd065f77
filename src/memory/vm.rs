//! Address-space reservation and commit.
//!
//! The allocator reserves its whole arena once as inaccessible address space
//! and makes pieces of it readable/writable on demand. Only large blocks are
//! ever decommitted; the range goes back to the OS when the owning
//! [`Reservation`] is dropped.

use std::fmt;
use std::io;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    /// The OS refused to hand out address space.
    ReservationFailed(io::Error),
    /// The OS refused to back a reserved range with memory.
    CommitFailed(io::Error),
    /// Returning committed pages to the OS failed.
    DecommitFailed(io::Error),
    /// Unmapping a reservation failed.
    ReleaseFailed(io::Error),
    /// Budgets or geometry are unusable, or the allocator is already set up.
    InitializationFailed(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservationFailed(e) => write!(f, "address space reservation failed: {e}"),
            Self::CommitFailed(e) => write!(f, "commit of reserved range failed: {e}"),
            Self::DecommitFailed(e) => write!(f, "decommit of committed range failed: {e}"),
            Self::ReleaseFailed(e) => write!(f, "release of reservation failed: {e}"),
            Self::InitializationFailed(why) => write!(f, "cannot initialize allocator: {why}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReservationFailed(e)
            | Self::CommitFailed(e)
            | Self::DecommitFailed(e)
            | Self::ReleaseFailed(e) => Some(e),
            Self::InitializationFailed(_) => None,
        }
    }
}

/// Raw OS primitives. One implementation per platform, plus a heap-backed
/// stand-in for loom and miri.
pub(crate) trait VmOps {
    /// Map exactly `len` bytes of inaccessible address space starting at a
    /// multiple of `align`.
    unsafe fn reserve(len: usize, align: usize) -> Result<NonNull<u8>, VmError>;

    /// Make `[ptr, ptr + len)` of a reservation readable and writable.
    unsafe fn commit(ptr: NonNull<u8>, len: usize) -> Result<(), VmError>;

    /// Give the physical pages behind `[ptr, ptr + len)` back and make the
    /// range inaccessible again. Contents are lost.
    unsafe fn decommit(ptr: NonNull<u8>, len: usize) -> Result<(), VmError>;

    /// Unmap a whole reservation.
    unsafe fn release(ptr: NonNull<u8>, len: usize) -> Result<(), VmError>;

    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

/// Unaligned head and tail of an over-sized mapping at `raw`, as
/// `(start, len)` pairs, so that exactly `[base, base + len)` is left.
#[cfg(not(any(loom, miri)))]
fn padding_around(raw: usize, padded: usize, len: usize, align: usize) -> (usize, [(usize, usize); 2]) {
    let base = raw.next_multiple_of(align);
    let head = (raw, base - raw);
    let tail = (base + len, raw + padded - (base + len));
    (base, [head, tail])
}

#[cfg(all(unix, not(any(loom, miri))))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(len: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        if len == 0 {
            return Err(VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-length reservation",
            )));
        }
        // mmap only guarantees page alignment; map `align` extra and cut the
        // excess off both ends.
        let align = align.max(Self::page_size());
        let padded = len.checked_add(align).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::new(io::ErrorKind::InvalidInput, "reservation size overflows"))
        })?;
        // Safety: anonymous private mapping, no fd; the kernel picks the address.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                padded,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(VmError::ReservationFailed(io::Error::last_os_error()));
        }
        let (base, cuts) = padding_around(raw as usize, padded, len, align);
        for (start, cut) in cuts {
            // Safety: both pieces lie inside the mapping made above and
            // outside the part we keep.
            if cut > 0 && unsafe { libc::munmap(start as *mut libc::c_void, cut) } != 0 {
                let err = io::Error::last_os_error();
                // Safety: as above; drop whatever is still mapped.
                unsafe { libc::munmap(raw, padded) };
                return Err(VmError::ReservationFailed(err));
            }
        }
        NonNull::new(base as *mut u8)
            .ok_or_else(|| VmError::ReservationFailed(io::Error::other("mmap returned address 0")))
    }

    unsafe fn commit(ptr: NonNull<u8>, len: usize) -> Result<(), VmError> {
        let addr = ptr.as_ptr().cast::<libc::c_void>();
        // Safety: caller passes a range inside one of our reservations.
        if unsafe { libc::mprotect(addr, len, libc::PROT_READ | libc::PROT_WRITE) } != 0 {
            return Err(VmError::CommitFailed(io::Error::last_os_error()));
        }
        // Handle chunks are 2MB-aligned; let THP back them with one page.
        // Advisory only, so the result is ignored.
        #[cfg(target_os = "linux")]
        if len >= HUGE_PAGE_SIZE {
            // Safety: same range as above.
            unsafe { libc::madvise(addr, len, libc::MADV_HUGEPAGE) };
        }
        Ok(())
    }

    unsafe fn decommit(ptr: NonNull<u8>, len: usize) -> Result<(), VmError> {
        let addr = ptr.as_ptr().cast::<libc::c_void>();
        // MADV_FREE lets the kernel take the pages lazily; a later commit may
        // see old contents or zeroes.
        // Safety: caller passes a committed range of one of our reservations.
        if unsafe { libc::madvise(addr, len, libc::MADV_FREE) } != 0 {
            return Err(VmError::DecommitFailed(io::Error::last_os_error()));
        }
        // Safety: same range.
        if unsafe { libc::mprotect(addr, len, libc::PROT_NONE) } != 0 {
            return Err(VmError::DecommitFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    unsafe fn release(ptr: NonNull<u8>, len: usize) -> Result<(), VmError> {
        // Safety: caller passes a whole reservation returned by `reserve`.
        if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len) } != 0 {
            return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn page_size() -> usize {
        static PAGE: crate::sync::OnceLock<usize> = crate::sync::OnceLock::new();
        *PAGE.get_or_init(|| {
            // Safety: sysconf has no preconditions.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            usize::try_from(raw).ok().filter(|&p| p > 0).unwrap_or(4096)
        })
    }
}

#[cfg(all(target_os = "linux", not(any(loom, miri))))]
const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

// loom and miri cannot issue mmap; a zeroed heap block stands in for the
// reservation and is always accessible, so commit has nothing to do. The
// block is aligned to `len` rounded up to a power of two, which covers every
// `align` the allocator asks for and lets `release` rebuild the layout.
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(len: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        let layout = mock_layout(len).map_err(VmError::ReservationFailed)?;
        if align > layout.align() {
            return Err(VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment exceeds reservation size",
            )));
        }
        // Safety: mock_layout rejects zero sizes.
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::from(io::ErrorKind::OutOfMemory))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _len: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn decommit(_ptr: NonNull<u8>, _len: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn release(ptr: NonNull<u8>, len: usize) -> Result<(), VmError> {
        let layout = mock_layout(len).map_err(VmError::ReleaseFailed)?;
        // Safety: allocated by `reserve` with the same layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

#[cfg(any(loom, miri))]
fn mock_layout(len: usize) -> Result<std::alloc::Layout, io::Error> {
    if len == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero-length reservation"));
    }
    let align = len.checked_next_power_of_two().unwrap_or(1 << 62).max(4096);
    std::alloc::Layout::from_size_align(len, align).map_err(io::Error::other)
}

/// An owned, aligned reservation of exactly `len` bytes. Unmapped on drop.
pub(crate) struct Reservation {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the reservation is plain address space; access to its contents is
// synchronized by whoever carves it up.
unsafe impl Send for Reservation {}
// Safety: see above; `Reservation` itself is immutable.
unsafe impl Sync for Reservation {}

impl Reservation {
    /// Reserve `len` bytes of address space starting at a multiple of `align`.
    pub fn aligned(len: usize, align: usize) -> Result<Self, VmError> {
        debug_assert!(align.is_power_of_two());
        // Safety: fresh mapping, owned by the returned value.
        let base = unsafe { PlatformVmOps::reserve(len, align)? };
        Ok(Self { base, len })
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Bytes of address space held, with no padding on either side.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn range_ptr(&self, addr: usize, len: usize) -> NonNull<u8> {
        debug_assert!(addr >= self.base() && addr + len <= self.base() + self.len);
        // Safety: inside our mapping, which never starts at 0.
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    /// Commit `[addr, addr + len)`, which must lie inside the window.
    ///
    /// # Safety
    /// Nobody else may be using the range under a different protection.
    pub unsafe fn commit(&self, addr: usize, len: usize) -> Result<(), VmError> {
        // Safety: upheld by caller.
        unsafe { PlatformVmOps::commit(self.range_ptr(addr, len), len) }
    }

    /// Decommit `[addr, addr + len)`, which must lie inside the window.
    ///
    /// # Safety
    /// The range must be committed and no longer in use by anyone.
    pub unsafe fn decommit(&self, addr: usize, len: usize) -> Result<(), VmError> {
        // Safety: upheld by caller.
        unsafe { PlatformVmOps::decommit(self.range_ptr(addr, len), len) }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // Safety: `base`/`len` are exactly what `reserve` returned.
        if let Err(e) = unsafe { PlatformVmOps::release(self.base, self.len) } {
            tracing::warn!(error = %e, len = self.len, "failed to release reservation");
        }
    }
}
