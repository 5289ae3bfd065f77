//! C ABI over the process-wide allocator. See `include/virtual_alloc.h`.
//!
//! Panics never cross the boundary: they are logged and the process aborts.

use crate::memory::{GlobalVirtualAlloc, HANDLE_WORDS, Handle};
use std::ffi::c_void;
use std::panic::{UnwindSafe, catch_unwind};
use std::ptr::NonNull;

/// Opaque, caller-owned storage for a [`Handle`]. Byte-movable (`memcpy`),
/// never to be duplicated.
#[repr(C)]
pub struct VirtualAllocHandle {
    _private: [u64; HANDLE_WORDS],
}

const _: () = assert!(size_of::<VirtualAllocHandle>() == size_of::<Handle<'static>>());
const _: () = assert!(align_of::<VirtualAllocHandle>() == align_of::<Handle<'static>>());

fn catch<R, F: FnOnce() -> R + UnwindSafe>(f: F) -> R {
    match catch_unwind(f) {
        Ok(r) => r,
        Err(e) => {
            let msg = e
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| e.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("<non-string panic>");
            tracing::error!(panic = msg, "panic in virtual_alloc C entry point");
            std::process::abort()
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
#[inline]
fn to_usize(v: u64) -> usize {
    v as usize
}

fn init_global(physical_size: u64, virtual_size: u64) {
    match GlobalVirtualAlloc::init(to_usize(physical_size), to_usize(virtual_size)) {
        Ok(()) => {}
        Err(_) if GlobalVirtualAlloc::try_get().is_some() => {
            tracing::warn!("virtual_alloc already initialized; ignoring repeated init");
        }
        Err(e) => {
            tracing::error!(error = %e, physical_size, virtual_size, "virtual_alloc init failed");
            std::process::abort()
        }
    }
}

/// Initialize the process-wide allocator. Repeated calls are ignored.
/// Aborts if the arena cannot be reserved.
#[unsafe(no_mangle)]
pub extern "C" fn virtual_alloc_init_global(physical_size: u64, virtual_size: u64) {
    catch(|| init_global(physical_size, virtual_size));
}

/// Create a handle into `*dst`. Returns `false` if the allocator is not
/// initialized or has no capacity left for another handle.
///
/// # Safety
/// `dst` must be valid for writes of one `VirtualAllocHandle`. Any handle
/// previously stored there is leaked.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn virtual_alloc_init_handle(dst: *mut VirtualAllocHandle, seed: u64) -> bool {
    catch(|| match GlobalVirtualAlloc::init_handle(seed) {
        Some(handle) => {
            // Safety: same size and alignment, asserted above; dst is
            // writable per the caller contract.
            unsafe { dst.cast::<Handle<'static>>().write(handle) };
            true
        }
        None => false,
    })
}

/// Allocate `size` bytes aligned to `align`. Null on failure.
///
/// # Safety
/// `local` must point to a handle created by `virtual_alloc_init_handle`
/// that no other thread is using.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn virtual_alloc_alloc(
    local: *mut VirtualAllocHandle,
    size: u64,
    align: u64,
) -> *mut c_void {
    catch(|| {
        let Some(allocator) = GlobalVirtualAlloc::try_get() else {
            return std::ptr::null_mut();
        };
        // Safety: initialized handle, exclusively ours per the caller contract.
        let handle = unsafe { &mut *local.cast::<Handle<'static>>() };
        allocator
            .alloc(handle, to_usize(size), to_usize(align))
            .map_or(std::ptr::null_mut(), |p| p.as_ptr().cast())
    })
}

/// Free a block through `local`. Any handle may free any block.
///
/// # Safety
/// `local` as for `virtual_alloc_alloc`. `ptr` must come from
/// `virtual_alloc_alloc` or `global_virtual_alloc_alloc` with the same
/// `size` and `align` and must not be freed twice. Null is ignored.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn virtual_alloc_free(
    local: *mut VirtualAllocHandle,
    size: u64,
    align: u64,
    ptr: *mut c_void,
) {
    catch(|| {
        let (Some(allocator), Some(ptr)) = (GlobalVirtualAlloc::try_get(), NonNull::new(ptr.cast::<u8>())) else {
            return;
        };
        // Safety: per the caller contract.
        unsafe {
            let handle = &mut *local.cast::<Handle<'static>>();
            allocator.free(handle, to_usize(size), to_usize(align), ptr);
        }
    });
}

/// Same as `virtual_alloc_init_global`.
#[unsafe(no_mangle)]
pub extern "C" fn global_virtual_alloc_init(physical_size: u64, virtual_size: u64) {
    catch(|| init_global(physical_size, virtual_size));
}

/// Allocate through the calling thread's implicit handle. Null on failure.
#[unsafe(no_mangle)]
pub extern "C" fn global_virtual_alloc_alloc(size: u64, align: u64) -> *mut c_void {
    catch(|| {
        GlobalVirtualAlloc::alloc(to_usize(size), to_usize(align))
            .map_or(std::ptr::null_mut(), |p| p.as_ptr().cast())
    })
}

/// Free through the calling thread's implicit handle. Null is ignored.
///
/// # Safety
/// `ptr` must come from an allocation on this allocator with the same
/// `size` and `align` and must not be freed twice.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn global_virtual_alloc_free(size: u64, align: u64, ptr: *mut c_void) {
    catch(|| {
        if let Some(ptr) = NonNull::new(ptr.cast::<u8>()) {
            // Safety: per the caller contract.
            unsafe { GlobalVirtualAlloc::free(to_usize(size), to_usize(align), ptr) };
        }
    });
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    fn init() {
        virtual_alloc_init_global(1 << 30, 1 << 40);
    }

    #[test]
    fn test_repeated_init_is_ignored() {
        init();
        init();
        global_virtual_alloc_init(1, 1);
        assert!(GlobalVirtualAlloc::try_get().is_some());
    }

    #[test]
    fn test_handle_through_c_abi() {
        init();
        let mut slot = MaybeUninit::<VirtualAllocHandle>::uninit();
        // Safety: Test code; slot is writable.
        unsafe {
            assert!(virtual_alloc_init_handle(slot.as_mut_ptr(), 42));
            let h = slot.as_mut_ptr();
            let p = virtual_alloc_alloc(h, 200, 32);
            assert!(!p.is_null());
            assert!((p as usize).is_multiple_of(32));
            p.cast::<u8>().write_bytes(0xCD, 200);
            virtual_alloc_free(h, 200, 32, p);
            // Same class, same handle: the block comes straight back.
            assert_eq!(virtual_alloc_alloc(h, 256, 8), p);
            virtual_alloc_free(h, 256, 8, p);
        }
    }

    #[test]
    fn test_handle_survives_memcpy_move() {
        init();
        let mut a = MaybeUninit::<VirtualAllocHandle>::uninit();
        let mut b = MaybeUninit::<VirtualAllocHandle>::uninit();
        // Safety: Test code; `a` is not used after the copy.
        unsafe {
            assert!(virtual_alloc_init_handle(a.as_mut_ptr(), 7));
            let p = virtual_alloc_alloc(a.as_mut_ptr(), 64, 8);
            virtual_alloc_free(a.as_mut_ptr(), 64, 8, p);
            std::ptr::copy_nonoverlapping(a.as_ptr(), b.as_mut_ptr(), 1);
            assert_eq!(virtual_alloc_alloc(b.as_mut_ptr(), 64, 8), p);
            virtual_alloc_free(b.as_mut_ptr(), 64, 8, p);
        }
    }

    #[test]
    fn test_global_c_entry_points() {
        init();
        let p = global_virtual_alloc_alloc(1000, 8);
        assert!(!p.is_null());
        // Safety: Test code.
        unsafe {
            global_virtual_alloc_free(1000, 8, p);
            global_virtual_alloc_free(16, 8, std::ptr::null_mut());
        }
        assert!(global_virtual_alloc_alloc(0, 8) as usize == 8);
        assert!(global_virtual_alloc_alloc(16, 3).is_null());
    }
}
