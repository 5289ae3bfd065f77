//! Switch between `std` and `loom` synchronization.
//!
//! Code under `src/` takes atomics, locks, cells and threads from here and
//! never from `std::sync` directly, so a `--cfg loom` build models every
//! shared access the allocator makes.
#![allow(unused_imports, unused_macros)]

#[cfg(not(loom))]
mod imp {
    pub(crate) use std::sync::{Arc, Mutex, OnceLock};

    pub(crate) mod atomic {
        pub(crate) use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
    }

    pub(crate) mod cell {
        pub(crate) use std::cell::UnsafeCell;
    }

    pub(crate) mod hint {
        pub(crate) use std::hint::spin_loop;
    }

    pub(crate) mod thread {
        pub(crate) use std::thread::{scope, spawn, yield_now};
    }
}

#[cfg(loom)]
mod imp {
    pub(crate) use loom::sync::{Arc, Mutex};

    pub(crate) mod atomic {
        pub(crate) use loom::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
    }

    pub(crate) mod cell {
        pub(crate) use loom::cell::UnsafeCell;
    }

    pub(crate) mod hint {
        pub(crate) use loom::hint::spin_loop;
    }

    pub(crate) mod thread {
        pub(crate) use loom::thread::{spawn, yield_now};
    }

    /// Write-once cell for loom builds.
    ///
    /// loom has no `OnceLock` and its `Mutex` cannot be built in a `static`,
    /// so this wraps a plain std mutex. Initialisation happens once per model
    /// run and is not an interleaving loom needs to explore.
    pub(crate) struct OnceLock<T>(std::sync::Mutex<Option<Box<T>>>);

    // Safety: every access to the slot goes through the mutex; the boxed
    // value is never moved once stored.
    unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

    impl<T> OnceLock<T> {
        pub(crate) const fn new() -> Self {
            Self(std::sync::Mutex::new(None))
        }

        fn slot(&self) -> std::sync::MutexGuard<'_, Option<Box<T>>> {
            self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }

        /// Extend a borrow of the boxed value from the guard to `&self`.
        fn detach<'a>(&'a self, value: &T) -> &'a T {
            // Safety: the box is never dropped or replaced while `self` lives.
            unsafe { &*std::ptr::from_ref(value) }
        }

        pub(crate) fn get(&self) -> Option<&T> {
            let slot = self.slot();
            slot.as_deref().map(|v| self.detach(v))
        }

        pub(crate) fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
            let mut slot = self.slot();
            let value: &T = slot.get_or_insert_with(|| Box::new(init()));
            self.detach(value)
        }

        pub(crate) fn set(&self, value: T) -> Result<(), T> {
            let mut slot = self.slot();
            if slot.is_some() {
                return Err(value);
            }
            *slot = Some(Box::new(value));
            Ok(())
        }
    }
}

pub(crate) use imp::*;

/// `&mut T` out of a `sync::cell::UnsafeCell`, for either backend.
///
/// loom's cell hands out tracked pointers through `with_mut` instead of
/// returning `*mut T` from `get`.
///
/// # Safety
/// The caller must hold the only access to the cell's contents.
macro_rules! unsafe_cell_get_mut {
    ($cell:expr) => {{
        #[cfg(loom)]
        let inner = $cell.with_mut(|p| p);
        #[cfg(not(loom))]
        let inner = $cell.get();
        // Safety: exclusive access is the caller's obligation.
        unsafe { &mut *inner }
    }};
}
pub(crate) use unsafe_cell_get_mut;

/// Private atomic `static` for either backend. loom atomics are not `const`,
/// so loom builds go through `loom::lazy_static!`, which also resets the
/// value between model runs.
macro_rules! static_atomic {
    (static $name:ident : $ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        static $name: $ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            static ref $name: $ty = $init;
        }
    };
}
pub(crate) use static_atomic;
