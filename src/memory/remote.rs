//! Lock-free hand-off of blocks freed by a thread that does not own them.
//!
//! Each shard keeps one [`RemoteQueue`] per size class. Foreign handles push
//! freed blocks with a single CAS; handles bound to the shard drain the whole
//! queue with a single CAS and splice the chain into their private free list.
//!
//! The queue is a Treiber stack whose link lives in the first `usize` of each
//! freed block (the same slot the handle-local lists use). It needs no
//! generation tag:
//!
//! - `push` never reads through the old head, it only stores the old head
//!   value into the node it owns. An ABA swap of the head between its load and
//!   its CAS leaves the node linked to the current head, which is correct.
//! - There is no single-node pop. `take_all` detaches the entire chain by
//!   swinging the head to null, so no thread ever dereferences a node it has
//!   not yet exclusively acquired.

use crate::sync::atomic::{AtomicUsize, Ordering};
use std::ptr::NonNull;

pub(crate) struct RemoteQueue {
    head: AtomicUsize,
}

impl Default for RemoteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteQueue {
    pub fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
        }
    }

    /// Link field of a queued block. Offset 0, so the block only needs
    /// `align_of::<usize>()`, which every size class exceeds.
    #[inline]
    fn link(node: NonNull<u8>) -> *mut AtomicUsize {
        let p = node.as_ptr().cast::<AtomicUsize>();
        debug_assert!(
            (p as usize).is_multiple_of(std::mem::align_of::<AtomicUsize>()),
            "remote link field is not atomically aligned: {p:p}",
        );
        p
    }

    /// Push a freed block.
    ///
    /// # Safety
    /// `node` must point to at least `size_of::<usize>()` writable bytes that
    /// the caller owns and will not touch again until the block is handed out
    /// by a later `alloc`.
    pub unsafe fn push(&self, node: NonNull<u8>) {
        let link = Self::link(node);
        let mut head = self.head.load(Ordering::Relaxed);
        // A fresh atomic is written rather than stored into: the block held
        // caller data until now, not an initialised atomic.
        // Safety: node is owned by the caller and suitably aligned.
        unsafe { link.write(AtomicUsize::new(head)) };
        loop {
            match self.head.compare_exchange_weak(
                head,
                node.as_ptr() as usize,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    head = actual;
                    // Safety: node is still exclusively ours until the CAS wins.
                    unsafe { (*link).store(head, Ordering::Relaxed) };
                }
            }
        }
    }

    /// Detach and return the whole chain, newest first.
    ///
    /// Walk it with [`next`](Self::next). The Acquire on the winning CAS pairs
    /// with every pusher's Release (they form one release sequence on `head`),
    /// so all links in the chain are visible.
    pub fn take_all(&self) -> Option<NonNull<u8>> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            if head == 0 {
                return None;
            }
            match self.head.compare_exchange_weak(head, 0, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return NonNull::new(head as *mut u8),
                Err(actual) => head = actual,
            }
        }
    }

    /// Successor of `node` in a chain returned by [`take_all`](Self::take_all).
    ///
    /// # Safety
    /// `node` must belong to a chain the caller detached and has not yet
    /// relinked into another list.
    #[inline]
    #[cfg(test)]
    pub unsafe fn next(node: NonNull<u8>) -> Option<NonNull<u8>> {
        // Safety: link was initialised by `push` and the chain is ours.
        let raw = unsafe { (*Self::link(node)).load(Ordering::Relaxed) };
        NonNull::new(raw as *mut u8)
    }

    #[inline]
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) == 0
    }
}
