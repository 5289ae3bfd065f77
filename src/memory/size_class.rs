//! Mapping from a caller's `(size, align)` pair to a size class.
//!
//! The allocator keeps no per-block header, so `free` must recompute exactly
//! the class `alloc` picked. Both paths go through [`SizeClass::of`], which is
//! a pure function of the pair.
//!
//! Classes are powers of two from 16 bytes to 4 MiB. Every block of a class is
//! aligned to the class size, so any alignment up to the class size is
//! satisfied by every block in that class and blocks never need to be
//! segregated by alignment.

pub(crate) const MIN_CLASS_SHIFT: u32 = 4;
pub(crate) const MAX_CLASS_SHIFT: u32 = 22;

/// Smallest block handed out; also the minimum room needed for a free-list link.
pub const MIN_CLASS_SIZE: usize = 1 << MIN_CLASS_SHIFT;
/// Largest `(size, align)` served from a size class. Bigger requests take
/// whole shards.
pub const MAX_CLASS_SIZE: usize = 1 << MAX_CLASS_SHIFT;

pub(crate) const CLASS_COUNT: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SizeClass(u8);

impl SizeClass {
    /// Class for a request, or `None` if it exceeds [`MAX_CLASS_SIZE`].
    ///
    /// `align` must be a power of two. `size == 0` is handled by the caller
    /// before classification.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub fn of(size: usize, align: usize) -> Option<Self> {
        debug_assert!(align.is_power_of_two(), "align {align} is not a power of two");
        let want = size.max(align).max(MIN_CLASS_SIZE);
        if want > MAX_CLASS_SIZE {
            return None;
        }
        let shift = want.next_power_of_two().trailing_zeros();
        Some(Self((shift - MIN_CLASS_SHIFT) as u8))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Block size, which is also the alignment of every block in the class.
    #[inline]
    pub fn size(self) -> usize {
        1 << (u32::from(self.0) + MIN_CLASS_SHIFT)
    }

    #[cfg(test)]
    #[allow(clippy::cast_possible_truncation)]
    pub fn all() -> impl Iterator<Item = Self> {
        (0..CLASS_COUNT).map(|i| Self(i as u8))
    }
}
