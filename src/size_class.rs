//! Size class rounding and indexing.
//!
//! Unlike a gperftools-style table with a handful of hand-tuned classes,
//! every 8-byte increment up to [`MAX_BYTES`](crate::config::MAX_BYTES) gets
//! its own class. This keeps internal fragmentation at zero at the cost of
//! a larger (but still flat, O(1)) class count.

use crate::config::{ALIGN, MAX_BYTES};

/// Total number of size classes, covering `ALIGN` to `MAX_BYTES` bytes.
pub const NUM_CLASSES: usize = MAX_BYTES / ALIGN;

/// Round `n` up to the next multiple of [`ALIGN`].
#[inline]
pub const fn round_up(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Map a request size to its size-class index.
///
/// `n` is clamped to at least `ALIGN` first, so `index_for(0) == index_for(8) == 0`.
#[inline]
pub const fn index_for(n: usize) -> usize {
    let n = if n < ALIGN { ALIGN } else { n };
    (n + ALIGN - 1) / ALIGN - 1
}

/// The block size handed out for class `index`.
#[inline]
pub const fn size_for_index(index: usize) -> usize {
    (index + 1) * ALIGN
}

/// Whether `size` fits the tiered size-class path at all, or must be
/// forwarded to the system allocator.
#[inline]
pub const fn fits_size_classes(size: usize) -> bool {
    size <= MAX_BYTES
}
