use crate::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

/// Align `value` upwards to `align` (must be a power of two).
///
/// Returns `None` if the result does not fit in a `usize`.
#[inline]
#[must_use]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Align `value` downwards to `align` (must be a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Round a byte count up to whole pages.
#[inline]
#[must_use]
pub const fn page_align(size: usize) -> Option<usize> {
    match size.checked_add(PAGE_MASK) {
        Some(v) => Some(v & !PAGE_MASK),
        None => None,
    }
}

/// Index of the page containing byte `offset`.
#[inline]
#[must_use]
pub const fn pfn_down(offset: usize) -> usize {
    offset >> PAGE_SHIFT
}

/// Index of the first page boundary at or after byte `offset`.
#[inline]
#[must_use]
pub const fn pfn_up(offset: usize) -> usize {
    (offset + PAGE_SIZE - 1) >> PAGE_SHIFT
}

/// Find last set bit, 1-based. `fls(0) == 0`, `fls(1) == 1`, `fls(0x80) == 8`.
#[inline]
#[must_use]
pub const fn fls(value: usize) -> u32 {
    usize::BITS - value.leading_zeros()
}

/// Floor of log2. `value` must be non-zero.
#[inline]
#[must_use]
pub const fn ilog2(value: usize) -> u32 {
    debug_assert!(value != 0);
    fls(value) - 1
}

/// Smallest order such that `2^order` pages cover `size` bytes.
///
/// `get_order(1) == 0`, `get_order(PAGE_SIZE + 1) == 1`.
#[inline]
#[must_use]
pub const fn get_order(size: usize) -> u32 {
    if size <= PAGE_SIZE {
        return 0;
    }
    fls((size - 1) >> PAGE_SHIFT)
}
