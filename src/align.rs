//! Power-of-two alignment arithmetic.
//!
//! Every helper here assumes `align` is a non-zero power of two; callers
//! validate user-supplied alignments before reaching this module.

/// Alignment of every block header and every block size, in bytes.
pub const DEFAULT_ALIGN: usize = 8;

/// Round `value` up to the nearest multiple of `align`.
///
/// Wraps on overflow; use [`checked_align_up`] for caller-controlled values.
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    value.wrapping_add(align - 1) & !(align - 1)
}

/// Round `value` down to the nearest multiple of `align`.
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Round `value` up to the nearest multiple of `align`, or `None` if the
/// result does not fit in a `usize`.
#[inline]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}
