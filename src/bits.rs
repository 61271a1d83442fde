//! Bit-scan helpers behind the bin index.
//!
//! With the `intrinsics` feature (default) these compile down to `lzcnt`/`bsr`-style
//! instructions. Without it a portable loop is used; both paths run the same tests.

/// Count leading zeros. `x` must be non-zero.
#[cfg(feature = "intrinsics")]
#[inline(always)]
pub(crate) fn clz(x: usize) -> u32 {
  debug_assert!(x > 0);
  x.leading_zeros()
}

/// Count leading zeros. `x` must be non-zero.
#[cfg(not(feature = "intrinsics"))]
#[inline]
pub(crate) fn clz(x: usize) -> u32 {
  debug_assert!(x > 0);
  let mut t: usize = 1 << (usize::BITS - 1);
  let mut r = 0;
  while x & t == 0 {
    t >>= 1;
    r += 1;
  }
  r
}

#[inline(always)]
pub(crate) fn log2_floor(x: usize) -> u32 {
  debug_assert!(x > 0);
  (usize::BITS - 1) - clz(x)
}

/// Ceiling log2. Zero and one both map to zero.
#[inline(always)]
pub(crate) fn log2_ceil(x: usize) -> u32 {
  if x <= 1 { 0 } else { usize::BITS - clz(x - 1) }
}

#[inline(always)]
pub(crate) const fn pow2(power: u32) -> usize {
  1 << power
}

/// Smallest power of two `>= x`. `x` must be at least 2 and no larger than the top bit.
#[inline(always)]
pub(crate) fn round_up_to_power_of_2(x: usize) -> usize {
  debug_assert!(x >= 2);
  1 << (usize::BITS - clz(x - 1))
}

/// Keeps only the lowest set bit of `mask` (zero stays zero).
#[inline(always)]
pub(crate) const fn lowest_set_bit(mask: usize) -> usize {
  mask & mask.wrapping_neg()
}
