//! Alignment arithmetic shared by the header codec and the block allocator.
//!
//! Every alignment handled here must be a power of two. Passing anything else
//! is a contract violation and panics.

/// Rounds `value` up to the machine word size.
///
/// # Examples
///
/// ```rust
/// use resalloc::align;
///
/// match std::mem::size_of::<usize>() {
///     8 => assert_eq!(align!(13), 16), // 64 bit machine.
///     4 => assert_eq!(align!(11), 12), // 32 bit machine.
///     _ => {},
/// };
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    $crate::align::align_up($value, ::core::mem::size_of::<usize>())
  };
}

/// Rounds `value` up to `alignment`.
///
/// ```rust
/// use resalloc::align_to;
///
/// assert_eq!(align_to!(17, 16), 32);
/// assert_eq!(align_to!(64, 64), 64);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $alignment:expr) => {
    $crate::align::align_up($value, $alignment)
  };
}

pub const fn is_pot(value: usize) -> bool {
  value != 0 && value & (value - 1) == 0
}

#[inline]
#[track_caller]
pub fn assert_pot(alignment: usize) {
  assert!(is_pot(alignment), "alignment {alignment} is not a power of two");
}

/// Rounds `value` up to a multiple of `alignment`, wrapping on overflow.
pub const fn align_up(
  value: usize,
  alignment: usize,
) -> usize {
  debug_assert!(is_pot(alignment));
  value.wrapping_add(alignment - 1) & !(alignment - 1)
}

/// Like [`align_up`], but `None` when the result does not fit in a `usize`.
pub const fn checked_align_up(
  value: usize,
  alignment: usize,
) -> Option<usize> {
  debug_assert!(is_pot(alignment));
  match value.checked_add(alignment - 1) {
    Some(v) => Some(v & !(alignment - 1)),
    None => None,
  }
}

pub const fn align_down(
  value: usize,
  alignment: usize,
) -> usize {
  debug_assert!(is_pot(alignment));
  value & !(alignment - 1)
}

/// Bytes needed to move `addr` forward to the next multiple of `alignment`.
///
/// This is the single fitting primitive: both the size pass and the placement
/// pass of the block allocator go through it, as does the header codec.
pub const fn padding(
  addr: usize,
  alignment: usize,
) -> usize {
  debug_assert!(is_pot(alignment));
  addr.wrapping_neg() & (alignment - 1)
}

pub fn is_aligned<T>(
  ptr: *const T,
  alignment: usize,
) -> bool {
  ptr.addr() & (alignment - 1) == 0
}

/// `log2(alignment)`.
pub const fn alignment_power(alignment: usize) -> u8 {
  debug_assert!(is_pot(alignment));
  alignment.trailing_zeros() as u8
}

/// Fits `size` bytes at `alignment` into the `space` bytes starting at `ptr`.
///
/// On success `ptr` is advanced to the aligned address, `space` shrinks by
/// the padding consumed, and the aligned address is returned. On failure both
/// are left untouched.
pub fn fit(
  alignment: usize,
  size: usize,
  ptr: &mut *mut u8,
  space: &mut usize,
) -> Option<*mut u8> {
  assert_pot(alignment);

  let pad = padding(ptr.addr(), alignment);
  let needed = pad.checked_add(size)?;
  if needed > *space {
    return None;
  }

  *ptr = ptr.wrapping_add(pad);
  *space -= pad;
  Some(*ptr)
}

#[cfg(test)]
mod tests {
  use std::{mem, ptr};

  use super::*;

  #[test]
  fn test_align() {
    let ptr_size = mem::size_of::<usize>();

    let mut alignments = Vec::new();

    for i in 0..10 {
      let sizes = (ptr_size * i + 1)..=(ptr_size * (i + 1));

      let expected_alignment = ptr_size * (i + 1);

      alignments.push((sizes, expected_alignment));
    }

    for (sizes, expected) in alignments {
      for size in sizes {
        assert_eq!(expected, align!(size));
      }
    }
  }

  #[test]
  fn test_align_to_and_down() {
    assert_eq!(align_to!(0, 16), 0);
    assert_eq!(align_to!(1, 16), 16);
    assert_eq!(align_to!(4096, 4096), 4096);
    assert_eq!(align_down(4095, 4096), 0);
    assert_eq!(align_down(8200, 4096), 8192);
    assert_eq!(checked_align_up(usize::MAX, 8), None);
    assert_eq!(checked_align_up(usize::MAX - 15, 8), Some(usize::MAX - 7));
  }

  #[test]
  fn test_pot() {
    assert!(!is_pot(0));
    assert!(is_pot(1));
    assert!(is_pot(4096));
    assert!(!is_pot(12));
    assert_eq!(alignment_power(1), 0);
    assert_eq!(alignment_power(64), 6);
  }

  #[test]
  fn test_padding() {
    assert_eq!(padding(0, 16), 0);
    assert_eq!(padding(1, 16), 15);
    assert_eq!(padding(72, 16), 8);
    assert_eq!(padding(64, 16), 0);
  }

  #[test]
  fn test_fit_null_is_aligned() {
    let mut p: *mut u8 = ptr::null_mut();
    let mut space = usize::MAX;

    let ret = fit(16, 16, &mut p, &mut space);

    assert_eq!(ret, Some(ptr::null_mut()));
    assert!(p.is_null());
    assert_eq!(space, usize::MAX);
  }

  #[test]
  fn test_fit_advances() {
    let mut p = ptr::without_provenance_mut::<u8>(17);
    let mut space = usize::MAX;

    let ret = fit(16, 1234, &mut p, &mut space);

    assert_eq!(ret.map(|r| r.addr()), Some(32));
    assert_eq!(p.addr(), 32);
    assert_eq!(space, usize::MAX - 15);
  }

  #[test]
  fn test_fit_out_of_space() {
    let mut p = ptr::without_provenance_mut::<u8>(17);
    let mut space = 20;

    assert_eq!(fit(16, 8, &mut p, &mut space), None);
    assert_eq!(p.addr(), 17);
    assert_eq!(space, 20);

    assert_eq!(fit(16, 5, &mut p, &mut space).map(|r| r.addr()), Some(32));
    assert_eq!(space, 5);
  }

  #[test]
  #[should_panic(expected = "not a power of two")]
  fn test_fit_rejects_non_pot() {
    let mut p: *mut u8 = ptr::null_mut();
    let mut space = 64;
    let _ = fit(24, 1, &mut p, &mut space);
  }
}
