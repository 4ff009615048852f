//! The allocation contract every strategy implements and every consumer
//! programs against.

use std::ptr::NonNull;

use bitflags::bitflags;

use crate::error::Result;

bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
  pub struct AllocFlags: u32 {
    /// Fill newly extended bytes with zero.
    const ZERO = 1 << 0;
    /// Abort the process instead of returning a failure.
    const NO_FAIL = 1 << 1;
    /// The input pointer names a live allocation to resize or move.
    const REALLOC = 1 << 2;
  }
}

/// Default alignment of the system allocator: what the platform heap
/// guarantees for any request.
pub const MAX_ALIGN: usize = 2 * std::mem::size_of::<usize>();

/// A memory allocation strategy.
///
/// Strategies are plain values. Whatever state they close over is owned
/// elsewhere, and none of them are synchronised: one instance must not be
/// used from two threads at once.
///
/// # Safety
///
/// Implementors must return pointers valid for reads and writes of the
/// requested size, aligned to the requested alignment, and live until passed
/// to [`Allocator::free`] or successfully reallocated.
pub unsafe trait Allocator {
  /// Alignment used when a caller asks for alignment `0`. A power of two.
  fn default_alignment(&self) -> usize;

  /// Allocates `size` bytes aligned to `alignment`.
  ///
  /// Without [`AllocFlags::REALLOC`], `ptr` is ignored. With it, `ptr` names
  /// a live allocation from this allocator which is resized, possibly moving.
  /// On failure the old allocation is untouched.
  ///
  /// A strategy that cannot resize returns [`AllocError::Unsupported`];
  /// [`crate::mem::xalloc_ex`] emulates the reallocation in that case.
  ///
  /// `alignment` is a power of two, or `0` for [`Allocator::default_alignment`].
  ///
  /// # Safety
  ///
  /// With `REALLOC` set, `ptr` must be null or a live allocation from `self`.
  ///
  /// [`AllocError::Unsupported`]: crate::AllocError::Unsupported
  unsafe fn allocate(
    &self,
    ptr: *mut u8,
    size: usize,
    alignment: usize,
    flags: AllocFlags,
  ) -> Result<NonNull<u8>>;

  /// Releases `ptr`. Null is a no-op.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from `self`.
  unsafe fn free(
    &self,
    ptr: *mut u8,
  );

  /// Usable byte length of `ptr`, `0` for null.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from `self`.
  unsafe fn usable_size(
    &self,
    ptr: *mut u8,
  ) -> usize;
}

unsafe impl<A: Allocator + ?Sized> Allocator for &A {
  fn default_alignment(&self) -> usize {
    (**self).default_alignment()
  }

  unsafe fn allocate(
    &self,
    ptr: *mut u8,
    size: usize,
    alignment: usize,
    flags: AllocFlags,
  ) -> Result<NonNull<u8>> {
    unsafe { (**self).allocate(ptr, size, alignment, flags) }
  }

  unsafe fn free(
    &self,
    ptr: *mut u8,
  ) {
    unsafe { (**self).free(ptr) }
  }

  unsafe fn usable_size(
    &self,
    ptr: *mut u8,
  ) -> usize {
    unsafe { (**self).usable_size(ptr) }
  }
}
