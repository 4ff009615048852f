//! The generic allocation entry points.
//!
//! Consumers go through these rather than calling a strategy directly: they
//! resolve the default alignment, emulate `REALLOC` for strategies that
//! cannot resize, and turn failures into an abort under `NO_FAIL`.

use std::ptr::{self, NonNull};

use crate::{
  align::assert_pot,
  allocator::{AllocFlags, Allocator},
  error::{AllocError, Result},
};

#[cold]
pub(crate) fn fatal(
  err: AllocError,
  size: usize,
  alignment: usize,
) -> ! {
  log::error!("allocation of {size} bytes at alignment {alignment} failed: {err}");
  std::process::abort()
}

/// Allocates or reallocates `size` bytes at `alignment` (`0` for the
/// allocator's default) through `a`.
///
/// # Safety
///
/// With `REALLOC` set, `ptr` must be null or a live allocation from `a`.
pub unsafe fn xalloc_ex<A: Allocator + ?Sized>(
  a: &A,
  ptr: *mut u8,
  size: usize,
  flags: AllocFlags,
  alignment: usize,
) -> Result<NonNull<u8>> {
  let alignment = if alignment == 0 { a.default_alignment() } else { alignment };
  assert_pot(alignment);

  let mut flags = flags;
  if ptr.is_null() {
    flags.remove(AllocFlags::REALLOC);
  }

  let result = match unsafe { a.allocate(ptr, size, alignment, flags) } {
    Err(err) if err.is_unsupported() && flags.contains(AllocFlags::REALLOC) => unsafe {
      emulate_realloc(a, ptr, size, flags, alignment)
    },
    result => result,
  };

  match result {
    Err(err) if flags.contains(AllocFlags::NO_FAIL) => fatal(err, size, alignment),
    result => result,
  }
}

/// allocate-new, copy, free-old.
unsafe fn emulate_realloc<A: Allocator + ?Sized>(
  a: &A,
  ptr: *mut u8,
  size: usize,
  flags: AllocFlags,
  alignment: usize,
) -> Result<NonNull<u8>> {
  let old_size = unsafe { a.usable_size(ptr) };
  log::debug!("emulating realloc of {:?}: {} -> {} bytes", ptr, old_size, size);

  let fresh = flags - AllocFlags::REALLOC - AllocFlags::NO_FAIL;
  let p = unsafe { a.allocate(ptr::null_mut(), size, alignment, fresh) }?;
  unsafe {
    ptr::copy_nonoverlapping(ptr as *const u8, p.as_ptr(), old_size.min(size));
    a.free(ptr);
  }
  Ok(p)
}

pub fn xalloc<A: Allocator + ?Sized>(
  a: &A,
  size: usize,
) -> Result<NonNull<u8>> {
  unsafe { xalloc_ex(a, ptr::null_mut(), size, AllocFlags::empty(), 0) }
}

pub fn xaligned_alloc<A: Allocator + ?Sized>(
  a: &A,
  size: usize,
  alignment: usize,
) -> Result<NonNull<u8>> {
  unsafe { xalloc_ex(a, ptr::null_mut(), size, AllocFlags::empty(), alignment) }
}

/// Zeroed allocation of `nmemb * size` bytes.
pub fn xcalloc<A: Allocator + ?Sized>(
  a: &A,
  nmemb: usize,
  size: usize,
) -> Result<NonNull<u8>> {
  let total = nmemb.checked_mul(size).ok_or(AllocError::SizeOverflow)?;
  unsafe { xalloc_ex(a, ptr::null_mut(), total, AllocFlags::ZERO, 0) }
}

/// # Safety
///
/// `ptr` must be null or a live allocation from `a`.
pub unsafe fn xrealloc<A: Allocator + ?Sized>(
  a: &A,
  ptr: *mut u8,
  size: usize,
) -> Result<NonNull<u8>> {
  unsafe { xalloc_ex(a, ptr, size, AllocFlags::REALLOC, 0) }
}

/// # Safety
///
/// `ptr` must be null or a live allocation from `a`.
pub unsafe fn xfree<A: Allocator + ?Sized>(
  a: &A,
  ptr: *mut u8,
) {
  unsafe { a.free(ptr) }
}
