//! The raw growable-allocation primitive the aligned allocator sits on.

use std::ptr::{self, NonNull};

use libc::c_void;

/// A source of raw, untracked bytes.
///
/// # Safety
///
/// Returned regions must be aligned to at least `2 * size_of::<usize>()`
/// and valid for `size` bytes. `realloc` must preserve the leading
/// `min(old, new)` bytes when it moves a region, and must leave the old
/// region intact when it fails.
pub unsafe trait RawHeap {
  /// Allocates (`ptr` null) or resizes `ptr` to `size` bytes. `None` when the
  /// request cannot be satisfied.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live region from this heap. `size` is non-zero.
  unsafe fn realloc(
    &self,
    ptr: *mut u8,
    size: usize,
  ) -> Option<NonNull<u8>>;

  /// # Safety
  ///
  /// `ptr` must be a live region from this heap.
  unsafe fn free(
    &self,
    ptr: NonNull<u8>,
  );
}

/// The platform heap, through `realloc(3)` and `free(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHeap;

unsafe impl RawHeap for SystemHeap {
  unsafe fn realloc(
    &self,
    ptr: *mut u8,
    size: usize,
  ) -> Option<NonNull<u8>> {
    debug_assert!(size != 0);
    let p = unsafe { libc::realloc(ptr as *mut c_void, size) };
    NonNull::new(p as *mut u8)
  }

  unsafe fn free(
    &self,
    ptr: NonNull<u8>,
  ) {
    unsafe { libc::free(ptr.as_ptr() as *mut c_void) }
  }
}

unsafe impl<H: RawHeap + ?Sized> RawHeap for &H {
  unsafe fn realloc(
    &self,
    ptr: *mut u8,
    size: usize,
  ) -> Option<NonNull<u8>> {
    unsafe { (**self).realloc(ptr, size) }
  }

  unsafe fn free(
    &self,
    ptr: NonNull<u8>,
  ) {
    unsafe { (**self).free(ptr) }
  }
}

/// Copies `len` bytes from `src` to `dst`, the regions may overlap.
pub(crate) unsafe fn shift_bytes(
  src: *const u8,
  dst: *mut u8,
  len: usize,
) {
  if src != dst as *const u8 && len != 0 {
    unsafe { ptr::copy(src, dst, len) }
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
  };

  use super::*;

  /// Tracks live regions and total bytes on top of the system heap, and
  /// fails any request that would push the live byte count past `budget`.
  #[derive(Debug)]
  pub struct CountingHeap {
    live: Cell<usize>,
    bytes: Cell<usize>,
    budget: Cell<usize>,
    sizes: RefCell<HashMap<usize, usize>>,
  }

  impl CountingHeap {
    pub fn new() -> Self {
      Self::with_budget(usize::MAX)
    }

    pub fn with_budget(budget: usize) -> Self {
      Self {
        live: Cell::new(0),
        bytes: Cell::new(0),
        budget: Cell::new(budget),
        sizes: Default::default(),
      }
    }

    pub fn live(&self) -> usize {
      self.live.get()
    }

    pub fn set_budget(
      &self,
      budget: usize,
    ) {
      self.budget.set(budget);
    }
  }

  unsafe impl RawHeap for CountingHeap {
    unsafe fn realloc(
      &self,
      ptr: *mut u8,
      size: usize,
    ) -> Option<NonNull<u8>> {
      let old = if ptr.is_null() {
        0
      } else {
        self.sizes.borrow()[&ptr.addr()]
      };

      if self.bytes.get() - old + size > self.budget.get() {
        return None;
      }

      let p = unsafe { SystemHeap.realloc(ptr, size) }?;

      let mut sizes = self.sizes.borrow_mut();
      if ptr.is_null() {
        self.live.set(self.live.get() + 1);
      } else {
        sizes.remove(&ptr.addr());
      }
      sizes.insert(p.as_ptr().addr(), size);
      self.bytes.set(self.bytes.get() - old + size);
      Some(p)
    }

    unsafe fn free(
      &self,
      ptr: NonNull<u8>,
    ) {
      let size = self
        .sizes
        .borrow_mut()
        .remove(&ptr.as_ptr().addr())
        .expect("freeing a region this heap does not own");
      self.bytes.set(self.bytes.get() - size);
      self.live.set(self.live.get() - 1);
      unsafe { SystemHeap.free(ptr) }
    }
  }

  pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
  }
}
