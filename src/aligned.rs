use std::ptr::{self, NonNull};

use crate::{
  align::{self, assert_pot},
  allocator::{AllocFlags, Allocator, MAX_ALIGN},
  error::{AllocError, Result},
  header::{self, BaseHeader, Record, Tags},
  heap::{self, RawHeap, SystemHeap},
};

/// Size- and alignment-tracked allocations on top of a [`RawHeap`].
///
/// Every allocation is preceded by a header record, so `usable_size` and
/// reallocation need nothing but the data pointer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlignedAllocator<R = SystemHeap> {
  heap: R,
}

/// The allocator used when no explicit one is supplied.
pub const fn system_allocator() -> AlignedAllocator<SystemHeap> {
  AlignedAllocator::new(SystemHeap)
}

impl<R: RawHeap> AlignedAllocator<R> {
  pub const fn new(heap: R) -> Self {
    Self { heap }
  }

  pub fn heap(&self) -> &R {
    &self.heap
  }

  /// Allocates behind record type `H`, tagging the base record with `tags`.
  ///
  /// With `REALLOC` the leading, non-base fields of the record travel with
  /// the allocation unchanged.
  ///
  /// # Safety
  ///
  /// With `REALLOC` set, `ptr` must be null or a live allocation made through
  /// this allocator with the same record type.
  pub unsafe fn allocate_record<H: Record>(
    &self,
    ptr: *mut u8,
    size: usize,
    alignment: usize,
    flags: AllocFlags,
    tags: Tags,
  ) -> Result<NonNull<u8>> {
    assert_pot(alignment);
    let alignment = alignment.max(header::min_alignment::<H>());

    let old = match NonNull::new(ptr) {
      Some(p) if flags.contains(AllocFlags::REALLOC) => Some(p),
      _ => None,
    };

    let reqsize = header::raw_size::<H>(size, alignment).ok_or(AllocError::SizeOverflow)?;

    let (old_raw, old_size, old_shift) = match old {
      Some(p) => unsafe {
        let record = header::decode::<H>(p);
        let base = header::read::<H>(p);

        if alignment < base.alignment() {
          log::warn!(
            "realloc of {:?} would lower alignment from {} to {}",
            p,
            base.alignment(),
            alignment
          );
        }
        assert!(
          alignment >= base.alignment(),
          "alignment may not decrease on reallocation"
        );

        let raw = record.cast::<u8>();
        (raw.as_ptr(), base.size(), p.offset_from(raw) as usize)
      },
      None => (ptr::null_mut(), 0, 0),
    };

    let raw = match unsafe { self.heap.realloc(old_raw, reqsize) } {
      Some(raw) => raw,
      None => {
        log::trace!("raw heap refused {} bytes", reqsize);
        return Err(AllocError::out_of_memory(size, alignment));
      }
    };

    let shift = header::data_offset::<H>(raw.as_ptr(), alignment);
    if old.is_some() && shift != old_shift {
      // Padding changed with the new base address; move the payload before
      // the back-pointer slot can land on it.
      unsafe {
        heap::shift_bytes(
          raw.as_ptr().add(old_shift),
          raw.as_ptr().add(shift),
          old_size.min(size),
        );
      }
    }

    let data = unsafe { header::encode::<H>(raw, size, alignment, tags) };
    debug_assert_eq!(data.as_ptr().addr() - raw.as_ptr().addr(), shift);
    debug_assert!(align::is_aligned(data.as_ptr(), alignment));

    if flags.contains(AllocFlags::ZERO) && size > old_size {
      unsafe { ptr::write_bytes(data.as_ptr().add(old_size), 0, size - old_size) };
    }

    log::trace!(
      "allocate: {:?} -> {:?}, size = {}, align = {}, flags = {:?}",
      ptr,
      data,
      size,
      alignment,
      flags
    );
    Ok(data)
  }

  /// # Safety
  ///
  /// `ptr` must be null or a live allocation made with record type `H`.
  pub unsafe fn free_record<H: Record>(
    &self,
    ptr: *mut u8,
  ) {
    let Some(data) = NonNull::new(ptr) else {
      return;
    };

    unsafe {
      let raw = header::scrub::<H>(data);
      log::trace!("free: {:?} (raw {:?})", data, raw);
      self.heap.free(raw);
    }
  }

  /// # Safety
  ///
  /// `ptr` must be null or a live allocation made with record type `H`.
  pub unsafe fn size_record<H: Record>(
    &self,
    ptr: *mut u8,
  ) -> usize {
    match NonNull::new(ptr) {
      Some(data) => unsafe { header::read::<H>(data).size() },
      None => 0,
    }
  }
}

unsafe impl<R: RawHeap> Allocator for AlignedAllocator<R> {
  fn default_alignment(&self) -> usize {
    MAX_ALIGN
  }

  unsafe fn allocate(
    &self,
    ptr: *mut u8,
    size: usize,
    alignment: usize,
    flags: AllocFlags,
  ) -> Result<NonNull<u8>> {
    let alignment = if alignment == 0 { MAX_ALIGN } else { alignment };
    unsafe { self.allocate_record::<BaseHeader>(ptr, size, alignment, flags, Tags::empty()) }
  }

  unsafe fn free(
    &self,
    ptr: *mut u8,
  ) {
    unsafe { self.free_record::<BaseHeader>(ptr) }
  }

  unsafe fn usable_size(
    &self,
    ptr: *mut u8,
  ) -> usize {
    unsafe { self.size_record::<BaseHeader>(ptr) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::heap::testing::{CountingHeap, init_logging};

  fn fill(
    p: NonNull<u8>,
    len: usize,
  ) {
    for i in 0..len {
      unsafe { p.as_ptr().add(i).write((i % 251) as u8) };
    }
  }

  fn check(
    p: NonNull<u8>,
    len: usize,
  ) {
    for i in 0..len {
      assert_eq!(unsafe { p.as_ptr().add(i).read() }, (i % 251) as u8, "byte {i}");
    }
  }

  #[test]
  fn test_alignment_and_size() {
    init_logging();
    let heap = CountingHeap::new();
    let a = AlignedAllocator::new(&heap);

    unsafe {
      for alignment in [1usize, 8, 16, 32, 64, 4096] {
        for size in [0usize, 1, 17, 4095] {
          let p = a.allocate(ptr::null_mut(), size, alignment, AllocFlags::empty()).unwrap();
          assert!(align::is_aligned(p.as_ptr(), alignment));
          assert_eq!(a.usable_size(p.as_ptr()), size);
          fill(p, size);
          check(p, size);
          a.free(p.as_ptr());
        }
      }
    }

    assert_eq!(heap.live(), 0);
  }

  #[test]
  fn test_null_is_noop() {
    let a = system_allocator();
    unsafe {
      a.free(ptr::null_mut());
      assert_eq!(a.usable_size(ptr::null_mut()), 0);
    }
  }

  #[test]
  fn test_small_alignment_raised_to_word() {
    let a = system_allocator();
    unsafe {
      let p = a.allocate(ptr::null_mut(), 3, 1, AllocFlags::empty()).unwrap();
      assert!(align::is_aligned(p.as_ptr(), size_of::<usize>()));
      let header = header::read::<BaseHeader>(p);
      assert_eq!(header.alignment(), size_of::<usize>());
      a.free(p.as_ptr());
    }
  }

  #[test]
  fn test_realloc_preserves_data() {
    init_logging();
    let heap = CountingHeap::new();
    let a = AlignedAllocator::new(&heap);

    unsafe {
      for alignment in [8usize, 64, 4096] {
        let p = a.allocate(ptr::null_mut(), 100, alignment, AllocFlags::empty()).unwrap();
        fill(p, 100);

        let q = a.allocate(p.as_ptr(), 100_000, alignment, AllocFlags::REALLOC).unwrap();
        assert!(align::is_aligned(q.as_ptr(), alignment));
        assert_eq!(a.usable_size(q.as_ptr()), 100_000);
        check(q, 100);

        let r = a.allocate(q.as_ptr(), 10, alignment, AllocFlags::REALLOC).unwrap();
        assert_eq!(a.usable_size(r.as_ptr()), 10);
        check(r, 10);

        a.free(r.as_ptr());
      }
    }

    assert_eq!(heap.live(), 0);
  }

  #[test]
  fn test_realloc_raising_alignment_shifts_payload() {
    let a = system_allocator();

    unsafe {
      let p = a.allocate(ptr::null_mut(), 64, 8, AllocFlags::empty()).unwrap();
      fill(p, 64);

      let q = a.allocate(p.as_ptr(), 64, 4096, AllocFlags::REALLOC).unwrap();
      assert!(align::is_aligned(q.as_ptr(), 4096));
      assert_eq!(header::read::<BaseHeader>(q).alignment(), 4096);
      check(q, 64);

      a.free(q.as_ptr());
    }
  }

  #[test]
  fn test_zero_extends_growth_only() {
    let a = system_allocator();

    unsafe {
      let p = a.allocate(ptr::null_mut(), 32, 0x10, AllocFlags::ZERO).unwrap();
      for i in 0..32 {
        assert_eq!(p.as_ptr().add(i).read(), 0);
      }
      ptr::write_bytes(p.as_ptr(), 0xAA, 32);

      let q = a
        .allocate(p.as_ptr(), 512, 0x10, AllocFlags::REALLOC | AllocFlags::ZERO)
        .unwrap();
      for i in 0..32 {
        assert_eq!(q.as_ptr().add(i).read(), 0xAA);
      }
      for i in 32..512 {
        assert_eq!(q.as_ptr().add(i).read(), 0);
      }

      a.free(q.as_ptr());
    }
  }

  #[test]
  fn test_realloc_without_pointer_allocates() {
    let a = system_allocator();
    unsafe {
      let p = a.allocate(ptr::null_mut(), 8, 8, AllocFlags::REALLOC).unwrap();
      assert_eq!(a.usable_size(p.as_ptr()), 8);
      a.free(p.as_ptr());
    }
  }

  #[test]
  fn test_out_of_memory_leaves_allocation_intact() {
    let heap = CountingHeap::with_budget(4096);
    let a = AlignedAllocator::new(&heap);

    unsafe {
      let p = a.allocate(ptr::null_mut(), 100, 16, AllocFlags::empty()).unwrap();
      fill(p, 100);

      let err = a.allocate(p.as_ptr(), 8192, 16, AllocFlags::REALLOC).unwrap_err();
      assert_eq!(err, AllocError::out_of_memory(8192, 16));
      assert_eq!(a.usable_size(p.as_ptr()), 100);
      check(p, 100);

      assert_eq!(
        a.allocate(ptr::null_mut(), usize::MAX, 16, AllocFlags::empty()),
        Err(AllocError::SizeOverflow)
      );

      a.free(p.as_ptr());
    }

    assert_eq!(heap.live(), 0);
  }

  #[test]
  #[should_panic(expected = "alignment may not decrease")]
  fn test_realloc_alignment_decrease_panics() {
    let a = system_allocator();
    unsafe {
      let p = a.allocate(ptr::null_mut(), 8, 64, AllocFlags::empty()).unwrap();
      let _ = a.allocate(p.as_ptr(), 16, 16, AllocFlags::REALLOC);
    }
  }

  #[test]
  #[should_panic(expected = "not a power of two")]
  fn test_non_pot_alignment_panics() {
    let a = system_allocator();
    unsafe {
      let _ = a.allocate(ptr::null_mut(), 8, 48, AllocFlags::empty());
    }
  }
}
