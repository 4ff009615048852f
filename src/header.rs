//! Header codec: the only code that reads or writes bookkeeping bytes.
//!
//! ```text
//!   Header adjacent to data (common case):
//!
//!   raw ─┬────────────────────────────────┬──────────────────────────┐
//!        │ record (.. size, bits, sig)    │  data                    │
//!        └────────────────────────────────┴──────────────────────────┘
//!                                  sig ──▲ ▲── data
//!
//!   Header separated by alignment padding:
//!
//!   raw ─┬────────────────────────────┬──────────┬──────┬────────────┐
//!        │ record (.. size, bits, sig)│ padding  │ &raw │  data      │
//!        └────────────────────────────┴──────────┴──────┴────────────┘
//!                                        back-pointer ──▲ ▲── data
//! ```
//!
//! Decoding reads the word just before the data. If it is the signature, the
//! record ends there. Otherwise the word is the record's address.

use std::{
  mem::{align_of, size_of},
  ptr::{self, NonNull},
};

use bitflags::bitflags;

use crate::align::{self, alignment_power};

/// Marks a word as the tail of a header record.
pub const SIGNATURE: usize = 0xFEED_5EED_FEED_5EED_u64 as usize;

/// Byte written over a record when its allocation is released.
pub const POISON: u8 = 0xDD;

const POWER_BITS: u32 = 8;
const POWER_MASK: usize = (1 << POWER_BITS) - 1;

bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct Tags: usize {
    /// The allocation is a node of a resource tree.
    const RESOURCE = 1 << 0;
    /// Teardown of the node has started.
    const IN_FREE = 1 << 1;
  }
}

/// The fixed bookkeeping every allocation carries.
///
/// `signature` is the last field so that, when the record sits right before
/// the data, the word immediately preceding the data is the signature.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseHeader {
  size: usize,
  bits: usize,
  signature: usize,
}

impl BaseHeader {
  fn new(
    size: usize,
    alignment: usize,
    tags: Tags,
  ) -> Self {
    Self {
      size,
      bits: alignment_power(alignment) as usize | (tags.bits() << POWER_BITS),
      signature: SIGNATURE,
    }
  }

  /// Requested byte length, not the padded length.
  pub fn size(&self) -> usize {
    self.size
  }

  pub fn alignment_power(&self) -> u8 {
    (self.bits & POWER_MASK) as u8
  }

  pub fn alignment(&self) -> usize {
    1 << self.alignment_power()
  }

  pub fn tags(&self) -> Tags {
    Tags::from_bits_retain(self.bits >> POWER_BITS)
  }

  pub fn is_valid(&self) -> bool {
    self.signature == SIGNATURE
  }
}

/// A header record: a `#[repr(C)]` type whose final field is a
/// [`BaseHeader`]. The codec only writes the base part; the leading fields
/// belong to the record's owner and survive reallocation.
///
/// # Safety
///
/// `BASE_OFFSET` must be the offset of the trailing `BaseHeader` field, and
/// the record must be `#[repr(C)]`.
pub unsafe trait Record: Sized {
  const BASE_OFFSET: usize;
}

unsafe impl Record for BaseHeader {
  const BASE_OFFSET: usize = 0;
}

/// Smallest data alignment usable with record `H`: keeps the record aligned
/// when it sits directly before the data, and leaves room for a back-pointer
/// whenever there is a gap.
pub const fn min_alignment<H: Record>() -> usize {
  let a = align_of::<H>();
  if a > align_of::<usize>() {
    a
  } else {
    align_of::<usize>()
  }
}

/// Raw bytes needed for `size` data bytes at `alignment` behind record `H`.
pub const fn raw_size<H: Record>(
  size: usize,
  alignment: usize,
) -> Option<usize> {
  match size_of::<H>().checked_add(size) {
    Some(n) => n.checked_add(alignment),
    None => None,
  }
}

/// Offset from the raw region start to the data for `alignment`, given the
/// region starts at `raw`.
pub fn data_offset<H: Record>(
  raw: *const u8,
  alignment: usize,
) -> usize {
  let header_end = raw.addr() + size_of::<H>();
  size_of::<H>() + align::padding(header_end, alignment)
}

const fn check_layout<H: Record>() {
  assert!(H::BASE_OFFSET + size_of::<BaseHeader>() == size_of::<H>());
  assert!(size_of::<H>() % size_of::<usize>() == 0);
}

/// Writes the base record at the start of `raw` and returns the data address.
///
/// The data address is the lowest address at or after the end of the record
/// satisfying `alignment`. When that leaves a gap, the word before the data
/// receives the record's address.
///
/// # Safety
///
/// `raw` must be valid for writes of `raw_size::<H>(size, alignment)` bytes
/// and aligned to `align_of::<H>()`. `alignment` must be a power of two of at
/// least [`min_alignment::<H>`].
pub unsafe fn encode<H: Record>(
  raw: NonNull<u8>,
  size: usize,
  alignment: usize,
  tags: Tags,
) -> NonNull<u8> {
  const { check_layout::<H>() };
  debug_assert!(alignment >= min_alignment::<H>());
  debug_assert!(align::is_aligned(raw.as_ptr(), align_of::<H>()));

  unsafe {
    let data = raw.add(data_offset::<H>(raw.as_ptr(), alignment));
    let base = raw.add(H::BASE_OFFSET).cast::<BaseHeader>();
    base.write(BaseHeader::new(size, alignment, tags));

    let header_end = raw.add(size_of::<H>());
    if header_end != data {
      data.cast::<*mut u8>().sub(1).write(raw.as_ptr());
    }

    log::trace!(
      "encode: raw = {:?}, data = {:?}, size = {}, align = {}, indirect = {}",
      raw,
      data,
      size,
      alignment,
      header_end != data
    );

    data
  }
}

/// Recovers the record belonging to `data`.
///
/// # Safety
///
/// `data` must be a live data address produced by [`encode::<H>`].
pub unsafe fn decode<H: Record>(data: NonNull<u8>) -> NonNull<H> {
  match unsafe { try_decode::<H>(data) } {
    Some(record) => record,
    None => panic!("no header record for data {data:?}"),
  }
}

/// Like [`decode`], but `None` when no valid record of type `H` is found.
///
/// Lets a caller tell record types apart: a record of another type whose
/// words are all initialized never carries the signature where `H` expects
/// it.
///
/// # Safety
///
/// `data` must be a live data address produced by [`encode`] with a record
/// type no smaller than `H`.
pub unsafe fn try_decode<H: Record>(data: NonNull<u8>) -> Option<NonNull<H>> {
  unsafe {
    let slot = data.cast::<*mut u8>().sub(1).read();
    let record = if slot.addr() == SIGNATURE {
      data.sub(size_of::<H>()).cast::<H>()
    } else {
      // A back-pointer written by `encode`: the record's own address.
      NonNull::new(slot)?.cast::<H>()
    };

    if !align::is_aligned(record.as_ptr(), align_of::<H>()) {
      log::trace!("misaligned header record at {:?} for data {:?}", record, data);
      return None;
    }
    base_of(record).as_ref().is_valid().then_some(record)
  }
}

/// The base part of `record`.
pub fn base_of<H: Record>(record: NonNull<H>) -> NonNull<BaseHeader> {
  unsafe { record.byte_add(H::BASE_OFFSET).cast() }
}

/// A copy of the base record for `data`.
///
/// # Safety
///
/// As for [`decode`].
pub unsafe fn read<H: Record>(data: NonNull<u8>) -> BaseHeader {
  unsafe { base_of(decode::<H>(data)).read() }
}

/// Replaces the tag bits of the record for `data`, returning the old tags.
///
/// # Safety
///
/// As for [`decode`].
pub unsafe fn set_tags<H: Record>(
  data: NonNull<u8>,
  tags: Tags,
) -> Tags {
  unsafe {
    let mut base = base_of(decode::<H>(data));
    let header = base.as_mut();
    let old = header.tags();
    header.bits = (header.bits & POWER_MASK) | (tags.bits() << POWER_BITS);
    old
  }
}

/// Overwrites the record for `data`, and the back-pointer if any, with
/// [`POISON`]. Returns the raw region start.
///
/// # Safety
///
/// As for [`decode`]. The allocation must not be decoded again.
pub unsafe fn scrub<H: Record>(data: NonNull<u8>) -> NonNull<u8> {
  unsafe {
    let record = decode::<H>(data);
    let raw = record.cast::<u8>();
    let header_end = raw.add(size_of::<H>());
    let len = data.offset_from(raw) as usize;
    debug_assert!(len >= header_end.offset_from(raw) as usize);
    ptr::write_bytes(raw.as_ptr(), POISON, len);
    raw
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[repr(C)]
  struct Extended {
    owner: u64,
    base: BaseHeader,
  }

  unsafe impl Record for Extended {
    const BASE_OFFSET: usize = std::mem::offset_of!(Extended, base);
  }

  /// Word-aligned scratch buffer big enough for the largest test case.
  fn scratch(len: usize) -> Vec<usize> {
    vec![0usize; len / size_of::<usize>() + 1]
  }

  #[test]
  fn test_round_trip() {
    for alignment in [8usize, 16, 32, 64, 4096] {
      for size in [0usize, 1, 17, 4095] {
        let alignment = alignment.max(min_alignment::<BaseHeader>());
        let len = raw_size::<BaseHeader>(size, alignment).unwrap();
        let mut buf = scratch(len);
        let raw = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();

        unsafe {
          let data = encode::<BaseHeader>(raw, size, alignment, Tags::empty());
          assert!(align::is_aligned(data.as_ptr(), alignment));
          assert!(data.as_ptr().addr() + size <= raw.as_ptr().addr() + len);

          let record = decode::<BaseHeader>(data);
          assert_eq!(record.cast::<u8>(), raw);

          let header = record.read();
          assert_eq!(header.size(), size);
          assert_eq!(header.alignment(), alignment);
          assert_eq!(header.tags(), Tags::empty());
        }
      }
    }
  }

  #[test]
  fn test_adjacent_has_no_back_pointer() {
    let mut buf = scratch(128);
    let raw = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();

    unsafe {
      let data = encode::<BaseHeader>(raw, 8, size_of::<usize>(), Tags::empty());
      assert_eq!(data.offset_from(raw) as usize, size_of::<BaseHeader>());
      assert_eq!(data.cast::<usize>().sub(1).read(), SIGNATURE);
    }
  }

  #[test]
  fn test_padded_writes_back_pointer() {
    let mut buf = scratch(8192);
    let raw = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();

    unsafe {
      let data = encode::<BaseHeader>(raw, 1, 4096, Tags::empty());
      if data.offset_from(raw) as usize != size_of::<BaseHeader>() {
        assert_eq!(data.cast::<*mut u8>().sub(1).read(), raw.as_ptr());
      }
      assert_eq!(decode::<BaseHeader>(data).cast::<u8>(), raw);
    }
  }

  #[test]
  fn test_extended_record_keeps_owner_fields() {
    let alignment = min_alignment::<Extended>().max(64);
    let len = raw_size::<Extended>(24, alignment).unwrap();
    let mut buf = scratch(len);
    let raw = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();

    unsafe {
      raw.cast::<Extended>().as_mut().owner = 0xABCD;
      let data = encode::<Extended>(raw, 24, alignment, Tags::RESOURCE);

      let record = decode::<Extended>(data);
      assert_eq!(record.as_ref().owner, 0xABCD);
      assert_eq!(record.as_ref().base.size(), 24);
      assert_eq!(read::<Extended>(data).tags(), Tags::RESOURCE);
    }
  }

  #[test]
  fn test_set_tags_keeps_alignment() {
    let mut buf = scratch(256);
    let raw = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();

    unsafe {
      let data = encode::<BaseHeader>(raw, 3, 32, Tags::RESOURCE);
      let old = set_tags::<BaseHeader>(data, Tags::RESOURCE | Tags::IN_FREE);
      assert_eq!(old, Tags::RESOURCE);

      let header = read::<BaseHeader>(data);
      assert_eq!(header.tags(), Tags::RESOURCE | Tags::IN_FREE);
      assert_eq!(header.alignment(), 32);
      assert_eq!(header.size(), 3);
    }
  }

  #[test]
  fn test_scrub_poisons_record() {
    let mut buf = scratch(256);
    let raw = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();

    unsafe {
      let data = encode::<BaseHeader>(raw, 3, 64, Tags::empty());
      assert_eq!(scrub::<BaseHeader>(data), raw);

      let header = raw.cast::<BaseHeader>().read();
      assert!(!header.is_valid());
      assert_eq!(raw.read(), POISON);
      assert_eq!(data.sub(1).read(), POISON);
    }
  }

  #[test]
  fn test_try_decode_tells_record_types_apart() {
    let alignment = 64;
    let len = raw_size::<Extended>(8, alignment).unwrap() + size_of::<usize>();
    let mut buf = scratch(len);
    let mut raw = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();

    unsafe {
      // Force a gap between the record and the data.
      if (raw.as_ptr().addr() + size_of::<Extended>()) % alignment == 0 {
        raw = raw.add(size_of::<usize>());
      }
      raw.cast::<Extended>().as_mut().owner = 7;
      let data = encode::<Extended>(raw, 8, alignment, Tags::RESOURCE);

      assert_eq!(try_decode::<Extended>(data).map(NonNull::cast::<u8>), Some(raw));
      assert!(try_decode::<BaseHeader>(data).is_none());
    }
  }

  #[test]
  #[should_panic(expected = "no header record")]
  fn test_decode_rejects_foreign_pointer() {
    let mut buf = scratch(64);
    let raw = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();

    unsafe {
      let data = raw.add(4 * size_of::<usize>());
      // The slot before `data` points back at `raw`, which holds no signature.
      data.cast::<*mut u8>().sub(1).write(raw.as_ptr());
      let _ = decode::<BaseHeader>(data);
    }
  }
}
