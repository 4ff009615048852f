//! Several independently aligned sub-regions carved out of one allocation.
//!
//! ```text
//!   base
//!   ┌────────────┬─pad─┬────────────────────┬──pad──┬───────────┐
//!   │  block 0   │     │      block 1       │       │  block 3  │
//!   └────────────┴─────┴────────────────────┴───────┴───────────┘
//!                                 (block 2 is empty: no address)
//! ```

use std::ptr::{self, NonNull};

use crate::{
  align::{self, assert_pot},
  aligned::system_allocator,
  allocator::{AllocFlags, Allocator},
  error::{AllocError, Result},
  mem,
};

/// `count` elements of `element_size` bytes aligned to `alignment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  pub count: usize,
  pub element_size: usize,
  pub alignment: usize,
}

impl BlockInfo {
  pub const fn new(
    count: usize,
    element_size: usize,
    alignment: usize,
  ) -> Self {
    Self {
      count,
      element_size,
      alignment,
    }
  }

  /// `count` values of `T`.
  pub const fn of<T>(count: usize) -> Self {
    Self::new(count, size_of::<T>(), align_of::<T>())
  }

  pub fn len(&self) -> Result<usize> {
    self
      .count
      .checked_mul(self.element_size)
      .ok_or(AllocError::SizeOverflow)
  }

  pub fn is_empty(&self) -> bool {
    self.count == 0 || self.element_size == 0
  }
}

/// Where each block lands relative to an allocation of `size()` bytes
/// aligned to `alignment()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
  size: usize,
  alignment: usize,
  offsets: Vec<Option<usize>>,
}

impl BlockLayout {
  pub fn compute(blocks: &[BlockInfo]) -> Result<Self> {
    for block in blocks {
      assert_pot(block.alignment);
    }

    let size = Self::size_pass(blocks)?;

    let alignment = blocks
      .iter()
      .filter(|block| !block.is_empty())
      .map(|block| block.alignment)
      .max()
      .unwrap_or(1);

    let mut offsets = Vec::with_capacity(blocks.len());
    let mut end = 0usize;
    for block in blocks {
      if block.is_empty() {
        offsets.push(None);
        continue;
      }

      let len = block.len()?;
      let offset = end + align::padding(end, block.alignment);
      end = offset + len;
      assert!(
        end <= size,
        "block placement ({end} bytes) exceeds the sized total ({size} bytes)"
      );
      offsets.push(Some(offset));
    }

    Ok(Self {
      size,
      alignment,
      offsets,
    })
  }

  /// Total bytes: each block placed after the running total, padded to its
  /// alignment. Empty blocks take no part, not even as the first block.
  fn size_pass(blocks: &[BlockInfo]) -> Result<usize> {
    let Some(start) = blocks.iter().position(|block| !block.is_empty()) else {
      return Ok(0);
    };
    let (first, rest) = (&blocks[start], &blocks[start + 1..]);

    let mut total = first.len()?;
    if total % first.alignment == 0 && total % (2 * first.alignment) == 0 {
      // Keeps a zero-padding boundary for the first block unambiguous.
      total = total
        .checked_add(first.alignment)
        .ok_or(AllocError::SizeOverflow)?;
    }

    for block in rest {
      if block.is_empty() {
        continue;
      }

      let pad = align::padding(total, block.alignment);
      total = block
        .len()?
        .checked_add(pad)
        .and_then(|n| n.checked_add(total))
        .ok_or(AllocError::SizeOverflow)?;
    }

    Ok(total)
  }

  pub fn size(&self) -> usize {
    self.size
  }

  pub fn alignment(&self) -> usize {
    self.alignment
  }

  /// Offset of each block, `None` for empty ones.
  pub fn offsets(&self) -> &[Option<usize>] {
    &self.offsets
  }
}

/// The result of a block allocation. Free `base()` through the allocator it
/// came from to release every region at once.
#[derive(Debug)]
pub struct BlockAllocation {
  base: NonNull<u8>,
  regions: Vec<Option<NonNull<u8>>>,
}

impl BlockAllocation {
  pub fn base(&self) -> NonNull<u8> {
    self.base
  }

  /// Address of block `index`, `None` when that block is empty.
  pub fn region(
    &self,
    index: usize,
  ) -> Option<NonNull<u8>> {
    self.regions[index]
  }

  pub fn regions(&self) -> &[Option<NonNull<u8>>] {
    &self.regions
  }

  /// Region addresses with empty blocks as null.
  pub fn region_ptrs(&self) -> impl Iterator<Item = *mut u8> + '_ {
    self
      .regions
      .iter()
      .map(|region| region.map_or(ptr::null_mut(), NonNull::as_ptr))
  }
}

/// Allocates every block in `blocks` from `a` in one request.
pub fn block_xalloc<A: Allocator + ?Sized>(
  a: &A,
  blocks: &[BlockInfo],
) -> Result<BlockAllocation> {
  block_xalloc_ex(a, blocks, AllocFlags::empty())
}

pub fn block_xalloc_ex<A: Allocator + ?Sized>(
  a: &A,
  blocks: &[BlockInfo],
  flags: AllocFlags,
) -> Result<BlockAllocation> {
  let layout = BlockLayout::compute(blocks)?;
  let flags = flags - AllocFlags::REALLOC;
  let base = unsafe { mem::xalloc_ex(a, ptr::null_mut(), layout.size(), flags, layout.alignment()) }?;

  let regions = blocks
    .iter()
    .zip(layout.offsets())
    .map(|(block, offset)| {
      offset.map(|offset| {
        let region = unsafe { base.add(offset) };
        debug_assert!(align::is_aligned(region.as_ptr(), block.alignment));
        region
      })
    })
    .collect();

  log::trace!(
    "block allocation: {} blocks, {} bytes at {:?}",
    blocks.len(),
    layout.size(),
    base
  );

  Ok(BlockAllocation { base, regions })
}

/// [`block_xalloc`] through the system allocator.
pub fn block_alloc(blocks: &[BlockInfo]) -> Result<BlockAllocation> {
  block_xalloc(&system_allocator(), blocks)
}
