use std::{
  cell::RefCell,
  ptr::{self, NonNull},
};

use crate::{
  align::{self, assert_pot},
  aligned::system_allocator,
  allocator::{AllocFlags, Allocator, MAX_ALIGN},
  error::{AllocError, Result},
  mem,
};

/// Alignment of the backing buffer.
const BACKING_ALIGN: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct Block {
  offset: usize,
  capacity: usize,
  size: usize,
  is_free: bool,
}

impl Block {
  fn end(&self) -> usize {
    self.offset + self.capacity
  }
}

/// A fixed-capacity arena carved front to back.
///
/// Freed blocks are reused first-fit; freeing the last block rewinds the
/// cursor past every trailing free block. Resizing in place is not supported:
/// `REALLOC` requests fail with [`AllocError::Unsupported`] and are emulated
/// by [`crate::mem::xalloc_ex`].
#[derive(Debug)]
pub struct BumpAllocator {
  buf: NonNull<u8>,
  capacity: usize,
  blocks: RefCell<Vec<Block>>,
}

impl BumpAllocator {
  pub fn with_capacity(capacity: usize) -> Result<Self> {
    let buf = mem::xaligned_alloc(&system_allocator(), capacity, BACKING_ALIGN)?;
    Ok(Self {
      buf,
      capacity,
      blocks: RefCell::new(Vec::new()),
    })
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Bytes between the start of the arena and the cursor.
  pub fn used(&self) -> usize {
    self.blocks.borrow().last().map_or(0, Block::end)
  }

  fn find_free_block(
    &self,
    blocks: &[Block],
    size: usize,
    alignment: usize,
  ) -> Option<usize> {
    blocks.iter().position(|block| {
      block.is_free
        && block.capacity >= size
        && align::is_aligned(self.addr_of(block.offset), alignment)
    })
  }

  fn addr_of(
    &self,
    offset: usize,
  ) -> *mut u8 {
    self.buf.as_ptr().wrapping_add(offset)
  }

  fn block_index(
    &self,
    blocks: &[Block],
    ptr: *mut u8,
  ) -> usize {
    let offset = ptr.addr().wrapping_sub(self.buf.as_ptr().addr());
    match blocks.binary_search_by_key(&offset, |block| block.offset) {
      Ok(index) if !blocks[index].is_free => index,
      _ => panic!("{ptr:?} is not a live allocation of this arena"),
    }
  }
}

unsafe impl Allocator for BumpAllocator {
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
    if flags.contains(AllocFlags::REALLOC) && !ptr.is_null() {
      return Err(AllocError::Unsupported);
    }

    let alignment = if alignment == 0 { MAX_ALIGN } else { alignment };
    assert_pot(alignment);

    let mut blocks = self.blocks.borrow_mut();

    let offset = if let Some(index) = self.find_free_block(&blocks, size, alignment) {
      let block = &mut blocks[index];
      block.is_free = false;
      block.size = size;
      block.offset
    } else {
      let used = blocks.last().map_or(0, Block::end);
      let mut cursor = self.addr_of(used);
      let mut space = self.capacity - used;
      // Every block spans at least one byte so offsets stay unique.
      let capacity = size.max(1);

      if align::fit(alignment, capacity, &mut cursor, &mut space).is_none() {
        return Err(AllocError::out_of_memory(size, alignment));
      }

      let offset = cursor.addr() - self.buf.as_ptr().addr();
      blocks.push(Block {
        offset,
        capacity,
        size,
        is_free: false,
      });
      offset
    };

    let data = unsafe { self.buf.add(offset) };
    if flags.contains(AllocFlags::ZERO) {
      unsafe { ptr::write_bytes(data.as_ptr(), 0, size) };
    }

    log::trace!("bump: allocated {} bytes at offset {}", size, offset);
    Ok(data)
  }

  unsafe fn free(
    &self,
    ptr: *mut u8,
  ) {
    if ptr.is_null() {
      return;
    }

    let mut blocks = self.blocks.borrow_mut();
    let index = self.block_index(&blocks, ptr);
    blocks[index].is_free = true;

    while blocks.last().is_some_and(|block| block.is_free) {
      blocks.pop();
    }
  }

  unsafe fn usable_size(
    &self,
    ptr: *mut u8,
  ) -> usize {
    if ptr.is_null() {
      return 0;
    }

    let blocks = self.blocks.borrow();
    blocks[self.block_index(&blocks, ptr)].size
  }
}

impl Drop for BumpAllocator {
  fn drop(&mut self) {
    unsafe { mem::xfree(&system_allocator(), self.buf.as_ptr()) }
  }
}
