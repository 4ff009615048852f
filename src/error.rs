use thiserror::Error;

/// Recoverable allocation failures.
///
/// Contract violations (bad alignment, shrinking alignment on reallocation,
/// stale handles) are not represented here: they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  #[error("out of memory allocating {size} bytes at alignment {alignment}")]
  OutOfMemory { size: usize, alignment: usize },

  #[error("allocation size overflows usize")]
  SizeOverflow,

  #[error("reallocation is not supported by this allocator")]
  Unsupported,
}

impl AllocError {
  pub fn out_of_memory(
    size: usize,
    alignment: usize,
  ) -> AllocError {
    AllocError::OutOfMemory { size, alignment }
  }

  pub fn is_unsupported(&self) -> bool {
    matches!(self, AllocError::Unsupported)
  }
}

pub type Result<T, E = AllocError> = std::result::Result<T, E>;
