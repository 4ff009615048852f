//! # resalloc - Aligned Allocation and Hierarchical Resources
//!
//! This crate provides a small allocator substrate: a uniform allocator
//! interface, a header-tracked aligned allocator over the C heap, a
//! fixed-capacity arena, single-request allocation of several aligned
//! blocks, and a tree of owned resources that are torn down together.
//!
//! ## Overview
//!
//! Every allocation made by an [`AlignedAllocator`] carries a header record
//! right before the data, so the data pointer alone is enough to recover the
//! size and alignment:
//!
//! ```text
//!   Aligned allocation:
//!
//!   raw (from the heap)
//!   ▼
//!   ┌──────────┬──────────────┬────────────────┬───────────────────────────┐
//!   │ padding  │ base header  │  back-pointer  │        user data          │
//!   │          │ ┌──────────┐ │  (only when a  │                           │
//!   │          │ │ size     │ │  gap separates │                           │
//!   │          │ │ align|tag│ │  header and    │                           │
//!   │          │ │ signature│ │  data)         │                           │
//!   │          │ └──────────┘ │                │                           │
//!   └──────────┴──────────────┴────────────────┴───────────────────────────┘
//!                                              ▲
//!                                              └── aligned pointer returned
//! ```
//!
//! A [`ResourceTree`] builds on the same header, extended with the handle of
//! the resource's node:
//!
//! ```text
//!   Resource tree:
//!
//!              root ──── destructor runs first
//!            ┌──┴──────┐
//!          child     child ── children freed most recent first
//!            │
//!          child
//!
//!   free(root) tears the whole subtree down exactly once.
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   resalloc
//!   ├── align      - Alignment arithmetic (align!, align_to!, fit)
//!   ├── allocator  - The Allocator trait and AllocFlags
//!   ├── error      - AllocError and Result
//!   ├── heap       - Raw heap backends (libc realloc/free)
//!   ├── header     - Header record codec
//!   ├── aligned    - AlignedAllocator
//!   ├── bump       - BumpAllocator (fixed-capacity arena)
//!   ├── mem        - xalloc/xrealloc/xfree entry points
//!   ├── block      - Multi-block allocation
//!   └── resource   - ResourceTree
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resalloc::{ResourceTree, system_allocator, xaligned_alloc, xfree};
//!
//! let a = system_allocator();
//! let page = xaligned_alloc(&a, 4096, 4096).unwrap();
//! unsafe { xfree(&a, page.as_ptr()) };
//!
//! let tree = ResourceTree::new();
//! let root = tree.alloc(None, 0).unwrap();
//! let name = tree.strdup(Some(root), "config").unwrap();
//! assert_eq!(tree.size(name), 7);
//! tree.free(root);
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded only**: allocators and trees use interior mutability
//!   without synchronization
//! - **Unix-only heap**: [`SystemHeap`] calls `libc::realloc` and `libc::free`
//!
//! ## Safety
//!
//! Raw allocation operations take and return pointers and are `unsafe` where
//! the caller must vouch for a pointer's origin. Resource handles are checked:
//! a stale handle is never mistaken for a live node.

pub mod align;
pub mod aligned;
pub mod allocator;
pub mod block;
pub mod bump;
pub mod error;
pub mod header;
pub mod heap;
pub mod mem;
pub mod resource;

pub use aligned::{AlignedAllocator, system_allocator};
pub use allocator::{AllocFlags, Allocator, MAX_ALIGN};
pub use block::{BlockAllocation, BlockInfo, BlockLayout, block_alloc, block_xalloc, block_xalloc_ex};
pub use bump::BumpAllocator;
pub use error::{AllocError, Result};
pub use heap::{RawHeap, SystemHeap};
pub use mem::{xaligned_alloc, xalloc, xalloc_ex, xcalloc, xfree, xrealloc};
pub use resource::{Resource, ResourceAllocator, ResourceTree, Teardown};
