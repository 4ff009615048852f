//! Hierarchical resource ownership.
//!
//! Every resource is an aligned allocation whose header record carries the
//! handle of its node in the tree's arena. Nodes own their children: freeing
//! a node runs its destructor, then frees every child, then releases the
//! node's own memory.
//!
//! ```text
//!              root
//!            ┌──┴───────┐
//!          child      child      (most recently added first)
//!            │
//!          child
//! ```
//!
//! The tree is single-threaded and re-entrant: destructors receive the tree
//! and may allocate, re-parent or free other resources, including the one
//! being torn down (which is then a no-op).

use std::{
  cell::RefCell,
  fmt::{self, Write as _},
  mem::offset_of,
  ops::ControlFlow,
  ptr::{self, NonNull},
};

use crate::{
  aligned::AlignedAllocator,
  allocator::{AllocFlags, Allocator, MAX_ALIGN},
  error::{AllocError, Result},
  header::{self, BaseHeader, Record, Tags},
  heap::{RawHeap, SystemHeap},
  mem,
};

/// Handle of a node in a [`ResourceTree`].
///
/// Handles are generation checked: once a node is freed its handle never
/// names another node.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resource {
  index: u32,
  generation: u32,
}

#[repr(C)]
struct ResourceHeader {
  resource: Resource,
  base: BaseHeader,
}

unsafe impl Record for ResourceHeader {
  const BASE_OFFSET: usize = offset_of!(ResourceHeader, base);
}

/// What a destructor is told about the node being torn down.
#[derive(Debug, Clone, Copy)]
pub struct Teardown {
  pub resource: Resource,
  pub data: NonNull<u8>,
  pub size: usize,
  pub alignment: usize,
}

pub type Destructor<R> = Box<dyn FnOnce(&ResourceTree<R>, Teardown)>;

struct Node<R: RawHeap> {
  data: NonNull<u8>,
  parent: Option<Resource>,
  /// Oldest first; the list head is the last element.
  children: Vec<Resource>,
  destructor: Option<Destructor<R>>,
}

struct Slot<R: RawHeap> {
  generation: u32,
  node: Option<Node<R>>,
}

struct Arena<R: RawHeap> {
  slots: Vec<Slot<R>>,
  vacant: Vec<u32>,
  live: usize,
}

impl<R: RawHeap> Arena<R> {
  fn new() -> Self {
    Self {
      slots: Vec::new(),
      vacant: Vec::new(),
      live: 0,
    }
  }

  fn insert(
    &mut self,
    data: NonNull<u8>,
    parent: Option<Resource>,
  ) -> Resource {
    let node = Node {
      data,
      parent,
      children: Vec::new(),
      destructor: None,
    };

    self.live += 1;
    if let Some(index) = self.vacant.pop() {
      let slot = &mut self.slots[index as usize];
      slot.node = Some(node);
      return Resource {
        index,
        generation: slot.generation,
      };
    }

    let Ok(index) = u32::try_from(self.slots.len()) else {
      panic!("resource arena exhausted");
    };
    self.slots.push(Slot {
      generation: 0,
      node: Some(node),
    });
    Resource {
      index,
      generation: 0,
    }
  }

  fn get(
    &self,
    res: Resource,
  ) -> Option<&Node<R>> {
    self
      .slots
      .get(res.index as usize)
      .filter(|slot| slot.generation == res.generation)
      .and_then(|slot| slot.node.as_ref())
  }

  fn get_mut(
    &mut self,
    res: Resource,
  ) -> Option<&mut Node<R>> {
    self
      .slots
      .get_mut(res.index as usize)
      .filter(|slot| slot.generation == res.generation)
      .and_then(|slot| slot.node.as_mut())
  }

  #[track_caller]
  fn node(
    &self,
    res: Resource,
  ) -> &Node<R> {
    match self.get(res) {
      Some(node) => node,
      None => panic!("stale resource handle {res:?}"),
    }
  }

  #[track_caller]
  fn node_mut(
    &mut self,
    res: Resource,
  ) -> &mut Node<R> {
    match self.get_mut(res) {
      Some(node) => node,
      None => panic!("stale resource handle {res:?}"),
    }
  }

  fn remove(
    &mut self,
    res: Resource,
  ) -> Node<R> {
    let slot = &mut self.slots[res.index as usize];
    debug_assert_eq!(slot.generation, res.generation);
    let Some(node) = slot.node.take() else {
      panic!("removing vacant slot {}", res.index);
    };
    slot.generation = slot.generation.wrapping_add(1);
    self.vacant.push(res.index);
    self.live -= 1;
    node
  }

  /// Detaches `res` from its parent's child list, if it has a parent.
  fn unlink(
    &mut self,
    res: Resource,
  ) {
    let Some(parent) = self.node_mut(res).parent.take() else {
      return;
    };

    let siblings = &mut self.node_mut(parent).children;
    if let Some(pos) = siblings.iter().rposition(|&child| child == res) {
      siblings.remove(pos);
    }
  }

  fn link(
    &mut self,
    parent: Resource,
    res: Resource,
  ) {
    self.node_mut(parent).children.push(res);
    self.node_mut(res).parent = Some(parent);
  }

  fn roots(&self) -> Vec<Resource> {
    self
      .slots
      .iter()
      .enumerate()
      .filter_map(|(index, slot)| {
        let node = slot.node.as_ref()?;
        node.parent.is_none().then_some(Resource {
          index: index as u32,
          generation: slot.generation,
        })
      })
      .collect()
  }
}

/// An ownership tree of aligned allocations.
pub struct ResourceTree<R: RawHeap = SystemHeap> {
  allocator: AlignedAllocator<R>,
  arena: RefCell<Arena<R>>,
}

impl ResourceTree<SystemHeap> {
  pub fn new() -> Self {
    Self::with_allocator(AlignedAllocator::default())
  }
}

impl Default for ResourceTree<SystemHeap> {
  fn default() -> Self {
    Self::new()
  }
}

impl<R: RawHeap> ResourceTree<R> {
  pub fn with_allocator(allocator: AlignedAllocator<R>) -> Self {
    Self {
      allocator,
      arena: RefCell::new(Arena::new()),
    }
  }

  pub fn raw_allocator(&self) -> &AlignedAllocator<R> {
    &self.allocator
  }

  /// Number of live resources.
  pub fn len(&self) -> usize {
    self.arena.borrow().live
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn contains(
    &self,
    res: Resource,
  ) -> bool {
    self.arena.borrow().get(res).is_some()
  }

  /// Creates a resource of `size` bytes at the default alignment, owned by
  /// `parent` if given.
  pub fn alloc(
    &self,
    parent: Option<Resource>,
    size: usize,
  ) -> Result<Resource> {
    self.allocate(parent, size, 0)
  }

  pub fn allocate(
    &self,
    parent: Option<Resource>,
    size: usize,
    alignment: usize,
  ) -> Result<Resource> {
    self.allocate_ex(parent, size, alignment, AllocFlags::empty())
  }

  /// Creates a resource. `alignment` `0` is the default alignment; `REALLOC`
  /// is ignored.
  pub fn allocate_ex(
    &self,
    parent: Option<Resource>,
    size: usize,
    alignment: usize,
    flags: AllocFlags,
  ) -> Result<Resource> {
    if let Some(parent) = parent {
      self.arena.borrow().node(parent);
    }

    let alignment = if alignment == 0 { MAX_ALIGN } else { alignment };
    let flags = flags - AllocFlags::REALLOC;

    let data = match unsafe {
      self
        .allocator
        .allocate_record::<ResourceHeader>(ptr::null_mut(), size, alignment, flags, Tags::RESOURCE)
    } {
      Ok(data) => data,
      Err(err) if flags.contains(AllocFlags::NO_FAIL) => mem::fatal(err, size, alignment),
      Err(err) => return Err(err),
    };

    let mut arena = self.arena.borrow_mut();
    let res = arena.insert(data, None);
    unsafe {
      let record = header::decode::<ResourceHeader>(data);
      (&raw mut (*record.as_ptr()).resource).write(res);
    }
    if let Some(parent) = parent {
      arena.link(parent, res);
    }

    log::trace!("resource {:?}: {} bytes under {:?}", res, size, parent);
    Ok(res)
  }

  /// Zeroed resource of `nmemb * size` bytes.
  pub fn calloc(
    &self,
    parent: Option<Resource>,
    nmemb: usize,
    size: usize,
  ) -> Result<Resource> {
    let total = nmemb.checked_mul(size).ok_or(AllocError::SizeOverflow)?;
    self.allocate_ex(parent, total, 0, AllocFlags::ZERO)
  }

  /// NUL-terminated copy of `s`.
  pub fn strdup(
    &self,
    parent: Option<Resource>,
    s: &str,
  ) -> Result<Resource> {
    let len = s.len().checked_add(1).ok_or(AllocError::SizeOverflow)?;
    let res = self.allocate(parent, len, 1)?;
    let data = self.data(res).as_ptr();
    unsafe {
      ptr::copy_nonoverlapping(s.as_ptr(), data, s.len());
      data.add(s.len()).write(0);
    }
    Ok(res)
  }

  /// NUL-terminated formatted string.
  pub fn format(
    &self,
    parent: Option<Resource>,
    args: fmt::Arguments<'_>,
  ) -> Result<Resource> {
    let res = self.allocate(parent, 0, 1)?;
    let mut writer = ResourceWriter {
      tree: self,
      res,
      len: 0,
      error: None,
    };

    match writer.write_fmt(args).and_then(|()| writer.write_str("\0")) {
      Ok(()) => Ok(res),
      Err(fmt::Error) => {
        let error = writer.error;
        self.free(res);
        match error {
          Some(err) => Err(err),
          None => panic!("a formatting trait implementation returned an error"),
        }
      }
    }
  }

  /// Resizes `res`, keeping its alignment. The data may move.
  pub fn realloc(
    &self,
    res: Resource,
    size: usize,
  ) -> Result<NonNull<u8>> {
    self.realloc_ex(res, size, 0, AllocFlags::empty())
  }

  fn realloc_ex(
    &self,
    res: Resource,
    size: usize,
    alignment: usize,
    flags: AllocFlags,
  ) -> Result<NonNull<u8>> {
    let data = self.data(res);
    let current = unsafe { header::read::<ResourceHeader>(data) };
    let alignment = if alignment == 0 { current.alignment() } else { alignment };

    let moved = unsafe {
      self.allocator.allocate_record::<ResourceHeader>(
        data.as_ptr(),
        size,
        alignment,
        flags | AllocFlags::REALLOC,
        current.tags(),
      )
    }?;

    self.arena.borrow_mut().node_mut(res).data = moved;
    Ok(moved)
  }

  /// Tears `res` down: destructor first, then every child, then the node
  /// itself. Freeing a resource whose teardown is already in progress, or
  /// one that no longer exists, does nothing.
  pub fn free(
    &self,
    res: Resource,
  ) {
    let (teardown, destructor) = {
      let mut arena = self.arena.borrow_mut();
      let Some(node) = arena.get_mut(res) else {
        log::debug!("ignoring free of released resource {:?}", res);
        return;
      };

      let data = node.data;
      let current = unsafe { header::read::<ResourceHeader>(data) };
      if current.tags().contains(Tags::IN_FREE) {
        return;
      }
      unsafe { header::set_tags::<ResourceHeader>(data, current.tags() | Tags::IN_FREE) };

      let teardown = Teardown {
        resource: res,
        data,
        size: current.size(),
        alignment: current.alignment(),
      };
      (teardown, node.destructor.take())
    };

    log::debug!("tearing down {:?} ({} bytes)", res, teardown.size);
    if let Some(destructor) = destructor {
      destructor(self, teardown);
    }

    loop {
      let child = {
        let mut arena = self.arena.borrow_mut();
        let child = arena.node_mut(res).children.pop();
        if let Some(node) = child.and_then(|child| arena.get_mut(child)) {
          node.parent = None;
        }
        child
      };

      match child {
        Some(child) => self.free(child),
        None => break,
      }
    }

    let node = {
      let mut arena = self.arena.borrow_mut();
      arena.unlink(res);
      arena.remove(res)
    };

    unsafe { self.allocator.free_record::<ResourceHeader>(node.data.as_ptr()) };
  }

  /// Moves `res` under `parent`. Returns `res`.
  pub fn add(
    &self,
    parent: Resource,
    res: Resource,
  ) -> Resource {
    let mut arena = self.arena.borrow_mut();

    let mut ancestor = Some(parent);
    while let Some(a) = ancestor {
      assert!(a != res, "adding {res:?} under {parent:?} would create a cycle");
      ancestor = arena.node(a).parent;
    }

    arena.unlink(res);
    arena.link(parent, res);
    res
  }

  /// Detaches `res` from its parent; it becomes a root. Returns `res`.
  pub fn remove(
    &self,
    res: Resource,
  ) -> Resource {
    self.arena.borrow_mut().unlink(res);
    res
  }

  /// Sets the callback invoked once at the start of `res`'s teardown,
  /// replacing any previous one.
  pub fn set_destructor<F>(
    &self,
    res: Resource,
    destructor: F,
  ) where
    F: FnOnce(&ResourceTree<R>, Teardown) + 'static,
  {
    self.arena.borrow_mut().node_mut(res).destructor = Some(Box::new(destructor));
  }

  pub fn parent(
    &self,
    res: Resource,
  ) -> Option<Resource> {
    self.arena.borrow().node(res).parent
  }

  /// Direct children, most recently added first.
  pub fn children(
    &self,
    res: Resource,
  ) -> Vec<Resource> {
    self.arena.borrow().node(res).children.iter().rev().copied().collect()
  }

  /// Calls `f` for each direct child in list order, stopping at the first
  /// `Break`.
  pub fn enum_children<B, F>(
    &self,
    res: Resource,
    mut f: F,
  ) -> ControlFlow<B>
  where
    F: FnMut(Resource) -> ControlFlow<B>,
  {
    for child in self.children(res) {
      f(child)?;
    }
    ControlFlow::Continue(())
  }

  pub fn data(
    &self,
    res: Resource,
  ) -> NonNull<u8> {
    self.arena.borrow().node(res).data
  }

  pub fn size(
    &self,
    res: Resource,
  ) -> usize {
    unsafe { header::read::<ResourceHeader>(self.data(res)).size() }
  }

  pub fn alignment(
    &self,
    res: Resource,
  ) -> usize {
    unsafe { header::read::<ResourceHeader>(self.data(res)).alignment() }
  }

  /// Size of `res` plus every descendant.
  pub fn size_total(
    &self,
    res: Resource,
  ) -> usize {
    let mut total = self.size(res);
    let _ = self.enum_children(res, |child| {
      total += self.size_total(child);
      ControlFlow::<()>::Continue(())
    });
    total
  }

  /// Recovers the handle of the resource whose data starts at `data`.
  ///
  /// # Safety
  ///
  /// `data` must be the data address of a live allocation with a header
  /// record: a resource, or any allocation of an [`AlignedAllocator`].
  pub unsafe fn resource_of(
    &self,
    data: NonNull<u8>,
  ) -> Resource {
    // A plain record is checked as such first so that its smaller layout is
    // never read as a resource record.
    if let Some(plain) = unsafe { header::try_decode::<BaseHeader>(data) } {
      let tags = unsafe { plain.as_ref().tags() };
      assert!(tags.contains(Tags::RESOURCE), "{data:?} is not a resource");
    }

    let current = unsafe { header::read::<ResourceHeader>(data) };
    debug_assert!(current.tags().contains(Tags::RESOURCE));

    let res = unsafe { header::decode::<ResourceHeader>(data).as_ref().resource };
    assert!(
      self.arena.borrow().get(res).is_some_and(|node| node.data == data),
      "{data:?} is not a resource of this tree"
    );
    res
  }

  /// An [`Allocator`] whose allocations become children of `parent`.
  pub fn allocator(
    &self,
    parent: Resource,
  ) -> ResourceAllocator<'_, R> {
    self.arena.borrow().node(parent);
    ResourceAllocator { tree: self, parent }
  }
}

impl<R: RawHeap> Drop for ResourceTree<R> {
  fn drop(&mut self) {
    loop {
      let roots = self.arena.borrow().roots();
      if roots.is_empty() {
        break;
      }

      let mut freed = false;
      for root in roots {
        self.free(root);
        freed |= !self.contains(root);
      }

      if !freed {
        log::warn!("dropping resource tree with {} live resources", self.len());
        break;
      }
    }
  }
}

impl<R: RawHeap> fmt::Debug for ResourceTree<R> {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    f.debug_struct("ResourceTree")
      .field("live", &self.len())
      .finish_non_exhaustive()
  }
}

/// Appends formatted output to a resource, growing it as needed.
struct ResourceWriter<'t, R: RawHeap> {
  tree: &'t ResourceTree<R>,
  res: Resource,
  len: usize,
  error: Option<AllocError>,
}

impl<R: RawHeap> fmt::Write for ResourceWriter<'_, R> {
  fn write_str(
    &mut self,
    s: &str,
  ) -> fmt::Result {
    let Some(len) = self.len.checked_add(s.len()) else {
      self.error = Some(AllocError::SizeOverflow);
      return Err(fmt::Error);
    };

    let data = match self.tree.realloc(self.res, len) {
      Ok(data) => data,
      Err(err) => {
        self.error = Some(err);
        return Err(fmt::Error);
      }
    };

    unsafe { ptr::copy_nonoverlapping(s.as_ptr(), data.as_ptr().add(self.len), s.len()) };
    self.len = len;
    Ok(())
  }
}

/// Bridges the tree to everything allocator-aware: allocations become
/// children of `parent`, and `free`, `usable_size` and `REALLOC` act on the
/// corresponding resource.
#[derive(Clone, Copy)]
pub struct ResourceAllocator<'t, R: RawHeap = SystemHeap> {
  tree: &'t ResourceTree<R>,
  parent: Resource,
}

impl<R: RawHeap> ResourceAllocator<'_, R> {
  pub fn parent(&self) -> Resource {
    self.parent
  }
}

unsafe impl<R: RawHeap> Allocator for ResourceAllocator<'_, R> {
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
    match NonNull::new(ptr) {
      Some(data) if flags.contains(AllocFlags::REALLOC) => {
        let res = unsafe { self.tree.resource_of(data) };
        self.tree.realloc_ex(res, size, alignment, flags)
      }
      _ => {
        let res = self.tree.allocate_ex(Some(self.parent), size, alignment, flags)?;
        Ok(self.tree.data(res))
      }
    }
  }

  unsafe fn free(
    &self,
    ptr: *mut u8,
  ) {
    if let Some(data) = NonNull::new(ptr) {
      let res = unsafe { self.tree.resource_of(data) };
      self.tree.free(res);
    }
  }

  unsafe fn usable_size(
    &self,
    ptr: *mut u8,
  ) -> usize {
    match NonNull::new(ptr) {
      Some(data) => self.tree.size(unsafe { self.tree.resource_of(data) }),
      None => 0,
    }
  }
}
