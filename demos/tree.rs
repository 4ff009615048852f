use std::{io::Read, ops::ControlFlow};

use resalloc::{
  AllocFlags, Allocator, BlockInfo, BumpAllocator, Resource, ResourceTree, block_alloc, system_allocator,
  xaligned_alloc, xalloc_ex, xfree, xrealloc,
};

/// Waits until the user presses ENTER when run with `--step`.
/// Useful for inspecting the process with `pmap` or `gdb` between steps.
fn block_until_enter_pressed(step: bool) {
  if step {
    println!("\n>>> Press ENTER to continue...");
    let _ = std::io::stdin().bytes().next();
  }
}

fn print_alloc(
  label: &str,
  ptr: *mut u8,
  size: usize,
  alignment: usize,
) {
  println!(
    "{label}: {ptr:?}, size = {size}, align = {alignment}, addr % align = {}",
    ptr.addr() % alignment
  );
}

fn print_tree(
  tree: &ResourceTree,
  res: Resource,
  depth: usize,
) {
  println!(
    "{:indent$}{:?}: {} bytes ({} with children)",
    "",
    res,
    tree.size(res),
    tree.size_total(res),
    indent = depth * 2
  );
  let _ = tree.enum_children(res, |child| {
    print_tree(tree, child, depth + 1);
    ControlFlow::<()>::Continue(())
  });
}

fn main() {
  env_logger::init();
  let step = std::env::args().any(|arg| arg == "--step");
  let a = system_allocator();

  unsafe {
    // --------------------------------------------------------------------
    // 1) A page-aligned u32 from the aligned allocator.
    // --------------------------------------------------------------------
    let first = xaligned_alloc(&a, 4, 4096).unwrap();
    println!("\n[1] Allocate u32 at 4096");
    print_alloc("[1]", first.as_ptr(), a.usable_size(first.as_ptr()), 4096);

    first.as_ptr().cast::<u32>().write(0xDEADBEEF);
    block_until_enter_pressed(step);

    // --------------------------------------------------------------------
    // 2) Grow it. Data and alignment survive the move.
    // --------------------------------------------------------------------
    let grown = xalloc_ex(&a, first.as_ptr(), 64 * 1024, AllocFlags::REALLOC, 4096).unwrap();
    println!("\n[2] Grow to 64 KiB");
    print_alloc("[2]", grown.as_ptr(), a.usable_size(grown.as_ptr()), 4096);
    println!("[2] Value kept = 0x{:X}", grown.as_ptr().cast::<u32>().read());

    xfree(&a, grown.as_ptr());
    block_until_enter_pressed(step);

    // --------------------------------------------------------------------
    // 3) Several aligned blocks in one allocation.
    // --------------------------------------------------------------------
    let blocks = [
      BlockInfo::of::<u64>(1),
      BlockInfo::of::<u32>(10),
      BlockInfo::new(0, 64, 64),
      BlockInfo::new(1, 1, 4096),
    ];
    let allocation = block_alloc(&blocks).unwrap();
    println!("\n[3] Block allocation");
    for (i, (block, region)) in blocks.iter().zip(allocation.region_ptrs()).enumerate() {
      print_alloc(&format!("[3] block {i}"), region, block.count * block.element_size, block.alignment);
    }

    xfree(&a, allocation.base().as_ptr());
    block_until_enter_pressed(step);

    // --------------------------------------------------------------------
    // 4) An arena cannot resize in place; xrealloc moves the data for it.
    // --------------------------------------------------------------------
    let arena = BumpAllocator::with_capacity(4096).unwrap();
    let small = xaligned_alloc(&arena, 8, 8).unwrap();
    small.as_ptr().write_bytes(0xAB, 8);
    let large = xrealloc(&arena, small.as_ptr(), 256).unwrap();
    println!("\n[4] Arena realloc {:?} -> {:?}, {} bytes in use", small, large, arena.used());
    arena.free(large.as_ptr());
    block_until_enter_pressed(step);
  }

  // --------------------------------------------------------------------
  // 5) A resource tree. Freeing the root releases everything under it.
  // --------------------------------------------------------------------
  let tree = ResourceTree::new();
  let root = tree.alloc(None, 0).unwrap();
  let config = tree.strdup(Some(root), "config").unwrap();
  for i in 0..3 {
    tree.format(Some(config), format_args!("entry {i}")).unwrap();
  }
  let buffer = tree.allocate(Some(root), 1024, 64).unwrap();
  tree.set_destructor(buffer, |_, teardown| {
    println!("[5] destroying {:?} ({} bytes)", teardown.resource, teardown.size);
  });

  println!("\n[5] Resource tree");
  print_tree(&tree, root, 0);

  tree.free(root);
  println!("[5] {} resources left", tree.len());

  println!("\n[6] End of example.");
}
