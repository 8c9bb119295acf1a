use std::ptr;

use fallocator::{ExplicitAllocator, SbrkProvider};
use libc::sbrk;

/// Prints the current program break using `sbrk(0)`.
/// The program break is the upper boundary of the heap managed via brk/sbrk.
unsafe fn print_program_break(label: &str) {
  println!(
    "[{}] PID = {}, program break (sbrk(0)) = {:?}",
    label,
    std::process::id(),
    unsafe { sbrk(0) },
  );
}

fn main() {
  // Run with RUST_LOG=debug to see the allocator's diagnostics and the
  // verbose heap dump at the end.
  env_logger::init();

  // Touch stdout before capturing the heap base: the C library allocates
  // its stdio buffers lazily, and that allocation may move the program
  // break. Everything our allocator does afterwards assumes the break
  // only moves when *it* asks.
  println!("explicit free-list allocator walkthrough");

  unsafe {
    print_program_break("start");
  }

  // The allocator captures the current break as its heap base and lays
  // out the sentinel area, one small free block, and the epilogue.
  let mut heap = match ExplicitAllocator::new(SbrkProvider::new()) {
    Ok(heap) => heap,
    Err(err) => {
      eprintln!("failed to initialize the heap: {err}");
      return;
    }
  };
  println!("initial heap laid out, size = {} bytes", heap.heap_size());

  unsafe {
    // --------------------------------------------------------------------
    // 1) Allocate space for a u32. The request is padded up to the
    //    minimum block size, so the initial free block serves it exactly.
    // --------------------------------------------------------------------
    let first_block = heap.allocate(size_of::<u32>());
    if first_block.is_null() {
      eprintln!("allocation failed (did something else move the break?)");
      return;
    }
    println!("\n[1] allocate(4) -> {:?}", first_block);

    let first_ptr = first_block as *mut u32;
    first_ptr.write(0xDEADBEEF);
    println!("[1] value written to first_block = 0x{:X}", first_ptr.read());

    // --------------------------------------------------------------------
    // 2) Allocate 12 bytes and fill them with a byte pattern. This one
    //    no longer fits in the initial region, so the heap grows.
    // --------------------------------------------------------------------
    let second_block = heap.allocate(12);
    if second_block.is_null() {
      eprintln!("allocation failed (did something else move the break?)");
      return;
    }
    println!("\n[2] allocate(12) -> {:?}", second_block);

    ptr::write_bytes(second_block, 0xAB, 12);
    println!("[2] heap grew to {} bytes", heap.heap_size());

    // --------------------------------------------------------------------
    // 3) Free the first block and allocate something small. A free-list
    //    allocator reuses the freed block; the addresses must match.
    // --------------------------------------------------------------------
    heap.free(first_block);
    println!("\n[3] freed first_block at {:?}", first_block);

    let third_block = heap.allocate(2);
    println!("[3] allocate(2) -> {:?}", third_block);
    println!(
      "[3] third_block == first_block? {}",
      if third_block == first_block {
        "yes, the freed block was reused"
      } else {
        "no, it was placed somewhere else"
      }
    );

    // --------------------------------------------------------------------
    // 4) Grow the small block with reallocate. The payload prefix moves
    //    along with it.
    // --------------------------------------------------------------------
    let third_ptr = third_block as *mut u16;
    third_ptr.write(0x1234);

    let grown = heap.reallocate(third_block, 64);
    if grown.is_null() {
      eprintln!("reallocation failed");
      return;
    }
    println!("\n[4] reallocate(third_block, 64) -> {:?}", grown);
    println!(
      "[4] first two bytes after the move = 0x{:X}",
      (grown as *mut u16).read()
    );

    // --------------------------------------------------------------------
    // 5) Zeroed allocation: every byte of the placed block starts as 0.
    // --------------------------------------------------------------------
    let zeroed = heap.zeroed_allocate(4, 8);
    if zeroed.is_null() {
      eprintln!("zeroed allocation failed");
      return;
    }
    let all_zero = (0..32).all(|i| zeroed.add(i).read() == 0);
    println!("\n[5] zeroed_allocate(4, 8) -> {:?}, all zero: {}", zeroed, all_zero);

    // --------------------------------------------------------------------
    // 6) Allocate a large block to observe heap growth through sbrk.
    // --------------------------------------------------------------------
    print_program_break("before large alloc");

    let big_block = heap.allocate(64 * 1024);
    println!("\n[6] allocate(64 KiB) -> {:?}", big_block);
    println!("[6] heap size is now {} bytes", heap.heap_size());

    print_program_break("after large alloc");

    // --------------------------------------------------------------------
    // 7) Walk the heap checker. With RUST_LOG=debug this also dumps the
    //    raw heap word by word.
    // --------------------------------------------------------------------
    println!("\n[7] running the heap checker");
    heap.check_heap(true);

    // --------------------------------------------------------------------
    // 8) End of demo. The heap region is never shrunk; the OS reclaims
    //    all memory when the process exits.
    // --------------------------------------------------------------------
    println!("\n[8] end of walkthrough");
  }
}
