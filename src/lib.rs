//! # fallocator - An Explicit Free-List Memory Allocator
//!
//! This crate provides a general-purpose **explicit free-list allocator**
//! in Rust that manages a single contiguous, monotonically growing heap
//! region supplied by an `sbrk`-style provider.
//!
//! ## Overview
//!
//! Unlike a bump allocator, which can only hand memory out, a free-list
//! allocator recycles it: freed blocks are threaded onto an intrusive
//! doubly-linked list, neighbors are merged on free, and later requests
//! are served from the list before the heap grows.
//!
//! ```text
//!   Explicit Free-List Concept:
//!
//!   ┌──────────────────────────────────────────────────────────────────┐
//!   │                          HEAP MEMORY                             │
//!   │                                                                  │
//!   │  ┌──────┬────────┬────────┬────────┬────────┬────────┬───────┐  │
//!   │  │ HEAD │ alloc  │  FREE  │ alloc  │  FREE  │ alloc  │epilog │  │
//!   │  │ TAIL │        │   ▲    │        │   ▲    │        │       │  │
//!   │  └──┬───┴────────┴───┼────┴────────┴───┼────┴────────┴───────┘  │
//!   │     │                │                 │                        │
//!   │     └── free list ───┴─── prev/next ───┘                        │
//!   │         (threaded through the free blocks themselves)           │
//!   └──────────────────────────────────────────────────────────────────┘
//!
//!   Allocation: first-k-fit over the list, split the slack when viable.
//!   Free: boundary-tag coalescing with the physical neighbors.
//! ```
//!
//! All internal bookkeeping uses heap-relative 32-bit offsets, so the
//! metadata is position independent and compact on a 64-bit host; the
//! price is a hard 4 GiB heap ceiling.
//!
//! ## Crate Structure
//!
//! ```text
//!   fallocator
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── block      - Header/footer bit packing (internal)
//!   ├── provider   - Heap providers: sbrk-backed and buffer-backed
//!   └── explicit   - ExplicitAllocator: list, placement, coalescing
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use fallocator::{BufferProvider, ExplicitAllocator};
//!
//! let mut heap = ExplicitAllocator::new(BufferProvider::new(4096)).unwrap();
//!
//! unsafe {
//!   // Allocate memory for a u64
//!   let ptr = heap.allocate(size_of::<u64>()) as *mut u64;
//!   assert!(!ptr.is_null());
//!
//!   // Use the memory
//!   *ptr = 42;
//!   assert_eq!(*ptr, 42);
//!
//!   // Free the memory; a later allocation may reuse the block
//!   heap.free(ptr as *mut u8);
//! }
//! ```
//!
//! For a real program heap, swap [`BufferProvider`] for [`SbrkProvider`],
//! which extends the data segment with `sbrk(2)` — see
//! `demos/explicit.rs` for a walkthrough.
//!
//! ## Features
//!
//! - **Block recycling**: freed memory is reused, split, and coalesced
//! - **Footer-free allocated blocks**: a predecessor-alloc bit in each
//!   header keeps the per-allocation overhead at a single word
//! - **Tunable placement**: first-fit by default, first-k-fit on request
//! - **Pluggable backing**: any [`HeapProvider`] supplies the region
//! - **Heap checker**: [`ExplicitAllocator::check_heap`] reports list and
//!   boundary-tag inconsistencies through the `log` facade
//!
//! ## Limitations
//!
//! - **Single-threaded only**: all operations take `&mut self`; wrap the
//!   allocator in a `Mutex` for concurrent use
//! - **8-byte alignment only**: the block format fixes the alignment, so
//!   this cannot back `GlobalAlloc` for arbitrary layouts
//! - **4 GiB ceiling**: offsets are 32-bit; requests that would push the
//!   heap past it fail with a null return
//! - **No heap shrinking**: the region only ever grows
//!
//! ## Safety
//!
//! This crate is inherently unsafe as it deals with raw memory
//! management. The pointer-taking operations require `unsafe` blocks and
//! trust the caller to pass only pointers the allocator handed out.

pub mod align;
mod block;
mod explicit;
mod provider;

pub use explicit::{DEFAULT_FIT_NUMBER, ExplicitAllocator, InitError};
pub use provider::{BufferProvider, HeapProvider, ProviderError, SbrkProvider};
