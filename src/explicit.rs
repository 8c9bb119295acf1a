//! # Explicit Free-List Allocator
//!
//! An allocator that manages a single contiguous, monotonically growing
//! heap region obtained from a [`HeapProvider`]. Free blocks are threaded
//! onto an intrusive doubly-linked list; placement is first-k-fit over
//! that list; neighbors are merged on free with boundary tags.
//!
//! ## Heap Layout
//!
//! All bookkeeping uses 32-bit offsets relative to the provider's base
//! address, so the metadata is position independent and stays compact on
//! a 64-bit host. The first 8 bytes of the heap are the list sentinel
//! area, and a zero-size, always-allocated epilogue header closes the
//! heap so nothing ever coalesces past the end.
//!
//! ```text
//!   offset 0     4        8   12      16                    heap_size-4
//!   ┌──────┬──────┬────────┬───────┬─────────┬─────┬────────┬──────────┐
//!   │ HEAD │ TAIL │ (pad)  │header │ block 1 │ ... │block n │ epilogue │
//!   └──────┴──────┴────────┴───────┴─────────┴─────┴────────┴──────────┘
//!      │      │
//!      │      └── offset of the last free block, or 0 (HEAD) if empty
//!      └── offset of the first free block, or 4 (TAIL) if empty
//! ```
//!
//! The constants `HEAD = 0` and `TAIL = 4` double as sentinel values in
//! the list links: a predecessor link equal to `HEAD` marks the first
//! free block, a successor link equal to `TAIL` marks the last.
//!
//! ## Block Layout
//!
//! ```text
//!   Allocated block (footprint = size + 4):
//!   ┌────────┬──────────────────────────────────────┐
//!   │ header │          payload (size bytes)        │
//!   └────────┴──────────────────────────────────────┘
//!            ▲
//!            └── pointer returned to the caller (8-byte aligned)
//!
//!   Free block (footprint = size + 8):
//!   ┌────────┬──────┬──────┬────────────────┬────────┐
//!   │ header │ prev │ next │ interior space │ footer │
//!   └────────┴──────┴──────┴────────────────┴────────┘
//!            ◄──────── size bytes ─────────►
//! ```
//!
//! Allocated blocks carry no footer: every header records whether the
//! *physically preceding* block is allocated, so the coalescer only needs
//! a footer when the predecessor is free — and free blocks always have
//! one. A free block of size `p` can therefore serve a request of up to
//! `p + 4` bytes, because allocation absorbs the footer slot back into
//! the payload.
//!
//! ## Coalescing
//!
//! Freeing a block examines the predecessor-alloc bit of its own header
//! and the self-alloc bit of the physically next header, giving four
//! cases:
//!
//! ```text
//!   prev busy, next busy   mark free, push onto the list head
//!   prev busy, next free   absorb the successor; take its list position
//!   prev free, next busy   absorbed by the predecessor; its position kept
//!   prev free, next free   triple merge into the predecessor
//! ```
//!
//! Every merge erases the interior boundary words, rewrites the footer of
//! the merged block, and raises the cached upper bound on the largest
//! free payload.
//!
//! ## Thread Safety
//!
//! This allocator is **NOT** thread-safe. All methods take `&mut self`;
//! for multi-threaded usage, external synchronization (e.g., a `Mutex`)
//! is required.

use std::ptr;

use log::{debug, error, warn};
use thiserror::Error;

use crate::align;
use crate::block::{
  DWORD_SIZE, MIN_BLOCK_SIZE, WORD_SIZE, pack_footer, pack_header, prev_alloc_of, self_alloc_of,
  size_of, with_prev_alloc,
};
use crate::provider::{HeapProvider, ProviderError};

/// Sentinel offset stored in a predecessor link of the first free block;
/// also the offset of the list-head word itself.
const HEAD: u32 = 0;

/// Sentinel offset stored in a successor link of the last free block;
/// also the offset of the list-tail word itself.
const TAIL: u32 = WORD_SIZE;

/// Offset of the first block's payload: sentinel area, then one header,
/// rounded up so the payload lands on an 8-byte boundary.
const FIRST_PAYLOAD: u32 = 2 * DWORD_SIZE;

/// Bytes requested from the provider during initialization: sentinel
/// area, one minimal free block, and the epilogue header.
const INITIAL_HEAP_SIZE: u32 = 32;

/// Payload size of the single free block the initial layout contains.
const INITIAL_FREE_PAYLOAD: u32 = 8;

/// A fit whose slack is below this is consumed whole rather than split;
/// the remainder could not hold a minimal free block plus its overhead.
const MIN_SPLIT_SLACK: u32 = 16;

/// The heap may not grow past what 32-bit offsets can address.
const HEAP_LIMIT: u64 = u32::MAX as u64;

/// Default number of fitting candidates the placement search examines
/// before it settles on the smallest of them. `1` is pure first-fit;
/// larger values trade search time for placement quality.
pub const DEFAULT_FIT_NUMBER: u32 = 1;

/// Failure modes of allocator construction.
#[derive(Debug, Error)]
pub enum InitError {
  /// The provider failed while the initial heap was laid out.
  #[error("heap provider failed while laying out the initial heap")]
  Provider(#[from] ProviderError),

  /// The provider's base address is not 8-byte aligned, so no block
  /// payload could ever be.
  #[error("heap base address {0:p} is not 8-byte aligned")]
  MisalignedBase(*mut u8),
}

/// Block size needed to serve a request of `size` bytes.
///
/// The caller's payload overlaps the slot that would hold the footer if
/// the block were free, which recovers one word; the result never drops
/// below the minimum block size so any block can later rejoin the free
/// list. Computed in 64 bits, with the request clamped to the 32-bit
/// heap limit so neither the alignment round-up here nor the overflow
/// guard's additions can wrap; a clamped request already exceeds what
/// the heap could ever hold and fails that guard.
fn required_size(size: usize) -> u64 {
  let wanted = (size as u64).clamp(u64::from(WORD_SIZE), HEAP_LIMIT);
  let aligned = align!(wanted - u64::from(WORD_SIZE));

  (aligned + u64::from(WORD_SIZE)).max(u64::from(MIN_BLOCK_SIZE))
}

/// An explicit free-list allocator over a [`HeapProvider`].
///
/// # Example
///
/// ```rust
/// use fallocator::{BufferProvider, ExplicitAllocator};
///
/// let mut heap = ExplicitAllocator::new(BufferProvider::new(4096)).unwrap();
///
/// unsafe {
///   let ptr = heap.allocate(64);
///   assert!(!ptr.is_null());
///   assert_eq!(ptr as usize % 8, 0);
///
///   ptr.write(42);
///   assert_eq!(ptr.read(), 42);
///
///   heap.free(ptr);
/// }
/// ```
pub struct ExplicitAllocator<P: HeapProvider> {
  /// Source of the contiguous heap region.
  provider: P,

  /// Monotonic upper bound on the largest free-block payload. Raised on
  /// free and coalesce, never lowered on allocate; used only as a
  /// fast-reject hint before walking the list.
  max_free_payload: u32,

  /// How many fitting candidates the placement search examines.
  fit_number: u32,

  /// Operation counter included in diagnostic log lines.
  op_count: u64,
}

impl<P: HeapProvider> ExplicitAllocator<P> {
  /// Lays out the initial heap on the given provider:
  ///
  /// ```text
  ///   0      4      8     12     16            24       28       32
  ///   ┌──────┬──────┬──────┬──────┬─────────────┬────────┬────────┐
  ///   │ HEAD │ TAIL │ pad  │header│ prev │ next │ footer │epilogue│
  ///   │  16  │  16  │      │ 8,f  │ HEAD │ TAIL │  8,f   │  0,a   │
  ///   └──────┴──────┴──────┴──────┴─────────────┴────────┴────────┘
  /// ```
  ///
  /// One 8-byte free block, list head and tail both pointing at it, and
  /// the epilogue closing the heap.
  pub fn new(provider: P) -> Result<Self, InitError> {
    Self::with_fit_number(provider, DEFAULT_FIT_NUMBER)
  }

  /// Like [`new`](Self::new), but with an explicit first-k-fit width.
  /// A `fit_number` of zero is treated as 1.
  pub fn with_fit_number(
    provider: P,
    fit_number: u32,
  ) -> Result<Self, InitError> {
    let base = provider.base();
    if base as usize % DWORD_SIZE as usize != 0 {
      return Err(InitError::MisalignedBase(base));
    }

    let mut allocator = Self {
      provider,
      max_free_payload: 0,
      fit_number: fit_number.max(1),
      op_count: 0,
    };

    allocator.provider.extend(INITIAL_HEAP_SIZE)?;

    // empty list, then the one initial block is pushed onto it
    allocator.set_head(TAIL);
    allocator.set_tail(HEAD);
    allocator.write_free_block(FIRST_PAYLOAD, INITIAL_FREE_PAYLOAD, true);
    allocator.list_insert_head(FIRST_PAYLOAD);
    allocator.max_free_payload = INITIAL_FREE_PAYLOAD;

    allocator.set_header(INITIAL_HEAP_SIZE, pack_header(0, false, true));

    Ok(allocator)
  }

  /// Current total heap size in bytes.
  pub fn heap_size(&self) -> u64 {
    self.provider.size()
  }

  /// Allocates a writable, 8-byte-aligned region of at least `size`
  /// bytes.
  ///
  /// Returns null when the request would push the heap past what 32-bit
  /// offsets can address, or when the provider refuses to grow.
  ///
  /// # Safety
  ///
  /// The caller must ensure no other code mutates the provider's region
  /// while the allocator manages it.
  pub unsafe fn allocate(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    self.op_count += 1;
    debug!("allocate op {}: size={}", self.op_count, size);

    match self.allocate_block(size) {
      Some(block) => self.address_of(block),
      None => ptr::null_mut(),
    }
  }

  /// Releases a region previously returned by [`allocate`](Self::allocate),
  /// [`reallocate`](Self::reallocate) or
  /// [`zeroed_allocate`](Self::zeroed_allocate), merging it with any free
  /// physical neighbor.
  ///
  /// A null pointer or a pointer outside the heap is a no-op. Freeing a
  /// block whose header is not marked allocated logs a diagnostic and
  /// changes nothing.
  ///
  /// # Safety
  ///
  /// `ptr` must be null, outside the heap, or a live pointer previously
  /// returned by this allocator; an interior or stale in-heap pointer is
  /// undefined behavior.
  pub unsafe fn free(
    &mut self,
    ptr: *mut u8,
  ) {
    self.op_count += 1;

    if ptr.is_null() {
      return;
    }
    let Some(block) = self.offset_of(ptr) else {
      debug!("free op {}: pointer {:p} is outside the heap", self.op_count, ptr);
      return;
    };

    self.free_block(block);
  }

  /// Resizes an allocation.
  ///
  /// A null `ptr` behaves like [`allocate`](Self::allocate); a zero
  /// `size` behaves like [`free`](Self::free) and returns null.
  /// Otherwise a new block is allocated, the overlapping payload prefix
  /// is copied word by word, and the old block is freed. When the new
  /// allocation fails, null is returned and the old block stays intact.
  ///
  /// # Safety
  ///
  /// Same requirements as [`free`](Self::free) for `ptr`.
  pub unsafe fn reallocate(
    &mut self,
    ptr: *mut u8,
    size: usize,
  ) -> *mut u8 {
    if ptr.is_null() {
      return unsafe { self.allocate(size) };
    }
    if size == 0 {
      unsafe { self.free(ptr) };
      return ptr::null_mut();
    }

    self.op_count += 1;
    debug!("reallocate op {}: size={}", self.op_count, size);

    let Some(old_block) = self.offset_of(ptr) else {
      debug!("reallocate op {}: pointer {:p} is outside the heap", self.op_count, ptr);
      return ptr::null_mut();
    };
    let Some(new_block) = self.allocate_block(size) else {
      return ptr::null_mut();
    };

    let copy_size = size_of(self.header(old_block)).min(size_of(self.header(new_block)));
    let mut offset = 0;
    while offset < copy_size {
      let word = self.word(old_block + offset);
      self.set_word(new_block + offset, word);
      offset += WORD_SIZE;
    }

    self.free_block(old_block);
    self.address_of(new_block)
  }

  /// Allocates `nmemb * size` bytes and zeroes the whole placed payload,
  /// which may exceed `nmemb * size` due to alignment padding.
  ///
  /// Returns null when the multiplication overflows or the allocation
  /// fails.
  ///
  /// # Safety
  ///
  /// Same requirements as [`allocate`](Self::allocate).
  pub unsafe fn zeroed_allocate(
    &mut self,
    nmemb: usize,
    size: usize,
  ) -> *mut u8 {
    self.op_count += 1;

    let Some(total) = nmemb.checked_mul(size) else {
      warn!(
        "zeroed_allocate op {}: {} x {} bytes overflows",
        self.op_count, nmemb, size
      );
      return ptr::null_mut();
    };
    let Some(block) = self.allocate_block(total) else {
      return ptr::null_mut();
    };

    let declared = size_of(self.header(block));
    let mut offset = 0;
    while offset < declared {
      self.set_word(block + offset, 0);
      offset += WORD_SIZE;
    }

    self.address_of(block)
  }

  /// Walks the free list from both sentinels and reports every
  /// inconsistency it can see through the `log` facade; with `verbose`
  /// set, additionally dumps the raw heap word by word at debug level.
  ///
  /// Purely an observability tool: it never mutates the heap and never
  /// panics, and both walks are bounded so even a corrupted, cyclic list
  /// terminates.
  pub fn check_heap(
    &self,
    verbose: bool,
  ) {
    let heap_size = self.heap_size();
    // more entries than could physically exist means a cycle
    let max_blocks = heap_size / u64::from(MIN_BLOCK_SIZE + DWORD_SIZE) + 1;

    let mut block = self.head();
    let mut steps = 0;
    while block != TAIL {
      if block < FIRST_PAYLOAD || u64::from(block) + u64::from(DWORD_SIZE) > heap_size {
        warn!("free list offset {} is outside the heap", block);
        break;
      }
      let header = self.header(block);
      if self_alloc_of(header) {
        warn!("free list entry at {} is marked allocated", block);
      }
      if size_of(header) == 0 {
        warn!("free block at {} has zero size", block);
      }
      steps += 1;
      if steps > max_blocks {
        warn!("free list does not terminate after {} entries", steps);
        break;
      }
      block = self.next_link(block);
    }

    let mut block = self.tail();
    let mut steps = 0;
    while block != HEAD {
      if block < FIRST_PAYLOAD || u64::from(block) + u64::from(DWORD_SIZE) > heap_size {
        warn!("free list offset {} is outside the heap (backward walk)", block);
        break;
      }
      let size = size_of(self.header(block));
      if u64::from(block) + u64::from(size) + u64::from(WORD_SIZE) > heap_size {
        warn!("free block at {} overruns the heap", block);
        break;
      }
      let footer = self.word(block + size);
      if self_alloc_of(footer) {
        warn!("footer of free block at {} is marked allocated", block);
      }
      if size_of(footer) != size {
        warn!(
          "free block at {}: footer size {} disagrees with header size {}",
          block,
          size_of(footer),
          size
        );
      }
      steps += 1;
      if steps > max_blocks {
        warn!("free list does not terminate after {} entries (backward walk)", steps);
        break;
      }
      block = self.prev_link(block);
    }

    if verbose {
      let mut offset = 0;
      while u64::from(offset) < heap_size {
        debug!("{:>10}: {:#010x}", offset, self.word(offset));
        offset += WORD_SIZE;
      }
    }
  }

  // ------------------------------------------------------------------
  // placement engine
  // ------------------------------------------------------------------

  /// Serves an allocation request, returning the payload offset of the
  /// placed block, or `None` when out of memory.
  fn allocate_block(
    &mut self,
    size: usize,
  ) -> Option<u32> {
    let required = required_size(size);
    if self.heap_size() + required + u64::from(WORD_SIZE) > HEAP_LIMIT {
      warn!(
        "allocate op {}: request of {} bytes would overflow the 32-bit heap",
        self.op_count, size
      );
      return None;
    }
    let required = required as u32;

    match self.find_fit(required) {
      Some((block, capacity)) => Some(self.place(block, capacity, required)),
      None => self.extend_heap(required),
    }
  }

  /// First-k-fit search. Walks the free list from the head, considering
  /// up to `fit_number` candidates that fit, and returns the smallest of
  /// them together with its capacity.
  ///
  /// A free block of payload `p` has capacity `p + 4`: allocating it
  /// recovers the footer slot. When even the cached maximum cannot serve
  /// the request, the walk is skipped entirely.
  fn find_fit(
    &self,
    required: u32,
  ) -> Option<(u32, u32)> {
    if u64::from(required) > u64::from(self.max_free_payload) + u64::from(WORD_SIZE) {
      return None;
    }

    let mut block = self.head();
    let mut best: Option<(u32, u32)> = None;
    let mut fits = 0;

    while block != TAIL && fits < self.fit_number {
      let capacity = size_of(self.header(block)) + WORD_SIZE;
      if capacity >= required {
        fits += 1;
        if best.is_none_or(|(_, smallest)| capacity < smallest) {
          best = Some((block, capacity));
        }
      }
      block = self.next_link(block);
    }

    best
  }

  /// Places a request of `required` bytes into a fitting free block of
  /// the given capacity, splitting off the slack when it can hold a free
  /// block of its own.
  fn place(
    &mut self,
    block: u32,
    capacity: u32,
    required: u32,
  ) -> u32 {
    let prev_alloc = prev_alloc_of(self.header(block));
    let slack = capacity - required;

    if slack < MIN_SPLIT_SLACK {
      // consume the block whole, footer slot included
      self.list_remove(block);
      self.write_allocated_block(block, capacity, prev_alloc);

      let following = block + capacity + WORD_SIZE;
      let was_allocated = self.update_prev_alloc(following, true);
      if was_allocated {
        error!(
          "predecessor bit at {} was already set while placing {}",
          following, block
        );
      }
    } else {
      // the remainder pays the header+footer overhead of becoming free
      let remainder_size = slack - DWORD_SIZE;
      let remainder = block + required + WORD_SIZE;
      let prev = self.prev_link(block);
      let next = self.next_link(block);

      self.write_allocated_block(block, required, prev_alloc);
      self.write_free_block(remainder, remainder_size, true);
      self.list_take_position(remainder, prev, next);

      let following = remainder + remainder_size + DWORD_SIZE;
      let was_allocated = self.update_prev_alloc(following, false);
      if was_allocated {
        error!(
          "predecessor bit at {} was already set while placing {}",
          following, block
        );
      }
    }

    block
  }

  /// Grows the heap by `required + 4` bytes and places the request in
  /// the new region. The old epilogue word moves to the new end of the
  /// heap, carrying its predecessor-alloc bit along, and its former slot
  /// becomes the new block's header.
  fn extend_heap(
    &mut self,
    required: u32,
  ) -> Option<u32> {
    let block = self.heap_size() as u32;

    if let Err(err) = self.provider.extend(required + WORD_SIZE) {
      warn!(
        "allocate op {}: heap extension by {} bytes failed: {}",
        self.op_count,
        required + WORD_SIZE,
        err
      );
      return None;
    }

    let old_epilogue = self.header(block);
    let prev_alloc = prev_alloc_of(old_epilogue);

    self.set_word(block + required, old_epilogue);
    self.update_prev_alloc(block + required + WORD_SIZE, true);
    self.write_allocated_block(block, required, prev_alloc);

    Some(block)
  }

  // ------------------------------------------------------------------
  // coalescer
  // ------------------------------------------------------------------

  /// Frees the block at the given payload offset, merging with free
  /// physical neighbors. Boundary accounting: every busy→free transition
  /// at a block boundary reclaims a header word into payload, and every
  /// free→busy hands one back.
  fn free_block(
    &mut self,
    block: u32,
  ) {
    let old_header = self.header(block);
    if !self_alloc_of(old_header) {
      error!("free op {}: block at {} is not allocated", self.op_count, block);
      return;
    }

    let size = size_of(old_header);
    // the allocated payload gives its footer slot back
    let freed = size + WORD_SIZE;
    let prev_alloc = prev_alloc_of(old_header);

    let following = block + size + WORD_SIZE;
    let following_header = self.header(following);
    let next_alloc = self_alloc_of(following_header);

    match (prev_alloc, next_alloc) {
      (true, true) => {
        let new_size = freed - DWORD_SIZE;
        self.write_free_block(block, new_size, true);
        self.list_insert_head(block);
        self.update_prev_alloc(following, false);
        self.raise_max(new_size);
      }
      (true, false) => {
        // absorb the free successor; its header becomes interior space
        // and the freed block takes over its list position
        let new_size = freed + size_of(following_header);
        let prev = self.prev_link(following);
        let next = self.next_link(following);

        self.set_word(following - WORD_SIZE, 0);
        self.write_free_block(block, new_size, true);
        self.list_take_position(block, prev, next);
        self.raise_max(new_size);
      }
      (false, true) => {
        // the free predecessor absorbs this block and keeps its own
        // list position; our header becomes interior space
        let preceding = self.preceding_free_block(block);
        let preceding_header = self.header(preceding);
        let new_size = size_of(preceding_header) + freed;

        self.zero_boundary(preceding + size_of(preceding_header));
        self.write_free_block(preceding, new_size, prev_alloc_of(preceding_header));
        self.update_prev_alloc(following, false);
        self.raise_max(new_size);
      }
      (false, false) => {
        // triple merge: the successor leaves the list, both interior
        // boundaries are erased, the predecessor spans all three
        let preceding = self.preceding_free_block(block);
        let preceding_header = self.header(preceding);
        let new_size =
          size_of(preceding_header) + freed + size_of(following_header) + DWORD_SIZE;

        self.list_remove(following);
        self.zero_boundary(preceding + size_of(preceding_header));
        self.set_word(block + size, 0);
        self.write_free_block(preceding, new_size, prev_alloc_of(preceding_header));
        self.raise_max(new_size);
      }
    }
  }

  /// Payload offset of the free block physically preceding `block`,
  /// found through the predecessor's footer.
  fn preceding_free_block(
    &self,
    block: u32,
  ) -> u32 {
    let footer = self.word(block - DWORD_SIZE);

    block - size_of(footer) - DWORD_SIZE
  }

  /// Erases the two boundary words at `offset` (a footer and the header
  /// after it) once they become interior space of a merged block.
  fn zero_boundary(
    &mut self,
    offset: u32,
  ) {
    self.set_word(offset, 0);
    self.set_word(offset + WORD_SIZE, 0);
  }

  /// Raises the cached free-payload bound; never lowers it.
  fn raise_max(
    &mut self,
    size: u32,
  ) {
    if self.max_free_payload < size {
      self.max_free_payload = size;
    }
  }

  // ------------------------------------------------------------------
  // free list
  // ------------------------------------------------------------------

  fn head(&self) -> u32 {
    self.word(HEAD)
  }

  fn set_head(
    &mut self,
    block: u32,
  ) {
    self.set_word(HEAD, block);
  }

  fn tail(&self) -> u32 {
    self.word(TAIL)
  }

  fn set_tail(
    &mut self,
    block: u32,
  ) {
    self.set_word(TAIL, block);
  }

  fn prev_link(
    &self,
    block: u32,
  ) -> u32 {
    self.word(block)
  }

  fn next_link(
    &self,
    block: u32,
  ) -> u32 {
    self.word(block + WORD_SIZE)
  }

  fn set_prev_link(
    &mut self,
    block: u32,
    to: u32,
  ) {
    self.set_word(block, to);
  }

  fn set_next_link(
    &mut self,
    block: u32,
    to: u32,
  ) {
    self.set_word(block + WORD_SIZE, to);
  }

  /// Links `block` in front of the current head.
  fn list_insert_head(
    &mut self,
    block: u32,
  ) {
    let old_head = self.head();

    self.set_prev_link(block, HEAD);
    self.set_next_link(block, old_head);
    if old_head == TAIL {
      self.set_tail(block);
    } else {
      self.set_prev_link(old_head, block);
    }
    self.set_head(block);
  }

  /// Splices `block` out of the list, rewiring the sentinels when it
  /// sits at an end.
  fn list_remove(
    &mut self,
    block: u32,
  ) {
    let prev = self.prev_link(block);
    let next = self.next_link(block);

    if prev == HEAD {
      self.set_head(next);
    } else {
      self.set_next_link(prev, next);
    }
    if next == TAIL {
      self.set_tail(prev);
    } else {
      self.set_prev_link(next, prev);
    }
  }

  /// Puts `block` into the list position between `prev` and `next`,
  /// whose previous occupant is gone (split remainder replacing the
  /// split block, or a merged block inheriting its absorbed successor's
  /// position).
  fn list_take_position(
    &mut self,
    block: u32,
    prev: u32,
    next: u32,
  ) {
    self.set_prev_link(block, prev);
    self.set_next_link(block, next);
    if prev == HEAD {
      self.set_head(block);
    } else {
      self.set_next_link(prev, block);
    }
    if next == TAIL {
      self.set_tail(block);
    } else {
      self.set_prev_link(next, block);
    }
  }

  // ------------------------------------------------------------------
  // block encoding on the heap
  // ------------------------------------------------------------------

  fn header(
    &self,
    block: u32,
  ) -> u32 {
    self.word(block - WORD_SIZE)
  }

  fn set_header(
    &mut self,
    block: u32,
    header: u32,
  ) {
    self.set_word(block - WORD_SIZE, header);
  }

  /// Writes an allocated block: header only, no footer.
  fn write_allocated_block(
    &mut self,
    block: u32,
    size: u32,
    prev_alloc: bool,
  ) {
    self.set_header(block, pack_header(size, prev_alloc, true));
  }

  /// Writes a free block's header and footer. The list links are managed
  /// separately by the list operations.
  fn write_free_block(
    &mut self,
    block: u32,
    size: u32,
    prev_alloc: bool,
  ) {
    self.set_header(block, pack_header(size, prev_alloc, false));
    self.set_word(block + size, pack_footer(size, false));
  }

  /// Rewrites only the predecessor-alloc bit of the block's header,
  /// returning the bit's previous value.
  fn update_prev_alloc(
    &mut self,
    block: u32,
    prev_alloc: bool,
  ) -> bool {
    let header = self.header(block);
    self.set_header(block, with_prev_alloc(header, prev_alloc));

    prev_alloc_of(header)
  }

  // ------------------------------------------------------------------
  // offset arithmetic
  // ------------------------------------------------------------------

  /// Translates a machine address into a heap-relative payload offset.
  ///
  /// Returns `None` for addresses outside the range a valid payload can
  /// occupy: before the first block, or too close to the heap's end to
  /// be a minimal allocated block followed by the epilogue.
  fn offset_of(
    &self,
    ptr: *mut u8,
  ) -> Option<u32> {
    let base = self.provider.base() as usize;
    let offset = (ptr as usize).checked_sub(base)?;

    if (offset as u64) < u64::from(FIRST_PAYLOAD)
      || offset as u64 > self.heap_size() - u64::from(MIN_BLOCK_SIZE + WORD_SIZE)
    {
      return None;
    }

    Some(offset as u32)
  }

  /// Translates a heap-relative offset into a machine address.
  fn address_of(
    &self,
    block: u32,
  ) -> *mut u8 {
    unsafe { self.provider.base().add(block as usize) }
  }

  fn word(
    &self,
    offset: u32,
  ) -> u32 {
    unsafe { self.provider.base().add(offset as usize).cast::<u32>().read() }
  }

  fn set_word(
    &mut self,
    offset: u32,
    value: u32,
  ) {
    unsafe {
      self
        .provider
        .base()
        .add(offset as usize)
        .cast::<u32>()
        .write(value);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::provider::BufferProvider;
  use rand::rngs::StdRng;
  use rand::{Rng, SeedableRng};

  fn new_heap(capacity: usize) -> ExplicitAllocator<BufferProvider> {
    let _ = env_logger::builder().is_test(true).try_init();

    ExplicitAllocator::new(BufferProvider::new(capacity)).unwrap()
  }

  #[derive(Debug, Clone, Copy)]
  struct BlockInfo {
    offset: u32,
    size: u32,
    self_alloc: bool,
    prev_alloc: bool,
  }

  /// Walks the physical block sequence from the first block to the
  /// epilogue, asserting that the block footprints tile the heap span
  /// exactly.
  fn physical_blocks(heap: &ExplicitAllocator<BufferProvider>) -> Vec<BlockInfo> {
    let mut blocks = Vec::new();
    let mut offset = FIRST_PAYLOAD;

    loop {
      let header = heap.header(offset);
      let size = size_of(header);
      let self_alloc = self_alloc_of(header);

      if size == 0 && self_alloc {
        assert_eq!(
          u64::from(offset),
          heap.heap_size(),
          "epilogue header must close the heap exactly"
        );
        break;
      }

      blocks.push(BlockInfo {
        offset,
        size,
        self_alloc,
        prev_alloc: prev_alloc_of(header),
      });

      offset += size + if self_alloc { WORD_SIZE } else { DWORD_SIZE };
    }

    blocks
  }

  fn free_list(heap: &ExplicitAllocator<BufferProvider>) -> Vec<u32> {
    let mut list = Vec::new();
    let mut block = heap.head();

    while block != TAIL {
      list.push(block);
      assert!(list.len() < 1_000_000, "free list does not terminate");
      block = heap.next_link(block);
    }

    list
  }

  /// Asserts the structural invariants that must hold between public
  /// operations: exact physical coverage, predecessor-bit consistency,
  /// no adjacent free blocks, footer agreement, and a doubly consistent
  /// free list containing exactly the free blocks.
  fn check_invariants(heap: &ExplicitAllocator<BufferProvider>) {
    let blocks = physical_blocks(heap);

    let mut prev_alloc = true;
    for block in &blocks {
      assert_eq!(
        block.prev_alloc, prev_alloc,
        "predecessor bit wrong at offset {}",
        block.offset
      );
      prev_alloc = block.self_alloc;
    }
    let epilogue = heap.word(heap.heap_size() as u32 - WORD_SIZE);
    assert_eq!(prev_alloc_of(epilogue), prev_alloc, "epilogue predecessor bit wrong");

    for pair in blocks.windows(2) {
      assert!(
        pair[0].self_alloc || pair[1].self_alloc,
        "adjacent free blocks at {} and {}",
        pair[0].offset,
        pair[1].offset
      );
    }

    for block in blocks.iter().filter(|block| !block.self_alloc) {
      let footer = heap.word(block.offset + block.size);
      assert_eq!(size_of(footer), block.size, "footer size wrong at {}", block.offset);
      assert!(!self_alloc_of(footer), "footer alloc bit wrong at {}", block.offset);
    }

    let list = free_list(heap);
    let mut listed = list.clone();
    listed.sort_unstable();
    let mut free_blocks: Vec<u32> = blocks
      .iter()
      .filter(|block| !block.self_alloc)
      .map(|block| block.offset)
      .collect();
    free_blocks.sort_unstable();
    assert_eq!(listed, free_blocks, "free list and free blocks disagree");

    let mut prev = HEAD;
    for &block in &list {
      assert_eq!(heap.prev_link(block), prev, "predecessor link wrong at {}", block);
      prev = block;
    }
    match list.last() {
      Some(&last) => assert_eq!(heap.tail(), last),
      None => {
        assert_eq!(heap.head(), TAIL);
        assert_eq!(heap.tail(), HEAD);
      }
    }
  }

  fn heap_snapshot(heap: &ExplicitAllocator<BufferProvider>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(heap.heap_size() as usize);
    for offset in 0..heap.heap_size() as usize {
      bytes.push(unsafe { heap.provider.base().add(offset).read() });
    }

    bytes
  }

  #[test]
  fn initial_heap_layout() {
    let heap = new_heap(4096);

    assert_eq!(heap.heap_size(), 32);
    assert_eq!(heap.head(), 16);
    assert_eq!(heap.tail(), 16);
    assert_eq!(heap.header(16), pack_header(8, true, false));
    assert_eq!(heap.word(24), pack_footer(8, false));
    assert_eq!(heap.header(32), pack_header(0, false, true));
    assert_eq!(heap.max_free_payload, 8);

    check_invariants(&heap);
  }

  #[test]
  fn allocate_reuses_the_initial_free_block() {
    let mut heap = new_heap(4096);

    let ptr = unsafe { heap.allocate(8) };

    assert_eq!(ptr as usize, heap.provider.base() as usize + 16);
    // served from the initial block, no growth
    assert_eq!(heap.heap_size(), 32);
    // list is empty now
    assert_eq!(heap.head(), TAIL);
    assert_eq!(heap.tail(), HEAD);
    // epilogue records an allocated predecessor
    assert_eq!(heap.header(32), pack_header(0, true, true));

    check_invariants(&heap);
  }

  #[test]
  fn allocations_are_aligned_distinct_and_writable() {
    let mut heap = new_heap(1 << 20);
    let mut regions = Vec::new();

    unsafe {
      for (index, size) in [1usize, 7, 8, 24, 100, 999, 4096].into_iter().enumerate() {
        let ptr = heap.allocate(size);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 8, 0, "allocation must be 8-byte aligned");

        ptr::write_bytes(ptr, index as u8 + 1, size);
        regions.push((ptr, size, index as u8 + 1));
      }

      // no allocation stomped on another
      for (ptr, size, tag) in &regions {
        for i in 0..*size {
          assert_eq!(ptr.add(i).read(), *tag);
        }
      }
    }

    check_invariants(&heap);
  }

  #[test]
  fn freeing_the_only_allocation_restores_the_initial_state() {
    let mut heap = new_heap(4096);
    let pristine = heap_snapshot(&heap);

    unsafe {
      let ptr = heap.allocate(8);
      heap.free(ptr);
    }

    assert_eq!(heap_snapshot(&heap), pristine);
    check_invariants(&heap);
  }

  #[test]
  fn split_leaves_exactly_one_remainder_block() {
    let mut heap = new_heap(4096);

    unsafe {
      let first = heap.allocate(24);
      let _second = heap.allocate(24);
      heap.free(first);

      let third = heap.allocate(16);
      assert!(!third.is_null());

      // the 16-byte request fits in the freed (and backward-coalesced)
      // region with room to split off a remainder
      let list = free_list(&heap);
      assert_eq!(list.len(), 1, "exactly one remainder block expected");
    }

    check_invariants(&heap);
  }

  #[test]
  fn freed_region_is_reused_deterministically() {
    let mut heap = new_heap(4096);

    unsafe {
      let first = heap.allocate(100);
      let size_before = heap.heap_size();
      heap.free(first);

      let second = heap.allocate(100);
      assert!(!second.is_null());
      // the freed region coalesced backward into the initial block, so
      // first fit places the request at the merged block's start
      assert_eq!(second as usize + 16, first as usize);
      assert_eq!(heap.heap_size(), size_before, "no new heap growth");
    }

    check_invariants(&heap);
  }

  #[test]
  fn recycled_offset_is_identical_when_initial_block_is_retired() {
    let mut heap = new_heap(4096);

    unsafe {
      let _guard = heap.allocate(8); // retires the initial free block

      let first = heap.allocate(100);
      heap.free(first);

      let second = heap.allocate(100);
      assert_eq!(second, first, "first fit must return the same region");
    }

    check_invariants(&heap);
  }

  #[test]
  fn split_threshold_spares_a_viable_remainder_only() {
    // a freed 44-byte-capacity block: a 28-byte request leaves slack 16
    // and splits, a 36-byte request leaves slack 8 and is consumed whole
    for (request, expect_split) in [(28usize, true), (36usize, false)] {
      let mut heap = new_heap(4096);

      unsafe {
        let _guard = heap.allocate(8);
        let victim = heap.allocate(44);
        let _fence = heap.allocate(8);
        heap.free(victim);

        let placed = heap.allocate(request);
        assert_eq!(placed, victim, "the freed block must be reused");

        let block = 32;
        if expect_split {
          assert_eq!(size_of(heap.header(block)), 28);
          assert_eq!(free_list(&heap), vec![64], "remainder block expected");
          assert_eq!(size_of(heap.header(64)), 8);
        } else {
          assert_eq!(size_of(heap.header(block)), 44, "block consumed whole");
          assert!(free_list(&heap).is_empty());
        }
      }

      check_invariants(&heap);
    }
  }

  #[test]
  fn triple_coalesce_merges_into_one_block() {
    let mut heap = new_heap(4096);

    unsafe {
      let _guard = heap.allocate(8);
      let a = heap.allocate(24);
      let b = heap.allocate(24);
      let c = heap.allocate(24);

      heap.free(a);
      heap.free(c);
      check_invariants(&heap);

      heap.free(b);

      let list = free_list(&heap);
      assert_eq!(list, vec![32], "one merged block expected");
      // three 28-byte payloads plus the two interior boundary pairs the
      // merge reclaimed, minus the footer the merged block pays
      assert_eq!(size_of(heap.header(32)), 88);

      check_invariants(&heap);

      // draining the guard merges the whole heap into a single block
      heap.free(_guard);
      let blocks = physical_blocks(&heap);
      assert_eq!(blocks.len(), 1);
      assert!(!blocks[0].self_alloc);
      assert_eq!(u64::from(blocks[0].size), heap.heap_size() - 24);
    }

    check_invariants(&heap);
  }

  #[test]
  fn first_fit_takes_the_list_head() {
    let mut heap = new_heap(8192);

    unsafe {
      let _guard = heap.allocate(8);
      let big = heap.allocate(60);
      let _fence1 = heap.allocate(8);
      let small = heap.allocate(24);
      let _fence2 = heap.allocate(8);

      // free order puts the big block at the list head
      heap.free(small);
      heap.free(big);

      let placed = heap.allocate(20);
      assert_eq!(placed, big, "first fit must take the head even if it is larger");
    }

    check_invariants(&heap);
  }

  #[test]
  fn first_two_fit_prefers_the_smaller_candidate() {
    let mut heap =
      ExplicitAllocator::with_fit_number(BufferProvider::new(8192), 2).unwrap();

    unsafe {
      let _guard = heap.allocate(8);
      let big = heap.allocate(60);
      let _fence1 = heap.allocate(8);
      let small = heap.allocate(24);
      let _fence2 = heap.allocate(8);

      heap.free(small);
      heap.free(big);

      let placed = heap.allocate(20);
      assert_eq!(placed, small, "the smaller of two fits must win");
    }

    check_invariants(&heap);
  }

  #[test]
  fn reallocate_null_and_zero_edge_cases() {
    let mut heap = new_heap(4096);

    unsafe {
      // null pointer behaves like allocate
      let ptr = heap.reallocate(ptr::null_mut(), 32);
      assert!(!ptr.is_null());
      assert_eq!(ptr as usize % 8, 0);

      // zero size behaves like free and returns null
      let released = heap.reallocate(ptr, 0);
      assert!(released.is_null());
      assert_eq!(free_list(&heap).len(), 1);
    }

    check_invariants(&heap);
  }

  #[test]
  fn reallocate_preserves_the_payload_prefix() {
    let mut heap = new_heap(4096);

    unsafe {
      let old = heap.allocate(16);
      for i in 0..16 {
        old.add(i).write(0xA0 + i as u8);
      }

      let new = heap.reallocate(old, 48);
      assert!(!new.is_null());
      assert_ne!(new, old);
      for i in 0..16 {
        assert_eq!(new.add(i).read(), 0xA0 + i as u8, "byte {} lost in move", i);
      }

      // shrinking keeps the shorter prefix
      let shrunk = heap.reallocate(new, 8);
      assert!(!shrunk.is_null());
      for i in 0..8 {
        assert_eq!(shrunk.add(i).read(), 0xA0 + i as u8);
      }
    }

    check_invariants(&heap);
  }

  #[test]
  fn reallocate_failure_leaves_the_old_block_intact() {
    let mut heap = new_heap(128);

    unsafe {
      let ptr = heap.allocate(24);
      assert!(!ptr.is_null());
      ptr::write_bytes(ptr, 0x5A, 24);

      let moved = heap.reallocate(ptr, 4096);
      assert!(moved.is_null(), "growth past the provider capacity must fail");

      for i in 0..24 {
        assert_eq!(ptr.add(i).read(), 0x5A, "old block must survive the failure");
      }
    }

    check_invariants(&heap);
  }

  #[test]
  fn zeroed_allocate_zeroes_the_declared_payload() {
    let mut heap = new_heap(4096);

    unsafe {
      // dirty a region first so the zeroing is observable
      let dirty = heap.allocate(40);
      ptr::write_bytes(dirty, 0xFF, 40);
      heap.free(dirty);

      let ptr = heap.zeroed_allocate(3, 10);
      assert!(!ptr.is_null());

      let block = heap.offset_of(ptr).unwrap();
      let declared = size_of(heap.header(block)) as usize;
      assert!(declared >= 30);
      for i in 0..declared {
        assert_eq!(ptr.add(i).read(), 0, "byte {} not zeroed", i);
      }
    }

    check_invariants(&heap);
  }

  #[test]
  fn zeroed_allocate_rejects_overflowing_products() {
    let mut heap = new_heap(4096);

    let ptr = unsafe { heap.zeroed_allocate(usize::MAX, 2) };

    assert!(ptr.is_null());
    assert_eq!(heap.heap_size(), 32, "heap must be untouched");
    check_invariants(&heap);
  }

  #[test]
  fn oversized_requests_fail_without_touching_the_heap() {
    let mut heap = new_heap(4096);
    let pristine = heap_snapshot(&heap);

    unsafe {
      assert!(heap.allocate(u32::MAX as usize).is_null());
      assert!(heap.allocate(usize::MAX).is_null());
      // reaches the same guard without overflowing the multiplication
      assert!(heap.zeroed_allocate(1, usize::MAX).is_null());
      assert!(heap.reallocate(ptr::null_mut(), usize::MAX).is_null());
    }

    assert_eq!(heap_snapshot(&heap), pristine);
    check_invariants(&heap);
  }

  #[test]
  fn provider_exhaustion_surfaces_as_null() {
    let mut heap = new_heap(64);

    unsafe {
      assert!(heap.allocate(100).is_null(), "no room to grow");
      check_invariants(&heap);

      // the initial block is still usable afterwards
      let ptr = heap.allocate(8);
      assert!(!ptr.is_null());
      assert_eq!(heap.heap_size(), 32);
    }

    check_invariants(&heap);
  }

  #[test]
  fn allocate_zero_bytes_yields_a_freeable_block() {
    let mut heap = new_heap(4096);

    unsafe {
      let ptr = heap.allocate(0);
      assert!(!ptr.is_null());
      assert_eq!(ptr as usize % 8, 0);
      check_invariants(&heap);

      heap.free(ptr);
    }

    check_invariants(&heap);
  }

  #[test]
  fn double_free_is_reported_and_ignored() {
    let mut heap = new_heap(4096);

    unsafe {
      let _guard = heap.allocate(8);
      let ptr = heap.allocate(24);
      heap.free(ptr);

      let snapshot = heap_snapshot(&heap);
      heap.free(ptr);
      assert_eq!(heap_snapshot(&heap), snapshot, "double free must not mutate");
    }

    check_invariants(&heap);
  }

  #[test]
  fn out_of_range_frees_are_ignored() {
    let mut heap = new_heap(4096);
    let base = heap.provider.base();
    let pristine = heap_snapshot(&heap);

    unsafe {
      heap.free(ptr::null_mut());
      heap.free(base.wrapping_sub(64));
      heap.free(base.add(8)); // inside the sentinel area
      heap.free(base.add(heap.heap_size() as usize + 100));
    }

    assert_eq!(heap_snapshot(&heap), pristine);
    check_invariants(&heap);
  }

  #[test]
  fn check_heap_never_mutates() {
    let mut heap = new_heap(4096);

    unsafe {
      let a = heap.allocate(24);
      let _b = heap.allocate(100);
      heap.free(a);
    }

    let snapshot = heap_snapshot(&heap);
    heap.check_heap(false);
    heap.check_heap(true);
    assert_eq!(heap_snapshot(&heap), snapshot);
  }

  #[test]
  fn random_operation_stream_upholds_the_invariants() {
    let mut heap = new_heap(64 << 20);
    let mut rng = StdRng::seed_from_u64(0x5EED_CAFE);
    let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();

    for op in 0..10_000u32 {
      let grow = live.is_empty() || rng.gen_bool(0.55);

      if grow {
        let size = rng.gen_range(1..=4096);
        let ptr = unsafe { heap.allocate(size) };
        if !ptr.is_null() {
          assert_eq!(ptr as usize % 8, 0);
          let tag = (op as u8).wrapping_mul(31).wrapping_add(7);
          unsafe { ptr::write_bytes(ptr, tag, size) };
          live.push((ptr, size, tag));
        }
      } else {
        let index = rng.gen_range(0..live.len());
        let (ptr, size, tag) = live.swap_remove(index);
        unsafe {
          for i in 0..size {
            assert_eq!(ptr.add(i).read(), tag, "live payload corrupted at byte {}", i);
          }
          heap.free(ptr);
        }
      }

      if op % 64 == 0 {
        check_invariants(&heap);
      }
    }

    check_invariants(&heap);

    for (ptr, _, _) in live.drain(..) {
      unsafe { heap.free(ptr) };
    }

    // a fully drained heap coalesces into a single free block
    let blocks = physical_blocks(&heap);
    assert_eq!(blocks.len(), 1);
    assert!(!blocks[0].self_alloc);
    check_invariants(&heap);
  }
}
