//! Heap providers.
//!
//! The allocator never talks to the operating system directly. It sits on
//! top of a [`HeapProvider`]: a single contiguous region with a stable base
//! address that only ever grows, in the style of `sbrk(2)`.
//!
//! ```text
//!   base                                      base + size
//!    │                                             │
//!    ▼                                             ▼
//!    ┌─────────────────────────────────────────────┬ ─ ─ ─ ─ ─ ┐
//!    │           heap bytes (never move)           │  extend(n)
//!    └─────────────────────────────────────────────┴ ─ ─ ─ ─ ─ ┘
//! ```
//!
//! Two implementations ship with the crate:
//!
//! - [`SbrkProvider`] extends the program's data segment with `sbrk`, the
//!   real-program backend.
//! - [`BufferProvider`] simulates `sbrk` inside a fixed-capacity buffer,
//!   which is what every test runs against: deterministic, isolated from
//!   the process allocator, and reclaimed on drop.

use std::ptr;

use libc::{c_void, intptr_t, sbrk};
use thiserror::Error;

use crate::align::ALIGNMENT;
use crate::align_to;

/// Failure modes of the heap-extension primitive.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
  /// The provider refused to grow by the requested number of bytes.
  #[error("heap provider cannot grow by {requested} bytes")]
  Exhausted {
    /// The growth amount that was refused.
    requested: u32,
  },

  /// The newly granted region does not start where the existing region
  /// ends. All block bookkeeping is offset-based, so a hole in the region
  /// would silently corrupt it; the provider reports the condition
  /// instead.
  #[error("heap region is no longer contiguous")]
  NonContiguous,
}

/// A monotonically growing, contiguous byte region.
///
/// # Contract
///
/// - [`base`](Self::base) is stable for the lifetime of the provider and
///   existing bytes never move.
/// - [`size`](Self::size) is the current total length in bytes.
/// - [`extend`](Self::extend) grows the region by `by` bytes and returns
///   the start of the new sub-region, which must equal `base + old_size`.
///   Callers only ever pass 8-byte-aligned amounts.
pub trait HeapProvider {
  /// Base address of the region.
  fn base(&self) -> *mut u8;

  /// Current total size of the region in bytes.
  fn size(&self) -> u64;

  /// Grows the region by `by` bytes, returning the start of the newly
  /// granted sub-region.
  fn extend(
    &mut self,
    by: u32,
  ) -> Result<*mut u8, ProviderError>;
}

/// Heap provider backed by the program break.
///
/// The base is captured with `sbrk(0)` at construction; every
/// [`extend`](HeapProvider::extend) moves the break forward. Because the
/// allocator's metadata assumes the region stays contiguous, each
/// extension verifies that the break had not been moved by anyone else in
/// the meantime; if it had, the provider reports
/// [`ProviderError::NonContiguous`] rather than handing out a region with
/// a hole in front of it.
pub struct SbrkProvider {
  /// Program break at construction time; base of the managed region.
  base: *mut u8,

  /// Bytes handed out so far.
  size: u64,
}

impl SbrkProvider {
  /// Captures the current program break as the heap base.
  pub fn new() -> Self {
    let base = unsafe { sbrk(0) } as *mut u8;

    Self { base, size: 0 }
  }
}

impl HeapProvider for SbrkProvider {
  fn base(&self) -> *mut u8 {
    self.base
  }

  fn size(&self) -> u64 {
    self.size
  }

  fn extend(
    &mut self,
    by: u32,
  ) -> Result<*mut u8, ProviderError> {
    let start = unsafe { sbrk(by as intptr_t) };
    if start == usize::MAX as *mut c_void {
      // sbrk returns (void*)-1 on failure
      return Err(ProviderError::Exhausted { requested: by });
    }

    let start = start as *mut u8;
    let expected = self.base.wrapping_add(self.size as usize);
    if !ptr::eq(start, expected) {
      return Err(ProviderError::NonContiguous);
    }

    self.size += u64::from(by);
    Ok(start)
  }
}

/// Heap provider backed by a fixed-capacity in-process buffer.
///
/// Plays the role of a simulated `sbrk`: the buffer is allocated once,
/// 8-byte aligned, and `extend` hands out successive slices of it until
/// the capacity runs out. Existing bytes never move because the buffer
/// itself never reallocates.
pub struct BufferProvider {
  /// Backing storage; `u64` elements guarantee an 8-byte-aligned base.
  storage: Box<[u64]>,

  /// Cached `storage` base address.
  base: *mut u8,

  /// Bytes handed out so far.
  used: usize,
}

impl BufferProvider {
  /// Creates a provider with at least `capacity` bytes of room, rounded
  /// up to the block format's alignment.
  pub fn new(capacity: usize) -> Self {
    let capacity = align_to!(capacity.max(ALIGNMENT as usize), ALIGNMENT as usize);
    let mut storage = vec![0u64; capacity / 8].into_boxed_slice();
    let base = storage.as_mut_ptr().cast::<u8>();

    Self {
      storage,
      base,
      used: 0,
    }
  }

  /// Total capacity in bytes.
  pub fn capacity(&self) -> usize {
    self.storage.len() * 8
  }
}

impl HeapProvider for BufferProvider {
  fn base(&self) -> *mut u8 {
    self.base
  }

  fn size(&self) -> u64 {
    self.used as u64
  }

  fn extend(
    &mut self,
    by: u32,
  ) -> Result<*mut u8, ProviderError> {
    let new_used = self
      .used
      .checked_add(by as usize)
      .filter(|&used| used <= self.capacity())
      .ok_or(ProviderError::Exhausted { requested: by })?;

    let start = unsafe { self.base.add(self.used) };
    self.used = new_used;

    Ok(start)
  }
}
