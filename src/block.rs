//! Block encoding.
//!
//! Every block on the heap is described by a 4-byte header word packed as
//!
//! ```text
//!   31                                    2   1   0
//!   ┌─────────────────────────────────────┬───┬───┐
//!   │ size (multiple of 4, low bits zero) │ P │ A │
//!   └─────────────────────────────────────┴───┴───┘
//!     P = predecessor-alloc bit (physically preceding block allocated)
//!     A = self-alloc bit (this block allocated)
//! ```
//!
//! The size counts the payload only: an allocated block occupies
//! `size + 4` bytes of heap (header + payload), a free block occupies
//! `size + 8` (header + payload + footer). Free blocks carry a footer word
//! at `payload + size` packed as `size | self_alloc`, which is what lets
//! the coalescer find the start of a free predecessor without a scan.
//!
//! All packing is explicit mask/shift arithmetic; nothing here touches the
//! heap itself.

/// Size of one heap word (header, footer, or list link), in bytes.
pub const WORD_SIZE: u32 = 4;

/// Size of a double word, the overhead a block pays when it is free
/// (header plus footer), in bytes.
pub const DWORD_SIZE: u32 = 8;

/// Smallest payload a block may have: a free block must be able to hold
/// its two list links plus recover its footer slot when allocated.
pub const MIN_BLOCK_SIZE: u32 = 3 * WORD_SIZE;

const SIZE_MASK: u32 = !0x3;
const PREV_ALLOC_BIT: u32 = 0x2;
const SELF_ALLOC_BIT: u32 = 0x1;

/// Packs a header word from a payload size and the two allocation bits.
///
/// `size` must be a multiple of 4; its low two bits are owned by the
/// flags.
pub fn pack_header(
  size: u32,
  prev_alloc: bool,
  self_alloc: bool,
) -> u32 {
  (size & SIZE_MASK) | ((prev_alloc as u32) << 1) | (self_alloc as u32)
}

/// Packs a footer word. Footers record only the size and the self-alloc
/// bit; the predecessor bit lives in headers alone.
pub fn pack_footer(
  size: u32,
  self_alloc: bool,
) -> u32 {
  (size & SIZE_MASK) | (self_alloc as u32)
}

/// Extracts the payload size from a header or footer word.
pub fn size_of(word: u32) -> u32 {
  word & SIZE_MASK
}

/// Extracts the predecessor-alloc bit from a header word.
pub fn prev_alloc_of(word: u32) -> bool {
  (word & PREV_ALLOC_BIT) != 0
}

/// Extracts the self-alloc bit from a header or footer word.
pub fn self_alloc_of(word: u32) -> bool {
  (word & SELF_ALLOC_BIT) != 0
}

/// Returns `word` with the predecessor-alloc bit replaced, leaving size
/// and self-alloc untouched.
pub fn with_prev_alloc(
  word: u32,
  prev_alloc: bool,
) -> u32 {
  (word & !PREV_ALLOC_BIT) | ((prev_alloc as u32) << 1)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn header_round_trip() {
    for size in [0u32, 4, 8, 12, 100, 4096, 0xFFFF_FFF8] {
      for prev_alloc in [false, true] {
        for self_alloc in [false, true] {
          let word = pack_header(size, prev_alloc, self_alloc);

          assert_eq!(size_of(word), size);
          assert_eq!(prev_alloc_of(word), prev_alloc);
          assert_eq!(self_alloc_of(word), self_alloc);
        }
      }
    }
  }

  #[test]
  fn footer_round_trip() {
    for size in [0u32, 8, 24, 1024] {
      for self_alloc in [false, true] {
        let word = pack_footer(size, self_alloc);

        assert_eq!(size_of(word), size);
        assert_eq!(self_alloc_of(word), self_alloc);
        assert!(!prev_alloc_of(word));
      }
    }
  }

  #[test]
  fn flags_live_in_the_low_bits() {
    assert_eq!(pack_header(8, true, true), 8 | 0x2 | 0x1);
    assert_eq!(pack_header(8, false, true), 8 | 0x1);
    assert_eq!(pack_header(8, true, false), 8 | 0x2);
    assert_eq!(pack_footer(8, true), 8 | 0x1);
  }

  #[test]
  fn with_prev_alloc_preserves_the_rest() {
    let word = pack_header(48, false, true);

    assert_eq!(with_prev_alloc(word, true), pack_header(48, true, true));
    assert_eq!(with_prev_alloc(with_prev_alloc(word, true), false), word);
  }
}
