//! Lock-free bit vector shared by stream and border bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = 64;

/// Fixed-size bit vector with atomic set/clear.
#[derive(Debug)]
pub struct AtomicBitmap {
  len: usize,
  words: Vec<AtomicU64>,
}

impl AtomicBitmap {
  /// Creates a bitmap of `len` cleared bits.
  pub fn new(len: usize) -> Self {
    let words = (0..len.div_ceil(WORD_BITS))
      .map(|_| AtomicU64::new(0))
      .collect();
    Self { len, words }
  }

  /// Number of bits.
  pub fn len(&self) -> usize {
    self.len
  }

  /// Whether the bitmap has no bits at all.
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Sets bit `index`, returning its previous value. Out-of-range is a no-op returning `false`.
  pub fn set(&self, index: usize) -> bool {
    if index >= self.len {
      return false;
    }
    let mask = 1u64 << (index % WORD_BITS);
    self.words[index / WORD_BITS].fetch_or(mask, Ordering::AcqRel) & mask != 0
  }

  /// Clears bit `index`, returning its previous value.
  pub fn clear(&self, index: usize) -> bool {
    if index >= self.len {
      return false;
    }
    let mask = 1u64 << (index % WORD_BITS);
    self.words[index / WORD_BITS].fetch_and(!mask, Ordering::AcqRel) & mask != 0
  }

  /// Reads bit `index`.
  pub fn test(&self, index: usize) -> bool {
    if index >= self.len {
      return false;
    }
    let mask = 1u64 << (index % WORD_BITS);
    self.words[index / WORD_BITS].load(Ordering::Acquire) & mask != 0
  }

  /// Number of set bits.
  pub fn count(&self) -> usize {
    self
      .words
      .iter()
      .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
      .sum()
  }

  /// Whether every bit is set. An empty bitmap counts as full.
  pub fn all(&self) -> bool {
    self.count() == self.len
  }

  /// Whether any bit is set.
  pub fn any(&self) -> bool {
    self.words.iter().any(|w| w.load(Ordering::Acquire) != 0)
  }

  /// Sets every bit.
  pub fn set_all(&self) {
    for index in 0..self.len {
      self.set(index);
    }
  }
}
