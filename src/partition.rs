//! # Partition Sets
//!
//! A [`PartitionSet`] records which partition ids of a fixed partition space
//! take part in one side of a graph boundary. It is built once, from a
//! [`PartitionDescriptor`] or directly, and is read-only afterwards.
//!
//! ```rust
//! use gridweave::partition::{PartitionDescriptor, PartitionSet};
//!
//! let desc = PartitionDescriptor { part_count: 5, part_ids: vec![0, 2, 4] };
//! let set = PartitionSet::from_descriptor(&desc).unwrap();
//! assert!(set.is_used(2));
//! assert!(!set.is_used(3));
//! assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 2, 4]);
//! assert_eq!(set.fill_descriptor(), desc);
//! ```

use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Partition identifier.
pub type PartId = u32;

const WORD_BITS: usize = 64;

/// Wire form of a partition set.
///
/// An empty `part_ids` list means every id in `[0, part_count)` is included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDescriptor {
  /// Size of the partition space.
  pub part_count: u32,
  /// Explicitly included ids.
  #[serde(default)]
  pub part_ids: Vec<PartId>,
}

impl PartitionDescriptor {
  /// Descriptor including all `part_count` partitions.
  pub fn all(part_count: u32) -> Self {
    Self {
      part_count,
      part_ids: Vec::new(),
    }
  }
}

/// Immutable set of included partition ids.
#[derive(Clone, PartialEq, Eq)]
pub struct PartitionSet {
  full_count: u32,
  used_count: usize,
  words: Vec<u64>,
}

impl PartitionSet {
  /// Set including every id in `[0, full_count)`.
  pub fn all(full_count: u32) -> Self {
    let mut set = Self::empty(full_count);
    for id in 0..full_count {
      set.insert(id);
    }
    set
  }

  /// Single partition space with id 0 included.
  pub fn single() -> Self {
    Self::all(1)
  }

  /// Set including only `ids`; an empty list includes everything.
  ///
  /// Ids outside `[0, full_count)` are rejected.
  pub fn from_ids(full_count: u32, ids: &[PartId]) -> Result<Self> {
    if ids.is_empty() {
      return Ok(Self::all(full_count));
    }
    let mut set = Self::empty(full_count);
    for &id in ids {
      if id >= full_count {
        return Err(GraphError::PartIdOverflow {
          id,
          count: full_count,
        });
      }
      set.insert(id);
    }
    Ok(set)
  }

  /// Builds a set from its wire form.
  pub fn from_descriptor(desc: &PartitionDescriptor) -> Result<Self> {
    Self::from_ids(desc.part_count, &desc.part_ids)
  }

  fn empty(full_count: u32) -> Self {
    let word_count = (full_count as usize).div_ceil(WORD_BITS);
    Self {
      full_count,
      used_count: 0,
      words: vec![0; word_count],
    }
  }

  fn insert(&mut self, id: PartId) {
    let (word, bit) = (id as usize / WORD_BITS, id as usize % WORD_BITS);
    let mask = 1u64 << bit;
    if self.words[word] & mask == 0 {
      self.words[word] |= mask;
      self.used_count += 1;
    }
  }

  /// Size of the partition space.
  pub fn full_count(&self) -> u32 {
    self.full_count
  }

  /// Number of included ids.
  pub fn used_count(&self) -> usize {
    self.used_count
  }

  /// Whether `id` is included. Ids out of range are never included.
  pub fn is_used(&self, id: PartId) -> bool {
    if id >= self.full_count {
      return false;
    }
    let (word, bit) = (id as usize / WORD_BITS, id as usize % WORD_BITS);
    self.words[word] & (1u64 << bit) != 0
  }

  /// Returns `Ok(())` if `id` is included, `PartIdOverflow` otherwise.
  pub fn check(&self, id: PartId) -> Result<()> {
    if self.is_used(id) {
      Ok(())
    } else {
      Err(GraphError::PartIdOverflow {
        id,
        count: self.full_count,
      })
    }
  }

  /// The `index`-th included id in ascending order.
  pub fn used_id_at(&self, index: usize) -> Option<PartId> {
    self.iter().nth(index)
  }

  /// Position of `id` among the included ids, `None` if not included.
  pub fn used_index_of(&self, id: PartId) -> Option<usize> {
    if !self.is_used(id) {
      return None;
    }
    self.iter().position(|used| used == id)
  }

  /// Included ids in ascending order.
  pub fn iter(&self) -> PartitionIter<'_> {
    PartitionIter {
      set: self,
      word: 0,
      current: self.words.first().copied().unwrap_or(0),
    }
  }

  /// Wire form with every included id listed explicitly.
  pub fn fill_descriptor(&self) -> PartitionDescriptor {
    PartitionDescriptor {
      part_count: self.full_count,
      part_ids: self.iter().collect(),
    }
  }
}

impl fmt::Debug for PartitionSet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PartitionSet")
      .field("full_count", &self.full_count)
      .field("ids", &self.iter().collect::<Vec<_>>())
      .finish()
  }
}

/// Ascending iterator over the ids of a [`PartitionSet`].
pub struct PartitionIter<'a> {
  set: &'a PartitionSet,
  word: usize,
  current: u64,
}

impl Iterator for PartitionIter<'_> {
  type Item = PartId;

  fn next(&mut self) -> Option<PartId> {
    loop {
      if self.current != 0 {
        let bit = self.current.trailing_zeros() as usize;
        self.current &= self.current - 1;
        return Some((self.word * WORD_BITS + bit) as PartId);
      }
      self.word += 1;
      if self.word >= self.set.words.len() {
        return None;
      }
      self.current = self.set.words[self.word];
    }
  }
}

impl<'a> IntoIterator for &'a PartitionSet {
  type Item = PartId;
  type IntoIter = PartitionIter<'a>;

  fn into_iter(self) -> Self::IntoIter {
    self.iter()
  }
}
