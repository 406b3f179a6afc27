//! # Readiness Bitmap
//!
//! Per-partition scheduling flags for one input of a node. Every partition has
//! four bits:
//!
//! - **ready**: data (or an eof marker) is waiting to be popped
//! - **finished**: all sources signalled eof and the queue is drained
//! - **optional**: the partition never blocks scheduling
//! - **valid**: the partition takes part in the predicates at all
//!
//! Sixteen partitions share one `AtomicU64`, one 16-bit lane per flag, so the
//! four flags of a partition always change in a single atomic word. All writes
//! go through compare-and-swap retry loops; nothing here takes a lock.
//!
//! ```rust
//! use gridweave::readiness::ReadinessBitmap;
//!
//! let bitmap = ReadinessBitmap::new(2);
//! assert!(bitmap.is_finish());
//! bitmap.set_finish_all(false);
//! assert!(!bitmap.is_ok());
//! bitmap.set_ready(0, true).unwrap();
//! bitmap.set_finish(1, true).unwrap();
//! assert!(bitmap.is_ok());
//! ```

use crate::error::{GraphError, Result};
use crate::partition::PartId;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const CHUNK: usize = 16;
const LANE_MASK: u64 = 0xFFFF;

#[derive(Clone, Copy, Debug)]
enum Lane {
  Ready = 0,
  Finish = 16,
  Optional = 32,
  Valid = 48,
}

/// Atomic per-partition {ready, finished, optional, valid} flags.
pub struct ReadinessBitmap {
  count: u32,
  chunks: Vec<AtomicU64>,
}

impl ReadinessBitmap {
  /// Creates a bitmap for `count` partitions with
  /// `finished = all, ready = none, optional = none, valid = all`.
  pub fn new(count: u32) -> Self {
    let chunk_count = (count as usize).div_ceil(CHUNK);
    let chunks = (0..chunk_count)
      .map(|chunk| {
        let members = Self::chunk_members(count, chunk);
        AtomicU64::new(
          (members << Lane::Valid as u64) | (members << Lane::Finish as u64),
        )
      })
      .collect();
    Self { count, chunks }
  }

  /// Bits of the partitions that exist in `chunk`.
  fn chunk_members(count: u32, chunk: usize) -> u64 {
    let remaining = count as usize - chunk * CHUNK;
    if remaining >= CHUNK {
      LANE_MASK
    } else {
      (1u64 << remaining) - 1
    }
  }

  /// Number of partitions covered.
  pub fn partition_count(&self) -> u32 {
    self.count
  }

  fn locate(&self, id: PartId) -> Result<(usize, u64)> {
    if id >= self.count {
      return Err(GraphError::PartIdOverflow {
        id,
        count: self.count,
      });
    }
    Ok((id as usize / CHUNK, 1u64 << (id as usize % CHUNK)))
  }

  fn update(&self, chunk: usize, f: impl Fn(u64) -> u64) {
    let word = &self.chunks[chunk];
    let mut current = word.load(Ordering::Acquire);
    loop {
      let next = f(current);
      if next == current {
        return;
      }
      match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => return,
        Err(observed) => current = observed,
      }
    }
  }

  fn set_bit(&self, id: PartId, lane: Lane, value: bool) -> Result<()> {
    let (chunk, bit) = self.locate(id)?;
    let mask = bit << lane as u64;
    self.update(chunk, |w| if value { w | mask } else { w & !mask });
    Ok(())
  }

  fn get_bit(&self, id: PartId, lane: Lane) -> Result<bool> {
    let (chunk, bit) = self.locate(id)?;
    let word = self.chunks[chunk].load(Ordering::Acquire);
    Ok(word & (bit << lane as u64) != 0)
  }

  fn set_lane_all(&self, lane: Lane, value: bool) {
    for chunk in 0..self.chunks.len() {
      let mask = Self::chunk_members(self.count, chunk) << lane as u64;
      self.update(chunk, |w| if value { w | mask } else { w & !mask });
    }
  }

  /// Sets the ready flag of `id`.
  pub fn set_ready(&self, id: PartId, value: bool) -> Result<()> {
    self.set_bit(id, Lane::Ready, value)
  }

  /// Sets the finished flag of `id`.
  pub fn set_finish(&self, id: PartId, value: bool) -> Result<()> {
    self.set_bit(id, Lane::Finish, value)
  }

  /// Sets the optional flag of `id`.
  pub fn set_optional(&self, id: PartId, value: bool) -> Result<()> {
    self.set_bit(id, Lane::Optional, value)
  }

  /// Sets the valid flag of `id`.
  pub fn set_valid(&self, id: PartId, value: bool) -> Result<()> {
    self.set_bit(id, Lane::Valid, value)
  }

  /// Sets ready and finished of `id` together in one atomic step.
  pub fn set_state(&self, id: PartId, ready: bool, finished: bool) -> Result<()> {
    let (chunk, bit) = self.locate(id)?;
    let ready_mask = bit << Lane::Ready as u64;
    let finish_mask = bit << Lane::Finish as u64;
    self.update(chunk, |w| {
      let w = if ready { w | ready_mask } else { w & !ready_mask };
      if finished {
        w | finish_mask
      } else {
        w & !finish_mask
      }
    });
    Ok(())
  }

  /// Sets the ready flag of every partition.
  pub fn set_ready_all(&self, value: bool) {
    self.set_lane_all(Lane::Ready, value);
  }

  /// Sets the finished flag of every partition.
  pub fn set_finish_all(&self, value: bool) {
    self.set_lane_all(Lane::Finish, value);
  }

  /// Sets the optional flag of every partition.
  pub fn set_optional_all(&self, value: bool) {
    self.set_lane_all(Lane::Optional, value);
  }

  /// Sets the valid flag of every partition.
  pub fn set_valid_all(&self, value: bool) {
    self.set_lane_all(Lane::Valid, value);
  }

  /// Reads the ready flag of `id`.
  pub fn is_ready_at(&self, id: PartId) -> Result<bool> {
    self.get_bit(id, Lane::Ready)
  }

  /// Reads the finished flag of `id`.
  pub fn is_finish_at(&self, id: PartId) -> Result<bool> {
    self.get_bit(id, Lane::Finish)
  }

  /// Reads the optional flag of `id`.
  pub fn is_optional_at(&self, id: PartId) -> Result<bool> {
    self.get_bit(id, Lane::Optional)
  }

  /// Reads the valid flag of `id`.
  pub fn is_valid_at(&self, id: PartId) -> Result<bool> {
    self.get_bit(id, Lane::Valid)
  }

  fn lanes(word: u64) -> (u64, u64, u64, u64) {
    (
      word & LANE_MASK,
      (word >> Lane::Finish as u64) & LANE_MASK,
      (word >> Lane::Optional as u64) & LANE_MASK,
      (word >> Lane::Valid as u64) & LANE_MASK,
    )
  }

  fn all_chunks(&self, pred: impl Fn(u64, u64, u64, u64) -> bool) -> bool {
    self.chunks.iter().all(|c| {
      let (ready, finish, optional, valid) = Self::lanes(c.load(Ordering::Acquire));
      pred(ready, finish, optional, valid)
    })
  }

  fn any_chunk(&self, pred: impl Fn(u64, u64, u64, u64) -> bool) -> bool {
    self.chunks.iter().any(|c| {
      let (ready, finish, optional, valid) = Self::lanes(c.load(Ordering::Acquire));
      pred(ready, finish, optional, valid)
    })
  }

  /// Any valid partition is ready.
  pub fn has_ready(&self) -> bool {
    self.any_chunk(|ready, _, _, valid| valid & ready != 0)
  }

  /// Every valid, non-optional partition is finished or ready.
  ///
  /// This is the predicate the scheduler uses to decide a node can run.
  pub fn is_ok(&self) -> bool {
    self.all_chunks(|ready, finish, optional, valid| valid & !optional & !(finish | ready) == 0)
  }

  /// Every valid partition is ready.
  pub fn is_ready(&self) -> bool {
    self.all_chunks(|ready, _, _, valid| valid & !ready == 0)
  }

  /// Every valid partition is finished.
  pub fn is_finish(&self) -> bool {
    self.all_chunks(|_, finish, _, valid| valid & !finish == 0)
  }

  /// Any valid partition is finished.
  pub fn has_finish_bit(&self) -> bool {
    self.any_chunk(|_, finish, _, valid| valid & finish != 0)
  }

  /// Some, but not all, valid partitions are finished.
  pub fn is_partial_finish(&self) -> bool {
    self.has_finish_bit() && !self.is_finish()
  }
}

impl fmt::Debug for ReadinessBitmap {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut list = f.debug_list();
    for id in 0..self.count {
      let flag = |lane| self.get_bit(id, lane).unwrap_or(false);
      list.entry(&format_args!(
        "{}:{}{}{}{}",
        id,
        if flag(Lane::Ready) { 'r' } else { '-' },
        if flag(Lane::Finish) { 'f' } else { '-' },
        if flag(Lane::Optional) { 'o' } else { '-' },
        if flag(Lane::Valid) { 'v' } else { '-' },
      ));
    }
    list.finish()
  }
}
