//! # Stream State
//!
//! Per-partition bookkeeping of one RPC stream. The send path of a partition is
//! serialized by a [`SendScope`]: whoever wins the compare-and-swap sends, every
//! other caller returns at once and relies on the winner to pick up its
//! messages. The pending-message counter is what lets the winner know there
//! is more to do.
//!
//! ```rust
//! use gridweave::partition::PartitionSet;
//! use gridweave::stream_state::StreamState;
//!
//! let state = StreamState::new(PartitionSet::all(2));
//! state.set_initialized(0);
//! let scope = state.try_send_scope(0).unwrap();
//! assert!(state.try_send_scope(0).is_none());
//! drop(scope);
//! assert!(state.no_message(0));
//! ```

use crate::bitmap::AtomicBitmap;
use crate::partition::{PartId, PartitionSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

#[derive(Debug, Default)]
struct SendSlot {
  sending: AtomicBool,
  messages: AtomicI64,
  initialized: AtomicBool,
}

/// Exclusive right to send on one partition; released on drop.
#[derive(Debug)]
pub struct SendScope<'a> {
  slot: &'a SendSlot,
}

impl Drop for SendScope<'_> {
  fn drop(&mut self) {
    self.slot.sending.store(false, Ordering::Release);
  }
}

/// Send/receive/cancel state of a stream's partitions.
#[derive(Debug)]
pub struct StreamState {
  parts: PartitionSet,
  slots: Vec<SendSlot>,
  send_eof: AtomicBitmap,
  receive_eof: AtomicBitmap,
  cancelled: AtomicBitmap,
}

impl StreamState {
  /// Creates state for the partitions in `parts`.
  pub fn new(parts: PartitionSet) -> Self {
    let full = parts.full_count() as usize;
    Self {
      slots: (0..full).map(|_| SendSlot::default()).collect(),
      send_eof: AtomicBitmap::new(full),
      receive_eof: AtomicBitmap::new(full),
      cancelled: AtomicBitmap::new(full),
      parts,
    }
  }

  /// Partitions this stream serves.
  pub fn parts(&self) -> &PartitionSet {
    &self.parts
  }

  fn slot(&self, partition: PartId) -> Option<&SendSlot> {
    if self.parts.is_used(partition) {
      self.slots.get(partition as usize)
    } else {
      None
    }
  }

  /// Takes the send scope of `partition` unless someone holds it.
  pub fn try_send_scope(&self, partition: PartId) -> Option<SendScope<'_>> {
    let slot = self.slot(partition)?;
    slot
      .sending
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| SendScope { slot })
  }

  /// Whether a send scope is held for `partition`.
  pub fn is_sending(&self, partition: PartId) -> bool {
    self
      .slot(partition)
      .is_some_and(|slot| slot.sending.load(Ordering::Acquire))
  }

  /// Counts one enqueued message.
  pub fn add_message(&self, partition: PartId) {
    if let Some(slot) = self.slot(partition) {
      slot.messages.fetch_add(1, Ordering::AcqRel);
    }
  }

  /// Removes `count` messages handled by a finished batch.
  pub fn sub_messages(&self, partition: PartId, count: i64) {
    if let Some(slot) = self.slot(partition) {
      slot.messages.fetch_sub(count, Ordering::AcqRel);
    }
  }

  /// Messages counted and not yet handled.
  pub fn message_count(&self, partition: PartId) -> i64 {
    self
      .slot(partition)
      .map_or(0, |slot| slot.messages.load(Ordering::Acquire))
  }

  /// Marks `partition` ready to send.
  pub fn set_initialized(&self, partition: PartId) {
    if let Some(slot) = self.slot(partition) {
      slot.initialized.store(true, Ordering::Release);
    }
  }

  /// Marks every partition ready to send.
  pub fn set_initialized_all(&self) {
    for partition in self.parts.iter() {
      self.set_initialized(partition);
    }
  }

  /// Whether `partition` is ready to send.
  pub fn is_initialized(&self, partition: PartId) -> bool {
    self
      .slot(partition)
      .is_some_and(|slot| slot.initialized.load(Ordering::Acquire))
  }

  /// Initialized and nothing pending.
  pub fn no_message(&self, partition: PartId) -> bool {
    self.is_initialized(partition) && self.message_count(partition) <= 0
  }

  /// Records that all outbound eof of `partition` was sent. Returns `true` the first time.
  pub fn set_send_eof(&self, partition: PartId) -> bool {
    !self.send_eof.set(partition as usize)
  }

  /// Whether all outbound eof of `partition` was sent.
  pub fn is_send_eof(&self, partition: PartId) -> bool {
    self.send_eof.test(partition as usize)
  }

  /// Records that all inbound eof of `partition` arrived. Returns `true` the first time.
  pub fn set_receive_eof(&self, partition: PartId) -> bool {
    !self.receive_eof.set(partition as usize)
  }

  /// Whether all inbound eof of `partition` arrived.
  pub fn is_receive_eof(&self, partition: PartId) -> bool {
    self.receive_eof.test(partition as usize)
  }

  /// Marks `partition` cancelled. Returns `true` the first time.
  pub fn set_cancelled(&self, partition: PartId) -> bool {
    !self.cancelled.set(partition as usize)
  }

  /// Whether `partition` is cancelled.
  pub fn is_cancelled(&self, partition: PartId) -> bool {
    self.cancelled.test(partition as usize)
  }
}
