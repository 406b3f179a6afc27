//! # Port Queues
//!
//! The buffer between a linked pair of ports. A queue holds one FIFO per
//! destination partition (`to`); entries remember their source partition
//! (`from`) so end-of-stream can be tracked per source.
//!
//! - [`NormalQueue`] carries payloads and eof markers. Only the destination
//!   partition's lock is taken on push or pop.
//! - [`ShuffleQueue`] carries no payloads at all. It only broadcasts eof, which
//!   makes it suitable for pure dependency edges.
//!
//! If a [`ReadinessBitmap`] is attached, it is updated under the partition
//! lock on every push and pop: `ready` while entries are pending, `finished`
//! once every source signalled eof and the queue is drained.

use crate::border::BorderState;
use crate::error::{GraphError, Result};
use crate::partition::{PartId, PartitionSet};
use crate::payload::{Payload, WirePayload};
use crate::readiness::ReadinessBitmap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::trace;

/// A queued payload in either store form.
#[derive(Debug, Clone)]
pub enum QueueItem {
  /// In-memory payload.
  Data(Payload),
  /// Serialized payload.
  Wire(WirePayload),
}

impl QueueItem {
  /// Bytes accounted against border counters; zero for in-memory payloads.
  pub fn wire_len(&self) -> usize {
    match self {
      QueueItem::Data(_) => 0,
      QueueItem::Wire(wire) => wire.len(),
    }
  }

  /// Data type name of the payload.
  pub fn type_name(&self) -> &str {
    match self {
      QueueItem::Data(payload) => payload.type_name(),
      QueueItem::Wire(wire) => wire.type_name(),
    }
  }
}

/// Outcome of a non-blocking pop.
#[derive(Debug)]
pub enum Popped {
  /// Nothing queued and not finished yet.
  Empty,
  /// A payload from `from`.
  Data {
    /// Source partition.
    from: PartId,
    /// The payload.
    item: QueueItem,
  },
  /// The eof marker of `from`.
  Eof {
    /// Source partition.
    from: PartId,
    /// Every source has signalled eof and nothing is left after this pop.
    finished: bool,
  },
  /// The partition was already finished and drained.
  Finished,
}

#[derive(Debug)]
enum Entry {
  Data { from: PartId, item: QueueItem },
  Eof { from: PartId },
}

struct PartitionQueue {
  entries: VecDeque<Entry>,
  eof: Vec<bool>,
  eof_count: usize,
}

impl PartitionQueue {
  fn new(writers: usize) -> Self {
    Self {
      entries: VecDeque::new(),
      eof: vec![false; writers],
      eof_count: 0,
    }
  }

  fn all_eof(&self) -> bool {
    self.eof_count == self.eof.len()
  }

  fn finished(&self) -> bool {
    self.entries.is_empty() && self.all_eof()
  }
}

/// Shared construction parameters of both queue variants.
struct QueueShape {
  label: String,
  to_part: PartitionSet,
  writers: PartitionSet,
  readiness: OnceLock<Arc<ReadinessBitmap>>,
  state: Option<Arc<BorderState>>,
}

impl QueueShape {
  fn data_after_eof(&self, to: PartId, from: PartId) -> GraphError {
    GraphError::DataAfterEof {
      port: self.label.clone(),
      to,
      from,
    }
  }

  fn to_index(&self, to: PartId) -> Result<usize> {
    self
      .to_part
      .used_index_of(to)
      .ok_or(GraphError::PartIdOverflow {
        id: to,
        count: self.to_part.full_count(),
      })
  }

  fn writer_index(&self, from: PartId) -> Result<usize> {
    self
      .writers
      .used_index_of(from)
      .ok_or(GraphError::PartIdOverflow {
        id: from,
        count: self.writers.full_count(),
      })
  }

  fn publish(&self, to: PartId, ready: bool, finished: bool) {
    if let Some(readiness) = self.readiness.get() {
      // `to` was validated against the same partition space the bitmap covers.
      let _ = readiness.set_state(to, ready, finished);
    }
  }

  fn attach(&self, readiness: Arc<ReadinessBitmap>, finished: impl Fn(PartId) -> bool) -> bool {
    for id in 0..readiness.partition_count() {
      let used = self.to_part.is_used(id);
      let _ = readiness.set_valid(id, used);
      let _ = readiness.set_state(id, false, used && finished(id));
    }
    self.readiness.set(readiness).is_ok()
  }
}

/// Payload-carrying queue.
pub struct NormalQueue {
  shape: QueueShape,
  partitions: Vec<Mutex<PartitionQueue>>,
  live: AtomicUsize,
  total: AtomicU64,
}

impl NormalQueue {
  /// Creates a queue for destinations `to_part` fed by the sources in `writers`.
  pub fn new(
    label: impl Into<String>,
    to_part: PartitionSet,
    writers: PartitionSet,
    state: Option<Arc<BorderState>>,
  ) -> Self {
    let partitions = (0..to_part.used_count())
      .map(|_| Mutex::new(PartitionQueue::new(writers.used_count())))
      .collect();
    Self {
      shape: QueueShape {
        label: label.into(),
        to_part,
        writers,
        readiness: OnceLock::new(),
        state,
      },
      partitions,
      live: AtomicUsize::new(0),
      total: AtomicU64::new(0),
    }
  }

  /// Appends `item` (if any) and, with `eof`, the eof marker of `from`.
  ///
  /// Returns whether partition `to` is finished afterwards. Fails with
  /// `DataAfterEof` if `from` already signalled eof for `to`.
  pub fn push(&self, to: PartId, from: PartId, item: Option<QueueItem>, eof: bool) -> Result<bool> {
    let index = self.shape.to_index(to)?;
    let writer = self.shape.writer_index(from)?;
    let mut queue = self.partitions[index].lock();
    if queue.eof[writer] {
      return Err(self.shape.data_after_eof(to, from));
    }
    Ok(self.append(&mut queue, to, from, writer, item, eof))
  }

  /// Appends the eof marker of `from` to every destination. Nothing is
  /// marked if `from` already signalled eof for any of them.
  pub fn set_eof(&self, from: PartId) -> Result<()> {
    let writer = self.shape.writer_index(from)?;
    let mut queues: Vec<_> = self.partitions.iter().map(|queue| queue.lock()).collect();
    if let Some(index) = queues.iter().position(|queue| queue.eof[writer]) {
      let to = self.shape.to_part.used_id_at(index).unwrap_or_default();
      return Err(self.shape.data_after_eof(to, from));
    }
    for (queue, to) in queues.iter_mut().zip(self.shape.to_part.iter()) {
      self.append(queue, to, from, writer, None, true);
    }
    Ok(())
  }

  fn append(
    &self,
    queue: &mut PartitionQueue,
    to: PartId,
    from: PartId,
    writer: usize,
    item: Option<QueueItem>,
    eof: bool,
  ) -> bool {
    let mut added = 0;
    if let Some(item) = item {
      if let Some(state) = &self.shape.state {
        state.on_push(item.wire_len());
      }
      queue.entries.push_back(Entry::Data { from, item });
      added += 1;
    }
    if eof {
      queue.eof[writer] = true;
      queue.eof_count += 1;
      queue.entries.push_back(Entry::Eof { from });
      added += 1;
    }
    self.live.fetch_add(added, Ordering::AcqRel);
    self.total.fetch_add(added as u64, Ordering::Relaxed);
    let finished = queue.finished();
    self.shape.publish(to, !queue.entries.is_empty(), finished);
    finished
  }

  /// Pops the oldest entry of partition `to` without blocking.
  pub fn pop(&self, to: PartId) -> Result<Popped> {
    let index = self.shape.to_index(to)?;
    let mut queue = self.partitions[index].lock();
    let Some(entry) = queue.entries.pop_front() else {
      return Ok(if queue.all_eof() {
        Popped::Finished
      } else {
        Popped::Empty
      });
    };
    self.live.fetch_sub(1, Ordering::AcqRel);
    let finished = queue.finished();
    self.shape.publish(to, !queue.entries.is_empty(), finished);
    Ok(match entry {
      Entry::Data { from, item } => {
        if let Some(state) = &self.shape.state {
          state.on_pop(item.wire_len());
        }
        Popped::Data { from, item }
      }
      Entry::Eof { from } => {
        trace!(queue = %self.shape.label, to, from, finished, "eof popped");
        Popped::Eof { from, finished }
      }
    })
  }

  /// Whether partition `to` is finished and drained.
  pub fn is_finished(&self, to: PartId) -> Result<bool> {
    let index = self.shape.to_index(to)?;
    Ok(self.partitions[index].lock().finished())
  }

  /// Whether every source signalled eof for `to`, drained or not.
  pub fn is_closed(&self, to: PartId) -> Result<bool> {
    let index = self.shape.to_index(to)?;
    Ok(self.partitions[index].lock().all_eof())
  }

  /// Entries currently queued across all partitions.
  pub fn live(&self) -> usize {
    self.live.load(Ordering::Acquire)
  }

  /// Entries ever queued.
  pub fn total(&self) -> u64 {
    self.total.load(Ordering::Relaxed)
  }

  fn attach_readiness(&self, readiness: Arc<ReadinessBitmap>) -> bool {
    let shape = &self.shape;
    shape.attach(readiness, |id| {
      shape
        .to_index(id)
        .map(|index| self.partitions[index].lock().finished())
        .unwrap_or(false)
    })
  }
}

/// Eof-only queue for dependency edges.
pub struct ShuffleQueue {
  shape: QueueShape,
  eof: Vec<Mutex<PartitionQueue>>,
}

impl ShuffleQueue {
  /// Creates a broadcast queue for destinations `to_part` fed by `writers`.
  pub fn new(
    label: impl Into<String>,
    to_part: PartitionSet,
    writers: PartitionSet,
    state: Option<Arc<BorderState>>,
  ) -> Self {
    let eof = (0..to_part.used_count())
      .map(|_| Mutex::new(PartitionQueue::new(writers.used_count())))
      .collect();
    Self {
      shape: QueueShape {
        label: label.into(),
        to_part,
        writers,
        readiness: OnceLock::new(),
        state,
      },
      eof,
    }
  }

  /// Records eof of `from` for every destination partition. Nothing is
  /// marked if `from` already signalled eof for any of them.
  ///
  /// Returns the destinations that became finished.
  pub fn set_eof(&self, from: PartId) -> Result<Vec<PartId>> {
    let writer = self.shape.writer_index(from)?;
    let mut queues: Vec<_> = self.eof.iter().map(|queue| queue.lock()).collect();
    if let Some(index) = queues.iter().position(|queue| queue.eof[writer]) {
      let to = self.shape.to_part.used_id_at(index).unwrap_or_default();
      return Err(self.shape.data_after_eof(to, from));
    }
    let mut finished = Vec::new();
    for (queue, to) in queues.iter_mut().zip(self.shape.to_part.iter()) {
      queue.eof[writer] = true;
      queue.eof_count += 1;
      if queue.all_eof() {
        finished.push(to);
      }
      self.shape.publish(to, false, queue.all_eof());
    }
    Ok(finished)
  }

  /// Whether every source signalled eof for `to`.
  pub fn is_finished(&self, to: PartId) -> Result<bool> {
    let index = self.shape.to_index(to)?;
    Ok(self.eof[index].lock().all_eof())
  }

  fn attach_readiness(&self, readiness: Arc<ReadinessBitmap>) -> bool {
    let shape = &self.shape;
    shape.attach(readiness, |id| {
      shape
        .to_index(id)
        .map(|index| self.eof[index].lock().all_eof())
        .unwrap_or(false)
    })
  }
}

/// Queue between two linked ports.
pub enum PortQueue {
  /// Payload-carrying FIFO.
  Normal(NormalQueue),
  /// Eof-only broadcast.
  Shuffle(ShuffleQueue),
}

impl PortQueue {
  /// See [`NormalQueue::push`]. A shuffle queue only accepts bare eof.
  pub fn push(&self, to: PartId, from: PartId, item: Option<QueueItem>, eof: bool) -> Result<bool> {
    match self {
      PortQueue::Normal(queue) => queue.push(to, from, item, eof),
      PortQueue::Shuffle(_) => Err(GraphError::Unsupported("push on a shuffle queue")),
    }
  }

  /// See [`NormalQueue::pop`].
  pub fn pop(&self, to: PartId) -> Result<Popped> {
    match self {
      PortQueue::Normal(queue) => queue.pop(to),
      PortQueue::Shuffle(_) => Err(GraphError::Unsupported("pop on a shuffle queue")),
    }
  }

  /// Signals eof of `from` to every destination partition.
  ///
  /// A shuffle queue broadcasts in one step; a normal queue appends one
  /// marker per destination so it is ordered after earlier payloads.
  pub fn set_eof(&self, from: PartId) -> Result<()> {
    match self {
      PortQueue::Normal(queue) => queue.set_eof(from),
      PortQueue::Shuffle(queue) => queue.set_eof(from).map(|_| ()),
    }
  }

  /// Whether destination `to` is finished and drained.
  pub fn is_finished(&self, to: PartId) -> Result<bool> {
    match self {
      PortQueue::Normal(queue) => queue.is_finished(to),
      PortQueue::Shuffle(queue) => queue.is_finished(to),
    }
  }

  /// Whether every source signalled eof for `to`; entries may still be queued.
  pub fn is_closed(&self, to: PartId) -> Result<bool> {
    match self {
      PortQueue::Normal(queue) => queue.is_closed(to),
      PortQueue::Shuffle(queue) => queue.is_finished(to),
    }
  }

  /// Destination partitions.
  pub fn to_part(&self) -> &PartitionSet {
    match self {
      PortQueue::Normal(queue) => &queue.shape.to_part,
      PortQueue::Shuffle(queue) => &queue.shape.to_part,
    }
  }

  /// Source partitions expected to signal eof.
  pub fn writers(&self) -> &PartitionSet {
    match self {
      PortQueue::Normal(queue) => &queue.shape.writers,
      PortQueue::Shuffle(queue) => &queue.shape.writers,
    }
  }

  /// Whether this is an eof-only queue.
  pub fn is_shuffle(&self) -> bool {
    matches!(self, PortQueue::Shuffle(_))
  }

  /// Attaches the consumer's readiness bitmap and initializes it from the
  /// current queue state. Returns `false` if one was already attached.
  pub fn attach_readiness(&self, readiness: Arc<ReadinessBitmap>) -> bool {
    match self {
      PortQueue::Normal(queue) => queue.attach_readiness(readiness),
      PortQueue::Shuffle(queue) => queue.attach_readiness(readiness),
    }
  }
}
