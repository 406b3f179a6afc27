//! # User Sink
//!
//! The caller's end of a run. Every graph output is an edge into the user
//! subgraph; its ports are read here, round-robin over outputs and
//! partitions. The domain finishes as soon as every output received all of
//! its eof markers, so a run can complete before the caller read its data;
//! what is queued stays readable through the run handle.

use super::{Domain, DomainCore, DomainKind};
use crate::bitmap::AtomicBitmap;
use crate::border::USER_SUBGRAPH;
use crate::error::{GraphError, Result};
use crate::partition::PartId;
use crate::payload::Payload;
use crate::port::{Port, PortData, PortListener};
use crate::run::GraphRun;
use crate::worker::Worker;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// One payload read from a graph output.
#[derive(Debug, Clone)]
pub struct SinkItem {
  /// Output name.
  pub output: String,
  /// Partition it was produced on.
  pub partition: PartId,
  /// The payload.
  pub payload: Payload,
}

/// Outcome of a non-blocking read.
#[derive(Debug)]
pub enum SinkPoll {
  /// A payload.
  Data(SinkItem),
  /// Nothing right now.
  Pending,
  /// Every output is drained.
  Finished,
}

/// Callback invoked, on the run's worker, when output data arrives.
pub type DataCallback = Arc<dyn Fn() + Send + Sync>;

struct SinkInput {
  port: Arc<Port>,
  drained: AtomicBitmap,
  remaining: AtomicUsize,
}

impl SinkInput {
  fn output(&self) -> &str {
    &self.port.key().node
  }

  fn is_drained(&self) -> bool {
    self.remaining.load(Ordering::Acquire) == 0
  }

  fn is_closed(&self) -> bool {
    let Ok(queue) = self.port.queue() else {
      return true;
    };
    queue
      .to_part()
      .iter()
      .all(|to| queue.is_closed(to).unwrap_or(true))
  }

  fn poll(&self) -> Result<Option<SinkItem>> {
    for partition in self.port.partitions()?.iter() {
      if self.drained.test(partition as usize) {
        continue;
      }
      match self.port.get_data(partition)? {
        PortData::Data { payload, .. } => {
          return Ok(Some(SinkItem {
            output: self.output().to_string(),
            partition,
            payload,
          }));
        }
        PortData::Eof => {
          if !self.drained.set(partition as usize) {
            self.remaining.fetch_sub(1, Ordering::AcqRel);
          }
        }
        PortData::NoData => {}
      }
    }
    Ok(None)
  }
}

/// The caller's end of a run.
pub struct UserDomain {
  core: DomainCore,
  inputs: Vec<SinkInput>,
  cursor: AtomicUsize,
  closed: AtomicBool,
  error: Mutex<Option<GraphError>>,
  version: Mutex<u64>,
  arrived: Condvar,
  callback: Mutex<Option<DataCallback>>,
}

impl UserDomain {
  /// Sink over the ports of the user subgraph's input borders.
  pub(crate) fn new(ports: Vec<Arc<Port>>, worker: Arc<Worker>) -> Result<Self> {
    let mut inputs = Vec::with_capacity(ports.len());
    for port in ports {
      let parts = port.partitions()?;
      inputs.push(SinkInput {
        drained: AtomicBitmap::new(parts.full_count() as usize),
        remaining: AtomicUsize::new(parts.used_count()),
        port,
      });
    }
    Ok(Self {
      core: DomainCore::new("user", DomainKind::User, USER_SUBGRAPH, worker),
      inputs,
      cursor: AtomicUsize::new(0),
      closed: AtomicBool::new(false),
      error: Mutex::new(None),
      version: Mutex::new(0),
      arrived: Condvar::new(),
      callback: Mutex::new(None),
    })
  }

  /// Installs the push listener on every sink port.
  pub(crate) fn listen(self: &Arc<Self>) {
    for input in &self.inputs {
      input.port.set_listener(Arc::new(SinkListener {
        user: Arc::downgrade(self),
      }));
    }
  }

  /// Output names, one per sink port.
  pub fn outputs(&self) -> Vec<String> {
    self
      .inputs
      .iter()
      .map(|input| input.output().to_string())
      .collect()
  }

  /// Installs a callback run on the worker whenever output data arrives.
  pub fn set_data_callback(&self, callback: DataCallback) {
    *self.callback.lock() = Some(callback);
    self.wake();
  }

  /// Reads the next payload without blocking.
  ///
  /// Once nothing is left, returns the run's error if it failed, `Finished`
  /// if every output drained, `Pending` otherwise.
  pub fn try_next_data(&self) -> Result<SinkPoll> {
    let count = self.inputs.len();
    let start = self.cursor.load(Ordering::Acquire);
    for offset in 0..count {
      let index = (start + offset) % count;
      let input = &self.inputs[index];
      if input.is_drained() {
        continue;
      }
      if let Some(item) = input.poll()? {
        self.cursor.store((index + 1) % count, Ordering::Release);
        return Ok(SinkPoll::Data(item));
      }
    }
    if let Some(error) = self.error.lock().clone() {
      return Err(error);
    }
    if self.inputs.iter().all(SinkInput::is_drained) {
      return Ok(SinkPoll::Finished);
    }
    Ok(SinkPoll::Pending)
  }

  /// Blocks until a payload arrives, every output drained, or the run fails.
  ///
  /// Returns `None` once drained. Must not be called from the run's runtime.
  pub fn next_data(&self) -> Result<Option<SinkItem>> {
    self.next_data_timeout(None)
  }

  /// Like [`UserDomain::next_data`], failing with `Timeout` if nothing
  /// happens for `timeout`.
  pub fn next_data_timeout(&self, timeout: Option<Duration>) -> Result<Option<SinkItem>> {
    loop {
      let seen = *self.version.lock();
      match self.try_next_data()? {
        SinkPoll::Data(item) => return Ok(Some(item)),
        SinkPoll::Finished => return Ok(None),
        SinkPoll::Pending => {}
      }
      let mut version = self.version.lock();
      if *version == seen {
        match timeout {
          Some(timeout) => {
            if self.arrived.wait_for(&mut version, timeout).timed_out() {
              return Err(GraphError::Timeout);
            }
          }
          None => self.arrived.wait(&mut version),
        }
      }
    }
  }

  /// Stores the run's error; reads fail with it once the queues are empty.
  pub(crate) fn record_error(&self, error: &GraphError) {
    let mut stored = self.error.lock();
    if stored.is_none() {
      *stored = Some(error.clone());
    }
    drop(stored);
    self.wake();
  }

  pub(crate) fn wake(&self) {
    {
      let mut version = self.version.lock();
      *version += 1;
    }
    self.arrived.notify_all();
    let callback = self.callback.lock().clone();
    if let Some(callback) = callback {
      self.core.worker().schedule_fn(move || callback(), false);
    }
  }

  fn on_push(&self) {
    self.wake();
    self.check_closed();
  }

  fn check_closed(&self) {
    if self.inputs.iter().all(SinkInput::is_closed) && !self.closed.swap(true, Ordering::AcqRel) {
      self.notify_finish(None, true);
    }
  }
}

impl Domain for UserDomain {
  fn core(&self) -> &DomainCore {
    &self.core
  }

  fn run(&self, _run: &Arc<GraphRun>) -> Result<()> {
    self.check_closed();
    Ok(())
  }

  fn on_terminate(&self, _run: Option<&Arc<GraphRun>>, error: Option<&GraphError>) {
    match error {
      Some(error) => self.record_error(error),
      None => self.wake(),
    }
  }
}

struct SinkListener {
  user: Weak<UserDomain>,
}

impl PortListener for SinkListener {
  fn on_push(&self, _port: &Port, _to: PartId) {
    if let Some(user) = self.user.upgrade() {
      user.on_push();
    }
  }
}
