//! # Worker
//!
//! Scheduling context of one run. Ready work goes onto a lock-free queue that
//! is drained by tasks on the tokio runtime; a short chain of follow-up work
//! may instead run inline on the calling thread, bounded by a per-thread depth.
//!
//! The worker also keeps the run's outstanding count. Domains add to it when
//! first acquired and take from it when released for the last time; the run is
//! complete exactly when the count drops back to zero after having been
//! non-zero.

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use serde::Deserialize;
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::runtime::Handle;
use tracing::{trace, warn};

thread_local! {
  static INLINE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Worker tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Upper bound on concurrent drain tasks per run.
  pub max_drainers: usize,
  /// How deep inline execution may nest on one thread.
  pub max_inline_depth: usize,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      max_drainers: 4,
      max_inline_depth: 8,
    }
  }
}

/// A unit of non-blocking work.
pub trait WorkItem: Send {
  /// Runs the item.
  fn process(self: Box<Self>);
}

impl<F> WorkItem for F
where
  F: FnOnce() + Send,
{
  fn process(self: Box<Self>) {
    (*self)()
  }
}

type CompletionHook = Box<dyn FnOnce() + Send>;

/// Per-run scheduler and completion counter.
pub struct Worker {
  name: String,
  handle: Handle,
  config: WorkerConfig,
  queue: SegQueue<Box<dyn WorkItem>>,
  drainers: AtomicUsize,
  outstanding: AtomicUsize,
  started: AtomicBool,
  completed: AtomicBool,
  on_complete: Mutex<Option<CompletionHook>>,
}

impl Worker {
  /// Creates a worker draining on `handle`.
  pub fn new(name: impl Into<String>, handle: Handle, config: WorkerConfig) -> Arc<Self> {
    Arc::new(Self {
      name: name.into(),
      handle,
      config,
      queue: SegQueue::new(),
      drainers: AtomicUsize::new(0),
      outstanding: AtomicUsize::new(0),
      started: AtomicBool::new(false),
      completed: AtomicBool::new(false),
      on_complete: Mutex::new(None),
    })
  }

  /// Runtime the worker drains on.
  pub fn handle(&self) -> &Handle {
    &self.handle
  }

  /// Installs the hook that runs once when the outstanding count returns to zero.
  pub fn on_complete(&self, hook: impl FnOnce() + Send + 'static) {
    *self.on_complete.lock() = Some(Box::new(hook));
  }

  /// Schedules `item`. With `allow_inline` it runs on this thread unless the
  /// inline depth limit is reached.
  pub fn schedule(self: &Arc<Self>, item: Box<dyn WorkItem>, allow_inline: bool) {
    if allow_inline && INLINE_DEPTH.with(Cell::get) < self.config.max_inline_depth {
      Self::run_item(item);
      return;
    }
    self.queue.push(item);
    self.spawn_drainer();
  }

  /// Schedules a closure. See [`Worker::schedule`].
  pub fn schedule_fn(self: &Arc<Self>, f: impl FnOnce() + Send + 'static, allow_inline: bool) {
    self.schedule(Box::new(f), allow_inline);
  }

  fn run_item(item: Box<dyn WorkItem>) {
    INLINE_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let _depth = scopeguard::guard((), |_| {
      INLINE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    });
    item.process();
  }

  fn claim_drainer(&self) -> bool {
    let mut current = self.drainers.load(Ordering::Acquire);
    loop {
      if current >= self.config.max_drainers.max(1) {
        return false;
      }
      match self.drainers.compare_exchange_weak(
        current,
        current + 1,
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return true,
        Err(observed) => current = observed,
      }
    }
  }

  fn spawn_drainer(self: &Arc<Self>) {
    if !self.claim_drainer() {
      return;
    }
    let worker = Arc::clone(self);
    self.handle.spawn(async move {
      worker.drain();
    });
  }

  fn drain(&self) {
    loop {
      while let Some(item) = self.queue.pop() {
        Self::run_item(item);
      }
      self.drainers.fetch_sub(1, Ordering::AcqRel);
      // An item pushed after the last pop but before the release above found
      // every drainer slot taken; pick it up here.
      if self.queue.is_empty() || !self.claim_drainer() {
        return;
      }
    }
  }

  /// Items waiting to be drained.
  pub fn pending(&self) -> usize {
    self.queue.len()
  }

  /// Adds one to the outstanding count.
  pub fn acquire(&self) {
    self.started.store(true, Ordering::Release);
    self.outstanding.fetch_add(1, Ordering::AcqRel);
  }

  /// Takes one from the outstanding count; completes the run at zero.
  pub fn release(&self) {
    let previous = self
      .outstanding
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
    match previous {
      Ok(1) => self.complete(),
      Ok(_) => {}
      Err(_) => warn!(worker = %self.name, "release on a worker with nothing outstanding"),
    }
  }

  /// Current outstanding count.
  pub fn outstanding(&self) -> usize {
    self.outstanding.load(Ordering::Acquire)
  }

  /// Whether the outstanding count returned to zero.
  pub fn is_completed(&self) -> bool {
    self.completed.load(Ordering::Acquire)
  }

  fn complete(&self) {
    if !self.started.load(Ordering::Acquire) || self.completed.swap(true, Ordering::AcqRel) {
      return;
    }
    trace!(worker = %self.name, "worker completed");
    let hook = self.on_complete.lock().take();
    if let Some(hook) = hook {
      hook();
    }
  }
}

impl fmt::Debug for Worker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Worker")
      .field("name", &self.name)
      .field("pending", &self.queue.len())
      .field("outstanding", &self.outstanding())
      .field("completed", &self.is_completed())
      .finish()
  }
}
