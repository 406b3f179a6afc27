//! Tests for domain reference counting against the worker.

use crate::domain::{Domain, DomainCore, DomainKind};
use crate::error::{GraphError, Result};
use crate::run::GraphRun;
use crate::worker::{Worker, WorkerConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::runtime::Handle;

struct Recorder {
  core: DomainCore,
  terminations: Mutex<Vec<Option<GraphError>>>,
}

impl Recorder {
  fn new(name: &str, worker: &Arc<Worker>) -> Self {
    Self {
      core: DomainCore::new(name, DomainKind::Local, 0, Arc::clone(worker)),
      terminations: Mutex::new(Vec::new()),
    }
  }
}

impl Domain for Recorder {
  fn core(&self) -> &DomainCore {
    &self.core
  }

  fn run(&self, _run: &Arc<GraphRun>) -> Result<()> {
    Ok(())
  }

  fn on_terminate(&self, _run: Option<&Arc<GraphRun>>, error: Option<&GraphError>) {
    self.terminations.lock().push(error.cloned());
  }
}

fn worker() -> (Arc<Worker>, Arc<AtomicUsize>) {
  let worker = Worker::new("domains", Handle::current(), WorkerConfig::default());
  let completed = Arc::new(AtomicUsize::new(0));
  let hook = Arc::clone(&completed);
  worker.on_complete(move || {
    hook.fetch_add(1, Ordering::AcqRel);
  });
  (worker, completed)
}

#[tokio::test]
async fn test_first_acquire_counts_once() {
  let (worker, _) = worker();
  let domain = Recorder::new("a", &worker);
  domain.acquire("init");
  domain.acquire("stream");
  assert_eq!(domain.core().refs(), 2);
  assert_eq!(worker.outstanding(), 1);
  domain.release("stream");
  assert_eq!(worker.outstanding(), 1);
  assert!(!domain.core().is_detached());
  domain.release("init");
  assert!(domain.core().is_detached());
  assert_eq!(worker.outstanding(), 0);
}

#[tokio::test]
async fn test_acquire_after_detach_is_ignored() {
  let (worker, completed) = worker();
  let domain = Recorder::new("a", &worker);
  domain.acquire("init");
  domain.release("init");
  assert_eq!(completed.load(Ordering::Acquire), 1);
  domain.acquire("late");
  assert_eq!(domain.core().refs(), 0);
  assert_eq!(worker.outstanding(), 0);
  domain.release("late");
  assert_eq!(completed.load(Ordering::Acquire), 1);
}

#[tokio::test]
async fn test_notify_finish_runs_once() {
  let (worker, completed) = worker();
  let domain = Recorder::new("a", &worker);
  domain.acquire("init");
  domain.notify_finish(Some(&GraphError::Timeout), true);
  domain.notify_finish(None, true);
  assert!(domain.core().is_terminated());
  assert_eq!(*domain.terminations.lock(), vec![Some(GraphError::Timeout)]);
  assert_eq!(completed.load(Ordering::Acquire), 1);
}

#[tokio::test]
async fn test_run_completes_after_last_domain() {
  let (worker, completed) = worker();
  let first = Recorder::new("first", &worker);
  let second = Recorder::new("second", &worker);
  first.acquire("init");
  second.acquire("init");
  second.acquire("stream");
  first.notify_finish(None, true);
  assert_eq!(completed.load(Ordering::Acquire), 0);
  second.notify_finish(None, true);
  assert_eq!(completed.load(Ordering::Acquire), 0);
  assert_eq!(worker.outstanding(), 1);
  second.release("stream");
  assert_eq!(completed.load(Ordering::Acquire), 1);
  assert_eq!(second.core().kind(), DomainKind::Local);
}
