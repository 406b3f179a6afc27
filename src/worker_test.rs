//! Tests for the worker: scheduling and the outstanding count.

use crate::worker::{Worker, WorkerConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

fn worker(max_inline_depth: usize) -> Arc<Worker> {
  Worker::new(
    "test",
    Handle::current(),
    WorkerConfig {
      max_drainers: 2,
      max_inline_depth,
    },
  )
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn test_inline_runs_on_caller() {
  let worker = worker(4);
  let ran = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&ran);
  worker.schedule_fn(move || {
    counter.fetch_add(1, Ordering::AcqRel);
  }, true);
  assert_eq!(ran.load(Ordering::Acquire), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queued_items_all_run() {
  let worker = worker(4);
  let (tx, mut rx) = mpsc::unbounded_channel();
  for index in 0..200 {
    let tx = tx.clone();
    worker.schedule_fn(move || {
      let _ = tx.send(index);
    }, false);
  }
  drop(tx);
  let mut seen = Vec::new();
  while let Ok(Some(index)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
    seen.push(index);
  }
  seen.sort_unstable();
  assert_eq!(seen, (0..200).collect::<Vec<_>>());
}

fn nest(worker: Arc<Worker>, level: usize, ran: Arc<AtomicUsize>, done: mpsc::UnboundedSender<()>) {
  let next = Arc::clone(&worker);
  worker.schedule_fn(move || {
    ran.fetch_add(1, Ordering::AcqRel);
    if level < 20 {
      nest(next, level + 1, ran, done);
    } else {
      let _ = done.send(());
    }
  }, true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inline_depth_is_bounded() {
  let worker = worker(3);
  let ran = Arc::new(AtomicUsize::new(0));
  let (tx, mut rx) = mpsc::unbounded_channel();
  nest(Arc::clone(&worker), 0, Arc::clone(&ran), tx);
  assert!(ran.load(Ordering::Acquire) >= 3);
  tokio::time::timeout(Duration::from_secs(5), rx.recv())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(ran.load(Ordering::Acquire), 21);
}

// ============================================================================
// Outstanding count
// ============================================================================

#[tokio::test]
async fn test_completes_when_count_returns_to_zero() {
  let worker = worker(4);
  let fired = Arc::new(AtomicUsize::new(0));
  let hook = Arc::clone(&fired);
  worker.on_complete(move || {
    hook.fetch_add(1, Ordering::AcqRel);
  });
  worker.acquire();
  worker.acquire();
  worker.release();
  assert!(!worker.is_completed());
  assert_eq!(worker.outstanding(), 1);
  worker.release();
  assert!(worker.is_completed());
  worker.release();
  assert_eq!(fired.load(Ordering::Acquire), 1);
}

#[tokio::test]
async fn test_release_before_acquire_does_not_complete() {
  let worker = worker(4);
  worker.release();
  assert!(!worker.is_completed());
  assert_eq!(worker.outstanding(), 0);
}
