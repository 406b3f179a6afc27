//! Runs whose subgraphs all execute in the calling process.

mod common;

use common::{engine, numbers, values};
use gridweave::domain::user::SinkPoll;
use gridweave::engine::{Engine, RunOptions};
use gridweave::error::{ErrorCode, GraphError};
use gridweave::graph::{GraphDef, NodeDef, SubgraphDef};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

fn pipeline(count: i64) -> GraphDef {
  GraphDef::new("pipeline")
    .subgraph(
      SubgraphDef::local(0)
        .node(numbers("numbers", count))
        .node(NodeDef::new("double", "double")),
    )
    .subgraph(SubgraphDef::local(1).node(NodeDef::new("sum", "sum")))
    .edge("numbers", "out", "double", "in")
    .edge("double", "out", "sum", "in")
    .output("doubled", "double", "out")
    .output("total", "sum", "out")
}

#[test]
fn test_pipeline_across_local_subgraphs() {
  let engine = engine();
  let run = engine.run(pipeline(4), RunOptions::default()).unwrap();
  let mut doubled = Vec::new();
  let mut total = Vec::new();
  for item in run.collect().unwrap() {
    let value = *item.payload.downcast_ref::<i64>().unwrap();
    match item.output.as_str() {
      "doubled" => doubled.push(value),
      "total" => total.push(value),
      other => panic!("unexpected output {}", other),
    }
  }
  assert_eq!(doubled, vec![2, 4, 6, 8]);
  assert_eq!(total, vec![20]);

  let summary = run.wait();
  assert!(summary.is_ok(), "{:?}", summary);
  assert!(summary.traces.iter().any(|trace| trace.message == "sum 20"));
  assert!(summary.metrics["double"].compute_count >= 1);
  assert!(run.is_completed());
}

#[test]
fn test_empty_source_still_finishes() {
  let engine = engine();
  let run = engine.run(pipeline(0), RunOptions::default()).unwrap();
  assert_eq!(values(&run), vec![0]);
  assert!(run.wait().is_ok());
}

#[test]
fn test_data_readable_after_completion() {
  let engine = engine();
  let graph = GraphDef::new("late")
    .subgraph(SubgraphDef::local(0).node(numbers("numbers", 2)))
    .output("values", "numbers", "out");
  let run = engine.run(graph, RunOptions::default()).unwrap();
  assert!(run.wait_timeout(Duration::from_secs(5)).is_some());
  assert_eq!(values(&run), vec![1, 2]);
  assert!(matches!(run.try_next_data().unwrap(), SinkPoll::Finished));
}

#[test]
fn test_data_callback_drives_draining() {
  let engine = engine();
  let run = engine.run(pipeline(4), RunOptions::default()).unwrap();
  let calls = Arc::new(AtomicUsize::new(0));
  let (tx, rx) = mpsc::channel();
  let counter = Arc::clone(&calls);
  run.set_data_callback(Arc::new(move || {
    counter.fetch_add(1, Ordering::AcqRel);
    let _ = tx.send(());
  }));

  let mut seen = Vec::new();
  loop {
    match run.try_next_data().unwrap() {
      SinkPoll::Data(item) => seen.push(*item.payload.downcast_ref::<i64>().unwrap()),
      SinkPoll::Pending => rx
        .recv_timeout(Duration::from_secs(5))
        .expect("callback after new data"),
      SinkPoll::Finished => break,
    }
  }
  seen.sort_unstable();
  assert_eq!(seen, vec![2, 4, 6, 8, 20]);
  assert!(calls.load(Ordering::Acquire) >= 1);
  assert!(run.wait().is_ok());
}

#[test]
fn test_kernel_failure_fails_run() {
  let engine = engine();
  let graph = GraphDef::new("failing")
    .subgraph(
      SubgraphDef::local(0)
        .node(numbers("numbers", 3))
        .node(NodeDef::new("broken", "fail")),
    )
    .edge("numbers", "out", "broken", "in")
    .output("values", "broken", "out");
  let run = engine.run(graph, RunOptions::default()).unwrap();
  assert!(matches!(run.collect(), Err(GraphError::Kernel { .. })));
  let summary = run.wait();
  assert_eq!(summary.code, ErrorCode::Kernel);
  assert!(summary.message.contains("refused"));
}

#[test]
fn test_unknown_kernel_is_rejected() {
  let engine = engine();
  let graph = GraphDef::new("unknown")
    .subgraph(SubgraphDef::local(0).node(NodeDef::new("mystery", "mystery")))
    .output("values", "mystery", "out");
  assert!(matches!(
    engine.run(graph, RunOptions::default()),
    Err(GraphError::InvalidGraph(_))
  ));
}

#[test]
fn test_duplicate_edge_is_rejected() {
  let engine = engine();
  let graph = GraphDef::new("twice")
    .subgraph(
      SubgraphDef::local(0)
        .node(numbers("numbers", 1))
        .node(NodeDef::new("double", "double")),
    )
    .edge("numbers", "out", "double", "in")
    .edge("numbers", "out", "double", "in");
  assert!(matches!(
    engine.run(graph, RunOptions::default()),
    Err(GraphError::PortAlreadyLinked(_))
  ));
}

#[test]
fn test_runs_share_an_engine() {
  let engine = engine();
  let runs: Vec<_> = (1..=4)
    .map(|count| {
      engine
        .run(pipeline(count), RunOptions::default().with_name(format!("run-{}", count)))
        .unwrap()
    })
    .collect();
  for (run, count) in runs.iter().zip(1..=4_i64) {
    let total: i64 = (1..=count).map(|value| value * 2).sum();
    assert!(values(run).contains(&total));
    assert!(run.wait().is_ok());
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_async_on_borrowed_runtime() {
  let engine = Engine::with_handle(common::config(), tokio::runtime::Handle::current()).unwrap();
  common::register(&engine);
  let run = engine.run(pipeline(3), RunOptions::default()).unwrap();
  let summary = tokio::time::timeout(Duration::from_secs(5), run.wait_async())
    .await
    .unwrap();
  assert!(summary.is_ok());
  let mut seen = Vec::new();
  while let SinkPoll::Data(item) = run.try_next_data().unwrap() {
    seen.push(*item.payload.downcast_ref::<i64>().unwrap());
  }
  seen.sort_unstable();
  assert_eq!(seen, vec![2, 4, 6, 12]);
}
