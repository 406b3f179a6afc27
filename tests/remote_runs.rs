//! Runs with remote subgraphs, served by a second engine over the loopback
//! connector.

mod common;

use common::{engine, numbers, values};
use gridweave::engine::{Engine, RunOptions};
use gridweave::error::{ErrorCode, GraphError};
use gridweave::graph::{GraphDef, NodeDef, SubgraphDef};
use gridweave::partition::{PartId, PartitionDescriptor};
use gridweave::transport::{
  ConnectRequest, Connector, LoopbackConnector, RpcStream, StreamReceiver, TransportError,
};
use gridweave::wire::StreamMessage;
use std::sync::Arc;
use std::time::Duration;

/// A client engine whose remote subgraphs run on a fresh server engine.
fn client() -> (Engine, Arc<Engine>) {
  let server = Arc::new(engine());
  let client = engine();
  client.set_connector(Arc::new(LoopbackConnector::new(Arc::clone(&server))));
  (client, server)
}

fn remote_double(partitions: u32, count: i64) -> GraphDef {
  GraphDef::new("remote-double")
    .subgraph(SubgraphDef::local(0).node(numbers("numbers", count)))
    .subgraph(
      SubgraphDef::remote(1, PartitionDescriptor::all(partitions))
        .node(NodeDef::new("double", "double")),
    )
    .edge("numbers", "out", "double", "in")
    .output("doubled", "double", "out")
}

// ============================================================================
// Data flow
// ============================================================================

#[test]
fn test_local_to_remote_and_back() {
  let (client, _server) = client();
  let run = client.run(remote_double(1, 3), RunOptions::default()).unwrap();
  assert_eq!(values(&run), vec![2, 4, 6]);
  let summary = run.wait();
  assert!(summary.is_ok(), "{:?}", summary);
  // Server metrics come back with the finalize summary.
  assert!(summary.metrics.contains_key("double"));
}

#[test]
fn test_partitions_split_the_data() {
  let (client, _server) = client();
  let run = client.run(remote_double(2, 4), RunOptions::default()).unwrap();
  let items = run.collect().unwrap();
  let mut by_partition = [Vec::new(), Vec::new()];
  for item in &items {
    by_partition[item.partition as usize].push(*item.payload.downcast_ref::<i64>().unwrap());
  }
  by_partition.iter_mut().for_each(|values| values.sort_unstable());
  assert_eq!(by_partition, [vec![2, 6], vec![4, 8]]);
  assert!(run.wait().is_ok());
}

#[test]
fn test_explicit_partition_subset() {
  let (client, _server) = client();
  let graph = GraphDef::new("subset")
    .subgraph(SubgraphDef::local(0).node(numbers("numbers", 4)))
    .subgraph(
      SubgraphDef::remote(
        1,
        PartitionDescriptor {
          part_count: 8,
          part_ids: vec![3, 5],
        },
      )
      .node(NodeDef::new("double", "double")),
    )
    .edge("numbers", "out", "double", "in")
    .output("doubled", "double", "out");
  let run = client.run(graph, RunOptions::default()).unwrap();
  let items = run.collect().unwrap();
  assert_eq!(items.len(), 4);
  assert!(items.iter().all(|item| item.partition == 3 || item.partition == 5));
  assert!(run.wait().is_ok());
}

#[test]
fn test_remote_result_feeds_local_node() {
  let (client, _server) = client();
  let graph = remote_double(2, 4)
    .subgraph(SubgraphDef::local(2).node(NodeDef::new("sum", "sum")))
    .edge("double", "out", "sum", "in")
    .output("total", "sum", "out");
  let run = client.run(graph, RunOptions::default()).unwrap();
  let items = run.collect().unwrap();
  let total: Vec<i64> = items
    .iter()
    .filter(|item| item.output == "total")
    .filter_map(|item| item.payload.downcast_ref::<i64>().copied())
    .collect();
  assert_eq!(total, vec![20]);
  assert!(run.wait().is_ok());
}

#[test]
fn test_remote_to_remote_relay() {
  let (client, _server) = client();
  let graph = GraphDef::new("relay")
    .subgraph(SubgraphDef::local(0).node(numbers("numbers", 3)))
    .subgraph(SubgraphDef::remote(1, PartitionDescriptor::all(1)).node(NodeDef::new("first", "double")))
    .subgraph(SubgraphDef::remote(2, PartitionDescriptor::all(1)).node(NodeDef::new("second", "double")))
    .edge("numbers", "out", "first", "in")
    .edge("first", "out", "second", "in")
    .output("quadrupled", "second", "out");
  let run = client.run(graph, RunOptions::default()).unwrap();
  assert_eq!(values(&run), vec![4, 8, 12]);
  assert!(run.wait().is_ok());
}

#[test]
fn test_remote_source_relays_to_remote() {
  let graph = GraphDef::new("remote-source")
    .subgraph(SubgraphDef::remote(1, PartitionDescriptor::all(1)).node(numbers("numbers", 50)))
    .subgraph(SubgraphDef::remote(2, PartitionDescriptor::all(4)).node(NodeDef::new("double", "double")))
    .edge("numbers", "out", "double", "in")
    .output("doubled", "double", "out");
  let expected: Vec<i64> = (1..=50).map(|value| value * 2).collect();
  // The source starts sending as soon as its stream opens, which can be
  // before the client has bound the second stream.
  for _ in 0..10 {
    let (client, _server) = client();
    let run = client.run(graph.clone(), RunOptions::default()).unwrap();
    assert_eq!(values(&run), expected);
    let summary = run.wait();
    assert!(summary.is_ok(), "{:?}", summary);
  }
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_remote_kernel_failure_reaches_client() {
  let (client, _server) = client();
  let graph = GraphDef::new("remote-fail")
    .subgraph(SubgraphDef::local(0).node(numbers("numbers", 2)))
    .subgraph(SubgraphDef::remote(1, PartitionDescriptor::all(1)).node(NodeDef::new("broken", "fail")))
    .edge("numbers", "out", "broken", "in")
    .output("values", "broken", "out");
  let run = client.run(graph, RunOptions::default()).unwrap();
  assert!(run.collect().is_err());
  let summary = run.wait();
  assert_eq!(summary.code, ErrorCode::Kernel);
  assert!(summary.message.contains("refused"));
}

#[test]
fn test_missing_connector_fails_run() {
  let engine = engine();
  let run = engine.run(remote_double(1, 1), RunOptions::default()).unwrap();
  assert!(matches!(run.collect(), Err(GraphError::StreamSend { .. })));
  assert_eq!(run.wait().code, ErrorCode::StreamSend);
}

struct Refusing;

impl Connector for Refusing {
  fn connect(
    &self,
    _request: ConnectRequest,
    _receiver: Arc<dyn StreamReceiver>,
  ) -> Result<Arc<dyn RpcStream>, TransportError> {
    Err(TransportError::Rejected("service unavailable".to_string()))
  }
}

#[test]
fn test_connect_failure_fails_run() {
  let engine = engine();
  engine.set_connector(Arc::new(Refusing));
  let run = engine.run(remote_double(2, 1), RunOptions::default()).unwrap();
  let summary = run.wait_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(summary.code, ErrorCode::StreamSend);
  assert!(summary.message.contains("service unavailable"));
}

/// Accepts every message and never answers.
struct Silent;

impl RpcStream for Silent {
  fn send(&self, _partition: PartId, _message: StreamMessage) -> Result<(), TransportError> {
    Ok(())
  }
}

impl Connector for Silent {
  fn connect(
    &self,
    _request: ConnectRequest,
    _receiver: Arc<dyn StreamReceiver>,
  ) -> Result<Arc<dyn RpcStream>, TransportError> {
    Ok(Arc::new(Silent))
  }
}

#[test]
fn test_silent_server_times_out() {
  let engine = engine();
  engine.set_connector(Arc::new(Silent));
  let run = engine
    .run(
      remote_double(1, 2),
      RunOptions::default().with_timeout(Duration::from_millis(200)),
    )
    .unwrap();
  assert!(matches!(run.collect(), Err(GraphError::Timeout)));
  assert_eq!(run.wait().code, ErrorCode::Timeout);
}

#[test]
fn test_cancel_stops_waiting_run() {
  let engine = engine();
  engine.set_connector(Arc::new(Silent));
  let run = engine.run(remote_double(1, 2), RunOptions::default()).unwrap();
  assert!(run.wait_timeout(Duration::from_millis(50)).is_none());
  run.cancel();
  let summary = run.wait_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(summary.code, ErrorCode::Cancelled);
}

/// Every send fails once connected.
struct Broken;

impl RpcStream for Broken {
  fn send(&self, _partition: PartId, _message: StreamMessage) -> Result<(), TransportError> {
    Err(TransportError::Closed)
  }
}

impl Connector for Broken {
  fn connect(
    &self,
    _request: ConnectRequest,
    _receiver: Arc<dyn StreamReceiver>,
  ) -> Result<Arc<dyn RpcStream>, TransportError> {
    Ok(Arc::new(Broken))
  }
}

#[test]
fn test_send_failure_fails_run_after_retries() {
  let engine = engine();
  engine.set_connector(Arc::new(Broken));
  let run = engine.run(remote_double(1, 2), RunOptions::default()).unwrap();
  let summary = run.wait_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(summary.code, ErrorCode::StreamSend);
}
