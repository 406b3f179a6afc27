//! Tests for ports.

use crate::border::{Border, BorderId};
use crate::error::GraphError;
use crate::memory_pool::{MemoryPool, MemoryPoolConfig};
use crate::partition::{PartId, PartitionSet};
use crate::payload::{Payload, TypeRegistry};
use crate::port::{Port, PortData, PortEnv, PortFlags, PortIo, PortKey, PortListener};
use parking_lot::Mutex;
use std::sync::Arc;

fn env_with_pool(pool: MemoryPool) -> Arc<PortEnv> {
  let types = TypeRegistry::new();
  types.register_json::<i64>("i64");
  types.register_json::<String>("string");
  Arc::new(PortEnv {
    types: Arc::new(types),
    pool: Arc::new(pool),
  })
}

fn env() -> Arc<PortEnv> {
  env_with_pool(MemoryPool::new())
}

fn linked(
  to_parts: PartitionSet,
  to_local: bool,
  flags: PortFlags,
  env: &Arc<PortEnv>,
) -> (Border, Border) {
  let id = BorderId::new(PortIo::Output, 0, 1);
  let key = PortKey::new("a", "out", "b", "in");
  let mut output = Border::new(id, PartitionSet::single(), true, Arc::clone(env));
  let mut input = Border::new(id.mirrored(), to_parts, to_local, Arc::clone(env));
  output.add_port(key.clone(), flags).unwrap();
  input.add_port(key.mirrored(), flags).unwrap();
  output.link_to(&input, true).unwrap();
  (output, input)
}

#[derive(Default)]
struct Recorder {
  pushes: Mutex<Vec<PartId>>,
  pops: Mutex<Vec<PartId>>,
}

impl PortListener for Recorder {
  fn on_push(&self, _port: &Port, to: PartId) {
    self.pushes.lock().push(to);
  }

  fn on_pop(&self, _port: &Port, to: PartId) {
    self.pops.lock().push(to);
  }
}

// ============================================================================
// PortKey
// ============================================================================

#[test]
fn test_port_key_mirror() {
  let key = PortKey::new("a", "out", "b", "in");
  assert_eq!(key.mirrored(), PortKey::new("b", "in", "a", "out"));
  assert_eq!(key.mirrored().mirrored(), key);
  assert_eq!(key.to_string(), "a.out<->b.in");
}

#[test]
fn test_unlinked_port() {
  let port = Port::new(
    0,
    PortKey::new("a", "out", "b", "in"),
    BorderId::new(PortIo::Output, 0, 1),
    crate::port::StoreKind::Data,
    PortFlags::default(),
    env(),
  );
  assert!(!port.is_linked());
  assert!(matches!(port.pop(0), Err(GraphError::PortNotLinked(_))));
  assert!(matches!(
    port.set_data(vec![None], true),
    Err(GraphError::PortNotLinked(_))
  ));
}

// ============================================================================
// Data transfer
// ============================================================================

#[test]
fn test_set_data_checks_slot_count() {
  let env = env();
  let (output, _input) = linked(PartitionSet::single(), true, PortFlags::default(), &env);
  let err = output
    .port(0)
    .unwrap()
    .set_data(vec![None, None], false)
    .unwrap_err();
  assert!(matches!(
    err,
    GraphError::PayloadCountMismatch {
      expected: 1,
      actual: 2
    }
  ));
}

#[test]
fn test_listeners_hear_push_and_pop() {
  let env = env();
  let (output, input) = linked(PartitionSet::single(), true, PortFlags::default(), &env);
  let out = output.port(0).unwrap();
  let inp = input.port(0).unwrap();
  let consumer = Arc::new(Recorder::default());
  let producer = Arc::new(Recorder::default());
  assert!(inp.set_listener(consumer.clone()));
  assert!(out.set_listener(producer.clone()));
  assert!(!inp.set_listener(Arc::new(Recorder::default())));

  out.set_data(vec![Some(Payload::new("i64", 1_i64))], false).unwrap();
  assert_eq!(*consumer.pushes.lock(), vec![0]);
  assert_eq!(value(inp.get_data(0).unwrap()), Some(1));
  assert_eq!(*producer.pops.lock(), vec![0]);
  assert!(matches!(inp.get_data(0).unwrap(), PortData::NoData));
}

fn value(data: PortData) -> Option<i64> {
  match data {
    PortData::Data { payload, .. } => payload.downcast_ref::<i64>().copied(),
    _ => None,
  }
}

#[test]
fn test_close_after_eof_is_quiet() {
  let env = env();
  let (output, input) = linked(PartitionSet::single(), true, PortFlags::default(), &env);
  let out = output.port(0).unwrap();
  out.set_eof(0).unwrap();
  out.close(0).unwrap();
  assert!(matches!(
    out.set_data(vec![Some(Payload::new("i64", 1_i64))], false),
    Err(GraphError::DataAfterEof { .. })
  ));
  assert!(matches!(input.port(0).unwrap().get_data(0).unwrap(), PortData::Eof));
}

#[test]
fn test_type_binding() {
  let env = env();
  let (output, input) = linked(PartitionSet::single(), false, PortFlags::default(), &env);
  let out = output.port(0).unwrap();
  out.set_data(vec![Some(Payload::new("i64", 1_i64))], false).unwrap();
  assert_eq!(out.bound_type(), Some("i64"));
  assert_eq!(input.port(0).unwrap().bound_type(), Some("i64"));
  let err = out
    .set_data(vec![Some(Payload::new("string", "x".to_string()))], false)
    .unwrap_err();
  assert!(matches!(err, GraphError::TypeMismatch { .. }));
}

#[test]
fn test_unknown_type_fails_serialization() {
  let env = env();
  let (output, _input) = linked(PartitionSet::single(), false, PortFlags::default(), &env);
  let err = output
    .port(0)
    .unwrap()
    .set_data(vec![Some(Payload::new("f32", 1.0_f32))], false)
    .unwrap_err();
  assert!(matches!(err, GraphError::TypeNotFound(name) if name == "f32"));
}

#[test]
fn test_pool_limit_blocks_deserialization() {
  let env = env_with_pool(MemoryPool::with_config(
    MemoryPoolConfig::default().with_limit_bytes(1),
  ));
  // Serialize on the client side; the lease keeps pool usage above the limit.
  let (client_out, client_in) = linked(PartitionSet::single(), false, PortFlags::default(), &env);
  client_out
    .port(0)
    .unwrap()
    .set_data(vec![Some(Payload::new("i64", 12345_i64))], false)
    .unwrap();
  let _held = client_in.port(0).unwrap().pop(0).unwrap();

  let id = BorderId::new(PortIo::Output, 0, 1);
  let key = PortKey::new("a", "out", "b", "in");
  let mut server_out = Border::new(id, PartitionSet::single(), false, Arc::clone(&env));
  let mut server_in = Border::new(id.mirrored(), PartitionSet::single(), true, Arc::clone(&env));
  server_out.add_port(key.clone(), PortFlags::default()).unwrap();
  server_in.add_port(key.mirrored(), PortFlags::default()).unwrap();
  server_out.link_to(&server_in, false).unwrap();

  let mut message = crate::wire::BorderMessage::new(id.mirrored());
  message.entries.push(crate::wire::PortEntry::data(
    0,
    0,
    0,
    &crate::payload::WirePayload::new("i64", bytes::Bytes::from_static(b"7")),
  ));
  assert!(matches!(
    server_out.receive(&message, 0),
    Err(GraphError::PoolLimitExceeded { .. })
  ));
}

// ============================================================================
// Dependency edges
// ============================================================================

#[test]
fn test_shuffle_edge_carries_only_eof() {
  let env = env();
  let flags = PortFlags {
    shuffle: true,
    optional: false,
  };
  let (output, input) = linked(PartitionSet::single(), true, flags, &env);
  let out = output.port(0).unwrap();
  assert!(out.is_shuffle());
  assert!(matches!(
    out.set_data(vec![Some(Payload::new("i64", 1_i64))], false),
    Err(GraphError::Unsupported(_))
  ));
  out.set_data(vec![None], false).unwrap();
  assert!(!input.port(0).unwrap().queue().unwrap().is_finished(0).unwrap());
  out.set_data(vec![None], true).unwrap();
  assert!(input.port(0).unwrap().queue().unwrap().is_finished(0).unwrap());
  out.close(0).unwrap();
}

#[test]
fn test_env_debug_output() {
  let env = env();
  let rendered = format!("{:?}", env);
  assert!(rendered.contains("PortEnv"));
  assert!(rendered.contains("MemoryPool"));
}
