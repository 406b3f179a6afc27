//! Tests for borders: pattern resolution, linking and the transfer paths.

use crate::border::{Border, BorderConnectInfo, BorderId, ConnectPattern};
use crate::error::GraphError;
use crate::memory_pool::MemoryPool;
use crate::partition::PartitionSet;
use crate::payload::{Payload, TypeRegistry};
use crate::port::{PortData, PortEnv, PortFlags, PortIo, PortKey, StoreKind};
use crate::wire::BorderMessage;
use std::sync::Arc;

fn env() -> Arc<PortEnv> {
  let types = TypeRegistry::new();
  types.register_json::<i64>("i64");
  Arc::new(PortEnv {
    types: Arc::new(types),
    pool: Arc::new(MemoryPool::new()),
  })
}

fn key() -> PortKey {
  PortKey::new("a", "out", "b", "in")
}

/// Builds `(Output, from -> to)` and its mirror with one port each.
fn pair(
  from: (i32, PartitionSet, bool),
  to: (i32, PartitionSet, bool),
  env: &Arc<PortEnv>,
) -> (Border, Border) {
  let id = BorderId::new(PortIo::Output, from.0, to.0);
  let mut output = Border::new(id, from.1, from.2, Arc::clone(env));
  let mut input = Border::new(id.mirrored(), to.1, to.2, Arc::clone(env));
  output.add_port(key(), PortFlags::default()).unwrap();
  input.add_port(key().mirrored(), PortFlags::default()).unwrap();
  (output, input)
}

fn value(data: PortData) -> Option<i64> {
  match data {
    PortData::Data { payload, .. } => payload.downcast_ref::<i64>().copied(),
    _ => None,
  }
}

// ============================================================================
// Pattern resolution
// ============================================================================

#[test]
fn test_resolve_patterns() {
  let three = PartitionSet::all(3);
  let two = PartitionSet::all(2);
  let cases = [
    (true, true, true, ConnectPattern::LocalToLocal),
    (false, false, true, ConnectPattern::RemoteToRemoteViaClient),
    (false, true, false, ConnectPattern::RemoteToLocalViaServer),
    (false, true, true, ConnectPattern::RemoteToLocalViaClient),
    (true, false, false, ConnectPattern::LocalToRemoteViaServer),
    (true, false, true, ConnectPattern::LocalToRemoteViaClient),
  ];
  for (from_local, to_local, on_client, pattern) in cases {
    let info = BorderConnectInfo::resolve(from_local, to_local, on_client, &three, &two).unwrap();
    assert_eq!(info.pattern, pattern);
  }
}

#[test]
fn test_resolve_partition_rules() {
  let three = PartitionSet::all(3);
  let two = PartitionSet::all(2);

  let info = BorderConnectInfo::resolve(false, false, true, &three, &two).unwrap();
  assert_eq!(info.from_part, three);
  assert_eq!(info.to_part, two);
  assert_eq!(info.eof_part, three);

  let info = BorderConnectInfo::resolve(false, true, true, &three, &two).unwrap();
  assert_eq!(info.to_part, three);
  assert_eq!(info.eof_part, PartitionSet::single());

  let info = BorderConnectInfo::resolve(true, false, true, &three, &two).unwrap();
  assert_eq!(info.from_part, two);
  assert_eq!(info.to_part, two);
}

#[test]
fn test_resolve_rejects_remote_to_remote_on_server() {
  let set = PartitionSet::single();
  let err = BorderConnectInfo::resolve(false, false, false, &set, &set).unwrap_err();
  assert!(matches!(err, GraphError::LinkFailed(_)));
}

// ============================================================================
// Linking
// ============================================================================

#[test]
fn test_link_local_to_local() {
  let env = env();
  let (output, input) = pair(
    (0, PartitionSet::single(), true),
    (1, PartitionSet::single(), true),
    &env,
  );
  output.link_to(&input, true).unwrap();
  assert!(output.is_linked() && input.is_linked());
  assert!(output.state().is_none());

  let out = output.port(0).unwrap();
  let inp = input.port(0).unwrap();
  assert_eq!(inp.store(), StoreKind::Data);
  out.set_data(vec![Some(Payload::new("i64", 5_i64))], true).unwrap();
  assert_eq!(value(inp.get_data(0).unwrap()), Some(5));
  assert!(matches!(inp.get_data(0).unwrap(), PortData::Eof));
}

#[test]
fn test_two_partitions_local_to_local() {
  let env = env();
  let (output, input) = pair(
    (0, PartitionSet::all(2), true),
    (1, PartitionSet::all(2), true),
    &env,
  );
  output.link_to(&input, false).unwrap();
  let out = output.port(0).unwrap();
  let inp = input.port(0).unwrap();

  out
    .set_data(vec![Some(Payload::new("i64", 1_i64)), Some(Payload::new("i64", 2_i64))], false)
    .unwrap();
  out.set_data(vec![None, Some(Payload::new("i64", 4_i64))], true).unwrap();
  assert_eq!(value(inp.get_data(0).unwrap()), Some(1));
  assert!(matches!(inp.get_data(0).unwrap(), PortData::Eof));
  assert_eq!(value(inp.get_data(1).unwrap()), Some(2));
  assert_eq!(value(inp.get_data(1).unwrap()), Some(4));
  assert!(matches!(inp.get_data(1).unwrap(), PortData::Eof));
}

#[test]
fn test_link_twice_fails() {
  let env = env();
  let (output, input) = pair(
    (0, PartitionSet::single(), true),
    (1, PartitionSet::single(), true),
    &env,
  );
  output.link_to(&input, true).unwrap();
  assert!(matches!(
    output.link_to(&input, true),
    Err(GraphError::BorderAlreadyLinked(_))
  ));
}

#[test]
fn test_link_requires_mirror() {
  let env = env();
  let output = Border::new(
    BorderId::new(PortIo::Output, 0, 1),
    PartitionSet::single(),
    true,
    Arc::clone(&env),
  );
  let other = Border::new(
    BorderId::new(PortIo::Input, 2, 0),
    PartitionSet::single(),
    true,
    Arc::clone(&env),
  );
  assert!(matches!(
    output.link_to(&other, true),
    Err(GraphError::LinkFailed(_))
  ));
  assert!(matches!(
    other.link_to(&output, true),
    Err(GraphError::LinkFailed(_))
  ));
}

#[test]
fn test_link_missing_peer_port() {
  let env = env();
  let id = BorderId::new(PortIo::Output, 0, 1);
  let mut output = Border::new(id, PartitionSet::single(), true, Arc::clone(&env));
  let mut input = Border::new(id.mirrored(), PartitionSet::single(), true, Arc::clone(&env));
  output.add_port(key(), PortFlags::default()).unwrap();
  input
    .add_port(PortKey::new("b", "other", "a", "out"), PortFlags::default())
    .unwrap();
  assert!(matches!(
    output.link_to(&input, true),
    Err(GraphError::LinkFailed(_))
  ));
}

#[test]
fn test_duplicate_port_rejected() {
  let env = env();
  let mut border = Border::new(
    BorderId::new(PortIo::Output, 0, 1),
    PartitionSet::single(),
    true,
    env,
  );
  assert_eq!(border.add_port(key(), PortFlags::default()).unwrap(), 0);
  assert!(matches!(
    border.add_port(key(), PortFlags::default()),
    Err(GraphError::PortAlreadyLinked(_))
  ));
}

// ============================================================================
// Transfer paths
// ============================================================================

#[test]
fn test_local_to_remote_via_client_then_server() {
  let env = env();
  // Client: local subgraph 0 feeds remote subgraph 1 with two partitions.
  let (client_out, client_in) = pair(
    (0, PartitionSet::single(), true),
    (1, PartitionSet::all(2), false),
    &env,
  );
  client_out.link_to(&client_in, true).unwrap();
  let info = client_out.connect_info().unwrap();
  assert_eq!(info.pattern, ConnectPattern::LocalToRemoteViaClient);
  let out = client_out.port(0).unwrap();
  assert_eq!(out.partitions().unwrap().used_count(), 2);
  out
    .set_data(vec![None, Some(Payload::new("i64", 9_i64))], true)
    .unwrap();
  assert_eq!(out.bound_type(), Some("i64"));

  let (message, more) = client_in.collect_border_message(1, usize::MAX).unwrap();
  assert!(!more);
  assert_eq!(message.entries.len(), 2);
  assert!(!message.entries[0].eof);
  assert!(message.entries[1].eof);
  assert!(client_in.state().unwrap().is_final(1));
  assert!(!client_in.state().unwrap().all_final());

  // Server of partition 1: remote subgraph 0 feeds the local subgraph 1.
  let (server_out, server_in) = pair(
    (0, PartitionSet::single(), false),
    (1, PartitionSet::all(2), true),
    &env,
  );
  server_out.link_to(&server_in, false).unwrap();
  assert_eq!(
    server_out.connect_info().unwrap().pattern,
    ConnectPattern::RemoteToLocalViaServer
  );
  assert_eq!(message.target_border(), server_out.id());
  assert_eq!(server_out.receive(&message, 1).unwrap(), vec![1]);
  let inp = server_in.port(0).unwrap();
  assert_eq!(value(inp.get_data(0).unwrap()), Some(9));
  assert!(matches!(inp.get_data(0).unwrap(), PortData::Eof));
}

#[test]
fn test_local_to_remote_via_server_then_client() {
  let env = env();
  // Server of partition 0 of subgraph 1 feeds local subgraph 0.
  let (server_out, server_in) = pair(
    (1, PartitionSet::all(2), true),
    (0, PartitionSet::single(), false),
    &env,
  );
  server_out.link_to(&server_in, false).unwrap();
  assert_eq!(
    server_out.connect_info().unwrap().pattern,
    ConnectPattern::LocalToRemoteViaServer
  );
  server_out
    .port(0)
    .unwrap()
    .set_data(vec![Some(Payload::new("i64", 3_i64))], true)
    .unwrap();
  let (message, _) = server_in.collect_border_message(0, usize::MAX).unwrap();
  assert_eq!(message.entries.len(), 2);
  assert!(server_in.state().unwrap().all_final());

  // The client receives it as partition 0 of subgraph 1.
  let (client_out, client_in) = pair(
    (1, PartitionSet::all(2), false),
    (0, PartitionSet::single(), true),
    &env,
  );
  client_out.link_to(&client_in, true).unwrap();
  assert_eq!(
    client_out.connect_info().unwrap().pattern,
    ConnectPattern::RemoteToLocalViaClient
  );
  assert_eq!(client_out.receive(&message, 0).unwrap(), vec![0]);
  let inp = client_in.port(0).unwrap();
  assert_eq!(inp.partitions().unwrap().used_count(), 2);
  assert_eq!(value(inp.get_data(0).unwrap()), Some(3));
  assert!(matches!(inp.get_data(0).unwrap(), PortData::Eof));
  assert!(matches!(inp.get_data(1).unwrap(), PortData::NoData));
}

#[test]
fn test_remote_to_remote_relay() {
  let env = env();
  let (relay_out, relay_in) = pair(
    (1, PartitionSet::all(2), false),
    (2, PartitionSet::all(3), false),
    &env,
  );
  relay_out.link_to(&relay_in, true).unwrap();
  assert_eq!(
    relay_out.connect_info().unwrap().pattern,
    ConnectPattern::RemoteToRemoteViaClient
  );

  // Partition 1 of subgraph 1 sends one payload to partition 2 of subgraph 2,
  // then eof to all three destinations.
  let mut message = BorderMessage::new(relay_in.id());
  let types = &env.types;
  let data_type = types.get("i64").unwrap();
  let mut buf = bytes::BytesMut::new();
  data_type
    .serialize(&Payload::new("i64", 11_i64), &mut buf)
    .unwrap();
  let wire = crate::payload::WirePayload::new("i64", buf.freeze());
  message
    .entries
    .push(crate::wire::PortEntry::data(0, 0, 2, &wire));
  for to in 0..3 {
    message.entries.push(crate::wire::PortEntry::eof(0, 0, to));
  }
  assert_eq!(relay_out.receive(&message, 1).unwrap(), vec![1]);

  let (forward, _) = relay_in.collect_border_message(2, usize::MAX).unwrap();
  assert_eq!(forward.entries.len(), 2);
  assert_eq!(forward.entries[0].from, 1);
  assert_eq!(forward.entries[0].to, 2);
  assert_eq!(forward.entries[0].bytes, wire.bytes().clone());
  assert!(forward.entries[1].eof);
  // Partition 0 of subgraph 1 has not sent eof yet.
  assert!(!relay_in.state().unwrap().is_final(2));
}

#[test]
fn test_collect_respects_byte_limit() {
  let env = env();
  let (output, input) = pair(
    (0, PartitionSet::single(), true),
    (1, PartitionSet::single(), false),
    &env,
  );
  output.link_to(&input, true).unwrap();
  let port = output.port(0).unwrap();
  for value in 0..4_i64 {
    port
      .set_data(vec![Some(Payload::new("i64", value))], false)
      .unwrap();
  }
  let state = input.state().unwrap();
  assert_eq!(state.pushed(), 4);
  assert!(state.pending_bytes() > 0);

  let (first, more) = input.collect_border_message(0, 1).unwrap();
  assert!(more);
  assert_eq!(first.entries.len(), 1);
  let (rest, more) = input.collect_border_message(0, usize::MAX).unwrap();
  assert!(!more);
  assert_eq!(rest.entries.len(), 3);
  assert_eq!(state.popped(), 4);
  assert_eq!(state.pending_bytes(), 0);
}

#[test]
fn test_receive_unknown_port_fails() {
  let env = env();
  let (output, input) = pair(
    (1, PartitionSet::single(), false),
    (0, PartitionSet::single(), true),
    &env,
  );
  output.link_to(&input, true).unwrap();
  let mut message = BorderMessage::new(input.id());
  message.entries.push(crate::wire::PortEntry::eof(7, 0, 0));
  assert!(matches!(
    output.receive(&message, 0),
    Err(GraphError::PortNotFound(_))
  ));
}
