//! Tests for stream messages.

use crate::border::BorderId;
use crate::error::GraphError;
use crate::payload::WirePayload;
use crate::port::PortIo;
use crate::result::ResultSummary;
use crate::wire::{BorderMessage, ControlMessage, PortEntry, StreamMessage};
use bytes::Bytes;

#[test]
fn test_target_border_is_mirror() {
  let message = BorderMessage::new(BorderId::new(PortIo::Input, 0, 2));
  assert_eq!(message.border_id(), BorderId::new(PortIo::Input, 0, 2));
  assert_eq!(message.target_border(), BorderId::new(PortIo::Output, 2, 0));
  assert!(message.is_empty());
}

#[test]
fn test_data_message_encoding() {
  let mut border = BorderMessage::new(BorderId::new(PortIo::Input, 1, 0));
  let wire = WirePayload::new("i64", Bytes::from_static(b"42"));
  border.entries.push(PortEntry::data(3, 0, 1, &wire));
  border.entries.push(PortEntry::eof(3, 0, 1));
  let message = StreamMessage::data(1, vec![border]);
  assert!(!message.is_empty());

  let back = StreamMessage::decode(&message.encode().unwrap()).unwrap();
  assert_eq!(back, message);
  let entry = &back.borders[0].entries[0];
  assert_eq!(entry.port_id, 3);
  assert_eq!(entry.type_name, "i64");
  assert_eq!(&entry.bytes[..], b"42");
  assert!(back.borders[0].entries[1].eof);
}

#[test]
fn test_finalize_carries_summary() {
  let mut summary = ResultSummary::default();
  summary.merge_error(crate::error::ErrorCode::StreamSend, "gone", None);
  let message = StreamMessage::control(0, ControlMessage::Finalize(summary.clone()));
  let back = StreamMessage::decode(&message.encode().unwrap()).unwrap();
  assert_eq!(back.control, Some(ControlMessage::Finalize(summary)));
}

#[test]
fn test_empty_message() {
  assert!(StreamMessage::data(0, vec![BorderMessage::new(BorderId::new(PortIo::Input, 0, 1))]).is_empty());
  assert!(!StreamMessage::control(0, ControlMessage::Cancel).is_empty());
}

#[test]
fn test_decode_garbage_fails() {
  assert!(matches!(
    StreamMessage::decode(b"not json"),
    Err(GraphError::Deserialize { .. })
  ));
}
