//! # Wire Messages
//!
//! What travels over an RPC stream. A [`StreamMessage`] concerns one partition
//! of the remote subgraph (in both directions) and carries the entries drained
//! from every border of that stream plus an optional control message.
//!
//! Messages are encoded as JSON.
//!
//! ```rust
//! use gridweave::wire::{ControlMessage, StreamMessage};
//!
//! let msg = StreamMessage::control(3, ControlMessage::Eof);
//! let back = StreamMessage::decode(&msg.encode().unwrap()).unwrap();
//! assert_eq!(back, msg);
//! ```

use crate::border::{BorderId, SubgraphId};
use crate::error::{GraphError, Result};
use crate::partition::PartId;
use crate::payload::WirePayload;
use crate::port::PortIo;
use crate::result::{ResultSummary, TraceEvent};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One queue entry on the wire: a payload or an eof marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortEntry {
  /// Port id within the border.
  pub port_id: u32,
  /// Source partition.
  pub from: PartId,
  /// Destination partition.
  pub to: PartId,
  /// Eof marker of `from`; such entries carry no payload.
  pub eof: bool,
  /// Data type name of the payload.
  #[serde(default)]
  pub type_name: String,
  /// Serialized payload.
  #[serde(default)]
  pub bytes: Bytes,
}

impl PortEntry {
  /// Payload entry.
  pub fn data(port_id: usize, from: PartId, to: PartId, wire: &WirePayload) -> Self {
    Self {
      port_id: port_id as u32,
      from,
      to,
      eof: false,
      type_name: wire.type_name().to_string(),
      bytes: wire.bytes().clone(),
    }
  }

  /// Eof marker entry.
  pub fn eof(port_id: usize, from: PartId, to: PartId) -> Self {
    Self {
      port_id: port_id as u32,
      from,
      to,
      eof: true,
      type_name: String::new(),
      bytes: Bytes::new(),
    }
  }
}

/// Entries drained from one border.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BorderMessage {
  /// Subgraph owning the sending border.
  pub subgraph: SubgraphId,
  /// Subgraph on the other side.
  pub peer_subgraph: SubgraphId,
  /// Direction of the sending border.
  pub io: PortIo,
  /// Entries in queue order.
  pub entries: Vec<PortEntry>,
}

impl BorderMessage {
  /// Empty message for the border `id`.
  pub fn new(id: BorderId) -> Self {
    Self {
      subgraph: id.subgraph,
      peer_subgraph: id.peer,
      io: id.io,
      entries: Vec::new(),
    }
  }

  /// Id of the sending border.
  pub fn border_id(&self) -> BorderId {
    BorderId::new(self.io, self.subgraph, self.peer_subgraph)
  }

  /// Id of the border the receiver routes this message to.
  pub fn target_border(&self) -> BorderId {
    self.border_id().mirrored()
  }

  /// Whether there are no entries.
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

/// Out-of-band stream control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
  /// The sender delivered all of its data and eof markers.
  Eof,
  /// Trace events recorded by the sender.
  Trace(Vec<TraceEvent>),
  /// The sender's partition finished with this result.
  Finalize(ResultSummary),
  /// The receiver should abandon the partition.
  Cancel,
}

/// Unit of transfer on an RPC stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
  /// Partition of the remote subgraph this message concerns.
  pub partition: PartId,
  /// Border payloads.
  #[serde(default)]
  pub borders: Vec<BorderMessage>,
  /// Optional control message, applied after the border payloads.
  #[serde(default)]
  pub control: Option<ControlMessage>,
}

impl StreamMessage {
  /// Data-only message.
  pub fn data(partition: PartId, borders: Vec<BorderMessage>) -> Self {
    Self {
      partition,
      borders,
      control: None,
    }
  }

  /// Control-only message.
  pub fn control(partition: PartId, control: ControlMessage) -> Self {
    Self {
      partition,
      borders: Vec::new(),
      control: Some(control),
    }
  }

  /// Whether the message carries nothing.
  pub fn is_empty(&self) -> bool {
    self.control.is_none() && self.borders.iter().all(BorderMessage::is_empty)
  }

  /// Encodes to JSON bytes.
  pub fn encode(&self) -> Result<Bytes> {
    serde_json::to_vec(self)
      .map(Bytes::from)
      .map_err(|e| GraphError::Serialize {
        type_name: "StreamMessage".to_string(),
        reason: e.to_string(),
      })
  }

  /// Decodes from JSON bytes.
  pub fn decode(bytes: &[u8]) -> Result<Self> {
    serde_json::from_slice(bytes).map_err(|e| GraphError::Deserialize {
      type_name: "StreamMessage".to_string(),
      reason: e.to_string(),
    })
  }
}
