//! # Transport
//!
//! The RPC seam between a client run and the servers of its remote subgraphs.
//! A [`Connector`] opens one [`RpcStream`] per remote subgraph; the stream
//! addresses a partition per message. Inbound messages are handed to a
//! [`StreamReceiver`] in arrival order.
//!
//! [`LoopbackConnector`] serves remote subgraphs from another [`Engine`] in
//! the same process, exchanging encoded [`StreamMessage`]s over tokio
//! channels. It exercises the full wire path and is what the integration
//! tests run against.

use crate::border::SubgraphId;
use crate::domain::server::ServerDomain;
use crate::engine::{Engine, ServeRequest};
use crate::graph::GraphDef;
use crate::partition::{PartId, PartitionDescriptor, PartitionSet};
use crate::stream_state::StreamState;
use crate::wire::StreamMessage;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tracing::{debug, warn};

/// Error type for transport failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
  /// The stream is closed.
  #[error("stream closed")]
  Closed,
  /// The message could not be encoded.
  #[error("encode failed: {0}")]
  Encode(String),
  /// The stream does not carry this partition.
  #[error("unknown partition {0}")]
  UnknownPartition(PartId),
  /// The remote side refused the request.
  #[error("rejected: {0}")]
  Rejected(String),
  /// The partition was cancelled before the message went out.
  #[error("partition {0} cancelled")]
  Cancelled(PartId),
}

/// Outbound half of a stream.
pub trait RpcStream: Send + Sync {
  /// Sends `message` for `partition`. Must not block.
  fn send(&self, partition: PartId, message: StreamMessage) -> Result<(), TransportError>;

  /// Closes the stream. Later sends fail with [`TransportError::Closed`].
  fn close(&self) {}
}

/// Inbound half of a stream.
pub trait StreamReceiver: Send + Sync {
  /// Handles one message. Called in arrival order, never concurrently for
  /// the same stream.
  fn receive(&self, message: StreamMessage);
}

/// What a client asks a server for.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
  /// The whole graph; the server builds its side from it.
  pub graph: Arc<GraphDef>,
  /// Remote subgraph to serve.
  pub subgraph: SubgraphId,
  /// Partitions to serve.
  pub part: PartitionDescriptor,
  /// Time left until the client's deadline.
  pub timeout: Duration,
}

/// Opens streams to remote subgraphs.
pub trait Connector: Send + Sync {
  /// Connects to every partition of `request.part`; inbound messages go to
  /// `receiver`.
  fn connect(
    &self,
    request: ConnectRequest,
    receiver: Arc<dyn StreamReceiver>,
  ) -> Result<Arc<dyn RpcStream>, TransportError>;
}

/// Sends `message` on `stream`, retrying a failed send up to `retries` times.
/// Gives up with [`TransportError::Cancelled`] once `partition` is cancelled.
pub(crate) fn send_with_retry(
  stream: &dyn RpcStream,
  state: &StreamState,
  partition: PartId,
  message: &StreamMessage,
  retries: u32,
) -> Result<(), TransportError> {
  let mut attempt = 0;
  loop {
    if state.is_cancelled(partition) {
      return Err(TransportError::Cancelled(partition));
    }
    match stream.send(partition, message.clone()) {
      Ok(()) => return Ok(()),
      Err(error) if attempt < retries => {
        attempt += 1;
        debug!(partition, attempt, %error, "send failed, retrying");
      }
      Err(error) => return Err(error),
    }
  }
}

fn encode(message: &StreamMessage) -> Result<Bytes, TransportError> {
  message
    .encode()
    .map_err(|e| TransportError::Encode(e.to_string()))
}

/// Client to server direction: one channel per partition.
struct ChannelStream {
  senders: Mutex<HashMap<PartId, UnboundedSender<Bytes>>>,
}

impl RpcStream for ChannelStream {
  fn send(&self, partition: PartId, message: StreamMessage) -> Result<(), TransportError> {
    let bytes = encode(&message)?;
    let senders = self.senders.lock();
    let sender = senders
      .get(&partition)
      .ok_or(TransportError::UnknownPartition(partition))?;
    sender.send(bytes).map_err(|_| TransportError::Closed)
  }

  fn close(&self) {
    self.senders.lock().clear();
  }
}

/// Server to client direction: one channel shared by every partition.
struct BackStream {
  sender: Mutex<Option<UnboundedSender<Bytes>>>,
}

impl RpcStream for BackStream {
  fn send(&self, _partition: PartId, message: StreamMessage) -> Result<(), TransportError> {
    let bytes = encode(&message)?;
    match self.sender.lock().as_ref() {
      Some(sender) => sender.send(bytes).map_err(|_| TransportError::Closed),
      None => Err(TransportError::Closed),
    }
  }

  fn close(&self) {
    self.sender.lock().take();
  }
}

/// Serves remote subgraphs from an in-process engine.
pub struct LoopbackConnector {
  server: Arc<Engine>,
}

impl LoopbackConnector {
  /// Connector whose remote subgraphs run on `server`.
  pub fn new(server: Arc<Engine>) -> Self {
    Self { server }
  }
}

impl fmt::Debug for LoopbackConnector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LoopbackConnector").finish_non_exhaustive()
  }
}

impl Connector for LoopbackConnector {
  fn connect(
    &self,
    request: ConnectRequest,
    receiver: Arc<dyn StreamReceiver>,
  ) -> Result<Arc<dyn RpcStream>, TransportError> {
    let parts = PartitionSet::from_descriptor(&request.part)
      .map_err(|e| TransportError::Rejected(e.to_string()))?;
    let handle = self.server.handle().clone();

    let (back_tx, mut back_rx) = unbounded_channel::<Bytes>();
    handle.spawn(async move {
      while let Some(bytes) = back_rx.recv().await {
        match StreamMessage::decode(&bytes) {
          Ok(message) => receiver.receive(message),
          Err(error) => warn!(%error, "dropping undecodable message from server"),
        }
      }
    });

    let mut senders = HashMap::new();
    for partition in parts.iter() {
      let back: Arc<dyn RpcStream> = Arc::new(BackStream {
        sender: Mutex::new(Some(back_tx.clone())),
      });
      let server: Arc<ServerDomain> = self
        .server
        .serve(
          ServeRequest {
            graph: Arc::clone(&request.graph),
            subgraph: request.subgraph,
            partition,
            timeout: request.timeout,
          },
          back,
        )
        .map_err(|e| TransportError::Rejected(e.to_string()))?;
      let (tx, mut rx) = unbounded_channel::<Bytes>();
      handle.spawn(async move {
        while let Some(bytes) = rx.recv().await {
          match StreamMessage::decode(&bytes) {
            Ok(message) => server.receive(message),
            Err(error) => warn!(%error, "dropping undecodable message from client"),
          }
        }
      });
      senders.insert(partition, tx);
    }
    debug!(
      subgraph = request.subgraph,
      partitions = parts.used_count(),
      "loopback connected"
    );
    Ok(Arc::new(ChannelStream {
      senders: Mutex::new(senders),
    }))
  }
}
