//! # Ports
//!
//! A [`Port`] is one end of an edge as seen from one side of a border. Ports
//! are created unlinked by their [`Border`](crate::border::Border) and linked
//! exactly once, 1:1, to the matching port of the peer border. Both ends then
//! share one [`PortQueue`], owned by the pair.
//!
//! ## Store kinds and transfer paths
//!
//! A port on a node running in this process holds in-memory data
//! ([`StoreKind::Data`]); a port on the transport side of a remote border holds
//! serialized bytes ([`StoreKind::Serialized`]). What a push does depends on the
//! payload form and the store kind of the destination:
//!
//! | payload | destination | action |
//! |---|---|---|
//! | data | data | enqueue as is |
//! | data | serialized | bind the data type, serialize into a pooled buffer |
//! | serialized | data | check the pool limit, bind the data type, deserialize |
//! | serialized | serialized | relay unchanged |
//!
//! The data type is bound from the first payload that needs one and is
//! propagated to the peer port.
//!
//! ## Wake-ups
//!
//! A [`PortListener`] on the destination port hears about every push; one on
//! the source port hears about every pop. Listeners must only enqueue work.

use crate::border::{BorderConnectInfo, BorderId};
use crate::error::{GraphError, Result};
use crate::memory_pool::MemoryPool;
use crate::partition::{PartId, PartitionSet};
use crate::payload::{DataType, Payload, TypeRegistry, WirePayload};
use crate::port_queue::{Popped, PortQueue, QueueItem};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

/// Writer id a local node uses on its output ports.
pub const LOCAL_WRITER: PartId = 0;

/// Direction of a port or border, seen from the subgraph that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortIo {
  /// Data flows into the subgraph.
  Input,
  /// Data flows out of the subgraph.
  Output,
}

impl PortIo {
  /// The opposite direction.
  pub fn flip(self) -> Self {
    match self {
      PortIo::Input => PortIo::Output,
      PortIo::Output => PortIo::Input,
    }
  }
}

/// How a port holds payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
  /// In-memory [`Payload`]s.
  Data,
  /// Serialized [`WirePayload`]s.
  Serialized,
}

/// Identity of a port: its own node and port name plus those of its peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortKey {
  /// Node owning this end.
  pub node: String,
  /// Port name on `node`.
  pub port: String,
  /// Node at the other end.
  pub peer_node: String,
  /// Port name on `peer_node`.
  pub peer_port: String,
}

impl PortKey {
  /// Creates a key.
  pub fn new(
    node: impl Into<String>,
    port: impl Into<String>,
    peer_node: impl Into<String>,
    peer_port: impl Into<String>,
  ) -> Self {
    Self {
      node: node.into(),
      port: port.into(),
      peer_node: peer_node.into(),
      peer_port: peer_port.into(),
    }
  }

  /// The key the peer port carries.
  pub fn mirrored(&self) -> Self {
    Self {
      node: self.peer_node.clone(),
      port: self.peer_port.clone(),
      peer_node: self.node.clone(),
      peer_port: self.port.clone(),
    }
  }
}

impl fmt::Display for PortKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}.{}<->{}.{}",
      self.node, self.port, self.peer_node, self.peer_port
    )
  }
}

/// Registries shared by every port of a run.
#[derive(Debug)]
pub struct PortEnv {
  /// Data types for (de)serialization.
  pub types: Arc<TypeRegistry>,
  /// Buffer pool and usage accounting.
  pub pool: Arc<MemoryPool>,
}

/// Receives push and pop notifications from a port.
pub trait PortListener: Send + Sync {
  /// A push into `port`'s queue for destination `to` completed.
  fn on_push(&self, port: &Port, to: PartId);

  /// A pop from the queue feeding from `port` completed.
  fn on_pop(&self, _port: &Port, _to: PartId) {}
}

/// What a node sees when reading an input partition.
#[derive(Debug)]
pub enum PortData {
  /// Nothing to read right now.
  NoData,
  /// A payload.
  Data {
    /// Source partition.
    from: PartId,
    /// The payload.
    payload: Payload,
  },
  /// Every source finished and everything was read.
  Eof,
}

struct PortLink {
  peer: Weak<Port>,
  peer_store: StoreKind,
  queue: Arc<PortQueue>,
  info: Arc<BorderConnectInfo>,
}

/// One end of a linked edge.
pub struct Port {
  id: usize,
  key: PortKey,
  io: PortIo,
  store: StoreKind,
  border: BorderId,
  shuffle: bool,
  optional: bool,
  env: Arc<PortEnv>,
  link: OnceLock<PortLink>,
  bound: OnceLock<Arc<dyn DataType>>,
  listener: OnceLock<Arc<dyn PortListener>>,
}

/// Per-edge flags carried by a port.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortFlags {
  /// Dependency-only edge backed by a shuffle queue.
  pub shuffle: bool,
  /// The edge never blocks scheduling of its consumer.
  pub optional: bool,
}

impl Port {
  /// Creates an unlinked port.
  pub fn new(
    id: usize,
    key: PortKey,
    border: BorderId,
    store: StoreKind,
    flags: PortFlags,
    env: Arc<PortEnv>,
  ) -> Self {
    Self {
      id,
      key,
      io: border.io,
      store,
      border,
      shuffle: flags.shuffle,
      optional: flags.optional,
      env,
      link: OnceLock::new(),
      bound: OnceLock::new(),
      listener: OnceLock::new(),
    }
  }

  /// Index within the owning border.
  pub fn id(&self) -> usize {
    self.id
  }

  /// Port identity.
  pub fn key(&self) -> &PortKey {
    &self.key
  }

  /// `node.port` label used in errors and logs.
  pub fn label(&self) -> String {
    format!("{}.{}", self.key.node, self.key.port)
  }

  /// Direction.
  pub fn io(&self) -> PortIo {
    self.io
  }

  /// How this end holds payloads.
  pub fn store(&self) -> StoreKind {
    self.store
  }

  /// Owning border.
  pub fn border_id(&self) -> BorderId {
    self.border
  }

  /// Whether the edge is dependency-only.
  pub fn is_shuffle(&self) -> bool {
    self.shuffle
  }

  /// Whether the edge is optional for scheduling.
  pub fn is_optional(&self) -> bool {
    self.optional
  }

  /// Whether [`Port::link`] has run.
  pub fn is_linked(&self) -> bool {
    self.link.get().is_some()
  }

  /// Links this port to `peer` through `queue`. Only succeeds once.
  pub fn link(
    &self,
    peer: &Arc<Port>,
    queue: Arc<PortQueue>,
    info: Arc<BorderConnectInfo>,
  ) -> Result<()> {
    self
      .link
      .set(PortLink {
        peer: Arc::downgrade(peer),
        peer_store: peer.store,
        queue,
        info,
      })
      .map_err(|_| GraphError::PortAlreadyLinked(self.key.to_string()))
  }

  fn linked(&self) -> Result<&PortLink> {
    self
      .link
      .get()
      .ok_or_else(|| GraphError::PortNotLinked(self.key.to_string()))
  }

  /// The shared queue.
  pub fn queue(&self) -> Result<&Arc<PortQueue>> {
    Ok(&self.linked()?.queue)
  }

  /// The linked peer, if still alive.
  pub fn peer(&self) -> Option<Arc<Port>> {
    self.link.get().and_then(|link| link.peer.upgrade())
  }

  /// Connection info of the border pair this port was linked through.
  pub fn connect_info(&self) -> Result<&BorderConnectInfo> {
    Ok(&self.linked()?.info)
  }

  /// Partitions a node addresses through this port: the destination
  /// partitions of the queue, which for an output equal its `from` set.
  pub fn partitions(&self) -> Result<&PartitionSet> {
    let link = self.linked()?;
    Ok(match self.io {
      PortIo::Output => &link.info.from_part,
      PortIo::Input => link.queue.to_part(),
    })
  }

  /// Installs the listener. Returns `false` if one is already installed.
  pub fn set_listener(&self, listener: Arc<dyn PortListener>) -> bool {
    self.listener.set(listener).is_ok()
  }

  /// Name of the bound data type, if any.
  pub fn bound_type(&self) -> Option<&str> {
    self.bound.get().map(|data_type| data_type.name())
  }

  /// Binds the data type `name` to this port and its peer.
  ///
  /// A second bind with a different name fails with `TypeMismatch`.
  pub fn bind_type(&self, name: &str) -> Result<Arc<dyn DataType>> {
    if let Some(bound) = self.bound.get() {
      if bound.name() != name {
        return Err(GraphError::TypeMismatch {
          port: self.label(),
          expected: bound.name().to_string(),
          actual: name.to_string(),
        });
      }
      return Ok(Arc::clone(bound));
    }
    let data_type = self.env.types.get(name)?;
    let bound = Arc::clone(self.bound.get_or_init(|| data_type));
    if bound.name() != name {
      return Err(GraphError::TypeMismatch {
        port: self.label(),
        expected: bound.name().to_string(),
        actual: name.to_string(),
      });
    }
    if let Some(peer) = self.peer() {
      let _ = peer.bound.set(Arc::clone(&bound));
    }
    Ok(bound)
  }

  fn convert(&self, item: QueueItem, target: StoreKind) -> Result<QueueItem> {
    match (item, target) {
      (item @ QueueItem::Data(_), StoreKind::Data) => Ok(item),
      (item @ QueueItem::Wire(_), StoreKind::Serialized) => Ok(item),
      (QueueItem::Data(payload), StoreKind::Serialized) => {
        let data_type = self.bind_type(payload.type_name())?;
        let pool = &self.env.pool;
        let mut buf = pool.get_buffer(256);
        data_type.serialize(&payload, &mut buf)?;
        let bytes = Bytes::copy_from_slice(&buf);
        pool.return_buffer(buf);
        let lease = pool.lease(bytes.len());
        Ok(QueueItem::Wire(
          WirePayload::new(data_type.name(), bytes).with_lease(lease),
        ))
      }
      (QueueItem::Wire(wire), StoreKind::Data) => {
        self.env.pool.check_limit()?;
        let data_type = self.bind_type(wire.type_name())?;
        Ok(QueueItem::Data(data_type.deserialize(wire.bytes())?))
      }
    }
  }

  /// Pushes into the shared queue, converting `item` to the peer's store kind.
  ///
  /// Returns whether destination `to` is finished afterwards.
  pub fn push_item(
    &self,
    to: PartId,
    from: PartId,
    item: Option<QueueItem>,
    eof: bool,
  ) -> Result<bool> {
    let link = self.linked()?;
    let item = item
      .map(|item| self.convert(item, link.peer_store))
      .transpose()?;
    let finished = link.queue.push(to, from, item, eof)?;
    if let Some(peer) = link.peer.upgrade() {
      peer.notify_push(to);
    }
    Ok(finished)
  }

  /// Writes one slot per partition of [`Port::partitions`].
  ///
  /// A `None` slot is skipped unless `eof` is set, in which case it carries
  /// only the eof marker.
  pub fn set_data(&self, payloads: Vec<Option<Payload>>, eof: bool) -> Result<()> {
    let link = self.linked()?;
    let parts = &link.info.from_part;
    if payloads.len() != parts.used_count() {
      return Err(GraphError::PayloadCountMismatch {
        expected: parts.used_count(),
        actual: payloads.len(),
      });
    }
    if link.queue.is_shuffle() {
      if payloads.iter().any(Option::is_some) {
        return Err(GraphError::Unsupported("payload on a dependency edge"));
      }
      return if eof { self.set_eof(LOCAL_WRITER) } else { Ok(()) };
    }
    for (to, slot) in parts.iter().zip(payloads) {
      if slot.is_none() && !eof {
        continue;
      }
      self.push_item(to, LOCAL_WRITER, slot.map(QueueItem::Data), eof)?;
    }
    Ok(())
  }

  /// Signals eof from writer `from` to every destination partition.
  pub fn set_eof(&self, from: PartId) -> Result<()> {
    let link = self.linked()?;
    link.queue.set_eof(from)?;
    if let Some(peer) = link.peer.upgrade() {
      for to in link.queue.to_part().iter() {
        peer.notify_push(to);
      }
    }
    Ok(())
  }

  /// Signals eof from writer `from` to every destination that has not seen
  /// it yet. Used when a node finishes after closing some outputs itself.
  pub fn close(&self, from: PartId) -> Result<()> {
    let link = self.linked()?;
    if link.queue.is_shuffle() {
      return match self.set_eof(from) {
        Err(GraphError::DataAfterEof { .. }) => Ok(()),
        other => other,
      };
    }
    for to in link.queue.to_part().iter() {
      match self.push_item(to, from, None, true) {
        Ok(_) | Err(GraphError::DataAfterEof { .. }) => {}
        Err(err) => return Err(err),
      }
    }
    Ok(())
  }

  /// Pops the next entry of destination `to`.
  pub fn pop(&self, to: PartId) -> Result<Popped> {
    let link = self.linked()?;
    let popped = link.queue.pop(to)?;
    if matches!(popped, Popped::Data { .. } | Popped::Eof { .. })
      && let Some(peer) = link.peer.upgrade()
    {
      peer.notify_pop(to);
    }
    Ok(popped)
  }

  /// Reads partition `to` of an input holding in-memory data.
  ///
  /// Intermediate eof markers of single sources are consumed silently; only
  /// the final eof is reported.
  pub fn get_data(&self, to: PartId) -> Result<PortData> {
    loop {
      match self.pop(to)? {
        Popped::Empty => return Ok(PortData::NoData),
        Popped::Finished | Popped::Eof { finished: true, .. } => return Ok(PortData::Eof),
        Popped::Eof { finished: false, .. } => continue,
        Popped::Data {
          from,
          item: QueueItem::Data(payload),
        } => return Ok(PortData::Data { from, payload }),
        Popped::Data {
          item: QueueItem::Wire(_),
          ..
        } => return Err(GraphError::Unsupported("serialized payload on a data port")),
      }
    }
  }

  fn notify_push(&self, to: PartId) {
    if let Some(listener) = self.listener.get() {
      listener.on_push(self, to);
    }
  }

  fn notify_pop(&self, to: PartId) {
    if let Some(listener) = self.listener.get() {
      listener.on_pop(self, to);
    }
  }
}

impl fmt::Debug for Port {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Port")
      .field("id", &self.id)
      .field("key", &self.key)
      .field("io", &self.io)
      .field("store", &self.store)
      .field("linked", &self.is_linked())
      .field("bound", &self.bound_type())
      .finish()
  }
}
