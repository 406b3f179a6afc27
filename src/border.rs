//! # Borders
//!
//! A [`Border`] groups the ports on one side of a subgraph boundary: every edge
//! between subgraph `A` and subgraph `B` contributes one port to `A`'s output
//! border towards `B` and one to `B`'s input border from `A`. Edges inside a
//! subgraph go through the self borders `(Output, A, A)` and `(Input, A, A)`.
//!
//! Port ids are positions within the border in graph edge order, so two
//! processes that build the same graph agree on them; wire messages address
//! ports by id.
//!
//! Linking an output border to its peer input border happens once. It decides
//! the [`ConnectPattern`] from where the two sides run and pairs every port 1:1.
//!
//! | from local | to local | on client | pattern | partition rule |
//! |---|---|---|---|---|
//! | no | no | yes | remote to remote via client | eof writers = from |
//! | no | yes | no | remote to local via server | to = from |
//! | no | yes | yes | remote to local via client | to = from |
//! | yes | no | no | local to remote via server | from = to |
//! | yes | no | yes | local to remote via client | from = to |
//! | yes | yes | any | local to local | in-memory queue |
//! | no | no | no | invalid | `LinkFailed` |

use crate::bitmap::AtomicBitmap;
use crate::error::{GraphError, Result};
use crate::partition::{PartId, PartitionSet};
use crate::port::{Port, PortEnv, PortFlags, PortIo, PortKey, StoreKind};
use crate::port_queue::{NormalQueue, Popped, PortQueue, QueueItem, ShuffleQueue};
use crate::payload::WirePayload;
use crate::wire::{BorderMessage, PortEntry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace};

/// Subgraph identifier. The user sink is [`USER_SUBGRAPH`].
pub type SubgraphId = i32;

/// Subgraph id of the user-facing sink.
pub const USER_SUBGRAPH: SubgraphId = -1;

/// `(io, subgraph, peer subgraph)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BorderId {
  /// Direction seen from `subgraph`.
  pub io: PortIo,
  /// Owning subgraph.
  pub subgraph: SubgraphId,
  /// Subgraph on the other side.
  pub peer: SubgraphId,
}

impl BorderId {
  /// Creates an id.
  pub fn new(io: PortIo, subgraph: SubgraphId, peer: SubgraphId) -> Self {
    Self { io, subgraph, peer }
  }

  /// Id of the border on the other side of the same boundary.
  pub fn mirrored(&self) -> Self {
    Self {
      io: self.io.flip(),
      subgraph: self.peer,
      peer: self.subgraph,
    }
  }
}

impl fmt::Display for BorderId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}({}->{})", self.io, self.subgraph, self.peer)
  }
}

/// How data crosses a linked border pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPattern {
  /// Both sides run here.
  LocalToLocal,
  /// A local producer feeds a remote subgraph this process is the client of.
  LocalToRemoteViaClient,
  /// A served subgraph feeds its remote client.
  LocalToRemoteViaServer,
  /// A remote subgraph feeds a local consumer on the client.
  RemoteToLocalViaClient,
  /// The remote client feeds the served subgraph.
  RemoteToLocalViaServer,
  /// The client relays between two remote subgraphs.
  RemoteToRemoteViaClient,
}

impl ConnectPattern {
  /// Destination `(to, from)` of an entry received from `source`.
  pub fn route(self, source: PartId, entry: &PortEntry) -> Result<(PartId, PartId)> {
    match self {
      ConnectPattern::RemoteToLocalViaClient => Ok((source, 0)),
      ConnectPattern::RemoteToRemoteViaClient => Ok((entry.to, source)),
      ConnectPattern::RemoteToLocalViaServer => Ok((entry.from, 0)),
      _ => Err(GraphError::Unsupported("receive on a border with a local upstream")),
    }
  }
}

/// Partition routing of a linked border pair.
#[derive(Debug, Clone)]
pub struct BorderConnectInfo {
  /// Connection pattern.
  pub pattern: ConnectPattern,
  /// Partitions the upstream side writes; one payload slot each.
  pub from_part: PartitionSet,
  /// Destination partitions of the queues.
  pub to_part: PartitionSet,
  /// Writers every destination waits for eof from.
  pub eof_part: PartitionSet,
}

impl BorderConnectInfo {
  /// Resolves the pattern and partition sets for a pair of borders whose own
  /// partition sets are `from_default` (upstream) and `to_default` (downstream).
  pub fn resolve(
    from_local: bool,
    to_local: bool,
    on_client: bool,
    from_default: &PartitionSet,
    to_default: &PartitionSet,
  ) -> Result<Self> {
    let single = PartitionSet::single();
    let (pattern, from_part, to_part, eof_part) = match (from_local, to_local, on_client) {
      (true, true, _) => (
        ConnectPattern::LocalToLocal,
        from_default.clone(),
        to_default.clone(),
        single,
      ),
      (false, false, true) => (
        ConnectPattern::RemoteToRemoteViaClient,
        from_default.clone(),
        to_default.clone(),
        from_default.clone(),
      ),
      (false, true, false) => (
        ConnectPattern::RemoteToLocalViaServer,
        from_default.clone(),
        from_default.clone(),
        single,
      ),
      (false, true, true) => (
        ConnectPattern::RemoteToLocalViaClient,
        from_default.clone(),
        from_default.clone(),
        single,
      ),
      (true, false, false) => (
        ConnectPattern::LocalToRemoteViaServer,
        to_default.clone(),
        to_default.clone(),
        single,
      ),
      (true, false, true) => (
        ConnectPattern::LocalToRemoteViaClient,
        to_default.clone(),
        to_default.clone(),
        single,
      ),
      (false, false, false) => {
        return Err(GraphError::LinkFailed(
          "remote to remote border outside of a client".to_string(),
        ));
      }
    };
    Ok(Self {
      pattern,
      from_part,
      to_part,
      eof_part,
    })
  }

  /// Eof markers one port receives per remote source partition.
  fn markers_per_source(&self) -> u32 {
    match self.pattern {
      ConnectPattern::RemoteToLocalViaClient => 1,
      ConnectPattern::RemoteToRemoteViaClient | ConnectPattern::RemoteToLocalViaServer => {
        self.to_part.used_count() as u32
      }
      _ => 0,
    }
  }
}

/// Counters and eof bookkeeping of a border on the transport side.
#[derive(Debug)]
pub struct BorderState {
  ports: usize,
  to_part: PartitionSet,
  markers_per_source: u32,
  pushed: AtomicU64,
  popped: AtomicU64,
  pending_bytes: AtomicUsize,
  final_eof: AtomicBitmap,
  markers: Mutex<HashMap<PartId, Vec<u32>>>,
}

impl BorderState {
  fn new(ports: usize, info: &BorderConnectInfo) -> Self {
    Self {
      ports,
      to_part: info.to_part.clone(),
      markers_per_source: info.markers_per_source(),
      pushed: AtomicU64::new(0),
      popped: AtomicU64::new(0),
      pending_bytes: AtomicUsize::new(0),
      final_eof: AtomicBitmap::new(ports * info.to_part.full_count() as usize),
      markers: Mutex::new(HashMap::new()),
    }
  }

  pub(crate) fn on_push(&self, bytes: usize) {
    self.pushed.fetch_add(1, Ordering::Relaxed);
    self.pending_bytes.fetch_add(bytes, Ordering::AcqRel);
  }

  pub(crate) fn on_pop(&self, bytes: usize) {
    self.popped.fetch_add(1, Ordering::Relaxed);
    self.pending_bytes.fetch_sub(bytes, Ordering::AcqRel);
  }

  /// Payloads pushed through this border.
  pub fn pushed(&self) -> u64 {
    self.pushed.load(Ordering::Relaxed)
  }

  /// Payloads popped from this border.
  pub fn popped(&self) -> u64 {
    self.popped.load(Ordering::Relaxed)
  }

  /// Serialized bytes queued and not yet popped.
  pub fn pending_bytes(&self) -> usize {
    self.pending_bytes.load(Ordering::Acquire)
  }

  fn final_index(&self, port: usize, to: PartId) -> usize {
    port * self.to_part.full_count() as usize + to as usize
  }

  /// Records that `port` delivered its final eof for `to`.
  pub fn mark_final(&self, port: usize, to: PartId) -> bool {
    !self.final_eof.set(self.final_index(port, to))
  }

  /// Every port delivered its final eof for `to`.
  pub fn is_final(&self, to: PartId) -> bool {
    (0..self.ports).all(|port| self.final_eof.test(self.final_index(port, to)))
  }

  /// Every port delivered its final eof for every destination partition.
  pub fn all_final(&self) -> bool {
    self.to_part.iter().all(|to| self.is_final(to))
  }

  /// Counts an eof marker from `source` on `port`. Returns `true` exactly
  /// once per source: when every port has seen all of its markers.
  pub fn record_marker(&self, port: usize, source: PartId) -> bool {
    let mut markers = self.markers.lock();
    let counts = markers
      .entry(source)
      .or_insert_with(|| vec![0; self.ports]);
    counts[port] += 1;
    let expected = self.markers_per_source;
    counts[port] == expected && counts.iter().all(|&count| count >= expected)
  }
}

/// The ports of one side of a subgraph boundary.
pub struct Border {
  id: BorderId,
  part: PartitionSet,
  local: bool,
  env: Arc<PortEnv>,
  ports: Vec<Arc<Port>>,
  port_ids: HashMap<PortKey, usize>,
  linked: AtomicBool,
  connect: OnceLock<Arc<BorderConnectInfo>>,
  state: OnceLock<Arc<BorderState>>,
}

impl Border {
  /// Creates an empty border. `local` says whether `id.subgraph` runs in
  /// this process; it decides the store kind of the ports.
  pub fn new(id: BorderId, part: PartitionSet, local: bool, env: Arc<PortEnv>) -> Self {
    Self {
      id,
      part,
      local,
      env,
      ports: Vec::new(),
      port_ids: HashMap::new(),
      linked: AtomicBool::new(false),
      connect: OnceLock::new(),
      state: OnceLock::new(),
    }
  }

  /// Appends a port and returns its id.
  pub fn add_port(&mut self, key: PortKey, flags: PortFlags) -> Result<usize> {
    if self.port_ids.contains_key(&key) {
      return Err(GraphError::PortAlreadyLinked(key.to_string()));
    }
    let id = self.ports.len();
    let store = if self.local {
      StoreKind::Data
    } else {
      StoreKind::Serialized
    };
    self.port_ids.insert(key.clone(), id);
    self.ports.push(Arc::new(Port::new(
      id,
      key,
      self.id,
      store,
      flags,
      Arc::clone(&self.env),
    )));
    Ok(id)
  }

  /// Border id.
  pub fn id(&self) -> BorderId {
    self.id
  }

  /// Partition set of the owning subgraph on this border.
  pub fn part(&self) -> &PartitionSet {
    &self.part
  }

  /// Whether the owning subgraph runs in this process.
  pub fn is_local(&self) -> bool {
    self.local
  }

  /// Ports in id order.
  pub fn ports(&self) -> &[Arc<Port>] {
    &self.ports
  }

  /// Port by id.
  pub fn port(&self, id: usize) -> Result<&Arc<Port>> {
    self
      .ports
      .get(id)
      .ok_or_else(|| GraphError::PortNotFound(format!("{}#{}", self.id, id)))
  }

  /// Port by identity.
  pub fn port_by_key(&self, key: &PortKey) -> Option<&Arc<Port>> {
    self.port_ids.get(key).map(|&id| &self.ports[id])
  }

  /// Whether [`Border::link_to`] succeeded or is in progress.
  pub fn is_linked(&self) -> bool {
    self.linked.load(Ordering::Acquire)
  }

  /// Connection info, once linked.
  pub fn connect_info(&self) -> Result<&Arc<BorderConnectInfo>> {
    self
      .connect
      .get()
      .ok_or_else(|| GraphError::LinkFailed(format!("border {} is not linked", self.id)))
  }

  /// Transport-side state, present on borders of subgraphs running elsewhere.
  pub fn state(&self) -> Option<&Arc<BorderState>> {
    self.state.get()
  }

  fn claim_link(&self) -> Result<()> {
    self
      .linked
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .map(|_| ())
      .map_err(|_| GraphError::BorderAlreadyLinked(self.id.to_string()))
  }

  /// Links this output border to the matching input border `peer`.
  pub fn link_to(&self, peer: &Border, on_client: bool) -> Result<()> {
    if self.id.io != PortIo::Output || peer.id != self.id.mirrored() {
      return Err(GraphError::LinkFailed(format!(
        "border {} cannot link to {}",
        self.id, peer.id
      )));
    }
    self.claim_link()?;
    peer.claim_link()?;

    let info = Arc::new(BorderConnectInfo::resolve(
      self.local,
      peer.local,
      on_client,
      &self.part,
      &peer.part,
    )?);
    for border in [self, peer] {
      if !border.local {
        let _ = border
          .state
          .set(Arc::new(BorderState::new(border.ports.len(), &info)));
      }
    }
    let state = peer.state().or(self.state()).cloned();

    for port in &self.ports {
      let peer_port = peer
        .port_by_key(&port.key().mirrored())
        .ok_or_else(|| GraphError::LinkFailed(format!("no peer port for {}", port.key())))?;
      let label = peer_port.label();
      let queue = if port.is_shuffle() {
        PortQueue::Shuffle(ShuffleQueue::new(
          label,
          info.to_part.clone(),
          info.eof_part.clone(),
          state.clone(),
        ))
      } else {
        PortQueue::Normal(NormalQueue::new(
          label,
          info.to_part.clone(),
          info.eof_part.clone(),
          state.clone(),
        ))
      };
      let queue = Arc::new(queue);
      port.link(peer_port, Arc::clone(&queue), Arc::clone(&info))?;
      peer_port.link(port, queue, Arc::clone(&info))?;
    }
    if let Some(unpaired) = peer.ports.iter().find(|port| !port.is_linked()) {
      return Err(GraphError::LinkFailed(format!(
        "no peer port for {}",
        unpaired.key()
      )));
    }

    let _ = self.connect.set(Arc::clone(&info));
    let _ = peer.connect.set(Arc::clone(&info));
    debug!(
      border = %self.id,
      pattern = ?info.pattern,
      from = info.from_part.used_count(),
      to = info.to_part.used_count(),
      "border linked"
    );
    Ok(())
  }

  /// Drains queued entries for destination `to` into one message, stopping
  /// once `limit` serialized bytes are collected.
  ///
  /// Returns the message and whether entries were left behind.
  pub fn collect_border_message(&self, to: PartId, limit: usize) -> Result<(BorderMessage, bool)> {
    let mut message = BorderMessage::new(self.id);
    let mut bytes = 0;
    for port in &self.ports {
      if port.is_shuffle() {
        continue;
      }
      loop {
        if bytes >= limit {
          return Ok((message, true));
        }
        match port.pop(to)? {
          Popped::Empty | Popped::Finished => break,
          Popped::Data {
            from,
            item: QueueItem::Wire(wire),
          } => {
            bytes += wire.len();
            message.entries.push(PortEntry::data(port.id(), from, to, &wire));
          }
          Popped::Data {
            item: QueueItem::Data(_),
            ..
          } => return Err(GraphError::Unsupported("in-memory payload on a transport port")),
          Popped::Eof { from, finished } => {
            message.entries.push(PortEntry::eof(port.id(), from, to));
            if finished && let Some(state) = self.state() {
              state.mark_final(port.id(), to);
            }
          }
        }
      }
    }
    Ok((message, false))
  }

  /// Pushes every entry of `message`, received from remote partition
  /// `source`, into the port it names.
  ///
  /// Returns `[source]` when this message completed the eof markers expected
  /// from it on every port.
  pub fn receive(&self, message: &BorderMessage, source: PartId) -> Result<Vec<PartId>> {
    let info = self.connect_info()?;
    let mut completed = Vec::new();
    for entry in &message.entries {
      let port = self.port(entry.port_id as usize)?;
      let (to, from) = info.pattern.route(source, entry)?;
      let item = if entry.eof {
        None
      } else {
        let lease = self.env.pool.lease(entry.bytes.len());
        Some(QueueItem::Wire(
          WirePayload::new(entry.type_name.as_str(), entry.bytes.clone()).with_lease(lease),
        ))
      };
      port.push_item(to, from, item, entry.eof)?;
      if entry.eof {
        trace!(border = %self.id, port = port.id(), to, from, source, "eof received");
        if let Some(state) = self.state()
          && state.record_marker(port.id(), source)
        {
          completed.push(source);
        }
      }
    }
    Ok(completed)
  }
}

impl fmt::Debug for Border {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Border")
      .field("id", &self.id)
      .field("part", &self.part)
      .field("local", &self.local)
      .field("ports", &self.ports.len())
      .field("linked", &self.is_linked())
      .finish()
  }
}
