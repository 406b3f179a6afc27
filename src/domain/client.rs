//! # Client Domain
//!
//! The client end of one remote subgraph. It connects once, during
//! `pre_init`, and from then on:
//!
//! - sends whatever accumulates on the subgraph's input borders, one send
//!   loop per remote partition, serialized by the partition's send scope;
//! - routes inbound border data to its output borders, where it is
//!   deserialized for local consumers or relayed to another remote subgraph;
//! - finishes once every partition delivered its `Finalize`.
//!
//! A failed run cancels every partition not finalized yet.

use super::{Domain, DomainCore, DomainKind};
use crate::bitmap::AtomicBitmap;
use crate::border::{Border, BorderId, SubgraphId};
use crate::error::{GraphError, Result};
use crate::graph::GraphDef;
use crate::partition::{PartId, PartitionSet};
use crate::port::{Port, PortListener};
use crate::run::GraphRun;
use crate::stream_state::StreamState;
use crate::transport::{ConnectRequest, Connector, RpcStream, StreamReceiver, send_with_retry};
use crate::wire::{ControlMessage, StreamMessage};
use crate::worker::Worker;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Settings a client domain is built with.
pub(crate) struct ClientSetup {
  pub subgraph: SubgraphId,
  pub graph: Arc<GraphDef>,
  pub remote: PartitionSet,
  pub inputs: Vec<Arc<Border>>,
  pub outputs: Vec<Arc<Border>>,
  pub connector: Option<Arc<dyn Connector>>,
  pub batch_limit: usize,
  pub retries: u32,
}

/// Client end of a remote subgraph's stream.
pub struct ClientDomain {
  core: DomainCore,
  self_ref: Weak<ClientDomain>,
  graph: Arc<GraphDef>,
  remote: PartitionSet,
  inputs: Vec<Arc<Border>>,
  outputs: HashMap<BorderId, Arc<Border>>,
  connector: Option<Arc<dyn Connector>>,
  stream: RwLock<Option<Arc<dyn RpcStream>>>,
  stream_held: AtomicBool,
  state: StreamState,
  finalized: AtomicBitmap,
  batch_limit: usize,
  retries: u32,
}

impl ClientDomain {
  pub(crate) fn new(setup: ClientSetup, worker: Arc<Worker>) -> Arc<Self> {
    let full = setup.remote.full_count() as usize;
    Arc::new_cyclic(|self_ref| Self {
      core: DomainCore::new(
        format!("client-{}", setup.subgraph),
        DomainKind::Client,
        setup.subgraph,
        worker,
      ),
      self_ref: self_ref.clone(),
      graph: setup.graph,
      state: StreamState::new(setup.remote.clone()),
      finalized: AtomicBitmap::new(full),
      remote: setup.remote,
      inputs: setup.inputs,
      outputs: setup
        .outputs
        .into_iter()
        .map(|border| (border.id(), border))
        .collect(),
      connector: setup.connector,
      stream: RwLock::new(None),
      stream_held: AtomicBool::new(false),
      batch_limit: setup.batch_limit,
      retries: setup.retries,
    })
  }

  /// Installs the push listener on every input border port.
  pub(crate) fn listen(self: &Arc<Self>) {
    for border in &self.inputs {
      for port in border.ports() {
        port.set_listener(Arc::new(ClientListener {
          client: Arc::downgrade(self),
        }));
      }
    }
  }

  /// Remote partitions of the subgraph.
  pub fn partitions(&self) -> &PartitionSet {
    &self.remote
  }

  /// Send and receive bookkeeping.
  pub fn stream_state(&self) -> &StreamState {
    &self.state
  }

  /// Whether `partition` delivered its `Finalize`.
  pub fn is_finalized(&self, partition: PartId) -> bool {
    self.finalized.test(partition as usize)
  }

  fn schedule_send(&self, partition: PartId) {
    let Some(client) = self.self_ref.upgrade() else {
      return;
    };
    self
      .core
      .worker()
      .schedule_fn(move || client.send_loop(partition), false);
  }

  fn on_push(&self, to: PartId) {
    self.state.add_message(to);
    self.schedule_send(to);
  }

  fn send_loop(&self, partition: PartId) {
    // Pushes may arrive before `pre_init` bound the stream; `run` schedules
    // every partition again once it is bound.
    if !self.state.is_initialized(partition) || self.stream.read().is_none() {
      return;
    }
    loop {
      if self.core.is_terminated() {
        return;
      }
      let Some(scope) = self.state.try_send_scope(partition) else {
        return;
      };
      let snapshot = self.state.message_count(partition);
      let flushed = self.flush(partition);
      self.state.sub_messages(partition, snapshot);
      drop(scope);
      if let Err(error) = flushed {
        if !self.state.is_cancelled(partition)
          && let Some(run) = self.core.run()
        {
          run.fail(error);
        }
        return;
      }
      // A push between the flush and the scope release counted a message
      // whose own send attempt found the scope taken.
      if self.state.no_message(partition) {
        return;
      }
    }
  }

  fn flush(&self, partition: PartId) -> Result<()> {
    loop {
      let mut borders = Vec::new();
      let mut more = false;
      for border in &self.inputs {
        let (message, left) = border.collect_border_message(partition, self.batch_limit)?;
        more |= left;
        if !message.is_empty() {
          borders.push(message);
        }
      }
      if !borders.is_empty() {
        self.send(partition, StreamMessage::data(partition, borders))?;
      }
      if !more {
        break;
      }
    }
    if self.inputs.iter().all(|border| {
      border
        .state()
        .is_none_or(|state| state.is_final(partition))
    }) && self.state.set_send_eof(partition)
    {
      debug!(client = %self.core.name(), partition, "all eof sent");
      self.send(partition, StreamMessage::control(partition, ControlMessage::Eof))?;
    }
    Ok(())
  }

  fn send(&self, partition: PartId, message: StreamMessage) -> Result<()> {
    let stream = self.stream.read().clone().ok_or_else(|| GraphError::StreamSend {
      partition,
      reason: "stream is not connected".to_string(),
    })?;
    send_with_retry(stream.as_ref(), &self.state, partition, &message, self.retries).map_err(|error| {
      if let Some(run) = self.core.run() {
        run
          .result()
          .add_rpc_diagnostic(format!("{}/{}", self.core.name(), partition), error.to_string());
      }
      GraphError::StreamSend {
        partition,
        reason: error.to_string(),
      }
    })
  }

  /// Handles one message from the server of `message.partition`.
  pub fn receive(&self, message: StreamMessage) {
    let partition = message.partition;
    if self.core.is_terminated() {
      trace!(client = %self.core.name(), partition, "message after termination dropped");
      return;
    }
    let Some(run) = self.core.run() else {
      return;
    };
    if let Err(error) = self.apply(&run, message) {
      run.fail(error);
    }
  }

  fn apply(&self, run: &Arc<GraphRun>, message: StreamMessage) -> Result<()> {
    let partition = message.partition;
    self.remote.check(partition)?;
    for border_message in &message.borders {
      let target = border_message.target_border();
      let border = self.outputs.get(&target).ok_or_else(|| {
        GraphError::LinkFailed(format!("client {} has no border {}", self.core.name(), target))
      })?;
      for source in border.receive(border_message, partition)? {
        trace!(client = %self.core.name(), border = %target, source, "border eof complete");
      }
    }
    match message.control {
      None => {}
      Some(ControlMessage::Eof) => {
        self.state.set_receive_eof(partition);
      }
      Some(ControlMessage::Trace(events)) => run.result().add_traces(events),
      Some(ControlMessage::Finalize(summary)) => {
        run.result().merge_summary(&summary);
        if let Some(error) = summary.error() {
          run.fail(error);
          return Ok(());
        }
        if !self.finalized.set(partition as usize) {
          debug!(client = %self.core.name(), partition, "partition finalized");
        }
        if self.remote.iter().all(|id| self.is_finalized(id)) {
          self.notify_finish(None, true);
        }
      }
      Some(ControlMessage::Cancel) => {
        warn!(client = %self.core.name(), partition, "server cancelled partition");
        self.state.set_cancelled(partition);
        run.fail(GraphError::Cancelled);
      }
    }
    Ok(())
  }

  fn unbind(&self) {
    if let Some(stream) = self.stream.write().take() {
      stream.close();
    }
    if self.stream_held.swap(false, Ordering::AcqRel) {
      self.release("stream");
    }
  }
}

impl Domain for ClientDomain {
  fn core(&self) -> &DomainCore {
    &self.core
  }

  fn pre_init(&self, run: &Arc<GraphRun>) -> Result<()> {
    let connector = self.connector.clone().ok_or_else(|| GraphError::StreamSend {
      partition: 0,
      reason: format!("no connector for remote subgraph {}", self.core.subgraph()),
    })?;
    let receiver: Arc<dyn StreamReceiver> = Arc::new(ClientReceiver {
      client: self.self_ref.clone(),
    });
    let request = ConnectRequest {
      graph: Arc::clone(&self.graph),
      subgraph: self.core.subgraph(),
      part: self.remote.fill_descriptor(),
      timeout: run.remaining(),
    };
    // Servers may finalize before `connect` returns; the stream reference
    // must already be held by then.
    self.acquire("stream");
    self.stream_held.store(true, Ordering::Release);
    let stream = match connector.connect(request, receiver) {
      Ok(stream) => stream,
      Err(error) => {
        self.unbind();
        return Err(GraphError::StreamSend {
          partition: 0,
          reason: error.to_string(),
        });
      }
    };
    if self.core.is_terminated() {
      stream.close();
      return Ok(());
    }
    *self.stream.write() = Some(stream);
    debug!(client = %self.core.name(), partitions = self.remote.used_count(), "connected");
    Ok(())
  }

  fn run(&self, _run: &Arc<GraphRun>) -> Result<()> {
    self.state.set_initialized_all();
    for partition in self.remote.iter() {
      self.schedule_send(partition);
    }
    Ok(())
  }

  fn on_terminate(&self, _run: Option<&Arc<GraphRun>>, error: Option<&GraphError>) {
    if error.is_some() {
      let stream = self.stream.read().clone();
      for partition in self.remote.iter() {
        if self.is_finalized(partition) || !self.state.set_cancelled(partition) {
          continue;
        }
        if let Some(stream) = &stream
          && let Err(error) =
            stream.send(partition, StreamMessage::control(partition, ControlMessage::Cancel))
        {
          debug!(client = %self.core.name(), partition, %error, "cancel not delivered");
        }
      }
    }
    self.unbind();
  }
}

struct ClientListener {
  client: Weak<ClientDomain>,
}

impl PortListener for ClientListener {
  fn on_push(&self, _port: &Port, to: PartId) {
    if let Some(client) = self.client.upgrade() {
      client.on_push(to);
    }
  }
}

struct ClientReceiver {
  client: Weak<ClientDomain>,
}

impl StreamReceiver for ClientReceiver {
  fn receive(&self, message: StreamMessage) {
    if let Some(client) = self.client.upgrade() {
      client.receive(message);
    }
  }
}
