//! # Server Domain
//!
//! The server end of one partition of a remote subgraph. Its stream is bound
//! when the domain is created. It sends what the local nodes push to its
//! input borders, feeds inbound client data to its output borders, and
//! finalizes once the local subgraph finished and every eof went out:
//! `Eof`, then the run's traces, then a `Finalize` carrying the rest of the
//! run's summary.

use super::{Domain, DomainCore, DomainKind};
use crate::border::{Border, BorderId, SubgraphId};
use crate::error::{GraphError, Result};
use crate::partition::{PartId, PartitionSet};
use crate::port::{Port, PortListener};
use crate::run::GraphRun;
use crate::stream_state::StreamState;
use crate::transport::{RpcStream, send_with_retry};
use crate::wire::{ControlMessage, StreamMessage};
use crate::worker::Worker;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// Settings a server domain is built with.
pub(crate) struct ServerSetup {
  pub subgraph: SubgraphId,
  pub partition: PartId,
  pub served: PartitionSet,
  pub inputs: Vec<Arc<Border>>,
  pub outputs: Vec<Arc<Border>>,
  pub stream: Arc<dyn RpcStream>,
  pub batch_limit: usize,
  pub retries: u32,
}

/// Server end of one served partition.
pub struct ServerDomain {
  core: DomainCore,
  self_ref: Weak<ServerDomain>,
  partition: PartId,
  inputs: Vec<Arc<Border>>,
  outputs: HashMap<BorderId, Arc<Border>>,
  stream: Mutex<Option<Arc<dyn RpcStream>>>,
  state: StreamState,
  local_done: AtomicBool,
  finalized: AtomicBool,
  batch_limit: usize,
  retries: u32,
}

impl ServerDomain {
  pub(crate) fn new(setup: ServerSetup, worker: Arc<Worker>) -> Result<Arc<Self>> {
    let ServerSetup {
      subgraph,
      partition,
      served,
      inputs,
      outputs,
      stream,
      batch_limit,
      retries,
    } = setup;
    let state = StreamState::new(PartitionSet::from_ids(served.full_count(), &[partition])?);
    Ok(Arc::new_cyclic(|self_ref| Self {
      core: DomainCore::new(
        format!("server-{subgraph}/{partition}"),
        DomainKind::Server,
        subgraph,
        worker,
      ),
      self_ref: self_ref.clone(),
      partition,
      inputs,
      outputs: outputs
        .into_iter()
        .map(|border| (border.id(), border))
        .collect(),
      stream: Mutex::new(Some(stream)),
      state,
      local_done: AtomicBool::new(false),
      finalized: AtomicBool::new(false),
      batch_limit,
      retries,
    }))
  }

  /// Installs the push listener on every input border port.
  pub(crate) fn listen(self: &Arc<Self>) {
    for border in &self.inputs {
      for port in border.ports() {
        port.set_listener(Arc::new(ServerListener {
          server: Arc::downgrade(self),
        }));
      }
    }
  }

  /// Served partition.
  pub fn partition(&self) -> PartId {
    self.partition
  }

  /// Whether `Finalize` went out.
  pub fn is_finalized(&self) -> bool {
    self.finalized.load(Ordering::Acquire)
  }

  fn stream(&self) -> Option<Arc<dyn RpcStream>> {
    self.stream.lock().clone()
  }

  fn schedule_send(&self) {
    let Some(server) = self.self_ref.upgrade() else {
      return;
    };
    self
      .core
      .worker()
      .schedule_fn(move || server.send_loop(), false);
  }

  fn on_push(&self) {
    self.state.add_message(self.partition);
    self.schedule_send();
  }

  fn send_loop(&self) {
    let partition = self.partition;
    if !self.state.is_initialized(partition) {
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
      let flushed = self.flush();
      self.state.sub_messages(partition, snapshot);
      drop(scope);
      if let Err(error) = flushed {
        self.fail_unless_cancelled(error);
        return;
      }
      if self.state.no_message(partition) {
        break;
      }
    }
    self.try_finalize();
  }

  fn flush(&self) -> Result<()> {
    loop {
      let mut borders = Vec::new();
      let mut more = false;
      for border in &self.inputs {
        for to in border.connect_info()?.to_part.iter() {
          let (message, left) = border.collect_border_message(to, self.batch_limit)?;
          more |= left;
          if !message.is_empty() {
            borders.push(message);
          }
        }
      }
      if !borders.is_empty() {
        self.send(StreamMessage::data(self.partition, borders))?;
      }
      if !more {
        return Ok(());
      }
    }
  }

  fn send(&self, message: StreamMessage) -> Result<()> {
    let stream = self.stream().ok_or_else(|| GraphError::StreamSend {
      partition: self.partition,
      reason: "stream is closed".to_string(),
    })?;
    send_with_retry(stream.as_ref(), &self.state, self.partition, &message, self.retries).map_err(
      |error| GraphError::StreamSend {
        partition: self.partition,
        reason: error.to_string(),
      },
    )
  }

  fn fail_unless_cancelled(&self, error: GraphError) {
    if self.state.is_cancelled(self.partition) {
      debug!(server = %self.core.name(), %error, "send failed on a cancelled partition");
      return;
    }
    if let Some(run) = self.core.run() {
      run.fail(error);
    }
  }

  pub(crate) fn on_local_finished(&self) {
    self.local_done.store(true, Ordering::Release);
    self.try_finalize();
  }

  fn try_finalize(&self) {
    let partition = self.partition;
    if !self.local_done.load(Ordering::Acquire)
      || self.core.is_terminated()
      || self.state.is_sending(partition)
      || !self.state.no_message(partition)
      || !self
        .inputs
        .iter()
        .all(|border| border.state().is_none_or(|state| state.all_final()))
    {
      return;
    }
    if self.finalized.swap(true, Ordering::AcqRel) {
      return;
    }
    let Some(run) = self.core.run() else {
      return;
    };
    let mut summary = run.result().summary();
    let traces = std::mem::take(&mut summary.traces);
    let sent = self
      .send(StreamMessage::control(partition, ControlMessage::Eof))
      .and_then(|()| self.send(StreamMessage::control(partition, ControlMessage::Trace(traces))))
      .and_then(|()| self.send(StreamMessage::control(partition, ControlMessage::Finalize(summary))));
    match sent {
      Ok(()) => {
        self.state.set_send_eof(partition);
        info!(server = %self.core.name(), "partition finalized");
        self.notify_finish(None, true);
      }
      Err(error) => self.fail_unless_cancelled(error),
    }
  }

  /// Handles one message from the client.
  pub fn receive(&self, message: StreamMessage) {
    if self.core.is_terminated() {
      trace!(server = %self.core.name(), "message after termination dropped");
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
    if message.partition != self.partition {
      return Err(GraphError::PartIdOverflow {
        id: message.partition,
        count: self.state.parts().full_count(),
      });
    }
    for border_message in &message.borders {
      let target = border_message.target_border();
      let border = self.outputs.get(&target).ok_or_else(|| {
        GraphError::LinkFailed(format!("server {} has no border {}", self.core.name(), target))
      })?;
      border.receive(border_message, self.partition)?;
    }
    match message.control {
      None => {}
      Some(ControlMessage::Eof) => {
        if self.state.set_receive_eof(self.partition) {
          debug!(server = %self.core.name(), "client sent all eof");
        }
      }
      Some(ControlMessage::Trace(events)) => run.result().add_traces(events),
      Some(ControlMessage::Finalize(summary)) => run.result().merge_summary(&summary),
      Some(ControlMessage::Cancel) => {
        warn!(server = %self.core.name(), "cancelled by client");
        self.state.set_cancelled(self.partition);
        run.fail(GraphError::Cancelled);
      }
    }
    Ok(())
  }

  fn unbind(&self) {
    if let Some(stream) = self.stream.lock().take() {
      stream.close();
    }
  }
}

impl Domain for ServerDomain {
  fn core(&self) -> &DomainCore {
    &self.core
  }

  fn run(&self, _run: &Arc<GraphRun>) -> Result<()> {
    self.state.set_initialized_all();
    self.schedule_send();
    Ok(())
  }

  fn on_terminate(&self, run: Option<&Arc<GraphRun>>, error: Option<&GraphError>) {
    if let Some(error) = error
      && !self.state.is_cancelled(self.partition)
      && !self.finalized.swap(true, Ordering::AcqRel)
    {
      let mut summary = run.map(|run| run.result().summary()).unwrap_or_default();
      summary.merge_error(error.code(), &error.to_string(), None);
      let finalize = StreamMessage::control(self.partition, ControlMessage::Finalize(summary));
      if let Err(error) = self.send(finalize) {
        debug!(server = %self.core.name(), %error, "error finalize not delivered");
      }
    }
    self.unbind();
  }
}

struct ServerListener {
  server: Weak<ServerDomain>,
}

impl PortListener for ServerListener {
  fn on_push(&self, _port: &Port, _to: PartId) {
    if let Some(server) = self.server.upgrade() {
      server.on_push();
    }
  }
}
