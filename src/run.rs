//! # Graph Runs
//!
//! A [`GraphRun`] is one execution of a graph in this process, either as the
//! client of the whole graph ([`RunMode::Client`]) or as the server of one
//! partition of a remote subgraph ([`RunMode::Server`]).
//!
//! ## Placement
//!
//! | subgraph | client | server of `S` |
//! |---|---|---|
//! | user sink | local | remote |
//! | local subgraph | local | remote |
//! | remote subgraph `S` | remote | local |
//! | other remote subgraph | remote | remote |
//!
//! Edges inside a subgraph are built only where the subgraph is local. Edges
//! across subgraphs are built where either end is local; the client also
//! builds edges between two remote subgraphs and relays their data.
//!
//! ## Lifecycle
//!
//! 1. `build`: validate, create borders and ports in edge order, link every
//!    output border to its mirror, create nodes and domains.
//! 2. `start`: acquire every domain, start the deadline watchdog, `pre_init`
//!    every domain, `run` every domain, then schedule every node once.
//! 3. Nodes run on the worker as their inputs become ready; domains finish.
//! 4. The last domain release completes the worker, which completes the run:
//!    the result is finalized, waiters wake and completion hooks run.
//!
//! The first failure wins. It cancels the run's token, which cancels forked
//! runs, and terminates every domain with the error.

use crate::border::{Border, BorderId, SubgraphId, USER_SUBGRAPH};
use crate::config::EngineConfig;
use crate::domain::Domain;
use crate::domain::client::{ClientDomain, ClientSetup};
use crate::domain::fork::ForkDomain;
use crate::domain::local::LocalDomain;
use crate::domain::server::{ServerDomain, ServerSetup};
use crate::domain::user::{DataCallback, SinkItem, SinkPoll, UserDomain};
use crate::error::{GraphError, Result};
use crate::graph::{GraphDef, Link};
use crate::node::{KernelContext, KernelRegistry, NodeInput, NodeInstance, NodeListener};
use crate::partition::{PartId, PartitionSet};
use crate::port::{Port, PortEnv, PortIo, PortKey};
use crate::result::{ResultSummary, RunResult};
use crate::transport::{Connector, RpcStream};
use crate::worker::Worker;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Which side of the graph a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
  /// The caller's side: local subgraphs, the user sink, and clients of every
  /// remote subgraph.
  Client,
  /// One partition of a remote subgraph.
  Server {
    /// Served subgraph.
    subgraph: SubgraphId,
    /// Served partition.
    partition: PartId,
  },
}

/// Engine services shared by every run.
#[derive(Clone)]
pub struct RunContext {
  /// Engine configuration.
  pub config: Arc<EngineConfig>,
  /// Kernel factories.
  pub kernels: Arc<KernelRegistry>,
  /// Data types and memory pool.
  pub env: Arc<PortEnv>,
  /// Connector for remote subgraphs.
  pub connector: Option<Arc<dyn Connector>>,
  /// Runtime the run's work executes on.
  pub handle: Handle,
}

impl fmt::Debug for RunContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RunContext")
      .field("config", &self.config)
      .field("kernels", &self.kernels)
      .field("connector", &self.connector.is_some())
      .finish_non_exhaustive()
  }
}

/// Everything a run is built from.
pub(crate) struct RunSpec {
  pub name: String,
  pub graph: Arc<GraphDef>,
  pub mode: RunMode,
  pub ctx: RunContext,
  pub deadline: Instant,
  pub cancel: CancellationToken,
  pub stream: Option<Arc<dyn RpcStream>>,
}

/// Which subgraphs run here and how their borders are partitioned.
struct Topology<'a> {
  graph: &'a GraphDef,
  mode: RunMode,
  remote_parts: HashMap<SubgraphId, PartitionSet>,
}

impl<'a> Topology<'a> {
  fn new(graph: &'a GraphDef, mode: RunMode) -> Result<Self> {
    let mut remote_parts = HashMap::new();
    for subgraph in graph.subgraphs.iter().filter(|subgraph| subgraph.is_remote()) {
      remote_parts.insert(
        subgraph.id,
        PartitionSet::from_descriptor(&subgraph.partitions)?,
      );
    }
    Ok(Self {
      graph,
      mode,
      remote_parts,
    })
  }

  fn is_local(&self, subgraph: SubgraphId) -> bool {
    match self.mode {
      RunMode::Client => {
        subgraph == USER_SUBGRAPH
          || self
            .graph
            .find_subgraph(subgraph)
            .is_some_and(|def| !def.is_remote())
      }
      RunMode::Server { subgraph: served, .. } => subgraph == served,
    }
  }

  /// Partitions of a remote subgraph; everything else is a single partition.
  fn parts_of(&self, subgraph: SubgraphId) -> PartitionSet {
    self
      .remote_parts
      .get(&subgraph)
      .cloned()
      .unwrap_or_else(PartitionSet::single)
  }

  fn part(&self, id: BorderId) -> PartitionSet {
    if id.subgraph == id.peer {
      return PartitionSet::single();
    }
    self.parts_of(id.subgraph)
  }

  fn builds(&self, link: &Link) -> bool {
    if link.from_subgraph == link.to_subgraph {
      return self.is_local(link.from_subgraph);
    }
    self.mode == RunMode::Client || self.is_local(link.from_subgraph) || self.is_local(link.to_subgraph)
  }
}

type DoneHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct DoneHooks {
  fired: bool,
  list: Vec<DoneHook>,
}

/// One execution of a graph.
pub struct GraphRun {
  name: String,
  graph: Arc<GraphDef>,
  mode: RunMode,
  ctx: RunContext,
  worker: Arc<Worker>,
  result: Arc<RunResult>,
  borders: Vec<Arc<Border>>,
  border_index: HashMap<BorderId, usize>,
  nodes: Vec<NodeInstance>,
  domains: Vec<Arc<dyn Domain>>,
  locals: Vec<Arc<LocalDomain>>,
  user: Option<Arc<UserDomain>>,
  clients: Vec<Arc<ClientDomain>>,
  server: Option<Arc<ServerDomain>>,
  forks: Mutex<Vec<Arc<ForkDomain>>>,
  deadline: Instant,
  cancel: CancellationToken,
  done: CancellationToken,
  failed: AtomicBool,
  completed: Mutex<bool>,
  completed_cv: Condvar,
  done_hooks: Mutex<DoneHooks>,
  keep_alive: Mutex<Option<Arc<GraphRun>>>,
}

fn sort_ports(ports: &mut [Arc<Port>]) {
  ports.sort_by(|a, b| {
    let (a, b) = (a.key(), b.key());
    (&a.port, &a.peer_node, &a.peer_port).cmp(&(&b.port, &b.peer_node, &b.peer_port))
  });
}

impl GraphRun {
  /// Builds a run; nothing executes until [`GraphRun::start`].
  pub(crate) fn build(spec: RunSpec) -> Result<Arc<Self>> {
    let RunSpec {
      name,
      graph,
      mode,
      ctx,
      deadline,
      cancel,
      stream,
    } = spec;
    graph.validate()?;
    let topology = Topology::new(&graph, mode)?;
    let on_client = mode == RunMode::Client;

    let mut building: Vec<Border> = Vec::new();
    let mut border_index: HashMap<BorderId, usize> = HashMap::new();
    for link in graph.links()? {
      if !topology.builds(&link) {
        continue;
      }
      let output = BorderId::new(PortIo::Output, link.from_subgraph, link.to_subgraph);
      let key = PortKey::new(
        link.from.node.as_str(),
        link.from.port.as_str(),
        link.to.node.as_str(),
        link.to.port.as_str(),
      );
      for (id, key) in [(output, key.clone()), (output.mirrored(), key.mirrored())] {
        let slot = *border_index.entry(id).or_insert_with(|| {
          building.push(Border::new(
            id,
            topology.part(id),
            topology.is_local(id.subgraph),
            Arc::clone(&ctx.env),
          ));
          building.len() - 1
        });
        building[slot].add_port(key, link.flags)?;
      }
    }
    let borders: Vec<Arc<Border>> = building.into_iter().map(Arc::new).collect();
    for border in borders.iter().filter(|border| border.id().io == PortIo::Output) {
      let peer = border_index
        .get(&border.id().mirrored())
        .map(|&index| &borders[index])
        .ok_or_else(|| GraphError::LinkFailed(format!("no mirror of border {}", border.id())))?;
      border.link_to(peer, on_client)?;
    }

    let worker = Worker::new(name.clone(), ctx.handle.clone(), ctx.config.worker.clone());
    let ports_of = |io: PortIo, subgraph: SubgraphId, node: Option<&str>| {
      let mut ports: Vec<Arc<Port>> = borders
        .iter()
        .filter(|border| border.id().io == io && border.id().subgraph == subgraph)
        .flat_map(|border| border.ports().iter().cloned())
        .filter(|port| node.is_none_or(|node| port.key().node == node))
        .collect();
      sort_ports(&mut ports);
      ports
    };

    let mut nodes = Vec::new();
    let mut locals = Vec::new();
    for subgraph in graph
      .subgraphs
      .iter()
      .filter(|subgraph| topology.is_local(subgraph.id))
    {
      let mut members = Vec::with_capacity(subgraph.nodes.len());
      for def in &subgraph.nodes {
        let kernel = ctx.kernels.create(def)?;
        let inputs = ports_of(PortIo::Input, subgraph.id, Some(&def.name))
          .into_iter()
          .map(NodeInput::new)
          .collect::<Result<Vec<_>>>()?;
        let outputs = ports_of(PortIo::Output, subgraph.id, Some(&def.name));
        let index = nodes.len();
        members.push(index);
        nodes.push(NodeInstance::new(
          index,
          def.clone(),
          kernel,
          locals.len(),
          inputs,
          outputs,
        ));
      }
      locals.push(Arc::new(LocalDomain::new(
        subgraph.id,
        members,
        Arc::clone(&worker),
      )));
    }

    let mut user = None;
    let mut clients = Vec::new();
    let mut server = None;
    match mode {
      RunMode::Client => {
        user = Some(Arc::new(UserDomain::new(
          ports_of(PortIo::Input, USER_SUBGRAPH, None),
          Arc::clone(&worker),
        )?));
        for subgraph in graph.subgraphs.iter().filter(|subgraph| subgraph.is_remote()) {
          let of = |io: PortIo| -> Vec<Arc<Border>> {
            borders
              .iter()
              .filter(|border| border.id().io == io && border.id().subgraph == subgraph.id)
              .cloned()
              .collect()
          };
          clients.push(ClientDomain::new(
            ClientSetup {
              subgraph: subgraph.id,
              graph: Arc::clone(&graph),
              remote: topology.parts_of(subgraph.id),
              inputs: of(PortIo::Input),
              outputs: of(PortIo::Output),
              connector: ctx.connector.clone(),
              batch_limit: ctx.config.batch_limit_bytes,
              retries: ctx.config.send_retries,
            },
            Arc::clone(&worker),
          ));
        }
      }
      RunMode::Server {
        subgraph,
        partition,
      } => {
        let stream = stream.ok_or_else(|| {
          GraphError::InvalidGraph(format!("server run of subgraph {subgraph} has no stream"))
        })?;
        let served = topology.parts_of(subgraph);
        served.check(partition)?;
        let of = |io: PortIo| -> Vec<Arc<Border>> {
          borders
            .iter()
            .filter(|border| border.id().io == io && border.id().subgraph != subgraph)
            .cloned()
            .collect()
        };
        server = Some(ServerDomain::new(
          ServerSetup {
            subgraph,
            partition,
            served,
            inputs: of(PortIo::Input),
            outputs: of(PortIo::Output),
            stream,
            batch_limit: ctx.config.batch_limit_bytes,
            retries: ctx.config.send_retries,
          },
          Arc::clone(&worker),
        )?);
      }
    }

    let mut domains: Vec<Arc<dyn Domain>> = Vec::new();
    domains.extend(locals.iter().map(|local| Arc::clone(local) as Arc<dyn Domain>));
    domains.extend(user.iter().map(|user| Arc::clone(user) as Arc<dyn Domain>));
    domains.extend(clients.iter().map(|client| Arc::clone(client) as Arc<dyn Domain>));
    domains.extend(server.iter().map(|server| Arc::clone(server) as Arc<dyn Domain>));

    let run = Arc::new(Self {
      name,
      graph,
      mode,
      ctx,
      worker,
      result: Arc::new(RunResult::new()),
      borders,
      border_index,
      nodes,
      domains,
      locals,
      user,
      clients,
      server,
      forks: Mutex::new(Vec::new()),
      deadline,
      cancel,
      done: CancellationToken::new(),
      failed: AtomicBool::new(false),
      completed: Mutex::new(false),
      completed_cv: Condvar::new(),
      done_hooks: Mutex::new(DoneHooks::default()),
      keep_alive: Mutex::new(None),
    });
    run.attach();
    debug!(
      run = %run.name,
      mode = ?run.mode,
      borders = run.borders.len(),
      nodes = run.nodes.len(),
      domains = run.domains.len(),
      "run built"
    );
    Ok(run)
  }

  fn attach(self: &Arc<Self>) {
    for domain in &self.domains {
      domain.core().attach(self);
    }
    for node in &self.nodes {
      for input in &node.inputs {
        input.port.set_listener(Arc::new(NodeListener {
          run: Arc::downgrade(self),
          node: node.index,
        }));
      }
    }
    if let Some(user) = &self.user {
      user.listen();
    }
    for client in &self.clients {
      client.listen();
    }
    if let Some(server) = &self.server {
      server.listen();
    }
    let run: Weak<GraphRun> = Arc::downgrade(self);
    self.worker.on_complete(move || {
      if let Some(run) = run.upgrade() {
        run.complete();
      }
    });
  }

  /// Starts the run. It keeps itself alive until it completes.
  pub(crate) fn start(self: &Arc<Self>) {
    *self.keep_alive.lock() = Some(Arc::clone(self));
    info!(
      run = %self.name,
      mode = ?self.mode,
      nodes = self.nodes.len(),
      domains = self.domains.len(),
      "run started"
    );
    if self.domains.is_empty() {
      self.complete();
      return;
    }
    for domain in &self.domains {
      domain.acquire("init");
    }
    self.spawn_watchdog();
    for domain in &self.domains {
      if let Err(error) = domain.pre_init(self) {
        self.fail(error);
        return;
      }
    }
    for domain in &self.domains {
      if let Err(error) = domain.run(self) {
        self.fail(error);
        return;
      }
    }
    for index in 0..self.nodes.len() {
      self.schedule_node(index, false);
    }
  }

  fn spawn_watchdog(self: &Arc<Self>) {
    let run = Arc::clone(self);
    let deadline = self.deadline;
    let cancel = self.cancel.clone();
    let done = self.done.clone();
    self.ctx.handle.spawn(async move {
      tokio::select! {
        _ = done.cancelled() => {}
        _ = tokio::time::sleep_until(deadline) => run.fail(GraphError::Timeout),
        _ = cancel.cancelled() => run.fail(GraphError::Cancelled),
      }
    });
  }

  /// Run name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Execution side.
  pub fn mode(&self) -> RunMode {
    self.mode
  }

  /// The graph being run.
  pub fn graph(&self) -> &Arc<GraphDef> {
    &self.graph
  }

  pub(crate) fn context(&self) -> &RunContext {
    &self.ctx
  }

  /// The run's worker.
  pub fn worker(&self) -> &Arc<Worker> {
    &self.worker
  }

  /// Live result.
  pub fn result(&self) -> &RunResult {
    &self.result
  }

  pub(crate) fn result_arc(&self) -> Arc<RunResult> {
    Arc::clone(&self.result)
  }

  /// Border by id.
  pub fn border(&self, id: BorderId) -> Option<&Arc<Border>> {
    self.border_index.get(&id).map(|&index| &self.borders[index])
  }

  /// Every border built for this run.
  pub fn borders(&self) -> &[Arc<Border>] {
    &self.borders
  }

  pub(crate) fn node(&self, index: usize) -> Option<&NodeInstance> {
    self.nodes.get(index)
  }

  /// Domains in start order.
  pub fn domains(&self) -> &[Arc<dyn Domain>] {
    &self.domains
  }

  /// Server domain of a server run.
  pub fn server(&self) -> Option<&Arc<ServerDomain>> {
    self.server.as_ref()
  }

  /// Client domains, one per remote subgraph.
  pub fn clients(&self) -> &[Arc<ClientDomain>] {
    &self.clients
  }

  /// Run deadline.
  pub fn deadline(&self) -> Instant {
    self.deadline
  }

  /// Time left until the deadline.
  pub fn remaining(&self) -> Duration {
    self.deadline.saturating_duration_since(Instant::now())
  }

  pub(crate) fn cancel_token(&self) -> &CancellationToken {
    &self.cancel
  }

  pub(crate) fn fork_count(&self) -> usize {
    self.forks.lock().len()
  }

  pub(crate) fn add_fork(&self, fork: Arc<ForkDomain>) {
    self.forks.lock().push(fork);
  }

  /// Whether the run failed.
  pub fn is_failed(&self) -> bool {
    self.failed.load(Ordering::Acquire)
  }

  /// Whether the run completed.
  pub fn is_completed(&self) -> bool {
    *self.completed.lock()
  }

  pub(crate) fn schedule_node(self: &Arc<Self>, index: usize, allow_inline: bool) {
    let Some(node) = self.nodes.get(index) else {
      return;
    };
    if node.is_finished() || self.is_failed() || !node.try_schedule() {
      return;
    }
    let run = Arc::clone(self);
    self
      .worker
      .schedule_fn(move || run.step_node(index), allow_inline);
  }

  pub(crate) fn wake_node(self: &Arc<Self>, index: usize) {
    if let Some(node) = self.nodes.get(index) {
      node.wake();
      self.schedule_node(index, false);
    }
  }

  fn step_node(self: &Arc<Self>, index: usize) {
    let Some(node) = self.nodes.get(index) else {
      return;
    };
    if !node.is_finished() && !self.is_failed() && node.take_runnable() {
      let mut ctx = KernelContext::new(self, node);
      let started = std::time::Instant::now();
      let outcome = node.compute(&mut ctx);
      self.result.record_compute(node.name(), started.elapsed());
      match outcome {
        Ok(true) => self.finish_node(node),
        Ok(false) => {}
        Err(err) if err.is_fatal() => {
          error!(run = %self.name, node = node.name(), error = %err, "compute failed");
          self.fail(err);
        }
        Err(err) => warn!(run = %self.name, node = node.name(), error = %err, "compute error ignored"),
      }
    }
    node.unschedule();
    if node.is_runnable() {
      self.schedule_node(index, false);
    }
  }

  fn finish_node(&self, node: &NodeInstance) {
    if !node.mark_finished() {
      return;
    }
    debug!(run = %self.name, node = node.name(), "node finished");
    if let Err(err) = node.close_outputs() {
      self.fail(err);
      return;
    }
    if let Some(local) = self.locals.get(node.local) {
      local.node_finished();
    }
  }

  pub(crate) fn on_local_finished(&self) {
    if self.locals.iter().all(|local| local.core().is_terminated())
      && let Some(server) = &self.server
    {
      server.on_local_finished();
    }
  }

  /// Fails the run with `error`. Only the first failure terminates domains.
  pub fn fail(&self, error: GraphError) {
    self.result.set_error(&error);
    if let Some(user) = &self.user {
      user.record_error(&error);
    }
    if self.failed.swap(true, Ordering::AcqRel) {
      return;
    }
    warn!(run = %self.name, %error, "run failed");
    self.cancel.cancel();
    for domain in &self.domains {
      domain.notify_finish(Some(&error), false);
    }
    let forks = self.forks.lock().clone();
    for fork in forks {
      fork.notify_finish(Some(&error), false);
    }
  }

  /// Cancels the run.
  pub fn cancel(&self) {
    self.fail(GraphError::Cancelled);
  }

  fn complete(&self) {
    let summary = self.result.finalize();
    *self.completed.lock() = true;
    self.completed_cv.notify_all();
    self.done.cancel();
    info!(run = %self.name, code = %summary.code, "run completed");
    let hooks = {
      let mut hooks = self.done_hooks.lock();
      hooks.fired = true;
      std::mem::take(&mut hooks.list)
    };
    for hook in hooks {
      hook();
    }
    if let Some(user) = &self.user {
      user.wake();
    }
    self.keep_alive.lock().take();
  }

  /// Runs `hook` once the run completes, or right away if it already has.
  pub fn on_done(&self, hook: impl FnOnce() + Send + 'static) {
    let mut hooks = self.done_hooks.lock();
    if hooks.fired {
      drop(hooks);
      hook();
      return;
    }
    hooks.list.push(Box::new(hook));
  }

  /// Blocks until the run completes. Must not be called from the run's runtime.
  pub fn wait(&self) -> ResultSummary {
    let mut completed = self.completed.lock();
    while !*completed {
      self.completed_cv.wait(&mut completed);
    }
    drop(completed);
    self.result.summary()
  }

  /// Like [`GraphRun::wait`], giving up after `timeout`.
  pub fn wait_timeout(&self, timeout: Duration) -> Option<ResultSummary> {
    let mut completed = self.completed.lock();
    if !*completed {
      let _ = self.completed_cv.wait_for(&mut completed, timeout);
    }
    let done = *completed;
    drop(completed);
    done.then(|| self.result.summary())
  }

  /// Waits for completion without blocking a thread.
  pub async fn wait_async(&self) -> ResultSummary {
    self.done.cancelled().await;
    self.result.summary()
  }

  fn user(&self) -> Result<&Arc<UserDomain>> {
    self
      .user
      .as_ref()
      .ok_or(GraphError::Unsupported("server runs have no user outputs"))
  }

  /// See [`UserDomain::try_next_data`].
  pub fn try_next_data(&self) -> Result<SinkPoll> {
    self.user()?.try_next_data()
  }

  /// See [`UserDomain::next_data`].
  pub fn next_data(&self) -> Result<Option<SinkItem>> {
    self.user()?.next_data()
  }

  /// See [`UserDomain::next_data_timeout`].
  pub fn next_data_timeout(&self, timeout: Duration) -> Result<Option<SinkItem>> {
    self.user()?.next_data_timeout(Some(timeout))
  }

  /// See [`UserDomain::set_data_callback`].
  pub fn set_data_callback(&self, callback: DataCallback) {
    if let Some(user) = &self.user {
      user.set_data_callback(callback);
    }
  }
}

impl fmt::Debug for GraphRun {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("GraphRun")
      .field("name", &self.name)
      .field("mode", &self.mode)
      .field("nodes", &self.nodes.len())
      .field("domains", &self.domains.len())
      .field("failed", &self.is_failed())
      .field("completed", &self.is_completed())
      .finish()
  }
}
