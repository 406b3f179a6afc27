//! # Engine
//!
//! Entry point of the crate. An [`Engine`] owns (or borrows) a tokio runtime,
//! the kernel and data type registries, the memory pool, and the connector
//! used for remote subgraphs. It starts client runs with [`Engine::run`] and
//! serves partitions of remote subgraphs with [`Engine::serve`].
//!
//! ```rust
//! use gridweave::config::EngineConfig;
//! use gridweave::engine::{Engine, RunOptions};
//! use gridweave::graph::{GraphDef, NodeDef, SubgraphDef};
//! use gridweave::node::{Kernel, KernelContext};
//! use gridweave::payload::Payload;
//!
//! struct Answer;
//!
//! impl Kernel for Answer {
//!   fn compute(&self, ctx: &mut KernelContext<'_>) -> gridweave::error::Result<()> {
//!     ctx.emit("out", Payload::new("i64", 42_i64))
//!   }
//! }
//!
//! let engine = Engine::new(EngineConfig::default().with_worker_threads(2)).unwrap();
//! engine.kernels().register("answer", |_| Ok(Box::new(Answer)));
//!
//! let graph = GraphDef::new("answer")
//!   .subgraph(SubgraphDef::local(0).node(NodeDef::new("answer", "answer")))
//!   .output("result", "answer", "out");
//! let run = engine.run(graph, RunOptions::default()).unwrap();
//! let item = run.next_data().unwrap().unwrap();
//! assert_eq!(item.payload.downcast_ref::<i64>(), Some(&42));
//! assert!(run.wait().is_ok());
//! ```

use crate::border::SubgraphId;
use crate::config::EngineConfig;
use crate::domain::server::ServerDomain;
use crate::domain::user::{DataCallback, SinkItem, SinkPoll};
use crate::error::{GraphError, Result};
use crate::graph::GraphDef;
use crate::memory_pool::MemoryPool;
use crate::node::KernelRegistry;
use crate::partition::{PartId, PartitionSet};
use crate::payload::TypeRegistry;
use crate::port::PortEnv;
use crate::result::ResultSummary;
use crate::run::{GraphRun, RunContext, RunMode, RunSpec};
use crate::transport::{Connector, RpcStream};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
  /// Run name used in logs.
  pub name: Option<String>,
  /// Deadline relative to the start; the engine default if unset.
  pub timeout: Option<Duration>,
}

impl RunOptions {
  /// Sets the run name.
  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  /// Sets the timeout.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

/// What a client asked this engine to serve.
#[derive(Debug, Clone)]
pub struct ServeRequest {
  /// The whole graph.
  pub graph: Arc<GraphDef>,
  /// Remote subgraph to serve.
  pub subgraph: SubgraphId,
  /// Partition to serve.
  pub partition: PartId,
  /// Deadline relative to now.
  pub timeout: Duration,
}

/// Owns the runtime and registries runs are built from.
pub struct Engine {
  runtime: Option<Runtime>,
  handle: Handle,
  config: Arc<EngineConfig>,
  kernels: Arc<KernelRegistry>,
  types: Arc<TypeRegistry>,
  pool: Arc<MemoryPool>,
  connector: RwLock<Option<Arc<dyn Connector>>>,
}

impl Engine {
  /// Creates an engine with its own multi-threaded runtime.
  pub fn new(config: EngineConfig) -> Result<Self> {
    config.validate()?;
    let mut builder = Builder::new_multi_thread();
    builder.enable_all().thread_name("gridweave-worker");
    if config.worker_threads > 0 {
      builder.worker_threads(config.worker_threads);
    }
    let runtime = builder
      .build()
      .map_err(|e| GraphError::Config(format!("runtime: {e}")))?;
    let handle = runtime.handle().clone();
    Ok(Self::assemble(config, Some(runtime), handle))
  }

  /// Creates an engine running on an existing runtime.
  pub fn with_handle(config: EngineConfig, handle: Handle) -> Result<Self> {
    config.validate()?;
    Ok(Self::assemble(config, None, handle))
  }

  fn assemble(config: EngineConfig, runtime: Option<Runtime>, handle: Handle) -> Self {
    let pool = Arc::new(MemoryPool::with_config(config.memory_pool.clone()));
    Self {
      runtime,
      handle,
      config: Arc::new(config),
      kernels: Arc::new(KernelRegistry::new()),
      types: Arc::new(TypeRegistry::new()),
      pool,
      connector: RwLock::new(None),
    }
  }

  /// Engine configuration.
  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  /// Runtime handle runs execute on.
  pub fn handle(&self) -> &Handle {
    &self.handle
  }

  /// Kernel registry.
  pub fn kernels(&self) -> &KernelRegistry {
    &self.kernels
  }

  /// Data type registry.
  pub fn types(&self) -> &TypeRegistry {
    &self.types
  }

  /// Memory pool shared by every run.
  pub fn pool(&self) -> &Arc<MemoryPool> {
    &self.pool
  }

  /// Sets the connector for remote subgraphs.
  pub fn set_connector(&self, connector: Arc<dyn Connector>) {
    *self.connector.write() = Some(connector);
  }

  fn context(&self) -> RunContext {
    RunContext {
      config: Arc::clone(&self.config),
      kernels: Arc::clone(&self.kernels),
      env: Arc::new(PortEnv {
        types: Arc::clone(&self.types),
        pool: Arc::clone(&self.pool),
      }),
      connector: self.connector.read().clone(),
      handle: self.handle.clone(),
    }
  }

  /// Builds and starts a client run of `graph`.
  pub fn run(&self, graph: GraphDef, options: RunOptions) -> Result<RunHandle> {
    let timeout = options.timeout.unwrap_or_else(|| self.config.default_timeout());
    let name = options.name.unwrap_or_else(|| graph.name.clone());
    let run = GraphRun::build(RunSpec {
      name,
      graph: Arc::new(graph),
      mode: RunMode::Client,
      ctx: self.context(),
      deadline: Instant::now() + timeout,
      cancel: CancellationToken::new(),
      stream: None,
    })?;
    run.start();
    Ok(RunHandle { run })
  }

  /// Serves one partition of a remote subgraph; outbound messages go to
  /// `stream`, inbound ones are fed to the returned domain.
  pub fn serve(&self, request: ServeRequest, stream: Arc<dyn RpcStream>) -> Result<Arc<ServerDomain>> {
    let subgraph = request
      .graph
      .find_subgraph(request.subgraph)
      .filter(|subgraph| subgraph.is_remote())
      .ok_or_else(|| {
        GraphError::InvalidGraph(format!("subgraph {} is not remote", request.subgraph))
      })?;
    PartitionSet::from_descriptor(&subgraph.partitions)?.check(request.partition)?;
    let run = GraphRun::build(RunSpec {
      name: format!("{}/{}/{}", request.graph.name, request.subgraph, request.partition),
      graph: request.graph,
      mode: RunMode::Server {
        subgraph: request.subgraph,
        partition: request.partition,
      },
      ctx: self.context(),
      deadline: Instant::now() + request.timeout,
      cancel: CancellationToken::new(),
      stream: Some(stream),
    })?;
    let server = run
      .server()
      .cloned()
      .ok_or_else(|| GraphError::InvalidGraph("server run without a server domain".to_string()))?;
    info!(run = %run.name(), "serving partition");
    run.start();
    Ok(server)
  }
}

impl Drop for Engine {
  fn drop(&mut self) {
    if let Some(runtime) = self.runtime.take() {
      runtime.shutdown_background();
    }
  }
}

impl fmt::Debug for Engine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Engine")
      .field("config", &self.config)
      .field("owns_runtime", &self.runtime.is_some())
      .field("kernels", &self.kernels)
      .finish_non_exhaustive()
  }
}

/// The caller's handle on a client run.
#[derive(Debug, Clone)]
pub struct RunHandle {
  run: Arc<GraphRun>,
}

impl RunHandle {
  /// The underlying run.
  pub fn run(&self) -> &Arc<GraphRun> {
    &self.run
  }

  /// Blocks for the next output payload; `None` once every output drained.
  pub fn next_data(&self) -> Result<Option<SinkItem>> {
    self.run.next_data()
  }

  /// Like [`RunHandle::next_data`], failing with `Timeout` after `timeout`
  /// without progress.
  pub fn next_data_timeout(&self, timeout: Duration) -> Result<Option<SinkItem>> {
    self.run.next_data_timeout(timeout)
  }

  /// Reads the next output payload without blocking.
  pub fn try_next_data(&self) -> Result<SinkPoll> {
    self.run.try_next_data()
  }

  /// Reads every remaining output payload, blocking until drained.
  pub fn collect(&self) -> Result<Vec<SinkItem>> {
    let mut items = Vec::new();
    while let Some(item) = self.next_data()? {
      items.push(item);
    }
    Ok(items)
  }

  /// Installs a callback run whenever output data arrives.
  pub fn set_data_callback(&self, callback: DataCallback) {
    self.run.set_data_callback(callback);
  }

  /// Blocks until the run completes.
  pub fn wait(&self) -> ResultSummary {
    self.run.wait()
  }

  /// Like [`RunHandle::wait`], giving up after `timeout`.
  pub fn wait_timeout(&self, timeout: Duration) -> Option<ResultSummary> {
    self.run.wait_timeout(timeout)
  }

  /// Waits for completion without blocking a thread.
  pub async fn wait_async(&self) -> ResultSummary {
    self.run.wait_async().await
  }

  /// Cancels the run.
  pub fn cancel(&self) {
    self.run.cancel();
  }

  /// Result so far.
  pub fn summary(&self) -> ResultSummary {
    self.run.result().summary()
  }

  /// Whether the run completed.
  pub fn is_completed(&self) -> bool {
    self.run.is_completed()
  }
}
