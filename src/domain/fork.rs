//! # Forks
//!
//! A node may start a nested run of another graph from inside `compute`. The
//! fork is a domain of the parent run, so the parent does not complete
//! before it, and a failure on either side reaches the other: a failed
//! parent fails the fork with the same error, a failed fork fails the parent.
//!
//! The fork's deadline never exceeds the parent's, and its cancellation token
//! is a child of the parent's.

use super::user::SinkPoll;
use super::{Domain, DomainCore, DomainKind};
use crate::border::USER_SUBGRAPH;
use crate::error::{GraphError, Result};
use crate::graph::GraphDef;
use crate::result::ResultSummary;
use crate::run::{GraphRun, RunMode, RunSpec};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Options of a forked run.
#[derive(Debug, Clone, Default)]
pub struct ForkOptions {
  /// Name used in logs; defaults to `<node>/fork-<n>`.
  pub name: Option<String>,
  /// Deadline relative to now, capped by the parent's deadline.
  pub timeout: Option<Duration>,
}

impl ForkOptions {
  /// Sets the timeout.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

/// The parent-side domain of a forked run.
pub struct ForkDomain {
  core: DomainCore,
  node: usize,
  child: Arc<GraphRun>,
  started: Mutex<bool>,
}

impl ForkDomain {
  /// Builds the child run of `graph` for node `node` of `parent`.
  pub(crate) fn spawn(
    parent: &Arc<GraphRun>,
    node: usize,
    graph: GraphDef,
    options: ForkOptions,
  ) -> Result<ForkHandle> {
    graph.validate()?;
    let node_name = parent
      .node(node)
      .map(|node| node.name().to_string())
      .unwrap_or_default();
    let name = options
      .name
      .unwrap_or_else(|| format!("{}/fork-{}", node_name, parent.fork_count()));
    let deadline = match options.timeout {
      Some(timeout) => (Instant::now() + timeout).min(parent.deadline()),
      None => parent.deadline(),
    };
    let child = GraphRun::build(RunSpec {
      name: name.clone(),
      graph: Arc::new(graph),
      mode: RunMode::Client,
      ctx: parent.context().clone(),
      deadline,
      cancel: parent.cancel_token().child_token(),
      stream: None,
    })?;
    parent.result().attach_child(child.result_arc());

    let fork = Arc::new(Self {
      core: DomainCore::new(name, DomainKind::Fork, USER_SUBGRAPH, Arc::clone(parent.worker())),
      node,
      child,
      started: Mutex::new(false),
    });
    fork.core.attach(parent);
    fork.acquire("init");
    parent.add_fork(Arc::clone(&fork));

    let waker = Arc::downgrade(parent);
    fork.child.set_data_callback(Arc::new(move || {
      if let Some(parent) = waker.upgrade() {
        parent.wake_node(node);
      }
    }));
    let done = Arc::clone(&fork);
    fork.child.on_done(move || done.child_done());
    Ok(ForkHandle { fork })
  }

  fn child_done(&self) {
    let error = self.child.result().error();
    debug!(fork = %self.core.name(), ok = error.is_none(), "fork completed");
    if let Some(parent) = self.core.run() {
      if let Some(node) = parent.node(self.node) {
        node.wake();
        node.fork_done();
      }
      parent.schedule_node(self.node, false);
    }
    self.notify_finish(error.as_ref(), true);
  }
}

impl Domain for ForkDomain {
  fn core(&self) -> &DomainCore {
    &self.core
  }

  fn run(&self, _run: &Arc<GraphRun>) -> Result<()> {
    let mut started = self.started.lock();
    if !*started {
      *started = true;
      self.child.start();
    }
    Ok(())
  }

  fn on_terminate(&self, _run: Option<&Arc<GraphRun>>, error: Option<&GraphError>) {
    if let Some(error) = error {
      self.child.fail(error.clone());
    }
  }
}

/// A node's handle on one of its forks.
#[derive(Clone)]
pub struct ForkHandle {
  fork: Arc<ForkDomain>,
}

impl ForkHandle {
  pub(crate) fn start(&self) {
    if let Some(parent) = self.fork.core.run()
      && let Err(error) = self.fork.run(&parent)
    {
      parent.fail(error);
    }
  }

  /// Name of the forked run.
  pub fn name(&self) -> &str {
    self.fork.core.name()
  }

  /// Reads the next output payload of the fork without blocking.
  pub fn try_next_data(&self) -> Result<SinkPoll> {
    self.fork.child.try_next_data()
  }

  /// Whether the fork completed.
  pub fn is_finished(&self) -> bool {
    self.fork.child.is_completed()
  }

  /// Time left until the fork's deadline.
  pub fn remaining(&self) -> Duration {
    self.fork.child.remaining()
  }

  /// The fork's result so far.
  pub fn summary(&self) -> ResultSummary {
    self.fork.child.result().summary()
  }

  /// Cancels the fork, which fails the parent run as well.
  pub fn cancel(&self) {
    self.fork.child.cancel();
  }
}

impl fmt::Debug for ForkHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ForkHandle")
      .field("name", &self.name())
      .field("finished", &self.is_finished())
      .finish()
  }
}
