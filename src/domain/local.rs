//! Nodes of one subgraph running in this process.

use super::{Domain, DomainCore, DomainKind};
use crate::border::SubgraphId;
use crate::error::{GraphError, Result};
use crate::result::TraceEvent;
use crate::run::GraphRun;
use crate::worker::Worker;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Finishes once every node of its subgraph finished.
#[derive(Debug)]
pub struct LocalDomain {
  core: DomainCore,
  nodes: Vec<usize>,
  remaining: AtomicUsize,
}

impl LocalDomain {
  /// Domain over the run's nodes at indexes `nodes`.
  pub(crate) fn new(subgraph: SubgraphId, nodes: Vec<usize>, worker: Arc<Worker>) -> Self {
    Self {
      core: DomainCore::new(
        format!("local-{subgraph}"),
        DomainKind::Local,
        subgraph,
        worker,
      ),
      remaining: AtomicUsize::new(nodes.len()),
      nodes,
    }
  }

  /// Node indexes of this subgraph.
  pub fn nodes(&self) -> &[usize] {
    &self.nodes
  }

  /// Nodes not finished yet.
  pub fn remaining(&self) -> usize {
    self.remaining.load(Ordering::Acquire)
  }

  pub(crate) fn node_finished(&self) {
    let previous = self
      .remaining
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
    if previous == Ok(1) {
      self.notify_finish(None, true);
    }
  }
}

impl Domain for LocalDomain {
  fn core(&self) -> &DomainCore {
    &self.core
  }

  fn run(&self, _run: &Arc<GraphRun>) -> Result<()> {
    if self.nodes.is_empty() {
      self.notify_finish(None, true);
    }
    Ok(())
  }

  fn on_terminate(&self, run: Option<&Arc<GraphRun>>, error: Option<&GraphError>) {
    let Some(run) = run else {
      return;
    };
    if error.is_none() {
      run.on_local_finished();
      return;
    }
    for &index in &self.nodes {
      let Some(node) = run.node(index) else {
        continue;
      };
      if node.is_finished() {
        continue;
      }
      for input in node.partially_finished_inputs() {
        run.result().add_trace(TraceEvent::new(
          node.name(),
          format!("terminated with partially finished input {input}"),
        ));
      }
    }
  }
}
