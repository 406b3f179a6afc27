//! # Domains
//!
//! A domain is one unit of a run's lifecycle: the nodes of a local subgraph,
//! the user sink, the client end of a remote subgraph's stream, the server end
//! of a served partition, or a forked sub-run.
//!
//! Every domain is reference counted. The first acquire adds one to the
//! run's [`Worker`] outstanding count; the release that brings the domain back
//! to zero detaches it and takes that one away again. The run completes when
//! the worker count returns to zero, that is when every domain detached.
//!
//! A run acquires `"init"` on each domain before starting it. A domain drops
//! that reference from [`Domain::notify_finish`], exactly once, whether it
//! finished normally or was terminated by a failure. Client domains hold a
//! second `"stream"` reference while their RPC stream is bound.

pub mod client;
pub mod fork;
pub mod local;
pub mod server;
pub mod user;

use crate::border::SubgraphId;
use crate::error::{GraphError, Result};
use crate::run::GraphRun;
use crate::worker::Worker;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

#[cfg(feature = "live-registry")]
static LIVE_DOMAINS: AtomicUsize = AtomicUsize::new(0);

/// Number of domain instances alive in this process.
#[cfg(feature = "live-registry")]
pub fn live_domains() -> usize {
  LIVE_DOMAINS.load(Ordering::Acquire)
}

/// What a domain manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
  /// The caller's view of the run's outputs.
  User,
  /// Nodes of a subgraph running in this process.
  Local,
  /// Client end of a remote subgraph's stream.
  Client,
  /// Server end of one served partition.
  Server,
  /// A forked sub-run.
  Fork,
}

/// Refcount and termination state shared by every domain kind.
pub struct DomainCore {
  name: String,
  kind: DomainKind,
  subgraph: SubgraphId,
  refs: AtomicUsize,
  terminated: AtomicBool,
  detached: AtomicBool,
  run: Mutex<Option<Weak<GraphRun>>>,
  worker: Arc<Worker>,
}

impl DomainCore {
  /// Creates a detached-from-run core counting against `worker`.
  pub fn new(
    name: impl Into<String>,
    kind: DomainKind,
    subgraph: SubgraphId,
    worker: Arc<Worker>,
  ) -> Self {
    #[cfg(feature = "live-registry")]
    LIVE_DOMAINS.fetch_add(1, Ordering::AcqRel);
    Self {
      name: name.into(),
      kind,
      subgraph,
      refs: AtomicUsize::new(0),
      terminated: AtomicBool::new(false),
      detached: AtomicBool::new(false),
      run: Mutex::new(None),
      worker,
    }
  }

  /// Domain name used in logs.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Domain kind.
  pub fn kind(&self) -> DomainKind {
    self.kind
  }

  /// Subgraph the domain belongs to.
  pub fn subgraph(&self) -> SubgraphId {
    self.subgraph
  }

  /// Worker the domain counts against.
  pub fn worker(&self) -> &Arc<Worker> {
    &self.worker
  }

  /// Binds the owning run.
  pub(crate) fn attach(&self, run: &Arc<GraphRun>) {
    *self.run.lock() = Some(Arc::downgrade(run));
  }

  /// The owning run, until the domain detaches or the run is gone.
  pub(crate) fn run(&self) -> Option<Arc<GraphRun>> {
    self.run.lock().as_ref().and_then(Weak::upgrade)
  }

  /// Current reference count.
  pub fn refs(&self) -> usize {
    self.refs.load(Ordering::Acquire)
  }

  /// Whether [`Domain::notify_finish`] ran.
  pub fn is_terminated(&self) -> bool {
    self.terminated.load(Ordering::Acquire)
  }

  /// Whether the count returned to zero.
  pub fn is_detached(&self) -> bool {
    self.detached.load(Ordering::Acquire)
  }

  fn terminate(&self) -> bool {
    !self.terminated.swap(true, Ordering::AcqRel)
  }

  /// Adds a reference. The first one adds to the worker count.
  pub fn acquire(&self, reason: &str) {
    if self.is_detached() {
      warn!(domain = %self.name, reason, "acquire on a detached domain ignored");
      return;
    }
    let previous = self.refs.fetch_add(1, Ordering::AcqRel);
    trace!(domain = %self.name, reason, refs = previous + 1, "domain acquired");
    if previous == 0 {
      self.worker.acquire();
    }
  }

  /// Drops a reference. Reaching zero detaches the domain and takes it off
  /// the worker count.
  pub fn release(&self, reason: &str) {
    let previous = self
      .refs
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1));
    match previous {
      Ok(1) => {
        if !self.detached.swap(true, Ordering::AcqRel) {
          debug!(domain = %self.name, reason, "domain detached");
          self.run.lock().take();
          self.worker.release();
        }
      }
      Ok(refs) => trace!(domain = %self.name, reason, refs = refs - 1, "domain released"),
      Err(_) => warn!(domain = %self.name, reason, "release on a domain with no references"),
    }
  }
}

impl Drop for DomainCore {
  fn drop(&mut self) {
    #[cfg(feature = "live-registry")]
    LIVE_DOMAINS.fetch_sub(1, Ordering::AcqRel);
  }
}

impl fmt::Debug for DomainCore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DomainCore")
      .field("name", &self.name)
      .field("kind", &self.kind)
      .field("refs", &self.refs())
      .field("terminated", &self.is_terminated())
      .field("detached", &self.is_detached())
      .finish()
  }
}

/// Lifecycle hooks of a domain.
pub trait Domain: Send + Sync {
  /// Shared refcount state.
  fn core(&self) -> &DomainCore;

  /// Prepares resources, such as RPC streams, before any domain runs.
  fn pre_init(&self, _run: &Arc<GraphRun>) -> Result<()> {
    Ok(())
  }

  /// Starts the domain.
  fn run(&self, run: &Arc<GraphRun>) -> Result<()>;

  /// Called once from [`Domain::notify_finish`], before the `"init"`
  /// reference is dropped. `run` is `None` if the run is already gone.
  fn on_terminate(&self, run: Option<&Arc<GraphRun>>, error: Option<&GraphError>);

  /// See [`DomainCore::acquire`].
  fn acquire(&self, reason: &str) {
    self.core().acquire(reason);
  }

  /// See [`DomainCore::release`].
  fn release(&self, reason: &str) {
    self.core().release(reason);
  }

  /// Terminates the domain once. With `notify_graph`, an error also fails the
  /// whole run.
  fn notify_finish(&self, error: Option<&GraphError>, notify_graph: bool) {
    let core = self.core();
    if !core.terminate() {
      return;
    }
    let run = core.run();
    match error {
      Some(error) => debug!(domain = %core.name(), %error, "domain terminated"),
      None => debug!(domain = %core.name(), "domain finished"),
    }
    if let (Some(error), true, Some(run)) = (error, notify_graph, run.as_ref()) {
      run.fail(error.clone());
    }
    self.on_terminate(run.as_ref(), error);
    self.release("init");
  }
}
