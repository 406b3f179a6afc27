//! # Nodes and Kernels
//!
//! A node is an instance of a [`Kernel`] inside a running graph. Kernels are
//! created by name from a [`KernelRegistry`] and only ever see the graph
//! through a [`KernelContext`].
//!
//! ## Scheduling
//!
//! Each input edge of a node has a [`ReadinessBitmap`] fed by its queue. A node
//! is runnable when
//!
//! - it was explicitly woken (by [`KernelContext::yield_now`] or a fork), or
//! - every input is ok (each partition ready, finished or optional) and some
//!   input has data, or every input just finished, or
//! - it has no inputs and has not run yet.
//!
//! Port pushes schedule the node; a `scheduled` flag keeps it from running
//! twice at once, and readiness is re-checked after every `compute`, so a push
//! that raced with a running `compute` is never lost.
//!
//! Once all inputs are finished (or, for a source, after its first `compute`)
//! and no fork is pending, the node finishes and eof goes out on every output.
//!
//! ```rust
//! use gridweave::error::Result;
//! use gridweave::node::{Kernel, KernelContext, KernelRegistry};
//! use gridweave::payload::Payload;
//! use gridweave::port::PortData;
//!
//! struct Double;
//!
//! impl Kernel for Double {
//!   fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
//!     for (_, payload) in ctx.pull("in")? {
//!       if let Some(value) = payload.downcast_ref::<i64>() {
//!         ctx.emit("out", Payload::new("i64", value * 2))?;
//!       }
//!     }
//!     Ok(())
//!   }
//! }
//!
//! let registry = KernelRegistry::new();
//! registry.register("double", |_| Ok(Box::new(Double)));
//! ```

use crate::domain::fork::{ForkDomain, ForkHandle, ForkOptions};
use crate::error::{GraphError, Result};
use crate::graph::{GraphDef, NodeDef};
use crate::partition::PartId;
use crate::payload::Payload;
use crate::port::{LOCAL_WRITER, Port, PortData, PortListener};
use crate::readiness::ReadinessBitmap;
use crate::result::TraceEvent;
use crate::run::GraphRun;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Business logic of a node.
pub trait Kernel: Send + Sync {
  /// Consumes available input and produces output. Must not block.
  fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()>;
}

/// Builds a kernel for a node definition.
pub type KernelFactory = Arc<dyn Fn(&NodeDef) -> Result<Box<dyn Kernel>> + Send + Sync>;

/// Kernel factories by kernel name.
#[derive(Default)]
pub struct KernelRegistry {
  factories: RwLock<HashMap<String, KernelFactory>>,
}

impl KernelRegistry {
  /// Empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers `factory` under `name`, replacing any previous one.
  pub fn register<F>(&self, name: &str, factory: F)
  where
    F: Fn(&NodeDef) -> Result<Box<dyn Kernel>> + Send + Sync + 'static,
  {
    self
      .factories
      .write()
      .insert(name.to_string(), Arc::new(factory));
  }

  /// Creates the kernel of `node`.
  pub fn create(&self, node: &NodeDef) -> Result<Box<dyn Kernel>> {
    let factory = self.factories.read().get(&node.kernel).cloned().ok_or_else(|| {
      GraphError::InvalidGraph(format!(
        "unknown kernel {} for node {}",
        node.kernel, node.name
      ))
    })?;
    factory(node)
  }
}

impl fmt::Debug for KernelRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let factories = self.factories.read();
    let mut names: Vec<&String> = factories.keys().collect();
    names.sort();
    f.debug_struct("KernelRegistry")
      .field("kernels", &names)
      .finish()
  }
}

/// One input edge of a node.
pub(crate) struct NodeInput {
  pub(crate) port: Arc<Port>,
  pub(crate) readiness: Arc<ReadinessBitmap>,
}

impl NodeInput {
  pub(crate) fn new(port: Arc<Port>) -> Result<Self> {
    let queue = port.queue()?;
    let readiness = Arc::new(ReadinessBitmap::new(queue.to_part().full_count()));
    queue.attach_readiness(Arc::clone(&readiness));
    if port.is_optional() {
      readiness.set_optional_all(true);
    }
    Ok(Self { port, readiness })
  }

  fn name(&self) -> &str {
    &self.port.key().port
  }
}

/// A kernel placed in a run.
pub(crate) struct NodeInstance {
  pub(crate) index: usize,
  pub(crate) def: NodeDef,
  pub(crate) local: usize,
  kernel: Box<dyn Kernel>,
  pub(crate) inputs: Vec<NodeInput>,
  pub(crate) outputs: Vec<Arc<Port>>,
  scheduled: AtomicBool,
  wake: AtomicBool,
  started: AtomicBool,
  drained: AtomicBool,
  finished: AtomicBool,
  pending_forks: AtomicUsize,
  forks: Mutex<Vec<ForkHandle>>,
}

impl NodeInstance {
  pub(crate) fn new(
    index: usize,
    def: NodeDef,
    kernel: Box<dyn Kernel>,
    local: usize,
    inputs: Vec<NodeInput>,
    outputs: Vec<Arc<Port>>,
  ) -> Self {
    Self {
      index,
      def,
      local,
      kernel,
      inputs,
      outputs,
      scheduled: AtomicBool::new(false),
      wake: AtomicBool::new(false),
      started: AtomicBool::new(false),
      drained: AtomicBool::new(false),
      finished: AtomicBool::new(false),
      pending_forks: AtomicUsize::new(0),
      forks: Mutex::new(Vec::new()),
    }
  }

  pub(crate) fn name(&self) -> &str {
    &self.def.name
  }

  pub(crate) fn is_finished(&self) -> bool {
    self.finished.load(Ordering::Acquire)
  }

  /// Claims the right to run. `false` if already scheduled.
  pub(crate) fn try_schedule(&self) -> bool {
    self
      .scheduled
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  pub(crate) fn unschedule(&self) {
    self.scheduled.store(false, Ordering::Release);
  }

  pub(crate) fn wake(&self) {
    self.wake.store(true, Ordering::Release);
  }

  fn inputs_finished(&self) -> bool {
    self.inputs.iter().all(|input| input.readiness.is_finish())
  }

  /// Runnable without consuming the wake flag.
  pub(crate) fn is_runnable(&self) -> bool {
    if self.is_finished() {
      return false;
    }
    if self.wake.load(Ordering::Acquire) {
      return true;
    }
    if self.inputs.is_empty() {
      return !self.started.load(Ordering::Acquire);
    }
    if !self.inputs.iter().all(|input| input.readiness.is_ok()) {
      return false;
    }
    self.inputs.iter().any(|input| input.readiness.has_ready())
      || (self.inputs_finished() && !self.drained.load(Ordering::Acquire))
  }

  /// Whether to call `compute` now; consumes the wake flag.
  pub(crate) fn take_runnable(&self) -> bool {
    let woken = self.wake.swap(false, Ordering::AcqRel);
    woken || self.is_runnable()
  }

  /// Runs `compute` once and decides whether the node is done.
  pub(crate) fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<bool> {
    let finished_before = self.inputs_finished();
    self.kernel.compute(ctx)?;
    self.started.store(true, Ordering::Release);
    if ctx.yielded {
      self.wake();
      return Ok(false);
    }
    if finished_before {
      self.drained.store(true, Ordering::Release);
    }
    let inputs_done = self.inputs.is_empty() || (finished_before && self.inputs_finished());
    // A fork completing sets `wake` before dropping the pending count, so a
    // node seeing zero forks also sees the wake and reads the output first.
    Ok(
      inputs_done
        && self.pending_forks.load(Ordering::Acquire) == 0
        && !self.wake.load(Ordering::Acquire),
    )
  }

  /// Marks the node finished. Returns `true` the first time.
  pub(crate) fn mark_finished(&self) -> bool {
    !self.finished.swap(true, Ordering::AcqRel)
  }

  /// Sends eof on every output that has not sent it yet.
  pub(crate) fn close_outputs(&self) -> Result<()> {
    for port in &self.outputs {
      port.close(LOCAL_WRITER)?;
    }
    Ok(())
  }

  pub(crate) fn fork_started(&self, handle: ForkHandle) {
    self.pending_forks.fetch_add(1, Ordering::AcqRel);
    self.forks.lock().push(handle);
  }

  pub(crate) fn fork_done(&self) {
    self.pending_forks.fetch_sub(1, Ordering::AcqRel);
  }

  /// Inputs where some but not all partitions finished.
  pub(crate) fn partially_finished_inputs(&self) -> Vec<String> {
    self
      .inputs
      .iter()
      .filter(|input| input.readiness.is_partial_finish())
      .map(|input| format!("{} {:?}", input.port.label(), input.readiness))
      .collect()
  }
}

/// Schedules a node whenever one of its inputs receives data.
pub(crate) struct NodeListener {
  pub(crate) run: Weak<GraphRun>,
  pub(crate) node: usize,
}

impl PortListener for NodeListener {
  fn on_push(&self, _port: &Port, _to: PartId) {
    if let Some(run) = self.run.upgrade() {
      run.schedule_node(self.node, false);
    }
  }
}

/// The graph as a kernel sees it during one `compute` call.
pub struct KernelContext<'a> {
  run: &'a Arc<GraphRun>,
  node: &'a NodeInstance,
  yielded: bool,
}

impl<'a> KernelContext<'a> {
  pub(crate) fn new(run: &'a Arc<GraphRun>, node: &'a NodeInstance) -> Self {
    Self {
      run,
      node,
      yielded: false,
    }
  }

  /// Name of the running node.
  pub fn node_name(&self) -> &str {
    self.node.name()
  }

  /// Kernel parameters from the node definition.
  pub fn attrs(&self) -> &serde_json::Value {
    &self.node.def.attrs
  }

  fn inputs(&self, port: &str) -> Result<Vec<&NodeInput>> {
    let inputs: Vec<&NodeInput> = self
      .node
      .inputs
      .iter()
      .filter(|input| input.name() == port)
      .collect();
    if inputs.is_empty() {
      return Err(GraphError::PortNotFound(format!(
        "{}.{}",
        self.node.name(),
        port
      )));
    }
    Ok(inputs)
  }

  fn outputs(&self, port: &str) -> Result<Vec<&Arc<Port>>> {
    let outputs: Vec<&Arc<Port>> = self
      .node
      .outputs
      .iter()
      .filter(|output| output.key().port == port)
      .collect();
    if outputs.is_empty() {
      return Err(GraphError::PortNotFound(format!(
        "{}.{}",
        self.node.name(),
        port
      )));
    }
    Ok(outputs)
  }

  /// Partition ids readable on input `port`, across all of its edges.
  pub fn input_partitions(&self, port: &str) -> Result<Vec<PartId>> {
    let mut ids = Vec::new();
    for input in self.inputs(port)? {
      ids.extend(input.port.partitions()?.iter());
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
  }

  /// Number of payload slots [`KernelContext::set_data`] expects on `port`.
  pub fn output_partitions(&self, port: &str) -> Result<usize> {
    let outputs = self.outputs(port)?;
    Ok(outputs[0].partitions()?.used_count())
  }

  /// Reads partition `partition` of input `port`.
  ///
  /// With several edges into the same port, the first edge holding data wins;
  /// `Eof` is returned only when every edge carrying `partition` finished.
  pub fn get_data(&mut self, port: &str, partition: PartId) -> Result<PortData> {
    let mut seen = false;
    let mut pending = false;
    for input in self.inputs(port)? {
      if !input.port.partitions()?.is_used(partition) {
        continue;
      }
      seen = true;
      match input.port.get_data(partition)? {
        data @ PortData::Data { .. } => return Ok(data),
        PortData::NoData => pending = true,
        PortData::Eof => {}
      }
    }
    if !seen {
      return Err(GraphError::PartIdOverflow {
        id: partition,
        count: self.input_partitions(port)?.len() as u32,
      });
    }
    Ok(if pending { PortData::NoData } else { PortData::Eof })
  }

  /// Takes at most one payload from every partition of every edge of `port`.
  pub fn pull(&mut self, port: &str) -> Result<Vec<(PartId, Payload)>> {
    let mut pulled = Vec::new();
    for input in self.inputs(port)? {
      for partition in input.port.partitions()?.iter() {
        if let PortData::Data { payload, .. } = input.port.get_data(partition)? {
          pulled.push((partition, payload));
        }
      }
    }
    Ok(pulled)
  }

  /// Writes one slot per destination partition to every edge of `port`.
  pub fn set_data(&mut self, port: &str, payloads: Vec<Option<Payload>>, eof: bool) -> Result<()> {
    for output in self.outputs(port)? {
      output.set_data(payloads.clone(), eof)?;
    }
    Ok(())
  }

  /// Writes `payload` to every destination partition of `port`.
  pub fn emit(&mut self, port: &str, payload: Payload) -> Result<()> {
    for output in self.outputs(port)? {
      let slots = output.partitions()?.used_count();
      output.set_data(vec![Some(payload.clone()); slots], false)?;
    }
    Ok(())
  }

  /// Signals eof on every edge of `port`.
  pub fn set_eof(&mut self, port: &str) -> Result<()> {
    for output in self.outputs(port)? {
      output.set_eof(LOCAL_WRITER)?;
    }
    Ok(())
  }

  /// Starts a nested run of `graph`. Its outputs are read through the
  /// returned handle; the node is woken when they arrive and when the fork
  /// completes, and does not finish while forks are pending.
  pub fn fork(&mut self, graph: GraphDef, options: ForkOptions) -> Result<ForkHandle> {
    let handle = ForkDomain::spawn(self.run, self.node.index, graph, options)?;
    self.node.fork_started(handle.clone());
    handle.start();
    Ok(handle)
  }

  /// Forks started by this node, oldest first.
  pub fn forks(&self) -> Vec<ForkHandle> {
    self.node.forks.lock().clone()
  }

  /// Asks to be called again even without new input.
  pub fn yield_now(&mut self) {
    self.yielded = true;
  }

  /// Records a trace event in the run result.
  pub fn add_trace(&self, message: impl Into<String>) {
    self
      .run
      .result()
      .add_trace(TraceEvent::new(self.node.name(), message));
  }
}
