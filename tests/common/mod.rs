// Shared kernels and engine setup for the integration tests.
#![allow(dead_code)]

use gridweave::domain::fork::ForkOptions;
use gridweave::domain::user::SinkPoll;
use gridweave::engine::{Engine, RunHandle};
use gridweave::error::{GraphError, Result};
use gridweave::graph::{GraphDef, NodeDef, SubgraphDef};
use gridweave::node::{Kernel, KernelContext};
use gridweave::payload::Payload;
use gridweave::port::PortData;
use gridweave::prelude::EngineConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const TYPE: &str = "i64";

fn count(attrs: &serde_json::Value) -> i64 {
  attrs.get("count").and_then(serde_json::Value::as_i64).unwrap_or(3)
}

// Emits 1..=count, spreading values round-robin over the destination
// partitions.
struct Numbers {
  count: i64,
}

impl Kernel for Numbers {
  fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
    let slots = ctx.output_partitions("out")?;
    for value in 1..=self.count {
      let mut payloads = vec![None; slots];
      payloads[(value as usize - 1) % slots] = Some(Payload::new(TYPE, value));
      ctx.set_data("out", payloads, false)?;
    }
    Ok(())
  }
}

struct Double;

impl Kernel for Double {
  fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
    loop {
      let batch = ctx.pull("in")?;
      if batch.is_empty() {
        return Ok(());
      }
      for (_, payload) in batch {
        if let Some(value) = payload.downcast_ref::<i64>() {
          ctx.emit("out", Payload::new(TYPE, value * 2))?;
        }
      }
    }
  }
}

// Emits the sum of its input once every partition reached eof.
#[derive(Default)]
struct Sum {
  total: Mutex<i64>,
  emitted: AtomicBool,
}

impl Kernel for Sum {
  fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
    loop {
      let batch = ctx.pull("in")?;
      if batch.is_empty() {
        break;
      }
      let mut total = self.total.lock();
      for (_, payload) in batch {
        *total += payload.downcast_ref::<i64>().copied().unwrap_or_default();
      }
    }
    let mut finished = true;
    for partition in ctx.input_partitions("in")? {
      match ctx.get_data("in", partition)? {
        PortData::Eof => {}
        PortData::NoData => finished = false,
        PortData::Data { payload, .. } => {
          *self.total.lock() += payload.downcast_ref::<i64>().copied().unwrap_or_default();
          finished = false;
        }
      }
    }
    if !finished {
      return Ok(());
    }
    if !self.emitted.swap(true, Ordering::AcqRel) {
      let total = *self.total.lock();
      ctx.add_trace(format!("sum {}", total));
      ctx.emit("out", Payload::new(TYPE, total))?;
    }
    Ok(())
  }
}

struct Fail;

impl Kernel for Fail {
  fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
    Err(GraphError::Kernel {
      node: ctx.node_name().to_string(),
      message: "refused".to_string(),
    })
  }
}

// Forks a `numbers` graph on its first call and forwards the fork's output.
struct Forker {
  count: i64,
}

impl Kernel for Forker {
  fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
    if ctx.forks().is_empty() {
      let graph = GraphDef::new("inner")
        .subgraph(
          SubgraphDef::local(0).node(
            NodeDef::new("inner", "numbers").with_attrs(serde_json::json!({ "count": self.count })),
          ),
        )
        .output("values", "inner", "out");
      ctx.fork(graph, ForkOptions::default().with_timeout(Duration::from_secs(5)))?;
    }
    for fork in ctx.forks() {
      while let SinkPoll::Data(item) = fork.try_next_data()? {
        ctx.emit("out", item.payload)?;
      }
    }
    Ok(())
  }
}

/// Registers the test kernels and data types on `engine`.
pub fn register(engine: &Engine) {
  engine.types().register_json::<i64>(TYPE);
  let kernels = engine.kernels();
  kernels.register("numbers", |node| {
    Ok(Box::new(Numbers {
      count: count(&node.attrs),
    }))
  });
  kernels.register("double", |_| Ok(Box::new(Double)));
  kernels.register("sum", |_| Ok(Box::new(Sum::default())));
  kernels.register("fail", |_| Ok(Box::new(Fail)));
  kernels.register("forker", |node| {
    Ok(Box::new(Forker {
      count: count(&node.attrs),
    }))
  });
}

pub fn config() -> EngineConfig {
  EngineConfig::default()
    .with_worker_threads(2)
    .with_default_timeout(Duration::from_secs(10))
}

/// An engine with the test kernels.
pub fn engine() -> Engine {
  gridweave::logging::init_tracing();
  let engine = Engine::new(config()).expect("engine");
  register(&engine);
  engine
}

/// Values read from every output, sorted.
pub fn values(run: &RunHandle) -> Vec<i64> {
  let mut values: Vec<i64> = run
    .collect()
    .expect("collect")
    .iter()
    .filter_map(|item| item.payload.downcast_ref::<i64>().copied())
    .collect();
  values.sort_unstable();
  values
}

pub fn numbers(name: &str, count: i64) -> NodeDef {
  NodeDef::new(name, "numbers").with_attrs(serde_json::json!({ "count": count }))
}

