//! # GridWeave
//!
//! Partitioned dataflow transport and scheduling core.
//!
//! A graph is split into subgraphs. Local subgraphs run in the calling
//! process; remote subgraphs run behind RPC streams, one server run per
//! partition. GridWeave moves payloads across subgraph borders, decides when a
//! node is ready to run, and tracks the lifetime of every participant so the
//! run completes exactly once, with the first error winning.
//!
//! ## Layers
//!
//! - [`partition`], [`bitmap`], [`readiness`]: partition sets and the
//!   per-partition state bits everything else is built on.
//! - [`port_queue`], [`port`], [`border`]: where payloads live between a
//!   producer and its consumers, and how they cross subgraph boundaries.
//! - [`stream_state`], [`wire`], [`transport`]: per-partition stream
//!   bookkeeping, the message format, and the connector seam.
//! - [`worker`], [`domain`], [`node`], [`run`]: scheduling and lifetime.
//! - [`engine`]: the entry point.
//!
//! ## Quick Start
//!
//! ```rust
//! use gridweave::prelude::*;
//!
//! struct Numbers;
//!
//! impl Kernel for Numbers {
//!   fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
//!     for value in 1..=3_i64 {
//!       ctx.emit("out", Payload::new("i64", value))?;
//!     }
//!     Ok(())
//!   }
//! }
//!
//! let engine = Engine::new(EngineConfig::default()).unwrap();
//! engine.kernels().register("numbers", |_| Ok(Box::new(Numbers)));
//!
//! let graph = GraphDef::new("numbers")
//!   .subgraph(SubgraphDef::local(0).node(NodeDef::new("numbers", "numbers")))
//!   .output("values", "numbers", "out");
//! let run = engine.run(graph, RunOptions::default()).unwrap();
//! let values: Vec<i64> = run
//!   .collect()
//!   .unwrap()
//!   .iter()
//!   .filter_map(|item| item.payload.downcast_ref::<i64>().copied())
//!   .collect();
//! assert_eq!(values, vec![1, 2, 3]);
//! ```

// Documentation enforcement
#![warn(missing_docs)]

/// Lock-free bitmaps.
pub mod bitmap;
/// Subgraph borders and their routing patterns.
pub mod border;
/// Engine configuration.
pub mod config;
/// Lifetime participants of a run.
pub mod domain;
/// Entry point: runs and served partitions.
pub mod engine;
/// Error types.
pub mod error;
/// Graph definitions.
pub mod graph;
/// Tracing subscriber setup.
pub mod logging;
/// Buffer pool and memory accounting.
pub mod memory_pool;
/// Kernels, nodes and their scheduling.
pub mod node;
/// Partition ids and sets.
pub mod partition;
/// Typed and serialized payloads.
pub mod payload;
/// Ports: the typed ends of an edge.
pub mod port;
/// Per-port payload queues.
pub mod port_queue;
/// Per-partition readiness of a node input.
pub mod readiness;
/// Run results, traces and diagnostics.
pub mod result;
/// Graph runs.
pub mod run;
/// Per-partition stream bookkeeping.
pub mod stream_state;
/// Connector and stream traits, plus an in-process loopback.
pub mod transport;
/// Stream message format.
pub mod wire;
/// Work scheduling and completion tracking.
pub mod worker;

/// Commonly used types.
pub mod prelude {
  pub use crate::config::EngineConfig;
  pub use crate::engine::{Engine, RunHandle, RunOptions};
  pub use crate::error::{GraphError, Result};
  pub use crate::graph::{GraphDef, NodeDef, SubgraphDef};
  pub use crate::node::{Kernel, KernelContext, KernelRegistry};
  pub use crate::partition::{PartId, PartitionDescriptor, PartitionSet};
  pub use crate::payload::Payload;
}

#[cfg(test)]
mod bitmap_test;
#[cfg(test)]
mod border_test;
#[cfg(test)]
mod domain_test;
#[cfg(test)]
mod partition_test;
#[cfg(test)]
mod port_test;
#[cfg(test)]
mod wire_test;
#[cfg(test)]
mod worker_test;
