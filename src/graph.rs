//! # Graph Definitions
//!
//! A [`GraphDef`] describes a computation as subgraphs of nodes joined by
//! edges. It is plain serde data: a client ships the same definition to every
//! server it connects to, so both sides build identical borders and agree on
//! port ids.
//!
//! - A [`SubgraphDef`] runs either in the calling process ([`Location::Local`])
//!   or behind an RPC stream, once per partition ([`Location::Remote`]).
//! - An [`EdgeDef`] joins an output port of one node to an input port of
//!   another, possibly across subgraphs.
//! - An [`OutputDef`] exposes an output port to the caller of the run.
//!
//! ```rust
//! use gridweave::graph::{GraphDef, NodeDef, SubgraphDef};
//! use gridweave::partition::PartitionDescriptor;
//!
//! let graph = GraphDef::new("example")
//!   .subgraph(SubgraphDef::local(0).node(NodeDef::new("numbers", "numbers")))
//!   .subgraph(SubgraphDef::remote(1, PartitionDescriptor::all(2)).node(NodeDef::new("double", "double")))
//!   .edge("numbers", "out", "double", "in")
//!   .output("result", "double", "out");
//! assert!(graph.validate().is_ok());
//! ```

use crate::border::{SubgraphId, USER_SUBGRAPH};
use crate::error::{GraphError, Result};
use crate::partition::{PartitionDescriptor, PartitionSet};
use crate::port::PortFlags;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Where a subgraph executes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
  /// In the calling process, as a single partition.
  #[default]
  Local,
  /// Behind an RPC stream, one server run per partition.
  Remote {
    /// Name of the business service that serves it.
    #[serde(default)]
    biz: String,
  },
}

/// A node and the kernel it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
  /// Unique node name.
  pub name: String,
  /// Kernel name in the kernel registry.
  pub kernel: String,
  /// Kernel parameters.
  #[serde(default)]
  pub attrs: serde_json::Value,
}

impl NodeDef {
  /// Node without attributes.
  pub fn new(name: impl Into<String>, kernel: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      kernel: kernel.into(),
      attrs: serde_json::Value::Null,
    }
  }

  /// Sets the kernel parameters.
  pub fn with_attrs(mut self, attrs: serde_json::Value) -> Self {
    self.attrs = attrs;
    self
  }
}

/// A group of nodes placed together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgraphDef {
  /// Non-negative id, unique in the graph.
  pub id: SubgraphId,
  /// Nodes.
  #[serde(default)]
  pub nodes: Vec<NodeDef>,
  /// Placement.
  #[serde(default)]
  pub location: Location,
  /// Partitions of a remote subgraph.
  #[serde(default)]
  pub partitions: PartitionDescriptor,
}

impl SubgraphDef {
  /// Subgraph running in the calling process.
  pub fn local(id: SubgraphId) -> Self {
    Self {
      id,
      nodes: Vec::new(),
      location: Location::Local,
      partitions: PartitionDescriptor::all(1),
    }
  }

  /// Subgraph served remotely over `partitions`.
  pub fn remote(id: SubgraphId, partitions: PartitionDescriptor) -> Self {
    Self {
      id,
      nodes: Vec::new(),
      location: Location::Remote { biz: String::new() },
      partitions,
    }
  }

  /// Adds a node.
  pub fn node(mut self, node: NodeDef) -> Self {
    self.nodes.push(node);
    self
  }

  /// Whether the subgraph is remote.
  pub fn is_remote(&self) -> bool {
    matches!(self.location, Location::Remote { .. })
  }
}

/// `node.port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
  /// Node name.
  pub node: String,
  /// Port name.
  pub port: String,
}

impl Endpoint {
  /// Creates an endpoint.
  pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
    Self {
      node: node.into(),
      port: port.into(),
    }
  }
}

/// A directed edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDef {
  /// Producing output port.
  pub from: Endpoint,
  /// Consuming input port.
  pub to: Endpoint,
  /// The consumer may run without data on this edge.
  #[serde(default)]
  pub optional: bool,
  /// Dependency-only edge: carries eof but no payloads.
  #[serde(default)]
  pub shuffle: bool,
}

/// An output port exposed to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
  /// Name the caller sees.
  pub name: String,
  /// Port producing it.
  pub from: Endpoint,
}

/// A whole computation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
  /// Graph name, used in logs.
  pub name: String,
  /// Subgraphs.
  #[serde(default)]
  pub subgraphs: Vec<SubgraphDef>,
  /// Edges, in port id order.
  #[serde(default)]
  pub edges: Vec<EdgeDef>,
  /// Outputs.
  #[serde(default)]
  pub outputs: Vec<OutputDef>,
}

/// An edge with both ends resolved to subgraphs. Outputs appear as links into
/// the user sink, whose node and port are both the output name.
#[derive(Debug, Clone)]
pub(crate) struct Link {
  pub from_subgraph: SubgraphId,
  pub from: Endpoint,
  pub to_subgraph: SubgraphId,
  pub to: Endpoint,
  pub flags: PortFlags,
}

impl GraphDef {
  /// Empty graph.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      ..Self::default()
    }
  }

  /// Parses a JSON definition.
  pub fn from_json(text: &str) -> Result<Self> {
    serde_json::from_str(text).map_err(|e| GraphError::InvalidGraph(e.to_string()))
  }

  /// Adds a subgraph.
  pub fn subgraph(mut self, subgraph: SubgraphDef) -> Self {
    self.subgraphs.push(subgraph);
    self
  }

  /// Adds an edge.
  pub fn edge(self, from_node: &str, from_port: &str, to_node: &str, to_port: &str) -> Self {
    self.edge_def(EdgeDef {
      from: Endpoint::new(from_node, from_port),
      to: Endpoint::new(to_node, to_port),
      optional: false,
      shuffle: false,
    })
  }

  /// Adds a fully specified edge.
  pub fn edge_def(mut self, edge: EdgeDef) -> Self {
    self.edges.push(edge);
    self
  }

  /// Exposes `node.port` as output `name`.
  pub fn output(mut self, name: &str, node: &str, port: &str) -> Self {
    self.outputs.push(OutputDef {
      name: name.to_string(),
      from: Endpoint::new(node, port),
    });
    self
  }

  /// Subgraph by id.
  pub fn find_subgraph(&self, id: SubgraphId) -> Option<&SubgraphDef> {
    self.subgraphs.iter().find(|subgraph| subgraph.id == id)
  }

  fn node_subgraphs(&self) -> HashMap<&str, SubgraphId> {
    self
      .subgraphs
      .iter()
      .flat_map(|subgraph| {
        subgraph
          .nodes
          .iter()
          .map(move |node| (node.name.as_str(), subgraph.id))
      })
      .collect()
  }

  /// Checks ids, names, references and partition descriptors.
  pub fn validate(&self) -> Result<()> {
    let mut ids = HashSet::new();
    for subgraph in &self.subgraphs {
      if subgraph.id < 0 {
        return Err(GraphError::InvalidGraph(format!(
          "subgraph id {} is reserved",
          subgraph.id
        )));
      }
      if !ids.insert(subgraph.id) {
        return Err(GraphError::InvalidGraph(format!(
          "duplicate subgraph id {}",
          subgraph.id
        )));
      }
      if subgraph.is_remote() {
        if subgraph.partitions.part_count == 0 {
          return Err(GraphError::InvalidGraph(format!(
            "remote subgraph {} has no partitions",
            subgraph.id
          )));
        }
        PartitionSet::from_descriptor(&subgraph.partitions)?;
      }
    }

    let mut names = HashSet::new();
    for node in self.subgraphs.iter().flat_map(|subgraph| &subgraph.nodes) {
      if !names.insert(node.name.as_str()) {
        return Err(GraphError::InvalidGraph(format!(
          "duplicate node name {}",
          node.name
        )));
      }
    }

    let located = self.node_subgraphs();
    let locate = |endpoint: &Endpoint| {
      located
        .get(endpoint.node.as_str())
        .copied()
        .ok_or_else(|| GraphError::InvalidGraph(format!("unknown node {}", endpoint.node)))
    };
    for edge in &self.edges {
      let from = locate(&edge.from)?;
      let to = locate(&edge.to)?;
      if edge.shuffle {
        let remote = |id| self.find_subgraph(id).is_some_and(SubgraphDef::is_remote);
        if from != to && (remote(from) || remote(to)) {
          return Err(GraphError::InvalidGraph(format!(
            "dependency edge {}.{} -> {}.{} crosses a remote subgraph",
            edge.from.node, edge.from.port, edge.to.node, edge.to.port
          )));
        }
      }
    }

    let mut outputs = HashSet::new();
    for output in &self.outputs {
      locate(&output.from)?;
      if !outputs.insert(output.name.as_str()) {
        return Err(GraphError::InvalidGraph(format!(
          "duplicate output {}",
          output.name
        )));
      }
    }
    Ok(())
  }

  /// Edges then outputs, resolved to subgraphs. Call after [`GraphDef::validate`].
  pub(crate) fn links(&self) -> Result<Vec<Link>> {
    let located = self.node_subgraphs();
    let locate = |endpoint: &Endpoint| {
      located
        .get(endpoint.node.as_str())
        .copied()
        .ok_or_else(|| GraphError::InvalidGraph(format!("unknown node {}", endpoint.node)))
    };
    let mut links = Vec::with_capacity(self.edges.len() + self.outputs.len());
    for edge in &self.edges {
      links.push(Link {
        from_subgraph: locate(&edge.from)?,
        from: edge.from.clone(),
        to_subgraph: locate(&edge.to)?,
        to: edge.to.clone(),
        flags: PortFlags {
          shuffle: edge.shuffle,
          optional: edge.optional,
        },
      });
    }
    for output in &self.outputs {
      links.push(Link {
        from_subgraph: locate(&output.from)?,
        from: output.from.clone(),
        to_subgraph: USER_SUBGRAPH,
        to: Endpoint::new(output.name.as_str(), output.name.as_str()),
        flags: PortFlags::default(),
      });
    }
    Ok(links)
  }
}
