//! # Error Handling
//!
//! Every failure in the transport and scheduling core is a [`GraphError`]. Each
//! variant maps to a stable [`ErrorCode`], which is what crosses process
//! boundaries (inside `Finalize` control messages) and what the top-level
//! result reports as its single terminal code.
//!
//! ## Taxonomy
//!
//! - **Invariant violations**: [`GraphError::PartIdOverflow`],
//!   [`GraphError::BorderAlreadyLinked`], [`GraphError::PortAlreadyLinked`].
//!   Reported as errors that fail the run, never as panics.
//! - **Transport failures**: [`GraphError::StreamSend`], after the stream layer
//!   exhausted its retries.
//! - **Protocol violations**: [`GraphError::DataAfterEof`]. Returned to the
//!   caller, which decides whether to escalate.
//! - **(De)serialization**: [`GraphError::Serialize`], [`GraphError::Deserialize`],
//!   [`GraphError::TypeNotFound`], [`GraphError::TypeMismatch`].
//! - **Resource exhaustion**: [`GraphError::PoolLimitExceeded`].
//!
//! ## Example
//!
//! ```rust
//! use gridweave::error::{ErrorCode, GraphError};
//!
//! let err = GraphError::DataAfterEof { port: "sink.in".to_string(), to: 0, from: 1 };
//! assert_eq!(err.code(), ErrorCode::DataAfterEof);
//! assert!(!err.is_fatal());
//! ```

use crate::partition::PartId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T, E = GraphError> = std::result::Result<T, E>;

/// Stable, serializable error code.
///
/// `None` means success. A run's result always carries exactly one code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
  /// No error.
  #[default]
  None,
  /// A partition id was outside its partition set, or a link invariant was broken.
  PartIdOverflow,
  /// A payload or eof arrived for a (to, from) pair that had already signalled eof.
  DataAfterEof,
  /// Serializing a payload failed.
  Serialize,
  /// Deserializing a payload failed.
  Deserialize,
  /// No data type is registered under the requested name.
  TypeNotFound,
  /// The payload type differs from the type bound to the port.
  TypeMismatch,
  /// Memory pool usage is above its configured limit.
  PoolLimitExceeded,
  /// Border ports could not be paired.
  LinkFailed,
  /// The operation is not supported by this queue or port variant.
  Unsupported,
  /// An RPC stream failed to send.
  StreamSend,
  /// The graph definition is invalid.
  InvalidGraph,
  /// A kernel returned an error.
  Kernel,
  /// The run exceeded its deadline.
  Timeout,
  /// The run was cancelled.
  Cancelled,
  /// Configuration was rejected.
  Config,
}

impl ErrorCode {
  /// Returns `true` for [`ErrorCode::None`].
  pub fn is_ok(self) -> bool {
    self == ErrorCode::None
  }
}

impl fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ErrorCode::None => "NONE",
      ErrorCode::PartIdOverflow => "PART_ID_OVERFLOW",
      ErrorCode::DataAfterEof => "DATA_AFTER_EOF",
      ErrorCode::Serialize => "SERIALIZE",
      ErrorCode::Deserialize => "DESERIALIZE",
      ErrorCode::TypeNotFound => "TYPE_NOT_FOUND",
      ErrorCode::TypeMismatch => "TYPE_MISMATCH",
      ErrorCode::PoolLimitExceeded => "POOL_LIMIT_EXCEEDED",
      ErrorCode::LinkFailed => "LINK_FAILED",
      ErrorCode::Unsupported => "UNSUPPORTED",
      ErrorCode::StreamSend => "STREAM_SEND",
      ErrorCode::InvalidGraph => "INVALID_GRAPH",
      ErrorCode::Kernel => "KERNEL",
      ErrorCode::Timeout => "TIMEOUT",
      ErrorCode::Cancelled => "CANCELLED",
      ErrorCode::Config => "CONFIG",
    };
    f.write_str(name)
  }
}

/// Error raised by the transport and scheduling core.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
  /// Partition id outside of its set.
  #[error("partition id {id} out of range (partition count {count})")]
  PartIdOverflow {
    /// Offending id.
    id: PartId,
    /// Size of the partition space.
    count: u32,
  },
  /// Border linked a second time.
  #[error("border {0} is already linked")]
  BorderAlreadyLinked(String),
  /// Downstream port linked a second time.
  #[error("port {0} is already linked")]
  PortAlreadyLinked(String),
  /// Push after eof for the same (to, from) pair.
  #[error("data after eof on port {port}: to {to}, from {from}")]
  DataAfterEof {
    /// Port label (`node.port`).
    port: String,
    /// Destination partition.
    to: PartId,
    /// Source partition.
    from: PartId,
  },
  /// Serialization failure.
  #[error("serialize {type_name} failed: {reason}")]
  Serialize {
    /// Data type name.
    type_name: String,
    /// Underlying reason.
    reason: String,
  },
  /// Deserialization failure.
  #[error("deserialize {type_name} failed: {reason}")]
  Deserialize {
    /// Data type name.
    type_name: String,
    /// Underlying reason.
    reason: String,
  },
  /// Unknown data type name.
  #[error("data type {0} is not registered")]
  TypeNotFound(String),
  /// Payload type does not match the type bound to the port.
  #[error("port {port} is bound to {expected}, got {actual}")]
  TypeMismatch {
    /// Port label.
    port: String,
    /// Bound type name.
    expected: String,
    /// Observed type name.
    actual: String,
  },
  /// Memory pool is over its limit.
  #[error("memory pool usage {usage} exceeds limit {limit}")]
  PoolLimitExceeded {
    /// Current usage in bytes.
    usage: usize,
    /// Configured limit in bytes.
    limit: usize,
  },
  /// Border ports could not be paired.
  #[error("link failed: {0}")]
  LinkFailed(String),
  /// No port with this identity.
  #[error("port {0} not found")]
  PortNotFound(String),
  /// Port used before it was linked.
  #[error("port {0} is not linked")]
  PortNotLinked(String),
  /// Operation not supported by the variant.
  #[error("unsupported operation: {0}")]
  Unsupported(&'static str),
  /// `set_data` got the wrong number of payloads.
  #[error("expected {expected} payloads, got {actual}")]
  PayloadCountMismatch {
    /// Used partition count of the port.
    expected: usize,
    /// Number of payloads passed.
    actual: usize,
  },
  /// Stream send failed after retries.
  #[error("stream send to partition {partition} failed: {reason}")]
  StreamSend {
    /// Remote partition.
    partition: PartId,
    /// Transport failure.
    reason: String,
  },
  /// Invalid graph definition.
  #[error("invalid graph: {0}")]
  InvalidGraph(String),
  /// Kernel error.
  #[error("kernel {node} failed: {message}")]
  Kernel {
    /// Node name.
    node: String,
    /// Kernel message.
    message: String,
  },
  /// Deadline exceeded.
  #[error("run timed out")]
  Timeout,
  /// Run cancelled.
  #[error("run cancelled")]
  Cancelled,
  /// Rejected configuration.
  #[error("invalid configuration: {0}")]
  Config(String),
  /// Error reported by a remote peer.
  #[error("remote error {code}: {message}")]
  Remote {
    /// Remote error code.
    code: ErrorCode,
    /// Remote error message.
    message: String,
  },
}

impl GraphError {
  /// Returns the stable code of this error.
  pub fn code(&self) -> ErrorCode {
    match self {
      GraphError::PartIdOverflow { .. }
      | GraphError::BorderAlreadyLinked(_)
      | GraphError::PortAlreadyLinked(_) => ErrorCode::PartIdOverflow,
      GraphError::DataAfterEof { .. } => ErrorCode::DataAfterEof,
      GraphError::Serialize { .. } => ErrorCode::Serialize,
      GraphError::Deserialize { .. } => ErrorCode::Deserialize,
      GraphError::TypeNotFound(_) => ErrorCode::TypeNotFound,
      GraphError::TypeMismatch { .. } => ErrorCode::TypeMismatch,
      GraphError::PoolLimitExceeded { .. } => ErrorCode::PoolLimitExceeded,
      GraphError::LinkFailed(_) | GraphError::PortNotFound(_) | GraphError::PortNotLinked(_) => {
        ErrorCode::LinkFailed
      }
      GraphError::Unsupported(_) | GraphError::PayloadCountMismatch { .. } => {
        ErrorCode::Unsupported
      }
      GraphError::StreamSend { .. } => ErrorCode::StreamSend,
      GraphError::InvalidGraph(_) => ErrorCode::InvalidGraph,
      GraphError::Kernel { .. } => ErrorCode::Kernel,
      GraphError::Timeout => ErrorCode::Timeout,
      GraphError::Cancelled => ErrorCode::Cancelled,
      GraphError::Config(_) => ErrorCode::Config,
      GraphError::Remote { code, .. } => *code,
    }
  }

  /// Whether this error should fail the run when it reaches a domain.
  ///
  /// Protocol violations are left to the caller.
  pub fn is_fatal(&self) -> bool {
    !matches!(self, GraphError::DataAfterEof { .. })
  }
}
