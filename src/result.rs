//! # Run Results
//!
//! Every run accumulates a [`RunResult`]: one terminal error code, trace events,
//! per-kernel metrics and RPC diagnostics. Results of forked sub-runs are
//! attached as children and merged into their parent once, when the parent
//! completes. Remote results arrive as a [`ResultSummary`] inside `Finalize`
//! control messages and merge by the same rules.
//!
//! Error merge rule: the first populated error wins, except that a later error
//! with a non-empty message replaces an earlier one whose message is empty.

use crate::error::{ErrorCode, GraphError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A timestamped event reported back to the caller of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
  /// When the event was recorded.
  pub at: DateTime<Utc>,
  /// Node or domain that recorded it.
  pub source: String,
  /// Free-form text.
  pub message: String,
}

impl TraceEvent {
  /// Creates an event stamped now.
  pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      at: Utc::now(),
      source: source.into(),
      message: message.into(),
    }
  }
}

/// Compute statistics of one kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelMetrics {
  /// Number of `compute` calls.
  pub compute_count: u64,
  /// Total time spent in `compute`.
  pub compute_nanos: u64,
}

impl KernelMetrics {
  fn merge(&mut self, other: &KernelMetrics) {
    self.compute_count += other.compute_count;
    self.compute_nanos += other.compute_nanos;
  }
}

/// Serializable snapshot of a run result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
  /// Terminal error code; `None` on success.
  pub code: ErrorCode,
  /// Error message.
  pub message: String,
  /// Backtrace captured with the error, if backtraces are enabled.
  pub backtrace: Option<String>,
  /// Trace events in arrival order.
  pub traces: Vec<TraceEvent>,
  /// Metrics by node name.
  pub metrics: BTreeMap<String, KernelMetrics>,
  /// Transport diagnostics by key.
  pub rpc_diagnostics: BTreeMap<String, String>,
}

impl ResultSummary {
  /// Whether the run succeeded.
  pub fn is_ok(&self) -> bool {
    self.code.is_ok()
  }

  /// The terminal error as a [`GraphError`], if any.
  pub fn error(&self) -> Option<GraphError> {
    if self.code.is_ok() {
      return None;
    }
    Some(GraphError::Remote {
      code: self.code,
      message: self.message.clone(),
    })
  }

  /// Applies the error merge rule. Returns whether the error was taken.
  pub fn merge_error(&mut self, code: ErrorCode, message: &str, backtrace: Option<String>) -> bool {
    if code.is_ok() {
      return false;
    }
    let take = self.code.is_ok() || (self.message.is_empty() && !message.is_empty());
    if take {
      self.code = code;
      self.message = message.to_string();
      self.backtrace = backtrace;
    }
    take
  }

  /// Merges `other` into `self`.
  pub fn merge(&mut self, other: &ResultSummary) {
    self.merge_error(other.code, &other.message, other.backtrace.clone());
    self.traces.extend(other.traces.iter().cloned());
    for (node, metrics) in &other.metrics {
      self.metrics.entry(node.clone()).or_default().merge(metrics);
    }
    for (key, value) in &other.rpc_diagnostics {
      self
        .rpc_diagnostics
        .entry(key.clone())
        .or_insert_with(|| value.clone());
    }
  }
}

/// Live result of a run, shared by its domains and nodes.
#[derive(Debug, Default)]
pub struct RunResult {
  summary: Mutex<ResultSummary>,
  error: Mutex<Option<GraphError>>,
  children: Mutex<Vec<Arc<RunResult>>>,
  finalized: AtomicBool,
}

impl RunResult {
  /// Creates an empty, successful result.
  pub fn new() -> Self {
    Self::default()
  }

  /// Records `error` under the merge rule. Returns whether it was taken.
  pub fn set_error(&self, error: &GraphError) -> bool {
    let backtrace = Backtrace::capture();
    let backtrace = (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string());
    let taken = self
      .summary
      .lock()
      .merge_error(error.code(), &error.to_string(), backtrace);
    if taken {
      *self.error.lock() = Some(error.clone());
    }
    taken
  }

  /// The error recorded locally, if any.
  pub fn error(&self) -> Option<GraphError> {
    if let Some(error) = self.error.lock().clone() {
      return Some(error);
    }
    self.summary.lock().error()
  }

  /// Current terminal code.
  pub fn code(&self) -> ErrorCode {
    self.summary.lock().code
  }

  /// Appends a trace event.
  pub fn add_trace(&self, event: TraceEvent) {
    self.summary.lock().traces.push(event);
  }

  /// Appends trace events.
  pub fn add_traces(&self, events: impl IntoIterator<Item = TraceEvent>) {
    self.summary.lock().traces.extend(events);
  }

  /// Records one `compute` call of `node`.
  pub fn record_compute(&self, node: &str, elapsed: Duration) {
    let mut summary = self.summary.lock();
    let metrics = summary.metrics.entry(node.to_string()).or_default();
    metrics.compute_count += 1;
    metrics.compute_nanos += elapsed.as_nanos() as u64;
  }

  /// Records a transport diagnostic; the first value per key is kept.
  pub fn add_rpc_diagnostic(&self, key: impl Into<String>, value: impl Into<String>) {
    self
      .summary
      .lock()
      .rpc_diagnostics
      .entry(key.into())
      .or_insert_with(|| value.into());
  }

  /// Merges a remote summary.
  pub fn merge_summary(&self, other: &ResultSummary) {
    self.summary.lock().merge(other);
  }

  /// Attaches the result of a forked sub-run.
  pub fn attach_child(&self, child: Arc<RunResult>) {
    self.children.lock().push(child);
  }

  /// Snapshot including children that are not merged yet.
  pub fn summary(&self) -> ResultSummary {
    let mut summary = self.summary.lock().clone();
    for child in self.children.lock().iter() {
      summary.merge(&child.summary());
    }
    summary
  }

  /// Merges attached children into this result. Only the first call merges.
  pub fn finalize(&self) -> ResultSummary {
    if !self.finalized.swap(true, Ordering::AcqRel) {
      let children = std::mem::take(&mut *self.children.lock());
      let mut summary = self.summary.lock();
      for child in children {
        summary.merge(&child.summary());
      }
    }
    self.summary()
  }
}
