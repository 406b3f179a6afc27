//! # Engine Configuration
//!
//! [`EngineConfig`] collects every tunable of the engine. It deserializes from
//! JSON with defaults for missing fields, and can be adjusted with `with_*`
//! setters.
//!
//! ```rust
//! use gridweave::config::EngineConfig;
//!
//! let config = EngineConfig::from_json(r#"{ "send_retries": 5, "worker": { "max_drainers": 2 } }"#).unwrap();
//! assert_eq!(config.send_retries, 5);
//! assert_eq!(config.worker.max_drainers, 2);
//! assert_eq!(config.batch_limit_bytes, 8 * 1024 * 1024);
//! ```

use crate::error::{GraphError, Result};
use crate::memory_pool::MemoryPoolConfig;
use crate::worker::WorkerConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Engine-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Threads of the engine-owned runtime; `0` uses the tokio default.
  pub worker_threads: usize,
  /// Scheduling limits applied to every run.
  pub worker: WorkerConfig,
  /// Byte limit of one collected stream batch.
  pub batch_limit_bytes: usize,
  /// Retries of a failed stream send before the run fails.
  pub send_retries: u32,
  /// Run deadline used when the caller sets none, in milliseconds.
  pub default_timeout_ms: u64,
  /// Buffer pool and payload memory limit.
  pub memory_pool: MemoryPoolConfig,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      worker_threads: 0,
      worker: WorkerConfig::default(),
      batch_limit_bytes: 8 * 1024 * 1024,
      send_retries: 3,
      default_timeout_ms: 60_000,
      memory_pool: MemoryPoolConfig::default(),
    }
  }
}

impl EngineConfig {
  /// Parses a JSON document and validates it.
  pub fn from_json(text: &str) -> Result<Self> {
    let config: Self =
      serde_json::from_str(text).map_err(|e| GraphError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  /// Reads and parses a JSON file.
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
      .map_err(|e| GraphError::Config(format!("{}: {}", path.display(), e)))?;
    Self::from_json(&text)
  }

  /// Rejects settings the engine cannot run with.
  pub fn validate(&self) -> Result<()> {
    if self.worker.max_drainers == 0 {
      return Err(GraphError::Config("worker.max_drainers must be positive".to_string()));
    }
    if self.batch_limit_bytes == 0 {
      return Err(GraphError::Config("batch_limit_bytes must be positive".to_string()));
    }
    if self.default_timeout_ms == 0 {
      return Err(GraphError::Config("default_timeout_ms must be positive".to_string()));
    }
    if self.memory_pool.size_classes.is_empty() {
      return Err(GraphError::Config(
        "memory_pool.size_classes must not be empty".to_string(),
      ));
    }
    Ok(())
  }

  /// Default run deadline.
  pub fn default_timeout(&self) -> Duration {
    Duration::from_millis(self.default_timeout_ms)
  }

  /// Sets the number of runtime threads.
  pub fn with_worker_threads(mut self, threads: usize) -> Self {
    self.worker_threads = threads;
    self
  }

  /// Sets the maximum number of drain tasks per run.
  pub fn with_max_drainers(mut self, drainers: usize) -> Self {
    self.worker.max_drainers = drainers;
    self
  }

  /// Sets the maximum inline scheduling depth.
  pub fn with_max_inline_depth(mut self, depth: usize) -> Self {
    self.worker.max_inline_depth = depth;
    self
  }

  /// Sets the stream batch byte limit.
  pub fn with_batch_limit_bytes(mut self, bytes: usize) -> Self {
    self.batch_limit_bytes = bytes;
    self
  }

  /// Sets the number of send retries.
  pub fn with_send_retries(mut self, retries: u32) -> Self {
    self.send_retries = retries;
    self
  }

  /// Sets the default run deadline.
  pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
    self.default_timeout_ms = timeout.as_millis() as u64;
    self
  }

  /// Sets the memory pool usage limit.
  pub fn with_memory_limit(mut self, bytes: usize) -> Self {
    self.memory_pool.limit_bytes = bytes;
    self
  }
}
