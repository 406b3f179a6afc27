//! # Memory Pool
//!
//! Buffer reuse for payload serialization plus byte accounting for payloads
//! held in serialized form.
//!
//! ## Overview
//!
//! - **Buffer Pooling**: reusable `BytesMut` buffers, grouped by size class
//! - **Usage Accounting**: serialized payloads sitting in port queues hold a
//!   [`PoolLease`]; the pool's usage is the sum of live leases
//! - **Limit**: when usage is above [`MemoryPoolConfig::limit_bytes`], ports
//!   refuse to deserialize further payloads
//!
//! ```rust
//! use gridweave::memory_pool::{MemoryPool, MemoryPoolConfig};
//!
//! let pool = MemoryPool::with_config(MemoryPoolConfig::default().with_limit_bytes(16));
//! let lease = pool.lease(32);
//! assert!(pool.check_limit().is_err());
//! drop(lease);
//! assert!(pool.check_limit().is_ok());
//! ```

use crate::error::{GraphError, Result};
use bytes::BytesMut;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Configuration for memory pool sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryPoolConfig {
  /// Maximum number of buffers to keep in pool per size class
  pub max_buffers_per_size: usize,
  /// Size classes for buffer pooling (powers of 2)
  pub size_classes: Vec<usize>,
  /// Usage above which deserialization is refused
  pub limit_bytes: usize,
}

impl Default for MemoryPoolConfig {
  fn default() -> Self {
    Self {
      max_buffers_per_size: 1000,
      size_classes: vec![
        64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536,
      ],
      limit_bytes: 1 << 30,
    }
  }
}

impl MemoryPoolConfig {
  /// Sets the usage limit.
  pub fn with_limit_bytes(mut self, limit_bytes: usize) -> Self {
    self.limit_bytes = limit_bytes;
    self
  }
}

/// Thread-safe memory pool for buffer reuse and usage accounting.
#[derive(Debug)]
pub struct MemoryPool {
  /// Map of buffer size to available buffers in that size pool.
  pools: Mutex<HashMap<usize, Vec<BytesMut>>>,
  /// Bytes held by live leases.
  usage: Arc<AtomicUsize>,
  /// Configuration settings for the memory pool.
  config: MemoryPoolConfig,
}

impl Default for MemoryPool {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryPool {
  /// Creates a new memory pool with default configuration.
  pub fn new() -> Self {
    Self::with_config(MemoryPoolConfig::default())
  }

  /// Creates a new memory pool with custom configuration.
  pub fn with_config(config: MemoryPoolConfig) -> Self {
    Self {
      pools: Mutex::new(HashMap::new()),
      usage: Arc::new(AtomicUsize::new(0)),
      config,
    }
  }

  /// Gets a buffer from the pool with at least the requested capacity.
  pub fn get_buffer(&self, capacity: usize) -> BytesMut {
    let size_class = self.find_size_class(capacity);
    let mut pools = self.pools.lock();

    if let Some(buffers) = pools.get_mut(&size_class)
      && let Some(mut buffer) = buffers.pop()
    {
      buffer.clear();
      if buffer.capacity() < capacity {
        buffer.reserve(capacity - buffer.capacity());
      }
      return buffer;
    }

    BytesMut::with_capacity(size_class)
  }

  /// Returns a buffer to the pool for reuse.
  ///
  /// The buffer is dropped if its size class is already full.
  pub fn return_buffer(&self, mut buffer: BytesMut) {
    let size_class = self.find_size_class(buffer.capacity());
    let mut pools = self.pools.lock();
    let pool = pools.entry(size_class).or_default();
    if pool.len() < self.config.max_buffers_per_size {
      buffer.clear();
      pool.push(buffer);
    }
  }

  /// Finds the smallest size class that can accommodate the requested capacity.
  fn find_size_class(&self, capacity: usize) -> usize {
    for &size in &self.config.size_classes {
      if size >= capacity {
        return size;
      }
    }
    capacity.next_power_of_two().max(64)
  }

  /// Accounts `bytes` against the pool until the lease is dropped.
  pub fn lease(&self, bytes: usize) -> PoolLease {
    self.usage.fetch_add(bytes, Ordering::AcqRel);
    PoolLease {
      usage: Arc::clone(&self.usage),
      bytes,
    }
  }

  /// Bytes currently leased.
  pub fn usage(&self) -> usize {
    self.usage.load(Ordering::Acquire)
  }

  /// Configured usage limit.
  pub fn limit(&self) -> usize {
    self.config.limit_bytes
  }

  /// Fails with `PoolLimitExceeded` when usage is above the limit.
  pub fn check_limit(&self) -> Result<()> {
    let usage = self.usage();
    if usage > self.config.limit_bytes {
      return Err(GraphError::PoolLimitExceeded {
        usage,
        limit: self.config.limit_bytes,
      });
    }
    Ok(())
  }

  /// Gets pool statistics for monitoring and debugging.
  pub fn stats(&self) -> MemoryPoolStats {
    let pools = self.pools.lock();
    let mut total_buffers = 0;
    let mut total_memory = 0;
    for (size_class, buffers) in &*pools {
      total_buffers += buffers.len();
      total_memory += buffers.len() * size_class;
    }
    MemoryPoolStats {
      total_buffers,
      total_memory_bytes: total_memory,
      pools_count: pools.len(),
      leased_bytes: self.usage(),
    }
  }
}

/// Statistics about memory pool usage.
#[derive(Debug, Clone)]
pub struct MemoryPoolStats {
  /// Total number of buffers currently in all pools
  pub total_buffers: usize,
  /// Total memory used by pooled buffers in bytes
  pub total_memory_bytes: usize,
  /// Number of size class pools
  pub pools_count: usize,
  /// Bytes held by live leases
  pub leased_bytes: usize,
}

/// Usage held against a [`MemoryPool`]; released on drop.
#[derive(Debug)]
pub struct PoolLease {
  usage: Arc<AtomicUsize>,
  bytes: usize,
}

impl PoolLease {
  /// Leased byte count.
  pub fn bytes(&self) -> usize {
    self.bytes
  }
}

impl Drop for PoolLease {
  fn drop(&mut self) {
    self.usage.fetch_sub(self.bytes, Ordering::AcqRel);
  }
}
