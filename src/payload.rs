//! # Payloads and Data Types
//!
//! Ports move payloads in one of two forms:
//!
//! - [`Payload`]: an in-memory, type-erased value tagged with its data type name.
//! - [`WirePayload`]: the serialized bytes of a payload plus its type name. Bytes
//!   that sit in a queue hold a [`PoolLease`] so the memory pool can account for them.
//!
//! A [`DataType`] converts between the two. Data types are looked up by name in a
//! [`TypeRegistry`]; [`JsonDataType`] covers every `serde` type.
//!
//! ```rust
//! use gridweave::payload::{Payload, TypeRegistry};
//! use bytes::BytesMut;
//!
//! let registry = TypeRegistry::new();
//! registry.register_json::<i64>("i64");
//!
//! let data_type = registry.get("i64").unwrap();
//! let mut buf = BytesMut::new();
//! data_type.serialize(&Payload::new("i64", 42i64), &mut buf).unwrap();
//! let back = data_type.deserialize(&buf).unwrap();
//! assert_eq!(back.downcast_ref::<i64>(), Some(&42));
//! ```

use crate::error::{GraphError, Result};
use crate::memory_pool::PoolLease;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// In-memory payload: a shared, type-erased value and the name of its data type.
#[derive(Clone)]
pub struct Payload {
  type_name: Arc<str>,
  value: Arc<dyn Any + Send + Sync>,
}

impl Payload {
  /// Wraps `value` under the data type `type_name`.
  pub fn new<T: Any + Send + Sync>(type_name: impl Into<Arc<str>>, value: T) -> Self {
    Self {
      type_name: type_name.into(),
      value: Arc::new(value),
    }
  }

  /// Name of the payload's data type.
  pub fn type_name(&self) -> &str {
    &self.type_name
  }

  /// Borrows the value as `T` if it is one.
  pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
    self.value.downcast_ref::<T>()
  }
}

impl fmt::Debug for Payload {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Payload")
      .field("type_name", &self.type_name)
      .finish_non_exhaustive()
  }
}

/// Serialized payload.
#[derive(Clone)]
pub struct WirePayload {
  type_name: Arc<str>,
  bytes: Bytes,
  lease: Option<Arc<PoolLease>>,
}

impl WirePayload {
  /// Wraps already serialized bytes.
  pub fn new(type_name: impl Into<Arc<str>>, bytes: Bytes) -> Self {
    Self {
      type_name: type_name.into(),
      bytes,
      lease: None,
    }
  }

  /// Attaches a memory pool lease that lives as long as the payload.
  pub fn with_lease(mut self, lease: PoolLease) -> Self {
    self.lease = Some(Arc::new(lease));
    self
  }

  /// Name of the payload's data type.
  pub fn type_name(&self) -> &str {
    &self.type_name
  }

  /// Serialized bytes.
  pub fn bytes(&self) -> &Bytes {
    &self.bytes
  }

  /// Serialized length in bytes.
  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  /// Whether the serialized form is empty.
  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }
}

impl fmt::Debug for WirePayload {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WirePayload")
      .field("type_name", &self.type_name)
      .field("len", &self.bytes.len())
      .finish()
  }
}

/// Named payload codec.
pub trait DataType: Send + Sync {
  /// Registered name.
  fn name(&self) -> &str;

  /// Appends the serialized form of `payload` to `buf`.
  fn serialize(&self, payload: &Payload, buf: &mut BytesMut) -> Result<()>;

  /// Rebuilds a payload from its serialized form.
  fn deserialize(&self, bytes: &[u8]) -> Result<Payload>;
}

/// [`DataType`] for any `serde` type, encoded as JSON.
pub struct JsonDataType<T> {
  name: Arc<str>,
  _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDataType<T> {
  /// Creates the codec under `name`.
  pub fn new(name: impl Into<Arc<str>>) -> Self {
    Self {
      name: name.into(),
      _marker: PhantomData,
    }
  }
}

impl<T> DataType for JsonDataType<T>
where
  T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
  fn name(&self) -> &str {
    &self.name
  }

  fn serialize(&self, payload: &Payload, buf: &mut BytesMut) -> Result<()> {
    let value = payload
      .downcast_ref::<T>()
      .ok_or_else(|| GraphError::Serialize {
        type_name: self.name.to_string(),
        reason: format!("payload holds a value of type {}", payload.type_name()),
      })?;
    serde_json::to_writer(buf.writer(), value).map_err(|e| GraphError::Serialize {
      type_name: self.name.to_string(),
      reason: e.to_string(),
    })
  }

  fn deserialize(&self, bytes: &[u8]) -> Result<Payload> {
    let value: T = serde_json::from_slice(bytes).map_err(|e| GraphError::Deserialize {
      type_name: self.name.to_string(),
      reason: e.to_string(),
    })?;
    Ok(Payload {
      type_name: Arc::clone(&self.name),
      value: Arc::new(value),
    })
  }
}

/// Data types by name.
#[derive(Default)]
pub struct TypeRegistry {
  types: RwLock<HashMap<String, Arc<dyn DataType>>>,
}

impl TypeRegistry {
  /// Creates an empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers `data_type` under its own name, replacing any previous entry.
  pub fn register(&self, data_type: Arc<dyn DataType>) {
    self
      .types
      .write()
      .insert(data_type.name().to_string(), data_type);
  }

  /// Registers a [`JsonDataType`] for `T` under `name`.
  pub fn register_json<T>(&self, name: &str)
  where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
  {
    self.register(Arc::new(JsonDataType::<T>::new(name)));
  }

  /// Looks up a data type.
  pub fn get(&self, name: &str) -> Result<Arc<dyn DataType>> {
    self
      .types
      .read()
      .get(name)
      .cloned()
      .ok_or_else(|| GraphError::TypeNotFound(name.to_string()))
  }
}

impl fmt::Debug for TypeRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let types = self.types.read();
    let mut names: Vec<&String> = types.keys().collect();
    names.sort();
    f.debug_struct("TypeRegistry").field("types", &names).finish()
  }
}
