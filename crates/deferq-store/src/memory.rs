//! In-memory store.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{KeyValueStore, StoreError, validate_key};

/// Store backed by a concurrent map.
///
/// Values live as long as the store does. Share one instance behind an `Arc`
/// between schedulers to simulate a process restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: DashMap<String, String>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        validate_key(key)?;
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.values.remove(key);
        Ok(())
    }
}
