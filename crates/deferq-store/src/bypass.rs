//! No-op store for hosts without a backing store.

use async_trait::async_trait;
use tracing::trace;

use crate::{KeyValueStore, StoreError};

/// Store that drops every write and never finds anything.
///
/// Queues opened against it always start empty, and nothing survives a
/// restart.
#[derive(Debug, Default, Clone, Copy)]
pub struct BypassStore;

impl BypassStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl KeyValueStore for BypassStore {
    async fn init(&self) -> Result<(), StoreError> {
        trace!("bypass store: init");
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        trace!(key, "bypass store: read");
        Ok(None)
    }

    async fn write(&self, key: &str, _value: &str) -> Result<(), StoreError> {
        trace!(key, "bypass store: write dropped");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        trace!(key, "bypass store: remove");
        Ok(())
    }
}
