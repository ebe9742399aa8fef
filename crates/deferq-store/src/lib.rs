//! Key-value persistence for deferq.
//!
//! The scheduler only needs an opaque string store addressed by key. This
//! crate provides the [`KeyValueStore`] trait and three backends:
//!
//! - **FileStore**: one file per key inside a directory, atomic replace on write
//! - **MemoryStore**: concurrent in-memory map, survives scheduler restarts
//!   within one process
//! - **BypassStore**: every operation is a no-op and reads report absent

mod bypass;
mod error;
mod file;
mod memory;

use async_trait::async_trait;

pub use bypass::BypassStore;
pub use error::StoreError;
pub use file::FileStore;
pub use memory::MemoryStore;

/// An opaque key to string store.
///
/// `init` must complete before any other call and may be repeated.
/// Operations on the same key are expected to be linearizable: a `write`
/// is durable once it returns.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Prepare the backend for use. Idempotent.
    async fn init(&self) -> Result<(), StoreError>;

    /// Read the value stored under `key`, if any.
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`, replacing any previous value.
    async fn write(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete `key`. Deleting an absent key succeeds.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Reject keys that no backend can address.
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key cannot be empty".to_string()));
    }
    Ok(())
}
