//! Error types for the store backends.

use thiserror::Error;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend was used before `init`.
    #[error("store not initialized")]
    NotInitialized,

    /// Key cannot be stored.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}
