//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// An operation ran before `Scheduler::init`.
    #[error("scheduler not initialized")]
    NotInitialized,

    /// Queue is already open.
    #[error("queue already open: {0}")]
    AlreadyOpen(String),

    /// Queue is not open.
    #[error("queue not open: {0}")]
    NotOpen(String),

    /// Job not found.
    #[error("job not found: {queue}/{job}")]
    JobNotFound { queue: String, job: String },

    /// Job already exists.
    #[error("job already exists: {queue}/{job}")]
    JobExists { queue: String, job: String },

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] deferq_store::StoreError),

    /// Snapshot could not be encoded or decoded.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl SchedulerError {
    pub(crate) fn job_not_found(queue: &str, job: &str) -> Self {
        Self::JobNotFound {
            queue: queue.to_string(),
            job: job.to_string(),
        }
    }
}
