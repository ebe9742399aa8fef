//! Persistent in-process delayed job queues.
//!
//! This crate provides a scheduler that:
//! - Groups delayed jobs into independently opened, ordered queues
//! - Arms one timer per job and runs the queue's processor when it fires
//! - Writes the whole queue snapshot through to a key-value store on every change
//! - Reconciles overdue jobs when a queue is reopened after a restart

mod config;
mod error;
mod queue;
mod scheduler;
mod snapshot;
mod types;

pub use config::{IgnoredDueJobs, SchedulerConfig};
pub use error::SchedulerError;
pub use queue::JobProcessor;
pub use scheduler::Scheduler;
pub use snapshot::Snapshot;
pub use types::{DueBehavior, Job, Payload};
