//! Store and scheduler setup shared by every subcommand.

use std::path::PathBuf;
use std::sync::Arc;

use deferq_scheduler::{IgnoredDueJobs, Scheduler, SchedulerConfig};
use deferq_store::{BypassStore, FileStore, KeyValueStore};
use miette::Result;
use tracing::debug;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
pub fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

/// Default snapshot directory: `<data dir>/deferq/queues`.
pub fn default_store_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("deferq")
        .join("queues")
}

/// Where and how queues are persisted for this invocation.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub store_dir: PathBuf,
    /// Persist nothing; queues always open empty.
    pub bypass: bool,
    /// Drop overdue `ignore` jobs when a queue opens instead of keeping them.
    pub discard_ignored: bool,
}

impl HostConfig {
    pub fn new(store_dir: Option<PathBuf>, bypass: bool, discard_ignored: bool) -> Self {
        Self {
            store_dir: store_dir.unwrap_or_else(default_store_dir),
            bypass,
            discard_ignored,
        }
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        if self.bypass {
            Arc::new(BypassStore::new())
        } else {
            Arc::new(FileStore::new(self.store_dir.clone()))
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let policy = if self.discard_ignored {
            IgnoredDueJobs::Discard
        } else {
            IgnoredDueJobs::Retain
        };
        SchedulerConfig::default().with_ignored_due_jobs(policy)
    }

    /// Build and initialize a scheduler over the configured store.
    pub async fn scheduler(&self) -> Result<Scheduler> {
        let scheduler = Scheduler::with_config(self.store(), self.scheduler_config());
        scheduler.init().await.map_err(|e| {
            miette::miette!(
                "failed to initialize store at {}: {}",
                self.store_dir.display(),
                e
            )
        })?;
        debug!(store_dir = %self.store_dir.display(), bypass = self.bypass, "scheduler ready");
        Ok(scheduler)
    }
}
