//! In-memory queue state.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::{Job, Snapshot};

/// Async function a queue hands each job to.
///
/// An `Err` is logged; the job is consumed either way.
pub type JobProcessor = Arc<dyn Fn(Job) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Pending timer for a job.
///
/// The timer task only sleeps. Once it wakes it checks `canceled` and hands
/// the job off to a separate task, so aborting it never interrupts a running
/// processor.
#[derive(Debug)]
pub(crate) struct JobTimer {
    canceled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl JobTimer {
    pub(crate) fn new(canceled: Arc<AtomicBool>, handle: JoinHandle<()>) -> Self {
        Self { canceled, handle }
    }

    /// Flag the job canceled, stop the sleeping task and wait for it to end.
    pub(crate) async fn cancel(self) {
        self.canceled.store(true, Ordering::Release);
        self.handle.abort();
        match self.handle.await {
            Err(e) if e.is_panic() => warn!(error = %e, "job timer task panicked"),
            _ => {}
        }
    }
}

/// A job plus its runtime state.
#[derive(Debug)]
pub(crate) struct JobEntry {
    /// Identity of this entry within the scheduler. A stale timer from a
    /// closed queue never matches a reopened entry with the same job id.
    pub(crate) seq: u64,
    pub(crate) job: Job,
    pub(crate) timer: Option<JobTimer>,
}

/// An open queue: ordered jobs sharing one processor.
pub(crate) struct Queue {
    pub(crate) id: String,
    pub(crate) process: JobProcessor,
    /// Set once a close starts. A closing queue accepts no changes and
    /// starts no processors.
    pub(crate) closing: bool,
    entries: Vec<JobEntry>,
    /// Entries whose processor is running.
    firing: HashSet<u64>,
}

impl Queue {
    pub(crate) fn new(id: String, process: JobProcessor) -> Self {
        Self {
            id,
            process,
            closing: false,
            entries: Vec::new(),
            firing: HashSet::new(),
        }
    }

    pub(crate) fn begin_firing(&mut self, seq: u64) {
        self.firing.insert(seq);
    }

    /// Returns whether `seq` was firing.
    pub(crate) fn end_firing(&mut self, seq: u64) -> bool {
        self.firing.remove(&seq)
    }

    /// No processor is running for this queue.
    pub(crate) fn is_idle(&self) -> bool {
        self.firing.is_empty()
    }

    pub(crate) fn push(&mut self, seq: u64, job: Job, timer: Option<JobTimer>) {
        self.entries.push(JobEntry { seq, job, timer });
    }

    pub(crate) fn contains_job(&self, job_id: &str) -> bool {
        self.entries.iter().any(|e| e.job.id == job_id)
    }

    pub(crate) fn contains_seq(&self, seq: u64) -> bool {
        self.entries.iter().any(|e| e.seq == seq)
    }

    pub(crate) fn get(&self, job_id: &str) -> Option<&Job> {
        self.entries
            .iter()
            .find(|e| e.job.id == job_id)
            .map(|e| &e.job)
    }

    pub(crate) fn entry_mut(&mut self, seq: u64) -> Option<&mut JobEntry> {
        self.entries.iter_mut().find(|e| e.seq == seq)
    }

    /// Detach the entry for `job_id`, preserving the order of the rest.
    pub(crate) fn remove_job(&mut self, job_id: &str) -> Option<JobEntry> {
        let pos = self.entries.iter().position(|e| e.job.id == job_id)?;
        Some(self.entries.remove(pos))
    }

    pub(crate) fn remove_seq(&mut self, seq: u64) -> Option<JobEntry> {
        let pos = self.entries.iter().position(|e| e.seq == seq)?;
        Some(self.entries.remove(pos))
    }

    /// Take every armed timer, leaving the jobs in place.
    pub(crate) fn take_timers(&mut self) -> Vec<JobTimer> {
        self.entries
            .iter_mut()
            .filter_map(|e| e.timer.take())
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn jobs(&self) -> Vec<Job> {
        self.entries.iter().map(|e| e.job.clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.jobs())
    }
}
