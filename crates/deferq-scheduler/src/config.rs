//! Scheduler configuration.

/// What reconciliation does with an overdue job whose policy is
/// [`DueBehavior::Ignore`](crate::DueBehavior::Ignore).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IgnoredDueJobs {
    /// Leave the job in the queue untouched. It is skipped again on every
    /// subsequent open.
    #[default]
    Retain,
    /// Remove the job and persist the queue.
    Discard,
}

/// Options for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub ignored_due_jobs: IgnoredDueJobs,
}

impl SchedulerConfig {
    pub fn with_ignored_due_jobs(mut self, policy: IgnoredDueJobs) -> Self {
        self.ignored_due_jobs = policy;
        self
    }
}
