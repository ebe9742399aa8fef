//! Queue registry and job timers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use deferq_store::{BypassStore, KeyValueStore};
use futures_util::future::{BoxFuture, join_all};
use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::queue::{JobTimer, Queue};
use crate::{
    DueBehavior, IgnoredDueJobs, Job, JobProcessor, SchedulerConfig, SchedulerError, Snapshot,
};

struct Inner {
    store: Arc<dyn KeyValueStore>,
    config: SchedulerConfig,
    initialized: AtomicBool,
    queues: Mutex<HashMap<String, Queue>>,
    next_seq: AtomicU64,
    /// Signaled whenever a running processor finishes.
    processed: Notify,
}

/// Registry of open queues.
///
/// Cloning is cheap; clones share the registry. Every mutating operation
/// holds the registry lock across both the in-memory change and the snapshot
/// write, so observers never see one without the other. Processors run with
/// the lock released and may call back into the scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler persisting to `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_config(store, SchedulerConfig::default())
    }

    pub fn with_config(store: Arc<dyn KeyValueStore>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                initialized: AtomicBool::new(false),
                queues: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                processed: Notify::new(),
            }),
        }
    }

    /// Create a scheduler that persists nothing. Queues always open empty.
    pub fn bypass() -> Self {
        Self::new(Arc::new(BypassStore::new()))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Initialize the store. Must complete before any queue is opened.
    pub async fn init(&self) -> Result<(), SchedulerError> {
        self.inner.store.init().await?;
        self.inner.initialized.store(true, Ordering::Release);
        debug!("scheduler initialized");
        Ok(())
    }

    /// Open a queue, loading its snapshot or creating an empty one, and bind
    /// `process` as its processor.
    ///
    /// Jobs overdue at the moment of opening are reconciled before this
    /// returns: `Execute` jobs are processed in stored order and removed,
    /// `Ignore` jobs are retained or discarded per [`SchedulerConfig`]. Every
    /// other job gets a timer, even if it falls due while reconciliation runs.
    pub async fn open_queue<F, Fut>(
        &self,
        queue_id: impl Into<String>,
        process: F,
    ) -> Result<(), SchedulerError>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let processor: JobProcessor =
            Arc::new(move |job| -> BoxFuture<'static, Result<(), String>> { Box::pin(process(job)) });
        self.open_queue_with(queue_id.into(), processor).await
    }

    /// [`open_queue`](Self::open_queue) with an already boxed processor.
    #[tracing::instrument(skip_all, fields(queue = %queue_id))]
    pub async fn open_queue_with(
        &self,
        queue_id: String,
        process: JobProcessor,
    ) -> Result<(), SchedulerError> {
        if !self.inner.initialized.load(Ordering::Acquire) {
            return Err(SchedulerError::NotInitialized);
        }

        let (loaded, opened_at) = {
            let mut queues = self.inner.queues.lock().await;
            if queues.contains_key(&queue_id) {
                return Err(SchedulerError::AlreadyOpen(queue_id));
            }

            let snapshot = match Snapshot::load(self.inner.store.as_ref(), &queue_id).await? {
                Some(snapshot) => snapshot,
                None => {
                    let empty = Snapshot::default();
                    empty.save(self.inner.store.as_ref(), &queue_id).await?;
                    empty
                }
            };

            let mut queue = Queue::new(queue_id.clone(), process);
            let loaded: Vec<(u64, Job)> = snapshot
                .list
                .into_iter()
                .map(|job| {
                    let seq = self.next_seq();
                    queue.push(seq, job.clone(), None);
                    (seq, job)
                })
                .collect();
            queues.insert(queue_id.clone(), queue);
            (loaded, Utc::now())
        };

        info!(queue = %queue_id, jobs = loaded.len(), "queue opened");
        self.reconcile(&queue_id, loaded, opened_at).await
    }

    /// Apply the due-time policy to every loaded job, in stored order.
    ///
    /// Whether a job is overdue is judged against `opened_at`, so a slow
    /// processor never pushes a later job into the overdue branch.
    async fn reconcile(
        &self,
        queue_id: &str,
        loaded: Vec<(u64, Job)>,
        opened_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        for (seq, job) in loaded {
            if !job.is_due(opened_at) {
                let mut queues = self.inner.queues.lock().await;
                let entry = open_mut(&mut queues, queue_id)
                    .ok()
                    .and_then(|q| q.entry_mut(seq));
                if let Some(entry) = entry {
                    entry.timer = Some(self.arm(queue_id, seq, &job));
                }
                continue;
            }

            match (job.due_behavior, self.inner.config.ignored_due_jobs) {
                (DueBehavior::Execute, _) => {
                    let Some(process) = self.processor_for(queue_id, seq, None).await else {
                        continue;
                    };
                    info!(queue = %queue_id, job = %job.id, "executing overdue job");
                    run_processor(&process, queue_id, job).await;
                    self.finish_job(queue_id, seq).await?;
                }
                (DueBehavior::Ignore, IgnoredDueJobs::Retain) => {
                    debug!(queue = %queue_id, job = %job.id, "retaining ignored overdue job");
                }
                (DueBehavior::Ignore, IgnoredDueJobs::Discard) => {
                    if self.remove_and_persist(queue_id, seq).await? {
                        info!(queue = %queue_id, job = %job.id, "discarded ignored overdue job");
                    }
                }
            }
        }
        Ok(())
    }

    /// Append a job, arm its timer and persist the queue.
    ///
    /// A due time already in the past fires on the next timer tick; the
    /// overdue policy only applies when a queue is opened.
    #[tracing::instrument(skip_all, fields(queue = %queue_id, job = %job.id))]
    pub async fn add_job(&self, queue_id: &str, job: Job) -> Result<(), SchedulerError> {
        let mut queues = self.inner.queues.lock().await;
        let queue = open_mut(&mut queues, queue_id)?;

        if queue.contains_job(&job.id) {
            return Err(SchedulerError::JobExists {
                queue: queue_id.to_string(),
                job: job.id,
            });
        }

        let seq = self.next_seq();
        let timer = self.arm(queue_id, seq, &job);
        queue.push(seq, job, Some(timer));

        self.persist(queue).await
    }

    /// Cancel and remove one job, then persist the queue.
    #[tracing::instrument(skip_all, fields(queue = %queue_id, job = %job_id))]
    pub async fn remove_job(&self, queue_id: &str, job_id: &str) -> Result<(), SchedulerError> {
        let mut queues = self.inner.queues.lock().await;
        let queue = open_mut(&mut queues, queue_id)?;

        let entry = queue
            .remove_job(job_id)
            .ok_or_else(|| SchedulerError::job_not_found(queue_id, job_id))?;
        if let Some(timer) = entry.timer {
            timer.cancel().await;
        }
        debug!(queue = %queue_id, job = %job_id, "removed job");

        self.persist(queue).await
    }

    /// Cancel every timer, empty the queue and persist the empty snapshot.
    #[tracing::instrument(skip_all, fields(queue = %queue_id))]
    pub async fn clear_queue(&self, queue_id: &str) -> Result<(), SchedulerError> {
        let mut queues = self.inner.queues.lock().await;
        let queue = open_mut(&mut queues, queue_id)?;

        cancel_all(queue.take_timers()).await;
        let cleared = queue.len();
        queue.clear();
        info!(queue = %queue_id, cleared, "queue cleared");

        self.persist(queue).await
    }

    /// Cancel every timer, drop the queue and delete its snapshot.
    #[tracing::instrument(skip_all, fields(queue = %queue_id))]
    pub async fn remove_queue(&self, queue_id: &str) -> Result<(), SchedulerError> {
        let mut queues = self.inner.queues.lock().await;
        let timers = open_mut(&mut queues, queue_id)?.take_timers();

        cancel_all(timers).await;
        queues.remove(queue_id);
        self.inner.store.remove(queue_id).await?;

        info!(queue = %queue_id, "queue removed");
        Ok(())
    }

    /// Cancel every timer and drop the queue, keeping its snapshot so it
    /// can be opened again.
    ///
    /// Processors already running finish first and their jobs are removed
    /// from the snapshot, so nothing that ran is run again on reopen. Must
    /// not be awaited from a processor of the same queue.
    #[tracing::instrument(skip_all, fields(queue = %queue_id))]
    pub async fn close_queue(&self, queue_id: &str) -> Result<(), SchedulerError> {
        let timers = {
            let mut queues = self.inner.queues.lock().await;
            let queue = open_mut(&mut queues, queue_id)?;
            queue.closing = true;
            queue.take_timers()
        };

        cancel_all(timers).await;
        let pending = self.drain(&[queue_id.to_string()]).await;
        info!(queue = %queue_id, pending, "queue closed");
        Ok(())
    }

    /// Close every open queue. Must not be awaited from a processor.
    pub async fn shutdown(&self) {
        let (ids, timers) = {
            let mut queues = self.inner.queues.lock().await;
            let mut ids = Vec::new();
            let mut timers = Vec::new();
            for (id, queue) in queues.iter_mut().filter(|(_, q)| !q.closing) {
                queue.closing = true;
                timers.extend(queue.take_timers());
                ids.push(id.clone());
            }
            (ids, timers)
        };

        cancel_all(timers).await;
        let pending = self.drain(&ids).await;
        info!(queues = ids.len(), pending, "scheduler shut down");
    }

    /// Jobs of an open queue, in queue order.
    pub async fn jobs(&self, queue_id: &str) -> Result<Vec<Job>, SchedulerError> {
        let queues = self.inner.queues.lock().await;
        queues
            .get(queue_id)
            .map(Queue::jobs)
            .ok_or_else(|| SchedulerError::NotOpen(queue_id.to_string()))
    }

    /// A single job of an open queue.
    pub async fn job(&self, queue_id: &str, job_id: &str) -> Result<Job, SchedulerError> {
        let queues = self.inner.queues.lock().await;
        let queue = queues
            .get(queue_id)
            .ok_or_else(|| SchedulerError::NotOpen(queue_id.to_string()))?;
        queue
            .get(job_id)
            .cloned()
            .ok_or_else(|| SchedulerError::job_not_found(queue_id, job_id))
    }

    pub async fn is_open(&self, queue_id: &str) -> bool {
        self.inner
            .queues
            .lock()
            .await
            .get(queue_id)
            .is_some_and(|q| !q.closing)
    }

    /// Ids of all open queues, sorted.
    pub async fn open_queues(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .queues
            .lock()
            .await
            .iter()
            .filter(|(_, q)| !q.closing)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn next_seq(&self) -> u64 {
        self.inner.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Spawn a single-shot timer for the entry `seq`.
    fn arm(&self, queue_id: &str, seq: u64, job: &Job) -> JobTimer {
        let delay = job.delay_from(Utc::now());
        let canceled = Arc::new(AtomicBool::new(false));

        let scheduler = self.clone();
        let flag = Arc::clone(&canceled);
        let queue_id = queue_id.to_string();
        let job = job.clone();
        debug!(queue = %queue_id, job = %job.id, delay_ms = delay.as_millis() as u64, "armed job timer");

        let handle = tokio::spawn(async move {
            sleep(delay).await;
            if flag.load(Ordering::Acquire) {
                return;
            }
            // Detached so that canceling the timer cannot abort a processor
            // that has already started.
            tokio::spawn(async move { scheduler.fire(queue_id, seq, job, flag).await });
        });

        JobTimer::new(canceled, handle)
    }

    /// Timer body: process the job unless canceled, then remove and persist.
    async fn fire(&self, queue_id: String, seq: u64, job: Job, canceled: Arc<AtomicBool>) {
        let Some(process) = self.processor_for(&queue_id, seq, Some(&canceled)).await else {
            debug!(queue = %queue_id, job = %job.id, "timer fired for canceled or departed job");
            return;
        };

        info!(queue = %queue_id, job = %job.id, "executing job");
        run_processor(&process, &queue_id, job.clone()).await;

        if let Err(e) = self.finish_job(&queue_id, seq).await {
            error!(queue = %queue_id, job = %job.id, error = %e, "failed to persist queue after job");
        }
    }

    /// Claim entry `seq` for processing and return its queue's processor.
    ///
    /// Returns `None` if the entry is gone, its queue is closing or the
    /// timer was canceled. The flag is read under the registry lock, the
    /// same lock cancellation runs under.
    async fn processor_for(
        &self,
        queue_id: &str,
        seq: u64,
        canceled: Option<&AtomicBool>,
    ) -> Option<JobProcessor> {
        let mut queues = self.inner.queues.lock().await;
        let queue = queues.get_mut(queue_id)?;
        if queue.closing || !queue.contains_seq(seq) {
            return None;
        }
        if canceled.is_some_and(|flag| flag.load(Ordering::Acquire)) {
            return None;
        }
        queue.begin_firing(seq);
        Some(Arc::clone(&queue.process))
    }

    /// Release a claim taken by [`processor_for`](Self::processor_for) and
    /// remove the processed entry if it is still queued.
    async fn finish_job(&self, queue_id: &str, seq: u64) -> Result<bool, SchedulerError> {
        let mut queues = self.inner.queues.lock().await;
        let Some(queue) = queues.get_mut(queue_id) else {
            return Ok(false);
        };
        if queue.end_firing(seq) {
            self.inner.processed.notify_waiters();
        }
        if queue.remove_seq(seq).is_none() {
            return Ok(false);
        }
        self.persist(queue).await?;
        Ok(true)
    }

    /// Remove entry `seq` if it is still queued and persist.
    ///
    /// Returns whether anything was removed.
    async fn remove_and_persist(&self, queue_id: &str, seq: u64) -> Result<bool, SchedulerError> {
        let mut queues = self.inner.queues.lock().await;
        let Some(queue) = queues.get_mut(queue_id) else {
            return Ok(false);
        };
        if queue.remove_seq(seq).is_none() {
            return Ok(false);
        }
        self.persist(queue).await?;
        Ok(true)
    }

    /// Wait until no processor of the closing queues `ids` is running, then
    /// drop them. Returns the number of jobs left in their snapshots.
    async fn drain(&self, ids: &[String]) -> usize {
        loop {
            // Registered before the check so a finish in between is not missed
            let processed = self.inner.processed.notified();
            {
                let mut queues = self.inner.queues.lock().await;
                if ids.iter().all(|id| queues.get(id).is_none_or(Queue::is_idle)) {
                    return ids
                        .iter()
                        .filter_map(|id| queues.remove(id))
                        .map(|q| q.len())
                        .sum();
                }
            }
            processed.await;
        }
    }

    /// Write the whole queue snapshot. Callers hold the registry lock.
    async fn persist(&self, queue: &Queue) -> Result<(), SchedulerError> {
        queue
            .snapshot()
            .save(self.inner.store.as_ref(), &queue.id)
            .await
    }
}

/// The queue `queue_id` if it is open and not closing.
fn open_mut<'a>(
    queues: &'a mut HashMap<String, Queue>,
    queue_id: &str,
) -> Result<&'a mut Queue, SchedulerError> {
    queues
        .get_mut(queue_id)
        .filter(|q| !q.closing)
        .ok_or_else(|| SchedulerError::NotOpen(queue_id.to_string()))
}

async fn run_processor(process: &JobProcessor, queue_id: &str, job: Job) {
    let job_id = job.id.clone();
    if let Err(error) = process(job).await {
        warn!(queue = %queue_id, job = %job_id, error = %error, "job processor failed");
    }
}

/// Cancel timers concurrently and wait for all of them.
async fn cancel_all(timers: Vec<JobTimer>) {
    if timers.is_empty() {
        return;
    }
    let count = timers.len();
    join_all(timers.into_iter().map(JobTimer::cancel)).await;
    debug!(count, "canceled job timers");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use deferq_store::MemoryStore;

    fn noop(_job: Job) -> impl Future<Output = Result<(), String>> + Send + 'static {
        async { Ok(()) }
    }

    #[tokio::test]
    async fn test_open_before_init_fails() {
        let scheduler = Scheduler::bypass();
        let result = scheduler.open_queue("q", noop).await;
        assert!(matches!(result, Err(SchedulerError::NotInitialized)));
        assert!(!scheduler.is_open("q").await);
    }

    #[tokio::test]
    async fn test_open_twice_fails() {
        let scheduler = Scheduler::bypass();
        scheduler.init().await.unwrap();
        scheduler.open_queue("q", noop).await.unwrap();

        let result = scheduler.open_queue("q", noop).await;
        assert!(matches!(result, Err(SchedulerError::AlreadyOpen(id)) if id == "q"));
    }

    #[tokio::test]
    async fn test_open_persists_empty_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Scheduler::new(store.clone());
        scheduler.init().await.unwrap();

        scheduler.open_queue("fresh", noop).await.unwrap();
        assert_eq!(
            store.read("fresh").await.unwrap().as_deref(),
            Some(r#"{"list":[]}"#)
        );
    }

    #[tokio::test]
    async fn test_operations_on_unknown_queue_fail() {
        let scheduler = Scheduler::bypass();
        scheduler.init().await.unwrap();
        let job = Job::after("j", Duration::seconds(1));

        assert!(matches!(
            scheduler.add_job("nope", job).await,
            Err(SchedulerError::NotOpen(_))
        ));
        assert!(matches!(
            scheduler.remove_job("nope", "j").await,
            Err(SchedulerError::NotOpen(_))
        ));
        assert!(matches!(
            scheduler.clear_queue("nope").await,
            Err(SchedulerError::NotOpen(_))
        ));
        assert!(matches!(
            scheduler.remove_queue("nope").await,
            Err(SchedulerError::NotOpen(_))
        ));
        assert!(matches!(
            scheduler.close_queue("nope").await,
            Err(SchedulerError::NotOpen(_))
        ));
        assert!(matches!(
            scheduler.jobs("nope").await,
            Err(SchedulerError::NotOpen(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_job_id_rejected() {
        let scheduler = Scheduler::bypass();
        scheduler.init().await.unwrap();
        scheduler.open_queue("q", noop).await.unwrap();

        scheduler
            .add_job("q", Job::after("j", Duration::seconds(10)))
            .await
            .unwrap();
        let result = scheduler
            .add_job("q", Job::after("j", Duration::seconds(20)))
            .await;

        assert!(matches!(result, Err(SchedulerError::JobExists { .. })));
        assert_eq!(scheduler.jobs("q").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_queues_sorted() {
        let scheduler = Scheduler::bypass();
        scheduler.init().await.unwrap();
        scheduler.open_queue("b", noop).await.unwrap();
        scheduler.open_queue("a", noop).await.unwrap();

        assert_eq!(scheduler.open_queues().await, vec!["a", "b"]);

        scheduler.shutdown().await;
        assert!(scheduler.open_queues().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_lookup() {
        let scheduler = Scheduler::bypass();
        scheduler.init().await.unwrap();
        scheduler.open_queue("q", noop).await.unwrap();

        let job = Job::after("j", Duration::minutes(5));
        scheduler.add_job("q", job.clone()).await.unwrap();

        assert_eq!(scheduler.job("q", "j").await.unwrap(), job);
        assert!(matches!(
            scheduler.job("q", "other").await,
            Err(SchedulerError::JobNotFound { .. })
        ));
    }

    /// Sequence number of the single job in queue `q`.
    async fn only_seq(scheduler: &Scheduler) -> u64 {
        let queues = scheduler.inner.queues.lock().await;
        let queue = queues.get("q").unwrap();
        (0..scheduler.inner.next_seq.load(Ordering::Relaxed))
            .find(|seq| queue.contains_seq(*seq))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_canceled_timer_never_claims_job() {
        let scheduler = Scheduler::bypass();
        scheduler.init().await.unwrap();
        scheduler.open_queue("q", noop).await.unwrap();
        scheduler
            .add_job("q", Job::after("j", Duration::minutes(5)))
            .await
            .unwrap();
        let seq = only_seq(&scheduler).await;

        // A flag set before the claim wins even though the entry is still queued
        let canceled = AtomicBool::new(true);
        assert!(scheduler.processor_for("q", seq, Some(&canceled)).await.is_none());
        assert!(scheduler.inner.queues.lock().await["q"].is_idle());

        let live = AtomicBool::new(false);
        assert!(scheduler.processor_for("q", seq, Some(&live)).await.is_some());
        assert!(!scheduler.inner.queues.lock().await["q"].is_idle());

        assert!(scheduler.finish_job("q", seq).await.unwrap());
        assert!(scheduler.inner.queues.lock().await["q"].is_idle());
        assert!(scheduler.jobs("q").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_queue_rejects_changes_and_claims() {
        let scheduler = Scheduler::bypass();
        scheduler.init().await.unwrap();
        scheduler.open_queue("q", noop).await.unwrap();
        scheduler
            .add_job("q", Job::after("j", Duration::minutes(5)))
            .await
            .unwrap();
        let seq = only_seq(&scheduler).await;

        scheduler.inner.queues.lock().await.get_mut("q").unwrap().closing = true;

        assert!(!scheduler.is_open("q").await);
        assert!(scheduler.open_queues().await.is_empty());
        assert!(scheduler.processor_for("q", seq, None).await.is_none());
        assert!(matches!(
            scheduler.add_job("q", Job::after("k", Duration::minutes(1))).await,
            Err(SchedulerError::NotOpen(_))
        ));
        assert!(matches!(
            scheduler.close_queue("q").await,
            Err(SchedulerError::NotOpen(_))
        ));
    }
}
