//! Shared helpers for scheduler integration tests.

#![allow(dead_code)]

use std::future::{Ready, ready};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use deferq_scheduler::{Job, Scheduler};
use futures_util::future::BoxFuture;
use deferq_store::{KeyValueStore, MemoryStore};

/// Records the ids of every job a queue processes, in call order.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn processor(&self) -> impl Fn(Job) -> Ready<Result<(), String>> + Send + Sync + 'static {
        let seen = Arc::clone(&self.seen);
        move |job: Job| {
            seen.lock().unwrap().push(job.id);
            ready(Ok(()))
        }
    }

    /// Processor that records the job and then reports failure.
    pub fn failing_processor(
        &self,
    ) -> impl Fn(Job) -> Ready<Result<(), String>> + Send + Sync + 'static {
        let seen = Arc::clone(&self.seen);
        move |job: Job| {
            seen.lock().unwrap().push(job.id);
            ready(Err("downstream unavailable".to_string()))
        }
    }

    /// Processor that records the job on entry and takes `delay` to finish.
    pub fn slow_processor(
        &self,
        delay: StdDuration,
    ) -> impl Fn(Job) -> BoxFuture<'static, Result<(), String>> + Send + Sync + 'static {
        let seen = Arc::clone(&self.seen);
        move |job: Job| {
            seen.lock().unwrap().push(job.id);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(())
            })
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self, job_id: &str) -> usize {
        self.seen.lock().unwrap().iter().filter(|id| *id == job_id).count()
    }
}

/// Initialized scheduler over a fresh in-memory store.
pub async fn memory_scheduler() -> (Scheduler, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(store.clone());
    scheduler.init().await.unwrap();
    (scheduler, store)
}

/// Ids in the stored snapshot for `queue_id`, or `None` if nothing is stored.
pub async fn stored_ids(store: &dyn KeyValueStore, queue_id: &str) -> Option<Vec<String>> {
    deferq_scheduler::Snapshot::load(store, queue_id)
        .await
        .unwrap()
        .map(|s| s.list.into_iter().map(|j| j.id).collect())
}

pub fn ids(jobs: &[Job]) -> Vec<&str> {
    jobs.iter().map(|j| j.id.as_str()).collect()
}
