//! Subcommand implementations.
//!
//! One-shot commands open the target queue, which reconciles it, apply a
//! single change and close every queue again. Closing keeps snapshots, so
//! jobs scheduled here fire under a later `run`. A job that falls due before
//! the command exits may run here instead; closing waits for it and drops it
//! from the snapshot.

use std::future::{Future, Ready, ready};

use chrono::{DateTime, Duration, Utc};
use deferq_scheduler::{DueBehavior, Job, Payload, Scheduler, SchedulerError, Snapshot};
use miette::Result;
use serde_json::Value;
use tracing::info;

use crate::host::HostConfig;

/// Resolve `--in` / `--at` into an absolute due time.
pub fn parse_due(
    in_secs: Option<u64>,
    at: Option<&str>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, String> {
    match (in_secs, at) {
        (Some(secs), None) => i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|delay| now.checked_add_signed(delay))
            .ok_or_else(|| format!("delay of {} seconds is out of range", secs)),
        (None, Some(at)) => DateTime::parse_from_rfc3339(at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| format!("invalid timestamp '{}': {}", at, e)),
        _ => Err("exactly one of --in or --at is required".to_string()),
    }
}

/// Parse `--data`, which must be a JSON object.
pub fn parse_payload(data: Option<&str>) -> Result<Option<Payload>, String> {
    let Some(raw) = data else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(other) => Err(format!("job data must be a JSON object, got {}", other)),
        Err(e) => Err(format!("invalid job data: {}", e)),
    }
}

/// Build the job described by `add` arguments.
pub fn build_job(
    id: String,
    due_time: DateTime<Utc>,
    payload: Option<Payload>,
    ignore_when_overdue: bool,
) -> Job {
    let due_behavior = if ignore_when_overdue {
        DueBehavior::Ignore
    } else {
        DueBehavior::Execute
    };
    let job = Job::new(id, due_time).with_due_behavior(due_behavior);
    match payload {
        Some(payload) => job.with_payload(payload),
        None => job,
    }
}

/// One JSON line describing an executed job.
pub fn job_line(queue: &str, job: &Job) -> String {
    serde_json::json!({ "queue": queue, "job": job }).to_string()
}

/// Processor that logs each job and prints it to stdout.
fn report(queue: &str) -> impl Fn(Job) -> Ready<Result<(), String>> + Send + Sync + 'static {
    let queue = queue.to_string();
    move |job: Job| {
        info!(queue = %queue, job = %job.id, "job executed");
        println!("{}", job_line(&queue, &job));
        ready(Ok(()))
    }
}

/// Open `queue`, run `op` against it and close everything again.
async fn one_shot<F, Fut>(host: &HostConfig, queue: &str, op: F) -> Result<()>
where
    F: FnOnce(Scheduler) -> Fut,
    Fut: Future<Output = Result<(), SchedulerError>>,
{
    let scheduler = host.scheduler().await?;
    scheduler
        .open_queue(queue, report(queue))
        .await
        .map_err(|e| miette::miette!("failed to open queue {}: {}", queue, e))?;

    let result = op(scheduler.clone()).await;
    scheduler.shutdown().await;
    result.map_err(|e| miette::miette!("{}", e))
}

pub async fn add(host: &HostConfig, queue: &str, job: Job) -> Result<()> {
    let id = job.id.clone();
    let due = job.due_time;
    one_shot(host, queue, |scheduler| async move {
        scheduler.add_job(queue, job).await
    })
    .await?;
    info!(queue, job = %id, due = %due.to_rfc3339(), "job scheduled");
    Ok(())
}

pub async fn remove(host: &HostConfig, queue: &str, id: &str) -> Result<()> {
    one_shot(host, queue, |scheduler| async move {
        scheduler.remove_job(queue, id).await
    })
    .await?;
    info!(queue, job = id, "job removed");
    Ok(())
}

pub async fn clear(host: &HostConfig, queue: &str) -> Result<()> {
    one_shot(host, queue, |scheduler| async move {
        scheduler.clear_queue(queue).await
    })
    .await
}

pub async fn drop_queue(host: &HostConfig, queue: &str) -> Result<()> {
    one_shot(host, queue, |scheduler| async move {
        scheduler.remove_queue(queue).await
    })
    .await
}

/// Print the stored snapshot, one job per line, without opening the queue.
pub async fn list(host: &HostConfig, queue: &str) -> Result<()> {
    for job in stored_jobs(host, queue).await? {
        let line = serde_json::to_string(&job).map_err(|e| miette::miette!("{}", e))?;
        println!("{}", line);
    }
    Ok(())
}

/// Jobs in the stored snapshot, or none if the queue was never persisted.
pub async fn stored_jobs(host: &HostConfig, queue: &str) -> Result<Vec<Job>> {
    let store = host.store();
    store.init().await.map_err(|e| miette::miette!("{}", e))?;
    let snapshot = Snapshot::load(store.as_ref(), queue)
        .await
        .map_err(|e| miette::miette!("failed to load queue {}: {}", queue, e))?;

    match snapshot {
        Some(snapshot) => Ok(snapshot.list),
        None => {
            info!(queue, "no stored snapshot");
            Ok(Vec::new())
        }
    }
}

/// Open `queues` and process jobs until Ctrl-C.
pub async fn run(host: &HostConfig, queues: &[String]) -> Result<()> {
    let scheduler = host.scheduler().await?;
    for queue in queues {
        scheduler
            .open_queue(queue.clone(), report(queue))
            .await
            .map_err(|e| miette::miette!("failed to open queue {}: {}", queue, e))?;
    }
    info!(queues = ?queues, "waiting for jobs");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("failed to listen for shutdown signal: {}", e))?;
    info!("received shutdown signal");

    scheduler.shutdown().await;
    Ok(())
}
