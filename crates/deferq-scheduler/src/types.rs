//! Scheduler types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Opaque job payload.
pub type Payload = Map<String, Value>;

/// A scheduled job.
///
/// Only the persisted fields live here. Timer state is tracked by the
/// scheduler alongside the job and never leaves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Identifier, unique within the owning queue.
    pub id: String,
    /// When the job should run. Persisted with millisecond precision.
    #[serde(rename = "time", with = "chrono::serde::ts_milliseconds")]
    pub due_time: DateTime<Utc>,
    /// Caller data handed to the queue's processor unexamined.
    #[serde(rename = "data", default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    /// What to do if the job is already overdue when its queue is opened.
    #[serde(default)]
    pub due_behavior: DueBehavior,
}

/// Policy for a job found past due when its queue is (re)opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DueBehavior {
    /// Run the job immediately during open.
    Execute,
    /// Skip the job. Also the decoding fallback for unknown values.
    #[default]
    Ignore,
}

impl<'de> Deserialize<'de> for DueBehavior {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(match raw.as_deref() {
            Some("execute") => DueBehavior::Execute,
            _ => DueBehavior::Ignore,
        })
    }
}

impl Job {
    /// Create a job due at `due_time` that executes if found overdue.
    pub fn new(id: impl Into<String>, due_time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            due_time: truncate_to_millis(due_time),
            payload: None,
            due_behavior: DueBehavior::Execute,
        }
    }

    /// Create a job due `delay` from now.
    pub fn after(id: impl Into<String>, delay: Duration) -> Self {
        Self::new(id, Utc::now() + delay)
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Set the overdue policy.
    pub fn with_due_behavior(mut self, due_behavior: DueBehavior) -> Self {
        self.due_behavior = due_behavior;
        self
    }

    /// Whether the job is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_time <= now
    }

    /// Time left until the job is due, zero if already due.
    pub fn delay_from(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.due_time - now).to_std().unwrap_or_default()
    }
}

/// Drop sub-millisecond precision so a job equals its persisted form.
fn truncate_to_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
}
