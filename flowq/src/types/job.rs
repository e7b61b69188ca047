use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{JobId, JobPriority, ProcessingId};
use crate::JobFailure;

/// Job status, derived from which collection currently holds the job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Not yet eligible, waiting for its ready time
    Delayed,

    /// Eligible and waiting to be dispatched
    Waiting,

    /// Handed to a worker
    Processing,

    /// Finished successfully (short-lived archive)
    Completed,

    /// Dead-lettered; stays here until requeued or purged
    Failed,
}

impl JobStatus {
    /// Check if the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Delayed => "delayed",
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// The unit of work moved between store collections.
///
/// The payload is opaque to the queue and never inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Queue this job belongs to
    pub queue: String,

    pub payload: Value,

    pub priority: JobPriority,

    /// First enqueue time, preserved across retries
    pub created_at: DateTime<Utc>,

    pub retry_count: u32,

    pub max_retries: u32,

    /// Not eligible for dispatch before this instant
    #[serde(default)]
    pub delay_until: Option<DateTime<Utc>>,

    /// Set when dispatched
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// Set when dispatched; key into the processing collection
    #[serde(default)]
    pub processing_id: Option<ProcessingId>,

    #[serde(default)]
    pub last_error: Option<JobFailure>,

    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a fresh job with no retries recorded
    pub fn new(queue: impl Into<String>, payload: Value, priority: JobPriority, max_retries: u32) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            priority,
            created_at: Utc::now(),
            retry_count: 0,
            max_retries,
            delay_until: None,
            started_at: None,
            processing_id: None,
            last_error: None,
            failed_at: None,
        }
    }

    /// Check whether a failure now would still be retried
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Check if the job may enter the waiting collection at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.delay_until.map_or(true, |ready_at| ready_at <= now)
    }

    /// Stamp a dispatch attempt
    pub fn start_processing(&mut self, processing_id: ProcessingId, started_at: DateTime<Utc>) {
        self.processing_id = Some(processing_id);
        self.started_at = Some(started_at);
    }

    /// Time spent between first enqueue and the current dispatch
    pub fn wait_time(&self) -> Option<chrono::Duration> {
        self.started_at.map(|started| started - self.created_at)
    }

    /// Record a failure and bump the retry counter
    pub fn record_failure(&mut self, failure: JobFailure, at: DateTime<Utc>) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(failure);
        self.failed_at = Some(at);
    }

    /// Forget dispatch state so the job can be enqueued again
    pub fn clear_dispatch(&mut self) {
        self.started_at = None;
        self.processing_id = None;
    }

    /// Reset retry state for manual recovery
    pub fn reset_for_requeue(&mut self) {
        self.retry_count = 0;
        self.last_error = None;
        self.failed_at = None;
        self.delay_until = None;
        self.clear_dispatch();
    }
}

/// Bounded-lifetime audit record of a completed job.
///
/// Kept for metrics only, never replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub job: Job,
    pub result: Value,
    pub completed_at: DateTime<Utc>,
}

impl CompletionRecord {
    pub fn new(job: Job, result: Value, completed_at: DateTime<Utc>) -> Self {
        Self {
            job,
            result,
            completed_at,
        }
    }

    /// Latency from first enqueue to completion
    pub fn total_latency(&self) -> chrono::Duration {
        self.completed_at - self.job.created_at
    }

    /// Latency from the last dispatch to completion
    pub fn processing_latency(&self) -> Option<chrono::Duration> {
        self.job.started_at.map(|started| self.completed_at - started)
    }
}
