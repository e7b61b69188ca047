use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{JobId, JobStatus, ProcessingId};
use crate::ErrorKind;

/// Lifecycle events broadcast for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// Job entered the waiting or delayed collection
    Enqueued {
        job_id: JobId,
        queue: String,
        delay: Duration,
        at: DateTime<Utc>,
    },

    /// Delayed job moved into the waiting collection
    Promoted {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    /// Job handed to a worker
    Dispatched {
        job_id: JobId,
        processing_id: ProcessingId,
        at: DateTime<Utc>,
    },

    Completed {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    /// Job failed and was re-enqueued with backoff
    Retrying {
        job_id: JobId,
        attempt: u32,
        delay: Duration,
        at: DateTime<Utc>,
    },

    /// Job moved to the dead-letter collection
    DeadLettered {
        job_id: JobId,
        kind: ErrorKind,
        at: DateTime<Utc>,
    },

    /// Dead-lettered job sent back to waiting by an operator
    Requeued {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    /// Processing job reclaimed by the stale reaper
    Reaped {
        job_id: JobId,
        processing_id: ProcessingId,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Promoted { .. } => "promoted",
            Self::Dispatched { .. } => "dispatched",
            Self::Completed { .. } => "completed",
            Self::Retrying { .. } => "retrying",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::Requeued { .. } => "requeued",
            Self::Reaped { .. } => "reaped",
        }
    }

    /// Get the job ID from any event
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Promoted { job_id, .. }
            | Self::Dispatched { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::DeadLettered { job_id, .. }
            | Self::Requeued { job_id, .. }
            | Self::Reaped { job_id, .. } => job_id,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Enqueued { at, .. }
            | Self::Promoted { at, .. }
            | Self::Dispatched { at, .. }
            | Self::Completed { at, .. }
            | Self::Retrying { at, .. }
            | Self::DeadLettered { at, .. }
            | Self::Requeued { at, .. }
            | Self::Reaped { at, .. } => at,
        }
    }

    /// Collection the job sits in once this event has happened
    pub fn status_after(&self) -> JobStatus {
        match self {
            Self::Enqueued { delay, .. } if delay.is_zero() => JobStatus::Waiting,
            Self::Enqueued { .. } | Self::Retrying { .. } => JobStatus::Delayed,
            Self::Promoted { .. } | Self::Requeued { .. } => JobStatus::Waiting,
            Self::Dispatched { .. } => JobStatus::Processing,
            Self::Completed { .. } => JobStatus::Completed,
            Self::DeadLettered { .. } | Self::Reaped { .. } => JobStatus::Failed,
        }
    }
}
