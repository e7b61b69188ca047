use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{ErrorKind, Job, JobEvent, JobId, ProcessingId};
use super::LiveMetrics;

/// Event broadcaster plus live counters shared by one queue
#[derive(Clone)]
pub struct ObservabilityLayer {
    event_broadcaster: broadcast::Sender<JobEvent>,
    metrics: Arc<LiveMetrics>,
}

impl ObservabilityLayer {
    pub fn new() -> Self {
        let (event_broadcaster, _) = broadcast::channel(10000);

        Self {
            event_broadcaster,
            metrics: Arc::new(LiveMetrics::new()),
        }
    }

    fn emit(&self, event: JobEvent) {
        debug!(event = event.event_name(), job_id = %event.job_id(), "Recorded job event");
        // No subscribers is fine
        let _ = self.event_broadcaster.send(event);
    }

    pub fn record_job_enqueued(&self, job: &Job, delay: Duration, at: DateTime<Utc>) {
        self.metrics.increment_jobs_enqueued();
        self.emit(JobEvent::Enqueued {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            delay,
            at,
        });
    }

    pub fn record_job_promoted(&self, job_id: &JobId, at: DateTime<Utc>) {
        self.emit(JobEvent::Promoted {
            job_id: job_id.clone(),
            at,
        });
    }

    pub fn record_job_dispatched(&self, job_id: &JobId, processing_id: &ProcessingId, at: DateTime<Utc>) {
        self.metrics.increment_jobs_dispatched();
        self.emit(JobEvent::Dispatched {
            job_id: job_id.clone(),
            processing_id: processing_id.clone(),
            at,
        });
    }

    pub fn record_job_completed(&self, job_id: &JobId, at: DateTime<Utc>) {
        self.metrics.increment_jobs_completed();
        self.emit(JobEvent::Completed {
            job_id: job_id.clone(),
            at,
        });
    }

    pub fn record_job_retrying(&self, job_id: &JobId, attempt: u32, delay: Duration, at: DateTime<Utc>) {
        self.metrics.increment_jobs_retried();
        self.emit(JobEvent::Retrying {
            job_id: job_id.clone(),
            attempt,
            delay,
            at,
        });
    }

    pub fn record_job_dead_lettered(&self, job_id: &JobId, kind: ErrorKind, at: DateTime<Utc>) {
        self.metrics.increment_jobs_dead_lettered();
        self.emit(JobEvent::DeadLettered {
            job_id: job_id.clone(),
            kind,
            at,
        });
    }

    pub fn record_job_requeued(&self, job_id: &JobId, at: DateTime<Utc>) {
        self.metrics.increment_jobs_requeued(1);
        self.emit(JobEvent::Requeued {
            job_id: job_id.clone(),
            at,
        });
    }

    pub fn record_job_reaped(&self, job_id: &JobId, processing_id: &ProcessingId, at: DateTime<Utc>) {
        self.metrics.increment_jobs_reaped();
        self.emit(JobEvent::Reaped {
            job_id: job_id.clone(),
            processing_id: processing_id.clone(),
            at,
        });
    }

    /// Get event stream
    pub fn event_stream(&self) -> broadcast::Receiver<JobEvent> {
        self.event_broadcaster.subscribe()
    }

    /// Get live metrics
    pub fn metrics(&self) -> &LiveMetrics {
        &self.metrics
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}
