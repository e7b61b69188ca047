use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    QueueResult, QueueError, QueueConfig, Job, JobId, JobPriority, JobFailure, ErrorKind,
    ProcessingId, CompletionRecord, JobEvent, QueueSize, QueueStatistics, StoreMetrics,
    FailureBreakdown,
    retry::RetryPolicy,
    store::PriorityStore,
    observability::ObservabilityLayer,
};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Per-job overrides for [`JobQueue::add_job_with`]
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: JobPriority,
    /// Zero means immediately eligible
    pub delay: Duration,
    /// Overrides the queue's `max_retries` for this job
    pub max_retries: Option<u32>,
}

impl EnqueueOptions {
    pub fn new(priority: impl Into<JobPriority>) -> Self {
        Self {
            priority: priority.into(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// State transition produced by [`JobQueue::fail_job`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-enqueued into delayed with exponential backoff
    Retrying {
        job_id: JobId,
        attempt: u32,
        delay: Duration,
    },

    /// Moved to the dead-letter collection
    DeadLettered { job_id: JobId, kind: ErrorKind },

    /// The dispatch was no longer in processing (already completed,
    /// failed or reaped); nothing changed
    AlreadyReleased,
}

/// A named priority job queue over a shared [`PriorityStore`].
///
/// Producers call [`add_job`](Self::add_job); workers loop on
/// [`get_next_job`](Self::get_next_job) and report back through
/// [`complete_job`](Self::complete_job) or [`fail_job`](Self::fail_job).
/// Job-level failures never surface as errors; only store problems do.
pub struct JobQueue {
    name: String,
    store: Arc<dyn PriorityStore>,
    config: QueueConfig,
    retry_policy: RetryPolicy,
    observability: ObservabilityLayer,
    closed: watch::Sender<bool>,
}

impl JobQueue {
    /// Validate the config and verify the store is reachable.
    ///
    /// A store that cannot be reached is fatal: no queue is returned.
    pub async fn connect(store: Arc<dyn PriorityStore>, config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;

        store.ping().await.map_err(|e| match e {
            QueueError::Connection(msg) => QueueError::Connection(msg),
            other => QueueError::Connection(other.to_string()),
        })?;

        let (closed, _) = watch::channel(false);
        info!(
            queue = %config.queue_name,
            backend = store.backend_name(),
            max_retries = config.max_retries,
            base_retry_delay_secs = config.base_retry_delay.as_secs(),
            "Opened job queue"
        );

        Ok(Self {
            name: config.queue_name.clone(),
            retry_policy: RetryPolicy::from_config(&config),
            store,
            config,
            observability: ObservabilityLayer::new(),
            closed,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn observability(&self) -> &ObservabilityLayer {
        &self.observability
    }

    pub fn store(&self) -> &Arc<dyn PriorityStore> {
        &self.store
    }

    /// Stop accepting work and wake any blocked dispatchers
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            info!(queue = %self.name, "Closed job queue");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.is_closed() {
            Err(QueueError::QueueClosed(self.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Enqueue a payload. A non-zero `delay` parks it in the delayed
    /// collection until `now + delay`.
    pub async fn add_job(&self, payload: Value, priority: impl Into<JobPriority>, delay: Duration) -> QueueResult<JobId> {
        self.add_job_with(payload, EnqueueOptions::new(priority).with_delay(delay)).await
    }

    #[instrument(skip(self, payload), fields(queue = %self.name))]
    pub async fn add_job_with(&self, payload: Value, options: EnqueueOptions) -> QueueResult<JobId> {
        self.ensure_open()?;

        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let job = Job::new(self.name.clone(), payload, options.priority, max_retries);
        let now = Utc::now();

        let job = self.enqueue(job, options.delay, now).await?;
        self.observability.record_job_enqueued(&job, options.delay, now);
        Ok(job.id)
    }

    /// Insert into waiting or delayed; shared by new jobs and requeues
    async fn enqueue(&self, mut job: Job, delay: Duration, now: DateTime<Utc>) -> QueueResult<Job> {
        job.delay_until = ready_at(delay, now);
        let queue_depth = match job.delay_until {
            None => self.store.insert_waiting(&self.name, job.clone()).await?,
            Some(ready_at) => self.store.insert_delayed(&self.name, job.clone(), ready_at).await?,
        };

        info!(
            job_id = %job.id,
            priority = %job.priority,
            delay_ms = delay.as_millis() as u64,
            queue_depth,
            "Job enqueued"
        );
        Ok(job)
    }

    /// Promote delayed jobs whose ready time has passed
    pub async fn process_delayed_jobs(&self) -> QueueResult<usize> {
        self.process_delayed_jobs_at(Utc::now()).await
    }

    /// Promote delayed jobs ready at `now`, at most one batch per call
    pub async fn process_delayed_jobs_at(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let promoted = self
            .store
            .promote_due(&self.name, now, self.config.promote_batch_size)
            .await?;

        for job in &promoted {
            debug!(queue = %self.name, job_id = %job.id, priority = %job.priority, "Promoted delayed job");
            self.observability.record_job_promoted(&job.id, now);
        }
        Ok(promoted.len())
    }

    /// Wait up to `timeout` for the highest priority ready job.
    ///
    /// Runs one promotion cycle first. Returns `Ok(None)` on timeout or
    /// when the queue is closed while waiting. The returned job belongs to
    /// the caller until it is completed or failed. Dropping this future
    /// after the store has claimed a job leaves that job in processing
    /// until the stale reaper reclaims it.
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn get_next_job(&self, timeout: Duration) -> QueueResult<Option<Job>> {
        self.ensure_open()?;
        self.process_delayed_jobs().await?;

        let processing_id = ProcessingId::new();

        let claimed = self
            .store
            .claim_next(&self.name, processing_id, timeout, self.closed.subscribe())
            .await?;

        let Some(job) = claimed else {
            return Ok(None);
        };

        let started_at = job.started_at.unwrap_or_else(Utc::now);
        if let Some(processing_id) = &job.processing_id {
            info!(
                job_id = %job.id,
                processing_id = %processing_id,
                priority = %job.priority,
                wait_ms = job.wait_time().map(|wait| wait.num_milliseconds()).unwrap_or(0),
                "Job dispatched"
            );
            self.observability.record_job_dispatched(&job.id, processing_id, started_at);
        }
        Ok(Some(job))
    }

    /// Finish a dispatched job.
    ///
    /// Returns `false` when the dispatch was already released, in which
    /// case nothing is recorded.
    #[instrument(skip(self, job, result), fields(queue = %self.name, job_id = %job.id))]
    pub async fn complete_job(&self, job: &Job, result: Value) -> QueueResult<bool> {
        let Some(processing_id) = &job.processing_id else {
            debug!("Job was never dispatched, nothing to complete");
            return Ok(false);
        };

        let Some(released) = self.store.release_processing(&self.name, processing_id).await? else {
            debug!(processing_id = %processing_id, "Job already released, ignoring completion");
            return Ok(false);
        };

        let completed_at = Utc::now();
        let record = CompletionRecord::new(released, result, completed_at);
        let total_ms = record.total_latency().num_milliseconds();
        let processing_ms = record.processing_latency().map(|d| d.num_milliseconds());

        self.store
            .record_completion(&self.name, record, self.config.completed_retention)
            .await?;

        info!(processing_id = %processing_id, total_ms, processing_ms, "Job completed");
        self.observability.record_job_completed(&job.id, completed_at);
        Ok(true)
    }

    /// Record a failed attempt and move the job on: back to delayed with
    /// backoff while retries remain and `retryable` is set, otherwise to
    /// the dead-letter collection. The move out of processing is atomic,
    /// so a store error leaves the job in processing.
    #[instrument(skip(self, job, failure), fields(queue = %self.name, job_id = %job.id, error_kind = %failure.kind))]
    pub async fn fail_job(&self, job: &Job, failure: JobFailure, retryable: bool) -> QueueResult<FailOutcome> {
        let Some(processing_id) = &job.processing_id else {
            debug!("Job was never dispatched, nothing to fail");
            return Ok(FailOutcome::AlreadyReleased);
        };

        let now = Utc::now();
        let retry = RetryPolicy::should_retry(retryable, job.retry_count, job.max_retries);
        let mut failed = job.clone();
        failed.record_failure(failure.clone(), now);
        failed.clear_dispatch();
        let job_id = failed.id.clone();

        if retry {
            let attempt = failed.retry_count;
            let delay = self.retry_policy.delay_for(attempt);
            failed.delay_until = ready_at(delay, now);
            let ready_at = failed.delay_until;

            if !self.store.retry_processing(&self.name, processing_id, failed, ready_at).await? {
                debug!(processing_id = %processing_id, "Job already released, ignoring failure");
                return Ok(FailOutcome::AlreadyReleased);
            }

            warn!(
                attempt,
                max_retries = job.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %failure.message,
                "Job failed, will retry"
            );
            self.observability.record_job_retrying(&job_id, attempt, delay, now);
            return Ok(FailOutcome::Retrying { job_id, attempt, delay });
        }

        let attempts = failed.retry_count;
        if !self.store.dead_letter_processing(&self.name, processing_id, failed).await? {
            debug!(processing_id = %processing_id, "Job already released, ignoring failure");
            return Ok(FailOutcome::AlreadyReleased);
        }

        error!(
            attempts,
            retryable,
            error = %failure.message,
            "Job failed permanently, moved to dead-letter"
        );
        self.observability.record_job_dead_lettered(&job_id, failure.kind, now);
        Ok(FailOutcome::DeadLettered {
            job_id,
            kind: failure.kind,
        })
    }

    /// Dead-letter processing jobs older than `timeout`
    pub async fn cleanup_stale_jobs(&self, timeout: Duration) -> QueueResult<usize> {
        self.cleanup_stale_jobs_at(timeout, Utc::now()).await
    }

    /// Dead-letter processing jobs that started more than `timeout` before
    /// `now`. Reclaimed jobs are failed non-retryably: a worker that
    /// vanished may have produced side effects already.
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn cleanup_stale_jobs_at(&self, timeout: Duration, now: DateTime<Utc>) -> QueueResult<usize> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let mut reclaimed = 0;

        for job in self.store.list_processing(&self.name).await? {
            let Some(started_at) = job.started_at else {
                continue;
            };
            if now.signed_duration_since(started_at) <= timeout {
                continue;
            }

            let outcome = match self
                .fail_job(&job, JobFailure::timeout("processing timeout"), false)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Failed to reclaim stale job, leaving it in processing");
                    continue;
                }
            };

            if matches!(outcome, FailOutcome::DeadLettered { .. }) {
                if let Some(processing_id) = &job.processing_id {
                    self.observability.record_job_reaped(&job.id, processing_id, now);
                }
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            warn!(reclaimed, "Reclaimed stale processing jobs");
        } else {
            debug!("No stale processing jobs found");
        }
        Ok(reclaimed)
    }

    /// Move up to `max_jobs` dead-letter jobs back to waiting with a fresh
    /// retry budget. Returns how many were requeued.
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn requeue_failed_jobs(&self, max_jobs: usize) -> QueueResult<usize> {
        self.ensure_open()?;
        if max_jobs == 0 {
            return Ok(0);
        }

        let mut taken = self.store.take_dead_letters(&self.name, max_jobs).await?.into_iter();
        let now = Utc::now();
        let mut requeued = 0;

        while let Some(original) = taken.next() {
            let mut job = original.clone();
            job.reset_for_requeue();

            if let Err(e) = self.enqueue(job, Duration::ZERO, now).await {
                error!(error = %e, requeued, "Requeue interrupted, restoring remaining dead-letter jobs");
                for job in std::iter::once(original).chain(taken) {
                    self.store.insert_dead_letter(&self.name, job).await?;
                }
                return Err(e);
            }

            self.observability.record_job_requeued(&original.id, now);
            requeued += 1;
        }

        info!(requeued, "Requeued dead-letter jobs");
        Ok(requeued)
    }

    /// Drop dead-letter jobs that failed more than `older_than` ago
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn purge_dead_letters(&self, older_than: Duration) -> QueueResult<usize> {
        let failed_before = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let purged = self.store.purge_dead_letters(&self.name, failed_before).await?;
        if !purged.is_empty() {
            info!(purged = purged.len(), "Purged expired dead-letter jobs");
        }
        Ok(purged.len())
    }

    /// Snapshot of the dead-letter collection
    pub async fn dead_letters(&self) -> QueueResult<Vec<Job>> {
        self.store.list_dead_letters(&self.name).await
    }

    /// Snapshot of the processing collection
    pub async fn processing_jobs(&self) -> QueueResult<Vec<Job>> {
        self.store.list_processing(&self.name).await
    }

    pub async fn get_queue_size(&self) -> QueueResult<QueueSize> {
        self.store.counts(&self.name).await
    }

    /// Queue depth, recent completions, dead-letter breakdown by error
    /// kind and process-local throughput
    pub async fn get_statistics(&self) -> QueueResult<QueueStatistics> {
        let size = self.get_queue_size().await?;

        let retention = self.config.completed_retention;
        let since = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let completed_last_window = self.store.completed_since(&self.name, since).await?;

        let failure_breakdown: FailureBreakdown = self
            .dead_letters()
            .await?
            .iter()
            .map(|job| job.last_error.as_ref().map_or(ErrorKind::Other, |e| e.kind))
            .collect();

        Ok(QueueStatistics {
            queue: self.name.clone(),
            size,
            completed_last_window,
            retention,
            failure_breakdown,
            throughput: self.observability.metrics().snapshot(),
        })
    }

    /// Store-level counters, passed through unchanged
    pub async fn get_performance_metrics(&self) -> QueueResult<StoreMetrics> {
        self.store.metrics().await
    }

    /// Lifecycle events of this queue handle
    pub fn event_stream(&self) -> BoxStream<JobEvent> {
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};

        let stream = BroadcastStream::new(self.observability.event_stream())
            .filter_map(|result| result.ok());
        Box::pin(stream)
    }
}

/// Ready time for `delay`; `None` means immediately eligible
fn ready_at(delay: Duration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if delay.is_zero() {
        return None;
    }
    let ready_at = chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    Some(ready_at)
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .field("backend", &self.store.backend_name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, testing::FaultyStore};
    use serde_json::json;
    use tracing_test::traced_test;

    fn create_test_config() -> QueueConfig {
        QueueConfig::new("workflow_queue")
            .with_max_retries(2)
            .with_base_retry_delay(Duration::from_secs(60))
    }

    async fn create_test_queue() -> JobQueue {
        JobQueue::connect(Arc::new(MemoryStore::new()), create_test_config())
            .await
            .unwrap()
    }

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_add_job_lands_in_waiting() {
        let queue = create_test_queue().await;
        queue.add_job(json!({"sku": 1}), 3, Duration::ZERO).await.unwrap();

        let size = queue.get_queue_size().await.unwrap();
        assert_eq!(size.waiting, 1);
        assert_eq!(size.delayed, 0);
    }

    #[tokio::test]
    async fn test_add_job_with_delay_lands_in_delayed() {
        let queue = create_test_queue().await;
        queue.add_job(json!(null), 3, Duration::from_secs(5)).await.unwrap();

        let size = queue.get_queue_size().await.unwrap();
        assert_eq!(size.delayed, 1);
        assert!(queue.get_next_job(SHORT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dispatch_stamps_processing_state() {
        let queue = create_test_queue().await;
        let id = queue.add_job(json!(null), 1, Duration::ZERO).await.unwrap();

        let job = queue.get_next_job(SHORT).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert!(job.processing_id.is_some());
        assert!(job.started_at.is_some());
        assert_eq!(queue.get_queue_size().await.unwrap().processing, 1);
    }

    #[tokio::test]
    async fn test_complete_job_records_completion() {
        let queue = create_test_queue().await;
        queue.add_job(json!(null), 1, Duration::ZERO).await.unwrap();
        let job = queue.get_next_job(SHORT).await.unwrap().unwrap();

        assert!(queue.complete_job(&job, json!({"ok": true})).await.unwrap());

        let stats = queue.get_statistics().await.unwrap();
        assert_eq!(stats.size.processing, 0);
        assert_eq!(stats.completed_last_window, 1);
        assert_eq!(stats.throughput.completed, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_complete_twice_is_noop() {
        let queue = create_test_queue().await;
        queue.add_job(json!(null), 1, Duration::ZERO).await.unwrap();
        let job = queue.get_next_job(SHORT).await.unwrap().unwrap();

        assert!(queue.complete_job(&job, json!(1)).await.unwrap());
        assert!(!queue.complete_job(&job, json!(1)).await.unwrap());

        assert!(logs_contain("Job already released, ignoring completion"));
        let stats = queue.get_statistics().await.unwrap();
        assert_eq!(stats.completed_last_window, 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_backs_off() {
        let queue = create_test_queue().await;
        let id = queue.add_job(json!(null), 7, Duration::ZERO).await.unwrap();
        let job = queue.get_next_job(SHORT).await.unwrap().unwrap();

        let outcome = queue
            .fail_job(&job, JobFailure::api_error("503 from marketplace"), true)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                job_id: id,
                attempt: 1,
                delay: Duration::from_secs(60),
            }
        );
        let size = queue.get_queue_size().await.unwrap();
        assert_eq!(size.delayed, 1);
        assert_eq!(size.processing, 0);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_dead_letters() {
        let queue = create_test_queue().await;
        queue.add_job(json!(null), 1, Duration::ZERO).await.unwrap();
        let job = queue.get_next_job(SHORT).await.unwrap().unwrap();

        let outcome = queue
            .fail_job(&job, JobFailure::validation("bad listing"), false)
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::DeadLettered { kind: ErrorKind::Validation, .. }));

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 1);
        assert_eq!(dead[0].last_error.as_ref().map(|e| e.kind), Some(ErrorKind::Validation));

        let stats = queue.get_statistics().await.unwrap();
        assert_eq!(stats.failure_breakdown.validation, 1);
    }

    #[tokio::test]
    async fn test_fail_after_complete_is_ignored() {
        let queue = create_test_queue().await;
        queue.add_job(json!(null), 1, Duration::ZERO).await.unwrap();
        let job = queue.get_next_job(SHORT).await.unwrap().unwrap();

        queue.complete_job(&job, json!(null)).await.unwrap();
        let outcome = queue.fail_job(&job, JobFailure::other("late"), true).await.unwrap();

        assert_eq!(outcome, FailOutcome::AlreadyReleased);
        assert_eq!(queue.get_queue_size().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_promotion_preserves_priority() {
        let queue = create_test_queue().await;
        queue.add_job(json!("low"), 1, Duration::ZERO).await.unwrap();
        queue.add_job(json!("high-delayed"), 9, Duration::from_secs(5)).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(6);
        assert_eq!(queue.process_delayed_jobs_at(later).await.unwrap(), 1);

        let job = queue.get_next_job(SHORT).await.unwrap().unwrap();
        assert_eq!(job.payload, json!("high-delayed"));
        assert_eq!(job.priority, JobPriority(9));
    }

    #[tokio::test]
    async fn test_promotion_is_batched() {
        let queue = JobQueue::connect(
            Arc::new(MemoryStore::new()),
            create_test_config().with_promote_batch_size(2),
        )
        .await
        .unwrap();

        for _ in 0..5 {
            queue.add_job(json!(null), 1, Duration::from_millis(1)).await.unwrap();
        }

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(queue.process_delayed_jobs_at(later).await.unwrap(), 2);
        assert_eq!(queue.process_delayed_jobs_at(later).await.unwrap(), 2);
        assert_eq!(queue.process_delayed_jobs_at(later).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_rejects_work_and_wakes_dispatcher() {
        let queue = Arc::new(create_test_queue().await);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get_next_job(Duration::from_secs(30)).await })
        };

        tokio::time::sleep(SHORT).await;
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Ok(None)));
        assert!(matches!(
            queue.add_job(json!(null), 1, Duration::ZERO).await,
            Err(QueueError::QueueClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_close_during_slow_claim_returns_claimed_job() {
        let store = FaultyStore::default().with_claim_reply_delay(Duration::from_millis(100));
        let queue = Arc::new(JobQueue::connect(Arc::new(store), create_test_config()).await.unwrap());
        let id = queue.add_job(json!(null), 1, Duration::ZERO).await.unwrap();

        let dispatcher = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get_next_job(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.close();

        let job = dispatcher.await.unwrap().unwrap().unwrap();
        assert_eq!(job.id, id);
        assert!(queue.complete_job(&job, json!(null)).await.unwrap());
        assert_eq!(queue.get_queue_size().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_failed_dead_letter_write_keeps_job_in_processing() {
        let store = FaultyStore::default();
        let queue = JobQueue::connect(Arc::new(store.clone()), create_test_config()).await.unwrap();
        queue.add_job(json!(null), 1, Duration::ZERO).await.unwrap();
        let job = queue.get_next_job(SHORT).await.unwrap().unwrap();

        store.fail_next_dead_letters(1);
        let result = queue.fail_job(&job, JobFailure::validation("bad listing"), false).await;
        assert!(matches!(result, Err(QueueError::Store(_))));

        let size = queue.get_queue_size().await.unwrap();
        assert_eq!((size.processing, size.failed), (1, 0));

        let outcome = queue
            .fail_job(&job, JobFailure::validation("bad listing"), false)
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::DeadLettered { .. }));
        let size = queue.get_queue_size().await.unwrap();
        assert_eq!((size.processing, size.failed), (0, 1));
    }

    #[tokio::test]
    async fn test_stale_scan_continues_past_store_errors() {
        let store = FaultyStore::default();
        let queue = JobQueue::connect(Arc::new(store.clone()), create_test_config()).await.unwrap();
        for _ in 0..2 {
            queue.add_job(json!(null), 1, Duration::ZERO).await.unwrap();
            queue.get_next_job(SHORT).await.unwrap().unwrap();
        }

        store.fail_next_dead_letters(1);
        let later = Utc::now() + chrono::Duration::seconds(10);
        let reclaimed = queue.cleanup_stale_jobs_at(Duration::from_secs(1), later).await.unwrap();

        assert_eq!(reclaimed, 1);
        let size = queue.get_queue_size().await.unwrap();
        assert_eq!((size.processing, size.failed), (1, 1));
    }

    #[tokio::test]
    async fn test_throughput_counts_new_jobs_once() {
        let queue = create_test_queue().await;
        queue.add_job(json!(null), 1, Duration::ZERO).await.unwrap();

        let job = queue.get_next_job(SHORT).await.unwrap().unwrap();
        queue.fail_job(&job, JobFailure::other("flaky"), true).await.unwrap();
        queue.process_delayed_jobs_at(Utc::now() + chrono::Duration::seconds(61)).await.unwrap();
        let job = queue.get_next_job(SHORT).await.unwrap().unwrap();
        queue.fail_job(&job, JobFailure::other("broken"), false).await.unwrap();
        assert_eq!(queue.requeue_failed_jobs(1).await.unwrap(), 1);

        let throughput = queue.get_statistics().await.unwrap().throughput;
        assert_eq!(throughput.enqueued, 1);
        assert_eq!(throughput.retried, 1);
        assert_eq!(throughput.dead_lettered, 1);
        assert_eq!(throughput.requeued, 1);
    }

    #[tokio::test]
    async fn test_purge_dead_letters_by_age() {
        let queue = create_test_queue().await;
        queue.add_job(json!(null), 1, Duration::ZERO).await.unwrap();
        let job = queue.get_next_job(SHORT).await.unwrap().unwrap();
        queue.fail_job(&job, JobFailure::other("boom"), false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(queue.purge_dead_letters(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(queue.purge_dead_letters(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.get_queue_size().await.unwrap().failed, 0);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let result = JobQueue::connect(Arc::new(MemoryStore::new()), QueueConfig::new("")).await;
        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_performance_metrics_pass_through() {
        let queue = create_test_queue().await;
        let metrics = queue.get_performance_metrics().await.unwrap();
        assert_eq!(metrics.backend, "memory");
        assert!(metrics.total_commands.is_some());
    }
}
