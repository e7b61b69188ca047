use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    QueueResult, QueueError, Job, JobId, ProcessingId, CompletionRecord, QueueSize, StoreMetrics,
    store::{CloseSignal, MemoryStore, PriorityStore},
};

/// Memory store with injectable latency and failures
#[derive(Clone, Default)]
pub(crate) struct FaultyStore {
    pub inner: MemoryStore,
    /// Delay between a successful claim and its reply
    claim_reply_delay: Duration,
    /// Number of upcoming dead-letter moves that fail
    dead_letter_failures: Arc<AtomicUsize>,
}

impl FaultyStore {
    pub fn with_claim_reply_delay(mut self, delay: Duration) -> Self {
        self.claim_reply_delay = delay;
        self
    }

    pub fn fail_next_dead_letters(&self, count: usize) {
        self.dead_letter_failures.store(count, Ordering::SeqCst);
    }

    fn take_dead_letter_failure(&self) -> bool {
        self.dead_letter_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PriorityStore for FaultyStore {
    async fn ping(&self) -> QueueResult<()> {
        self.inner.ping().await
    }

    async fn insert_waiting(&self, queue: &str, job: Job) -> QueueResult<usize> {
        self.inner.insert_waiting(queue, job).await
    }

    async fn insert_delayed(&self, queue: &str, job: Job, ready_at: DateTime<Utc>) -> QueueResult<usize> {
        self.inner.insert_delayed(queue, job, ready_at).await
    }

    async fn promote_due(&self, queue: &str, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<Job>> {
        self.inner.promote_due(queue, now, limit).await
    }

    async fn claim_next(
        &self,
        queue: &str,
        processing_id: ProcessingId,
        timeout: Duration,
        closed: CloseSignal,
    ) -> QueueResult<Option<Job>> {
        let claimed = self.inner.claim_next(queue, processing_id, timeout, closed).await?;
        if claimed.is_some() {
            tokio::time::sleep(self.claim_reply_delay).await;
        }
        Ok(claimed)
    }

    async fn release_processing(&self, queue: &str, processing_id: &ProcessingId) -> QueueResult<Option<Job>> {
        self.inner.release_processing(queue, processing_id).await
    }

    async fn retry_processing(
        &self,
        queue: &str,
        processing_id: &ProcessingId,
        job: Job,
        ready_at: Option<DateTime<Utc>>,
    ) -> QueueResult<bool> {
        self.inner.retry_processing(queue, processing_id, job, ready_at).await
    }

    async fn dead_letter_processing(&self, queue: &str, processing_id: &ProcessingId, job: Job) -> QueueResult<bool> {
        if self.take_dead_letter_failure() {
            return Err(QueueError::Store("dead-letter write refused".to_string()));
        }
        self.inner.dead_letter_processing(queue, processing_id, job).await
    }

    async fn list_processing(&self, queue: &str) -> QueueResult<Vec<Job>> {
        self.inner.list_processing(queue).await
    }

    async fn record_completion(
        &self,
        queue: &str,
        record: CompletionRecord,
        retention: Duration,
    ) -> QueueResult<()> {
        self.inner.record_completion(queue, record, retention).await
    }

    async fn completed_since(&self, queue: &str, since: DateTime<Utc>) -> QueueResult<usize> {
        self.inner.completed_since(queue, since).await
    }

    async fn insert_dead_letter(&self, queue: &str, job: Job) -> QueueResult<()> {
        self.inner.insert_dead_letter(queue, job).await
    }

    async fn take_dead_letters(&self, queue: &str, max: usize) -> QueueResult<Vec<Job>> {
        self.inner.take_dead_letters(queue, max).await
    }

    async fn list_dead_letters(&self, queue: &str) -> QueueResult<Vec<Job>> {
        self.inner.list_dead_letters(queue).await
    }

    async fn purge_dead_letters(&self, queue: &str, failed_before: DateTime<Utc>) -> QueueResult<Vec<JobId>> {
        self.inner.purge_dead_letters(queue, failed_before).await
    }

    async fn counts(&self, queue: &str) -> QueueResult<QueueSize> {
        self.inner.counts(queue).await
    }

    async fn metrics(&self) -> QueueResult<StoreMetrics> {
        self.inner.metrics().await
    }

    fn backend_name(&self) -> &'static str {
        "faulty-memory"
    }
}
