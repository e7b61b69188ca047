#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;

use crate::{
    QueueResult, Job, JobId, ProcessingId, CompletionRecord, QueueSize, StoreMetrics,
};

#[cfg(feature = "memory")]
pub use memory::MemoryStore;

#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

#[cfg(all(test, feature = "memory"))]
pub(crate) mod testing;

/// Close flag of the owning queue, `true` once the queue is closed
pub type CloseSignal = watch::Receiver<bool>;

/// Resolves once `closed` reads `true`; never resolves if the queue is gone
pub(crate) async fn wait_closed(closed: &mut CloseSignal) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed {
            return;
        }
        if closed.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Backing store for named priority queues.
///
/// Every method is scoped by queue name and queues share no state. Each
/// method that moves a job between collections must be atomic from the
/// point of view of every other caller of the same store: no two claimers
/// may receive the same waiting job and no delayed job may be promoted
/// twice.
#[async_trait]
pub trait PriorityStore: Send + Sync {
    /// Verify the store is reachable
    async fn ping(&self) -> QueueResult<()>;

    /// Insert into waiting, ordered by priority (desc), then `created_at`
    /// (asc), then insertion order. Returns the waiting depth afterwards.
    async fn insert_waiting(&self, queue: &str, job: Job) -> QueueResult<usize>;

    /// Insert into delayed, ordered by ready time. Returns the delayed depth
    /// afterwards.
    async fn insert_delayed(&self, queue: &str, job: Job, ready_at: DateTime<Utc>) -> QueueResult<usize>;

    /// Move up to `limit` delayed jobs whose ready time is `<= now` into
    /// waiting, earliest first, and return the promoted jobs.
    async fn promote_due(&self, queue: &str, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<Job>>;

    /// Pop the highest priority waiting job, stamp it with `processing_id`
    /// and the dispatch time, and write it into processing. Waits up to
    /// `timeout` for a job to appear.
    ///
    /// `closed` may only cut short the idle wait between claim attempts:
    /// once a claim has moved a job into processing, the job is returned.
    async fn claim_next(
        &self,
        queue: &str,
        processing_id: ProcessingId,
        timeout: Duration,
        closed: CloseSignal,
    ) -> QueueResult<Option<Job>>;

    /// Remove and return a processing entry; `None` if already gone
    async fn release_processing(&self, queue: &str, processing_id: &ProcessingId) -> QueueResult<Option<Job>>;

    /// Replace a processing entry with `job`, inserted into waiting when
    /// `ready_at` is `None` and into delayed otherwise, in one atomic step.
    /// Returns `false` and changes nothing if the entry was already gone.
    async fn retry_processing(
        &self,
        queue: &str,
        processing_id: &ProcessingId,
        job: Job,
        ready_at: Option<DateTime<Utc>>,
    ) -> QueueResult<bool>;

    /// Replace a processing entry with `job` in the dead-letter collection,
    /// in one atomic step. Returns `false` and changes nothing if the entry
    /// was already gone.
    async fn dead_letter_processing(&self, queue: &str, processing_id: &ProcessingId, job: Job) -> QueueResult<bool>;

    /// Snapshot of every job currently in processing
    async fn list_processing(&self, queue: &str) -> QueueResult<Vec<Job>>;

    /// Store a completion record, dropping records older than `retention`
    async fn record_completion(
        &self,
        queue: &str,
        record: CompletionRecord,
        retention: Duration,
    ) -> QueueResult<()>;

    /// Number of retained completions at or after `since`
    async fn completed_since(&self, queue: &str, since: DateTime<Utc>) -> QueueResult<usize>;

    /// Insert into the dead-letter collection keyed by job id
    async fn insert_dead_letter(&self, queue: &str, job: Job) -> QueueResult<()>;

    /// Remove and return up to `max` dead-letter jobs, oldest failure first
    async fn take_dead_letters(&self, queue: &str, max: usize) -> QueueResult<Vec<Job>>;

    /// Snapshot of the dead-letter collection
    async fn list_dead_letters(&self, queue: &str) -> QueueResult<Vec<Job>>;

    /// Drop dead-letter jobs that failed before `failed_before`
    async fn purge_dead_letters(&self, queue: &str, failed_before: DateTime<Utc>) -> QueueResult<Vec<JobId>>;

    /// Per-collection counts
    async fn counts(&self, queue: &str) -> QueueResult<QueueSize>;

    /// Store-level counters, where the backend exposes them
    async fn metrics(&self) -> QueueResult<StoreMetrics>;

    /// Short backend name for logs and metrics
    fn backend_name(&self) -> &'static str;
}
