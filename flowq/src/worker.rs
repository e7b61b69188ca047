use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::{QueueResult, QueueError, Job, JobFailure, ErrorKind, queue::JobQueue};

/// Failure returned by a [`JobHandler`]
#[derive(Debug, Clone, Error)]
#[error("{failure}")]
pub struct HandlerError {
    pub failure: JobFailure,
    /// Whether another attempt could succeed
    pub retryable: bool,
}

impl HandlerError {
    pub fn retryable(failure: JobFailure) -> Self {
        Self { failure, retryable: true }
    }

    pub fn permanent(failure: JobFailure) -> Self {
        Self { failure, retryable: false }
    }
}

/// Validation failures are permanent, everything else is worth retrying
impl From<JobFailure> for HandlerError {
    fn from(failure: JobFailure) -> Self {
        let retryable = failure.kind != ErrorKind::Validation;
        Self { failure, retryable }
    }
}

/// User-supplied job processing
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> Result<Value, HandlerError>;
}

/// Worker loop tuning
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// How long one dispatch call blocks waiting for work
    pub poll_timeout: Duration,
    /// Pause after a store error before polling again
    pub error_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Handle for managing worker lifecycle.
///
/// Dropping the handle also stops the worker.
pub struct WorkerHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<QueueResult<()>>,
}

impl WorkerHandle {
    /// Stop polling and wait for the in-flight job, if any, to be reported.
    ///
    /// The worker notices the request once its current dispatch call
    /// returns, so this can take up to `poll_timeout`.
    pub async fn shutdown(self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| QueueError::WorkerShutdown(format!("worker task: {}", e)))?
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }
}

impl JobQueue {
    /// Spawn a task that dispatches jobs to `handler` until shut down or
    /// until the queue is closed. Must be called within a tokio runtime.
    #[instrument(skip(self, handler), fields(queue = %self.name()))]
    pub fn start_worker<H: JobHandler>(self: &Arc<Self>, handler: H, options: WorkerOptions) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker = Worker {
            queue: self.clone(),
            handler: Arc::new(handler),
            options,
            shutdown_rx,
        };
        let join_handle = tokio::spawn(worker.run());

        info!("Started worker");
        WorkerHandle {
            shutdown_tx,
            join_handle,
        }
    }
}

struct Worker<H> {
    queue: Arc<JobQueue>,
    handler: Arc<H>,
    options: WorkerOptions,
    shutdown_rx: oneshot::Receiver<()>,
}

impl<H: JobHandler> Worker<H> {
    async fn run(self) -> QueueResult<()> {
        let Worker {
            queue,
            handler,
            options,
            mut shutdown_rx,
        } = self;

        info!(queue = %queue.name(), "Worker started");

        loop {
            // Checked only between dispatch calls: a claim in flight is never dropped
            if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
                info!(queue = %queue.name(), "Worker shutdown requested");
                break;
            }

            match queue.get_next_job(options.poll_timeout).await {
                Ok(Some(job)) => {
                    if let Err(e) = process_job(&queue, handler.as_ref(), job).await {
                        error!(queue = %queue.name(), error = %e, "Error reporting job outcome");
                        tokio::time::sleep(options.error_backoff).await;
                    }
                }
                Ok(None) => {}
                Err(QueueError::QueueClosed(_)) => {
                    info!(queue = %queue.name(), "Queue closed, worker stopping");
                    break;
                }
                Err(e) => {
                    error!(queue = %queue.name(), error = %e, "Error fetching next job");
                    tokio::time::sleep(options.error_backoff).await;
                }
            }
        }

        info!(queue = %queue.name(), "Worker stopped");
        Ok(())
    }
}

async fn process_job<H: JobHandler>(queue: &JobQueue, handler: &H, job: Job) -> QueueResult<()> {
    debug!(queue = %queue.name(), job_id = %job.id, "Processing job");

    match handler.handle(&job).await {
        Ok(result) => {
            queue.complete_job(&job, result).await?;
        }
        Err(e) => {
            queue.fail_job(&job, e.failure, e.retryable).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{QueueConfig, store::{MemoryStore, testing::FaultyStore}};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        handled: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, job: &Job) -> Result<Value, HandlerError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"echo": job.payload}))
        }
    }

    struct RejectingHandler;

    #[async_trait]
    impl JobHandler for RejectingHandler {
        async fn handle(&self, _job: &Job) -> Result<Value, HandlerError> {
            Err(JobFailure::validation("missing sku").into())
        }
    }

    fn fast_options() -> WorkerOptions {
        WorkerOptions {
            poll_timeout: Duration::from_millis(20),
            error_backoff: Duration::from_millis(20),
        }
    }

    async fn create_test_queue() -> Arc<JobQueue> {
        let queue = JobQueue::connect(Arc::new(MemoryStore::new()), QueueConfig::new("worker_queue"))
            .await
            .unwrap();
        Arc::new(queue)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_handler_error_from_failure() {
        assert!(!HandlerError::from(JobFailure::validation("bad")).retryable);
        assert!(HandlerError::from(JobFailure::timeout("slow")).retryable);
        assert!(!HandlerError::permanent(JobFailure::other("x")).retryable);
    }

    #[tokio::test]
    async fn test_worker_completes_jobs() {
        let queue = create_test_queue().await;
        let handled = Arc::new(AtomicUsize::new(0));

        for n in 0..3 {
            queue.add_job(json!(n), 1, Duration::ZERO).await.unwrap();
        }

        let handle = queue.start_worker(CountingHandler { handled: handled.clone() }, fast_options());
        wait_until(|| handled.load(Ordering::SeqCst) == 3).await;
        handle.shutdown().await.unwrap();

        let stats = queue.get_statistics().await.unwrap();
        assert_eq!(stats.size.total(), 0);
        assert_eq!(stats.completed_last_window, 3);
    }

    #[tokio::test]
    async fn test_worker_dead_letters_permanent_failures() {
        let queue = create_test_queue().await;
        queue.add_job(json!({}), 1, Duration::ZERO).await.unwrap();

        let handle = queue.start_worker(RejectingHandler, fast_options());
        let observed = queue.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while observed.get_queue_size().await.unwrap().failed == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.shutdown().await.unwrap();

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead[0].last_error.as_ref().map(|e| e.kind), Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_shutdown_during_slow_claim_finishes_the_job() {
        let store = FaultyStore::default().with_claim_reply_delay(Duration::from_millis(100));
        let queue = Arc::new(
            JobQueue::connect(Arc::new(store), QueueConfig::new("worker_queue"))
                .await
                .unwrap(),
        );
        let handled = Arc::new(AtomicUsize::new(0));

        let handle = queue.start_worker(CountingHandler { handled: handled.clone() }, fast_options());
        queue.add_job(json!("in flight"), 1, Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown().await.unwrap();

        assert_eq!(handled.load(Ordering::SeqCst), 1);
        let size = queue.get_queue_size().await.unwrap();
        assert_eq!(size.total(), 0);
    }

    #[tokio::test]
    async fn test_worker_stops_when_queue_closes() {
        let queue = create_test_queue().await;
        let handle = queue.start_worker(RejectingHandler, fast_options());

        queue.close();
        let handle_ref = &handle;
        wait_until(|| handle_ref.is_finished()).await;
        handle.shutdown().await.unwrap();
    }
}
