use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::{QueueResult, QueueError, queue::JobQueue};

/// Periodically reclaims processing jobs whose worker went silent.
///
/// Each cycle dead-letters jobs that have been processing longer than the
/// stale timeout and, when the queue has a dead-letter retention, purges
/// expired dead-letter entries.
pub struct StaleReaper {
    queue: Arc<JobQueue>,
    stale_timeout: Duration,
    interval: Duration,
}

/// Outcome of one reaper cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub reclaimed: usize,
    pub purged: usize,
}

impl StaleReaper {
    pub fn new(queue: Arc<JobQueue>, stale_timeout: Duration) -> Self {
        Self {
            queue,
            stale_timeout,
            interval: Duration::from_secs(30), // Run every 30 seconds
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one reaper cycle
    pub async fn reap_once(&self) -> QueueResult<ReapReport> {
        let reclaimed = self.queue.cleanup_stale_jobs(self.stale_timeout).await?;

        let purged = match self.queue.config().dead_letter_retention {
            Some(retention) => self.queue.purge_dead_letters(retention).await?,
            None => 0,
        };

        Ok(ReapReport { reclaimed, purged })
    }

    /// Start the reaper background task
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(self.run(shutdown_rx));
        ReaperHandle {
            shutdown_tx,
            join_handle,
        }
    }

    async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut ticker = interval(self.interval);

        info!(
            queue = %self.queue.name(),
            interval_ms = self.interval.as_millis() as u64,
            stale_timeout_ms = self.stale_timeout.as_millis() as u64,
            "Starting stale job reaper"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {}
            }

            match self.reap_once().await {
                Ok(report) if report == ReapReport::default() => {
                    debug!(queue = %self.queue.name(), "Reaper cycle found nothing to do");
                }
                Ok(report) => {
                    info!(
                        queue = %self.queue.name(),
                        reclaimed = report.reclaimed,
                        purged = report.purged,
                        "Reaper cycle finished"
                    );
                }
                Err(QueueError::QueueClosed(_)) => break,
                Err(e) => {
                    warn!(queue = %self.queue.name(), error = %e, "Error during stale job reaping");
                }
            }
        }

        info!(queue = %self.queue.name(), "Stale job reaper stopped");
    }
}

/// Handle to a spawned [`StaleReaper`]
pub struct ReaperHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown(self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| QueueError::WorkerShutdown(format!("reaper task: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{QueueConfig, JobFailure, store::MemoryStore};
    use serde_json::json;

    #[tokio::test]
    async fn test_reap_once_reclaims_and_purges() {
        let store = MemoryStore::new();
        let config = QueueConfig::new("reaper_queue").with_dead_letter_retention(Duration::ZERO);
        let queue = Arc::new(JobQueue::connect(Arc::new(store.clone()), config).await.unwrap());

        queue.add_job(json!("stuck"), 1, Duration::ZERO).await.unwrap();
        let job = queue.get_next_job(Duration::from_millis(20)).await.unwrap().unwrap();
        let processing_id = job.processing_id.clone().unwrap();
        store.backdate_processing("reaper_queue", &processing_id, chrono::Duration::minutes(10));

        let reaper = StaleReaper::new(queue.clone(), Duration::from_secs(300));
        let report = reaper.reap_once().await.unwrap();
        assert_eq!(report.reclaimed, 1);

        // The reclaimed job itself is purged once it ages past the zero retention
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = reaper.reap_once().await.unwrap();
        assert_eq!(report, ReapReport { reclaimed: 0, purged: 1 });
    }

    #[tokio::test]
    async fn test_fresh_jobs_are_left_alone() {
        let queue = Arc::new(
            JobQueue::connect(Arc::new(MemoryStore::new()), QueueConfig::new("reaper_queue"))
                .await
                .unwrap(),
        );
        queue.add_job(json!(null), 1, Duration::ZERO).await.unwrap();
        let job = queue.get_next_job(Duration::from_millis(20)).await.unwrap().unwrap();

        let reaper = StaleReaper::new(queue.clone(), Duration::from_secs(300));
        assert_eq!(reaper.reap_once().await.unwrap(), ReapReport::default());

        queue.fail_job(&job, JobFailure::other("done"), false).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawned_reaper_shuts_down() {
        let queue = Arc::new(
            JobQueue::connect(Arc::new(MemoryStore::new()), QueueConfig::new("reaper_queue"))
                .await
                .unwrap(),
        );
        let handle = StaleReaper::new(queue, Duration::from_secs(1))
            .with_interval(Duration::from_millis(10))
            .spawn();

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown().await.unwrap();
    }
}
