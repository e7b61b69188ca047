//! # flowq: Priority Job Queue with Delays, Retries and Dead-Letters
//!
//! **Named job queues over a shared priority store**
//!
//! Producers enqueue JSON payloads with an integer priority and an optional
//! delay. Workers pull the highest priority ready job, run it and report the
//! outcome. Failures are retried with exponential backoff until the retry
//! budget is spent, then parked in a dead-letter collection where operators
//! can inspect, requeue or purge them.
//!
//! ## Features
//!
//! - **Priority Dispatch**: Highest priority first, FIFO among equal priorities
//! - **Delayed Jobs**: Promoted to waiting in batches once their ready time passes
//! - **No Double Dispatch**: Every store move is atomic, so concurrent workers never share a job
//! - **Retry with Backoff**: `base * 2^(attempt - 1)`, driven by structured [`ErrorKind`]s
//! - **Stale Reaping**: Jobs stuck in processing are reclaimed into the dead-letter collection
//! - **Pluggable Stores**: In-process [`MemoryStore`](store::MemoryStore) or Redis (feature `redis`)
//! - **Structured Observability**: `tracing` spans, lifecycle event streams and live counters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use flowq::prelude::*;
//! use serde_json::json;
//!
//! struct PublishListing;
//!
//! #[async_trait]
//! impl JobHandler for PublishListing {
//!     async fn handle(&self, job: &Job) -> Result<serde_json::Value, HandlerError> {
//!         match job.payload.get("sku") {
//!             Some(sku) => Ok(json!({ "published": sku })),
//!             None => Err(HandlerError::permanent(JobFailure::validation("missing sku"))),
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> QueueResult<()> {
//!     let manager = QueueManager::in_memory();
//!     let queue = manager.open(QueueConfig::new("listing_queue")).await?;
//!
//!     queue.add_job(json!({ "sku": "A-1" }), JobPriority::HIGH, Duration::ZERO).await?;
//!
//!     let worker = queue.start_worker(PublishListing, WorkerOptions::default());
//!     let reaper = StaleReaper::new(queue.clone(), Duration::from_secs(300)).spawn();
//!
//!     tokio::time::sleep(Duration::from_secs(1)).await;
//!     worker.shutdown().await?;
//!     reaper.shutdown().await?;
//!     manager.close_all();
//!     Ok(())
//! }
//! ```

pub mod types;
pub mod error;
pub mod config;
pub mod store;
pub mod retry;
pub mod queue;
pub mod worker;
pub mod reaper;
pub mod manager;
pub mod observability;

// Core API exports
pub use queue::{JobQueue, EnqueueOptions, FailOutcome, BoxStream};
pub use types::{
    JobId, ProcessingId, JobPriority, JobStatus, Job, CompletionRecord, JobEvent,
    QueueSize, QueueStatistics, FailureBreakdown, Throughput, StoreMetrics,
};
pub use error::{QueueError, QueueResult, JobFailure, ErrorKind};
pub use config::{QueueConfig, StoreConfig};
pub use store::{PriorityStore, CloseSignal};
pub use retry::RetryPolicy;
pub use worker::{JobHandler, HandlerError, WorkerOptions, WorkerHandle};
pub use reaper::{StaleReaper, ReaperHandle, ReapReport};
pub use manager::{QueueManager, StoreFactory, SharedStore};

// Observability exports
pub use observability::{ObservabilityLayer, LiveMetrics};

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

// Store implementations
#[cfg(feature = "memory")]
pub use store::MemoryStore;

#[cfg(feature = "redis")]
pub use store::RedisStore;

#[cfg(feature = "redis")]
pub use manager::RedisStoreFactory;

/// Everything a producer or worker usually needs
pub mod prelude {
    pub use crate::{
        JobQueue, QueueManager, QueueConfig, StaleReaper, EnqueueOptions, FailOutcome,
    };

    pub use crate::{
        Job, JobId, JobPriority, JobFailure, ErrorKind, QueueError, QueueResult,
    };

    pub use crate::{JobHandler, HandlerError, WorkerOptions};

    pub use async_trait::async_trait;
}
