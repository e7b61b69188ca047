pub mod ids;
pub mod job;
pub mod priority;
pub mod events;
pub mod stats;

pub use ids::{JobId, ProcessingId};
pub use job::{Job, JobStatus, CompletionRecord};
pub use priority::JobPriority;
pub use events::JobEvent;
pub use stats::{QueueSize, QueueStatistics, FailureBreakdown, Throughput, StoreMetrics};
