use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ErrorKind;

/// Number of jobs held by each collection of a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSize {
    pub waiting: usize,
    pub delayed: usize,
    pub processing: usize,
    pub failed: usize,
}

impl QueueSize {
    pub fn total(&self) -> usize {
        self.waiting + self.delayed + self.processing + self.failed
    }
}

/// Dead-letter jobs bucketed by error category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureBreakdown {
    pub timeout: usize,
    pub connection: usize,
    pub api_error: usize,
    pub validation: usize,
    pub other: usize,
}

impl FailureBreakdown {
    pub fn record(&mut self, kind: ErrorKind) {
        match kind {
            ErrorKind::Timeout => self.timeout += 1,
            ErrorKind::Connection => self.connection += 1,
            ErrorKind::ApiError => self.api_error += 1,
            ErrorKind::Validation => self.validation += 1,
            ErrorKind::Other => self.other += 1,
        }
    }

    pub fn get(&self, kind: ErrorKind) -> usize {
        match kind {
            ErrorKind::Timeout => self.timeout,
            ErrorKind::Connection => self.connection,
            ErrorKind::ApiError => self.api_error,
            ErrorKind::Validation => self.validation,
            ErrorKind::Other => self.other,
        }
    }

    pub fn total(&self) -> usize {
        ErrorKind::all().iter().map(|kind| self.get(*kind)).sum()
    }
}

impl FromIterator<ErrorKind> for FailureBreakdown {
    fn from_iter<I: IntoIterator<Item = ErrorKind>>(iter: I) -> Self {
        let mut breakdown = Self::default();
        for kind in iter {
            breakdown.record(kind);
        }
        breakdown
    }
}

/// Process-local throughput counters since the queue was opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throughput {
    /// New jobs only; retries and requeues have their own counters
    pub enqueued: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
    pub reaped: u64,
}

impl Throughput {
    /// Completed share of finished attempts, as a percentage
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.retried + self.dead_lettered;
        if finished == 0 {
            100.0
        } else {
            (self.completed as f64 / finished as f64) * 100.0
        }
    }
}

/// Full statistics report for one queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub queue: String,
    pub size: QueueSize,
    /// Completions still inside the retention window
    pub completed_last_window: usize,
    pub retention: Duration,
    pub failure_breakdown: FailureBreakdown,
    pub throughput: Throughput,
}

/// Store-level counters, passed through where the backend exposes them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreMetrics {
    pub backend: String,
    pub connected_clients: Option<u64>,
    pub ops_per_sec: Option<f64>,
    pub used_memory_bytes: Option<u64>,
    pub total_commands: Option<u64>,
}
