use std::sync::atomic::{AtomicU64, Ordering};

use crate::Throughput;

/// Live counters for one queue handle
#[derive(Debug, Default)]
pub struct LiveMetrics {
    jobs_enqueued: AtomicU64,
    jobs_dispatched: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    jobs_requeued: AtomicU64,
    jobs_reaped: AtomicU64,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_jobs_enqueued(&self) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_dispatched(&self) {
        self.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_retried(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_dead_lettered(&self) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_requeued(&self, count: u64) {
        self.jobs_requeued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_jobs_reaped(&self) {
        self.jobs_reaped.fetch_add(1, Ordering::Relaxed);
    }

    // Getters for global metrics
    pub fn jobs_enqueued(&self) -> u64 {
        self.jobs_enqueued.load(Ordering::Relaxed)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_dead_lettered(&self) -> u64 {
        self.jobs_dead_lettered.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> Throughput {
        Throughput {
            enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            dispatched: self.jobs_dispatched.load(Ordering::Relaxed),
            completed: self.jobs_completed.load(Ordering::Relaxed),
            retried: self.jobs_retried.load(Ordering::Relaxed),
            dead_lettered: self.jobs_dead_lettered.load(Ordering::Relaxed),
            requeued: self.jobs_requeued.load(Ordering::Relaxed),
            reaped: self.jobs_reaped.load(Ordering::Relaxed),
        }
    }
}
