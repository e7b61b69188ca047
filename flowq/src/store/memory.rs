use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    QueueResult, Job, JobId, JobPriority, ProcessingId, CompletionRecord, QueueSize, StoreMetrics,
    store::{CloseSignal, PriorityStore, wait_closed},
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct WaitingKey {
    priority: Reverse<JobPriority>,
    created_at: DateTime<Utc>,
    seq: u64,
}

type DelayedKey = (DateTime<Utc>, u64);

/// Collections of one named queue
#[derive(Default)]
struct QueueState {
    waiting: BTreeMap<WaitingKey, Job>,
    delayed: BTreeMap<DelayedKey, Job>,
    processing: HashMap<ProcessingId, Job>,
    failed: HashMap<JobId, Job>,
    /// Completion records in completion order
    completed: VecDeque<CompletionRecord>,
}

#[derive(Default)]
struct StoreState {
    queues: HashMap<String, QueueState>,
    /// Insertion sequence, the final tie-break for equal priority and time
    seq: u64,
}

impl StoreState {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// In-process priority store.
///
/// Every primitive runs under one lock, which makes each move atomic.
/// Clones share the same state, so one store can back producers and
/// workers running on different tasks.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,

    /// Wakes claimers blocked on an empty waiting collection
    job_available: Arc<Notify>,

    commands: Arc<AtomicU64>,
    started: Instant,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            job_available: Arc::new(Notify::new()),
            commands: Arc::new(AtomicU64::new(0)),
            started: Instant::now(),
        }
    }

    fn count_command(&self) {
        self.commands.fetch_add(1, Ordering::Relaxed);
    }

    fn push_waiting(state: &mut StoreState, queue: &str, job: Job) -> usize {
        let key = WaitingKey {
            priority: Reverse(job.priority),
            created_at: job.created_at,
            seq: state.next_seq(),
        };
        let queue_state = state.queue(queue);
        queue_state.waiting.insert(key, job);
        queue_state.waiting.len()
    }

    fn push_delayed(state: &mut StoreState, queue: &str, job: Job, ready_at: DateTime<Utc>) -> usize {
        let seq = state.next_seq();
        let queue_state = state.queue(queue);
        queue_state.delayed.insert((ready_at, seq), job);
        queue_state.delayed.len()
    }

    fn try_claim(&self, queue: &str, processing_id: &ProcessingId) -> Option<Job> {
        let mut state = self.state.lock();
        let queue_state = state.queues.get_mut(queue)?;
        let (_, mut job) = queue_state.waiting.pop_first()?;

        job.start_processing(processing_id.clone(), Utc::now());
        queue_state.processing.insert(processing_id.clone(), job.clone());
        Some(job)
    }

    /// Force a processing job's start time into the past
    #[cfg(test)]
    pub(crate) fn backdate_processing(&self, queue: &str, processing_id: &ProcessingId, by: chrono::Duration) {
        let mut state = self.state.lock();
        if let Some(job) = state.queue(queue).processing.get_mut(processing_id) {
            job.started_at = job.started_at.map(|started| started - by);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriorityStore for MemoryStore {
    async fn ping(&self) -> QueueResult<()> {
        self.count_command();
        Ok(())
    }

    async fn insert_waiting(&self, queue: &str, job: Job) -> QueueResult<usize> {
        self.count_command();
        let depth = {
            let mut state = self.state.lock();
            Self::push_waiting(&mut state, queue, job)
        };
        self.job_available.notify_waiters();
        Ok(depth)
    }

    async fn insert_delayed(&self, queue: &str, job: Job, ready_at: DateTime<Utc>) -> QueueResult<usize> {
        self.count_command();
        let mut state = self.state.lock();
        Ok(Self::push_delayed(&mut state, queue, job, ready_at))
    }

    async fn promote_due(&self, queue: &str, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<Job>> {
        self.count_command();
        let promoted = {
            let mut state = self.state.lock();
            let Some(queue_state) = state.queues.get_mut(queue) else {
                return Ok(Vec::new());
            };

            let due: Vec<DelayedKey> = queue_state
                .delayed
                .keys()
                .take_while(|(ready_at, _)| *ready_at <= now)
                .take(limit)
                .cloned()
                .collect();

            let jobs: Vec<Job> = due
                .iter()
                .filter_map(|key| queue_state.delayed.remove(key))
                .collect();

            for job in &jobs {
                Self::push_waiting(&mut state, queue, job.clone());
            }
            jobs
        };

        if !promoted.is_empty() {
            self.job_available.notify_waiters();
        }
        Ok(promoted)
    }

    async fn claim_next(
        &self,
        queue: &str,
        processing_id: ProcessingId,
        timeout: Duration,
        mut closed: CloseSignal,
    ) -> QueueResult<Option<Job>> {
        self.count_command();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before looking, so an insert between the
            // check and the wait is not missed.
            let notified = self.job_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let is_closed = *closed.borrow();
            if is_closed {
                return Ok(None);
            }

            if let Some(job) = self.try_claim(queue, &processing_id) {
                return Ok(Some(job));
            }

            tokio::select! {
                woken = tokio::time::timeout_at(deadline, notified) => {
                    if woken.is_err() {
                        return Ok(None);
                    }
                }
                _ = wait_closed(&mut closed) => return Ok(None),
            }
        }
    }

    async fn release_processing(&self, queue: &str, processing_id: &ProcessingId) -> QueueResult<Option<Job>> {
        self.count_command();
        let mut state = self.state.lock();
        Ok(state
            .queues
            .get_mut(queue)
            .and_then(|queue_state| queue_state.processing.remove(processing_id)))
    }

    async fn retry_processing(
        &self,
        queue: &str,
        processing_id: &ProcessingId,
        job: Job,
        ready_at: Option<DateTime<Utc>>,
    ) -> QueueResult<bool> {
        self.count_command();
        {
            let mut state = self.state.lock();
            let released = state
                .queues
                .get_mut(queue)
                .and_then(|queue_state| queue_state.processing.remove(processing_id));
            if released.is_none() {
                return Ok(false);
            }

            match ready_at {
                Some(ready_at) => {
                    Self::push_delayed(&mut state, queue, job, ready_at);
                }
                None => {
                    Self::push_waiting(&mut state, queue, job);
                }
            }
        }

        if ready_at.is_none() {
            self.job_available.notify_waiters();
        }
        Ok(true)
    }

    async fn dead_letter_processing(&self, queue: &str, processing_id: &ProcessingId, job: Job) -> QueueResult<bool> {
        self.count_command();
        let mut state = self.state.lock();
        let queue_state = state.queue(queue);
        if queue_state.processing.remove(processing_id).is_none() {
            return Ok(false);
        }
        queue_state.failed.insert(job.id.clone(), job);
        Ok(true)
    }

    async fn list_processing(&self, queue: &str) -> QueueResult<Vec<Job>> {
        self.count_command();
        let state = self.state.lock();
        Ok(state
            .queues
            .get(queue)
            .map(|queue_state| queue_state.processing.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn record_completion(
        &self,
        queue: &str,
        record: CompletionRecord,
        retention: Duration,
    ) -> QueueResult<()> {
        self.count_command();
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| record.completed_at.checked_sub_signed(retention));
        let mut state = self.state.lock();
        let completed = &mut state.queue(queue).completed;

        completed.push_back(record);
        if let Some(cutoff) = cutoff {
            while completed.front().is_some_and(|oldest| oldest.completed_at < cutoff) {
                completed.pop_front();
            }
        }
        Ok(())
    }

    async fn completed_since(&self, queue: &str, since: DateTime<Utc>) -> QueueResult<usize> {
        self.count_command();
        let state = self.state.lock();
        Ok(state
            .queues
            .get(queue)
            .map(|queue_state| {
                queue_state
                    .completed
                    .iter()
                    .filter(|record| record.completed_at >= since)
                    .count()
            })
            .unwrap_or(0))
    }

    async fn insert_dead_letter(&self, queue: &str, job: Job) -> QueueResult<()> {
        self.count_command();
        let mut state = self.state.lock();
        state.queue(queue).failed.insert(job.id.clone(), job);
        Ok(())
    }

    async fn take_dead_letters(&self, queue: &str, max: usize) -> QueueResult<Vec<Job>> {
        self.count_command();
        let mut state = self.state.lock();
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut oldest: Vec<(Option<DateTime<Utc>>, JobId)> = queue_state
            .failed
            .values()
            .map(|job| (job.failed_at, job.id.clone()))
            .collect();
        oldest.sort();

        Ok(oldest
            .into_iter()
            .take(max)
            .filter_map(|(_, id)| queue_state.failed.remove(&id))
            .collect())
    }

    async fn list_dead_letters(&self, queue: &str) -> QueueResult<Vec<Job>> {
        self.count_command();
        let state = self.state.lock();
        Ok(state
            .queues
            .get(queue)
            .map(|queue_state| queue_state.failed.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn purge_dead_letters(&self, queue: &str, failed_before: DateTime<Utc>) -> QueueResult<Vec<JobId>> {
        self.count_command();
        let mut state = self.state.lock();
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let expired: Vec<JobId> = queue_state
            .failed
            .values()
            .filter(|job| job.failed_at.is_some_and(|at| at < failed_before))
            .map(|job| job.id.clone())
            .collect();

        for id in &expired {
            queue_state.failed.remove(id);
        }
        Ok(expired)
    }

    async fn counts(&self, queue: &str) -> QueueResult<QueueSize> {
        self.count_command();
        let state = self.state.lock();
        Ok(state
            .queues
            .get(queue)
            .map(|queue_state| QueueSize {
                waiting: queue_state.waiting.len(),
                delayed: queue_state.delayed.len(),
                processing: queue_state.processing.len(),
                failed: queue_state.failed.len(),
            })
            .unwrap_or_default())
    }

    async fn metrics(&self) -> QueueResult<StoreMetrics> {
        self.count_command();
        let total = self.commands.load(Ordering::Relaxed);
        let uptime = self.started.elapsed().as_secs_f64();

        Ok(StoreMetrics {
            backend: self.backend_name().to_string(),
            // Every clone of the store is a client of the shared state
            connected_clients: Some(Arc::strong_count(&self.state) as u64),
            ops_per_sec: (uptime > 0.0).then(|| total as f64 / uptime),
            used_memory_bytes: None,
            total_commands: Some(total),
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
