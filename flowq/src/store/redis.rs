use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    QueueResult, QueueError, Job, JobId, ProcessingId, CompletionRecord, QueueSize, StoreMetrics,
    config::StoreConfig,
    store::{CloseSignal, PriorityStore, wait_closed},
};

const INSERT_LUA: &str = include_str!("lua/insert.lua");
const PROMOTE_LUA: &str = include_str!("lua/promote.lua");
const CLAIM_LUA: &str = include_str!("lua/claim.lua");
const RELEASE_LUA: &str = include_str!("lua/release.lua");
const RETRY_LUA: &str = include_str!("lua/retry.lua");
const DEAD_LETTER_LUA: &str = include_str!("lua/dead_letter.lua");
const TAKE_DEAD_LETTERS_LUA: &str = include_str!("lua/take_dead_letters.lua");
const PURGE_DEAD_LETTERS_LUA: &str = include_str!("lua/purge_dead_letters.lua");

const KEY_PREFIX: &str = "flowq";

/// Key names of one queue
struct QueueKeys {
    waiting: String,
    delayed: String,
    bodies: String,
    seq: String,
    processing: String,
    started: String,
    completed: String,
    failed: String,
    failed_at: String,
}

impl QueueKeys {
    fn new(queue: &str) -> Self {
        let key = |suffix: &str| format!("{KEY_PREFIX}:{queue}:{suffix}");
        Self {
            waiting: key("waiting"),
            delayed: key("delayed"),
            bodies: key("jobs"),
            seq: key("seq"),
            processing: key("processing"),
            started: key("started"),
            completed: key("completed"),
            failed: key("failed"),
            failed_at: key("failed_at"),
        }
    }
}

/// Priority store on a Redis server.
///
/// Waiting and delayed jobs live in sorted sets whose members are ranks of
/// the form `created_at_micros:sequence:job_id`; the bodies sit in a hash
/// keyed by rank. Waiting is scored by priority, so the lexicographically
/// smallest rank within the top score is the oldest job. Every move between
/// collections is one Lua script, executed atomically by the server.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    poll_interval: Duration,
    insert_script: Script,
    promote_script: Script,
    claim_script: Script,
    release_script: Script,
    retry_script: Script,
    dead_letter_script: Script,
    take_dead_letters_script: Script,
    purge_dead_letters_script: Script,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`
    pub async fn connect(config: &StoreConfig, poll_interval: Duration) -> QueueResult<Self> {
        let client = Client::open(config.to_url())
            .map_err(|e| QueueError::Connection(format!("{}: {}", config.redacted_url(), e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Connection(format!("{}: {}", config.redacted_url(), e)))?;

        let store = Self::with_connection(conn, poll_interval);
        store.ping().await?;

        info!(url = %config.redacted_url(), "Connected to redis priority store");
        Ok(store)
    }

    pub fn with_connection(conn: ConnectionManager, poll_interval: Duration) -> Self {
        Self {
            conn,
            poll_interval,
            insert_script: Script::new(INSERT_LUA),
            promote_script: Script::new(PROMOTE_LUA),
            claim_script: Script::new(CLAIM_LUA),
            release_script: Script::new(RELEASE_LUA),
            retry_script: Script::new(RETRY_LUA),
            dead_letter_script: Script::new(DEAD_LETTER_LUA),
            take_dead_letters_script: Script::new(TAKE_DEAD_LETTERS_LUA),
            purge_dead_letters_script: Script::new(PURGE_DEAD_LETTERS_LUA),
        }
    }

    fn rank_prefix(job: &Job) -> String {
        format!("{:020}", job.created_at.timestamp_micros().max(0))
    }

    async fn insert_into(&self, target: &str, keys: &QueueKeys, job: &Job, score: i64) -> QueueResult<usize> {
        let body = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let depth: usize = self
            .insert_script
            .key(target)
            .key(&keys.bodies)
            .key(&keys.seq)
            .arg(Self::rank_prefix(job))
            .arg(job.id.as_str())
            .arg(score)
            .arg(body)
            .invoke_async(&mut conn)
            .await?;
        Ok(depth)
    }

    async fn try_claim(&self, keys: &QueueKeys, processing_id: &ProcessingId) -> QueueResult<Option<Job>> {
        let started_at = Utc::now();
        let mut conn = self.conn.clone();
        let body: Option<String> = self
            .claim_script
            .key(&keys.waiting)
            .key(&keys.bodies)
            .key(&keys.processing)
            .key(&keys.started)
            .arg(processing_id.as_str())
            .arg(started_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        match body {
            Some(body) => {
                let mut job: Job = serde_json::from_str(&body)?;
                job.start_processing(processing_id.clone(), millis_to_datetime(started_at.timestamp_millis())?);
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }
}

fn millis_to_datetime(millis: i64) -> QueueResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| QueueError::Internal(format!("timestamp out of range: {}", millis)))
}

fn score_to_datetime(score: &str) -> QueueResult<DateTime<Utc>> {
    let millis = score
        .parse::<f64>()
        .map_err(|_| QueueError::Internal(format!("malformed timestamp score: {}", score)))?;
    millis_to_datetime(millis as i64)
}

fn decode_jobs(bodies: Vec<String>) -> QueueResult<Vec<Job>> {
    bodies
        .iter()
        .map(|body| serde_json::from_str(body).map_err(QueueError::from))
        .collect()
}

/// Pull the numeric fields this store reports out of an `INFO` reply
fn parse_info(info: &str) -> HashMap<&str, &str> {
    info.lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.trim().split_once(':'))
        .collect()
}

#[async_trait]
impl PriorityStore for RedisStore {
    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        debug!(reply = %pong, "Redis ping");
        Ok(())
    }

    async fn insert_waiting(&self, queue: &str, job: Job) -> QueueResult<usize> {
        let keys = QueueKeys::new(queue);
        self.insert_into(&keys.waiting, &keys, &job, job.priority.value()).await
    }

    async fn insert_delayed(&self, queue: &str, job: Job, ready_at: DateTime<Utc>) -> QueueResult<usize> {
        let keys = QueueKeys::new(queue);
        self.insert_into(&keys.delayed, &keys, &job, ready_at.timestamp_millis()).await
    }

    async fn promote_due(&self, queue: &str, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<Job>> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();
        let bodies: Vec<String> = self
            .promote_script
            .key(&keys.delayed)
            .key(&keys.waiting)
            .key(&keys.bodies)
            .arg(now.timestamp_millis())
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        decode_jobs(bodies)
    }

    async fn claim_next(
        &self,
        queue: &str,
        processing_id: ProcessingId,
        timeout: Duration,
        mut closed: CloseSignal,
    ) -> QueueResult<Option<Job>> {
        let keys = QueueKeys::new(queue);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let is_closed = *closed.borrow();
            if is_closed {
                return Ok(None);
            }

            // The script reply is always awaited; a dropped reply would
            // strand the job in processing.
            if let Some(job) = self.try_claim(&keys, &processing_id).await? {
                return Ok(Some(job));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval.min(deadline - now)) => {}
                _ = wait_closed(&mut closed) => return Ok(None),
            }
        }
    }

    async fn release_processing(&self, queue: &str, processing_id: &ProcessingId) -> QueueResult<Option<Job>> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();
        let released: Option<(String, Option<String>)> = self
            .release_script
            .key(&keys.processing)
            .key(&keys.started)
            .arg(processing_id.as_str())
            .invoke_async(&mut conn)
            .await?;

        let Some((body, started)) = released else {
            return Ok(None);
        };

        let mut job: Job = serde_json::from_str(&body)?;
        let started_at = match started {
            Some(score) => score_to_datetime(&score)?,
            None => {
                warn!(queue, processing_id = %processing_id, "Processing entry without start time");
                Utc::now()
            }
        };
        job.start_processing(processing_id.clone(), started_at);
        Ok(Some(job))
    }

    async fn retry_processing(
        &self,
        queue: &str,
        processing_id: &ProcessingId,
        job: Job,
        ready_at: Option<DateTime<Utc>>,
    ) -> QueueResult<bool> {
        let keys = QueueKeys::new(queue);
        let (target, score) = match ready_at {
            Some(ready_at) => (&keys.delayed, ready_at.timestamp_millis()),
            None => (&keys.waiting, job.priority.value()),
        };
        let body = serde_json::to_string(&job)?;

        let mut conn = self.conn.clone();
        let moved: bool = self
            .retry_script
            .key(&keys.processing)
            .key(&keys.started)
            .key(target)
            .key(&keys.bodies)
            .key(&keys.seq)
            .arg(processing_id.as_str())
            .arg(Self::rank_prefix(&job))
            .arg(job.id.as_str())
            .arg(score)
            .arg(body)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn dead_letter_processing(&self, queue: &str, processing_id: &ProcessingId, job: Job) -> QueueResult<bool> {
        let keys = QueueKeys::new(queue);
        let failed_ms = job.failed_at.unwrap_or_else(Utc::now).timestamp_millis();
        let body = serde_json::to_string(&job)?;

        let mut conn = self.conn.clone();
        let moved: bool = self
            .dead_letter_script
            .key(&keys.processing)
            .key(&keys.started)
            .key(&keys.failed)
            .key(&keys.failed_at)
            .arg(processing_id.as_str())
            .arg(job.id.as_str())
            .arg(failed_ms)
            .arg(body)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn list_processing(&self, queue: &str) -> QueueResult<Vec<Job>> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();
        let (bodies, started): (HashMap<String, String>, Vec<(String, f64)>) = ::redis::pipe()
            .atomic()
            .hgetall(&keys.processing)
            .zrange_withscores(&keys.started, 0, -1)
            .query_async(&mut conn)
            .await?;

        let started: HashMap<String, f64> = started.into_iter().collect();
        bodies
            .into_iter()
            .map(|(processing_id, body)| {
                let mut job: Job = serde_json::from_str(&body)?;
                let started_at = match started.get(&processing_id) {
                    Some(millis) => millis_to_datetime(*millis as i64)?,
                    None => Utc::now(),
                };
                job.start_processing(ProcessingId(processing_id), started_at);
                Ok(job)
            })
            .collect()
    }

    async fn record_completion(
        &self,
        queue: &str,
        record: CompletionRecord,
        retention: Duration,
    ) -> QueueResult<()> {
        let keys = QueueKeys::new(queue);
        let completed_ms = record.completed_at.timestamp_millis();
        let cutoff_ms = completed_ms.saturating_sub(i64::try_from(retention.as_millis()).unwrap_or(i64::MAX));
        let member = serde_json::to_string(&record)?;

        let mut conn = self.conn.clone();
        let _: () = ::redis::pipe()
            .atomic()
            .zadd(&keys.completed, member, completed_ms)
            .ignore()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&keys.completed)
            .arg("-inf")
            .arg(format!("({}", cutoff_ms))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn completed_since(&self, queue: &str, since: DateTime<Utc>) -> QueueResult<usize> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();
        let count: usize = ::redis::cmd("ZCOUNT")
            .arg(&keys.completed)
            .arg(since.timestamp_millis())
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn insert_dead_letter(&self, queue: &str, job: Job) -> QueueResult<()> {
        let keys = QueueKeys::new(queue);
        let failed_ms = job.failed_at.unwrap_or_else(Utc::now).timestamp_millis();
        let body = serde_json::to_string(&job)?;

        let mut conn = self.conn.clone();
        let _: () = ::redis::pipe()
            .atomic()
            .hset(&keys.failed, job.id.as_str(), body)
            .ignore()
            .zadd(&keys.failed_at, job.id.as_str(), failed_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn take_dead_letters(&self, queue: &str, max: usize) -> QueueResult<Vec<Job>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();
        let bodies: Vec<String> = self
            .take_dead_letters_script
            .key(&keys.failed)
            .key(&keys.failed_at)
            .arg(max)
            .invoke_async(&mut conn)
            .await?;
        decode_jobs(bodies)
    }

    async fn list_dead_letters(&self, queue: &str) -> QueueResult<Vec<Job>> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();
        let bodies: Vec<String> = ::redis::cmd("HVALS")
            .arg(&keys.failed)
            .query_async(&mut conn)
            .await?;
        decode_jobs(bodies)
    }

    async fn purge_dead_letters(&self, queue: &str, failed_before: DateTime<Utc>) -> QueueResult<Vec<JobId>> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();
        let ids: Vec<String> = self
            .purge_dead_letters_script
            .key(&keys.failed)
            .key(&keys.failed_at)
            .arg(failed_before.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(ids.into_iter().map(JobId).collect())
    }

    async fn counts(&self, queue: &str) -> QueueResult<QueueSize> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();
        let (waiting, delayed, processing, failed): (usize, usize, usize, usize) = ::redis::pipe()
            .atomic()
            .zcard(&keys.waiting)
            .zcard(&keys.delayed)
            .hlen(&keys.processing)
            .hlen(&keys.failed)
            .query_async(&mut conn)
            .await?;

        Ok(QueueSize {
            waiting,
            delayed,
            processing,
            failed,
        })
    }

    async fn metrics(&self) -> QueueResult<StoreMetrics> {
        let mut conn = self.conn.clone();
        let info: String = ::redis::cmd("INFO").query_async(&mut conn).await?;
        let fields = parse_info(&info);

        Ok(StoreMetrics {
            backend: self.backend_name().to_string(),
            connected_clients: fields.get("connected_clients").and_then(|v| v.parse().ok()),
            ops_per_sec: fields.get("instantaneous_ops_per_sec").and_then(|v| v.parse().ok()),
            used_memory_bytes: fields.get("used_memory").and_then(|v| v.parse().ok()),
            total_commands: fields.get("total_commands_processed").and_then(|v| v.parse().ok()),
        })
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobPriority;
    use serde_json::json;

    #[test]
    fn test_queue_keys_are_namespaced() {
        let keys = QueueKeys::new("workflow_queue");
        assert_eq!(keys.waiting, "flowq:workflow_queue:waiting");
        assert_eq!(keys.failed_at, "flowq:workflow_queue:failed_at");
    }

    #[test]
    fn test_rank_prefix_sorts_by_creation() {
        let mut older = Job::new("q", json!(null), JobPriority(1), 0);
        let newer = Job::new("q", json!(null), JobPriority(1), 0);
        older.created_at = newer.created_at - chrono::Duration::seconds(1);

        let older_rank = RedisStore::rank_prefix(&older);
        let newer_rank = RedisStore::rank_prefix(&newer);
        assert_eq!(older_rank.len(), 20);
        assert!(older_rank < newer_rank);
    }

    #[test]
    fn test_parse_info_fields() {
        let info = "# Clients\r\nconnected_clients:3\r\n# Stats\r\ninstantaneous_ops_per_sec:42\r\nused_memory:1024\r\n";
        let fields = parse_info(info);
        assert_eq!(fields.get("connected_clients"), Some(&"3"));
        assert_eq!(fields.get("instantaneous_ops_per_sec"), Some(&"42"));
        assert_eq!(fields.get("used_memory"), Some(&"1024"));
    }

    #[test]
    fn test_score_to_datetime() {
        let at = score_to_datetime("1700000000000").unwrap();
        assert_eq!(at.timestamp_millis(), 1_700_000_000_000);
        assert!(score_to_datetime("soon").is_err());
    }
}
