use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::{QueueError, QueueResult};

/// Priority store connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Logical database index
    pub db: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

impl StoreConfig {
    /// Connection URL in `redis://[:password@]host:port/db` form
    pub fn to_url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// URL safe for logs (password elided)
    pub fn redacted_url(&self) -> String {
        match self.password {
            Some(_) => format!("redis://:***@{}:{}/{}", self.host, self.port, self.db),
            None => self.to_url(),
        }
    }
}

/// Per-queue configuration, fixed at construction time
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub queue_name: String,
    /// Retries allowed before a job is dead-lettered
    pub max_retries: u32,
    /// First backoff step; doubles on every further retry
    pub base_retry_delay: Duration,
    /// Optional ceiling for the backoff
    pub max_retry_delay: Option<Duration>,
    /// How long completion records are kept
    pub completed_retention: Duration,
    /// Delayed jobs promoted per dispatch cycle
    pub promote_batch_size: usize,
    /// Dead-letter entries older than this are purged by the reaper
    pub dead_letter_retention: Option<Duration>,
    /// How often polling stores re-check for work while blocked
    pub poll_interval: Duration,
    pub store: StoreConfig,
}

impl QueueConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            max_retries: 3,
            base_retry_delay: Duration::from_secs(60),
            max_retry_delay: None,
            completed_retention: Duration::from_secs(3600), // 1 hour
            promote_batch_size: 10,
            dead_letter_retention: None,
            poll_interval: Duration::from_millis(100),
            store: StoreConfig::default(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_retry_delay(mut self, delay: Duration) -> Self {
        self.base_retry_delay = delay;
        self
    }

    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = Some(delay);
        self
    }

    pub fn with_completed_retention(mut self, retention: Duration) -> Self {
        self.completed_retention = retention;
        self
    }

    pub fn with_promote_batch_size(mut self, batch: usize) -> Self {
        self.promote_batch_size = batch;
        self
    }

    pub fn with_dead_letter_retention(mut self, retention: Duration) -> Self {
        self.dead_letter_retention = Some(retention);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Build a config from `FLOWQ_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env(queue_name: impl Into<String>) -> QueueResult<Self> {
        let defaults = Self::new(queue_name);
        let store_defaults = StoreConfig::default();

        let config = Self {
            max_retries: env_or("FLOWQ_MAX_RETRIES", defaults.max_retries)?,
            base_retry_delay: Duration::from_secs(env_or(
                "FLOWQ_BASE_RETRY_DELAY_SECS",
                defaults.base_retry_delay.as_secs(),
            )?),
            max_retry_delay: env_opt::<u64>("FLOWQ_MAX_RETRY_DELAY_SECS")?.map(Duration::from_secs),
            completed_retention: Duration::from_secs(env_or(
                "FLOWQ_COMPLETED_RETENTION_SECS",
                defaults.completed_retention.as_secs(),
            )?),
            promote_batch_size: env_or("FLOWQ_PROMOTE_BATCH_SIZE", defaults.promote_batch_size)?,
            dead_letter_retention: env_opt::<u64>("FLOWQ_DEAD_LETTER_RETENTION_SECS")?
                .map(Duration::from_secs),
            poll_interval: Duration::from_millis(env_or(
                "FLOWQ_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            store: StoreConfig {
                host: env::var("FLOWQ_STORE_HOST").unwrap_or(store_defaults.host),
                port: env_or("FLOWQ_STORE_PORT", store_defaults.port)?,
                password: env::var("FLOWQ_STORE_PASSWORD").ok().filter(|p| !p.is_empty()),
                db: env_or("FLOWQ_STORE_DB", store_defaults.db)?,
            },
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the queue cannot run with
    pub fn validate(&self) -> QueueResult<()> {
        if self.queue_name.trim().is_empty() {
            return Err(QueueError::InvalidConfig("queue_name must not be empty".to_string()));
        }
        if self.promote_batch_size == 0 {
            return Err(QueueError::InvalidConfig("promote_batch_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn env_opt<T: FromStr>(key: &str) -> QueueResult<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| QueueError::InvalidConfig(format!("{} has invalid value {:?}", key, raw))),
        Err(_) => Ok(None),
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> QueueResult<T> {
    Ok(env_opt(key)?.unwrap_or(default))
}
