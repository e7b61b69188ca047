use std::time::Duration;

use crate::QueueConfig;

/// Exponential backoff policy for retryable failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            base_delay: config.base_retry_delay,
            max_delay: config.max_retry_delay,
        }
    }

    /// Whether a failure observed at `retry_count` (before incrementing)
    /// should be retried
    pub fn should_retry(retryable: bool, retry_count: u32, max_retries: u32) -> bool {
        retryable && retry_count < max_retries
    }

    /// Backoff before retry number `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, saturating and optionally capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);

        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}
