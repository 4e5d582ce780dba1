//! Exponential backoff with jitter for conflicting transactions.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::BenchError;

/// Decides whether and how long to wait before re-running a transaction.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Policy that never retries.
    pub fn no_retries() -> Self {
        Self::new(RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// True when `error` may be retried after `retries_so_far` retries.
    pub fn should_retry(&self, error: &BenchError, retries_so_far: u32) -> bool {
        error.is_retryable() && retries_so_far < self.config.max_retries
    }

    /// Delay before retry number `retry` (0-based): capped exponential base plus random jitter.
    pub fn delay<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let base_ms = self.config.backoff_for_retry(retry).as_millis() as u64;
        let jitter_range = (base_ms as f64 * self.config.jitter_percent) as u64;
        let jitter = if jitter_range == 0 {
            0
        } else {
            rng.gen_range(0..=jitter_range)
        };
        Duration::from_millis(base_ms + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
