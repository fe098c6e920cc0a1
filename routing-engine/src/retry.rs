//! Retry policy - exponential backoff with jitter for edge submissions

use ledger_client::LedgerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per edge in one session, first try included
    pub max_attempts: u32,
    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,
    /// Upper bound for any delay (milliseconds)
    pub max_delay_ms: u64,
    /// Growth factor between retries
    pub backoff_multiplier: f64,
    /// Relative jitter applied to each delay
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1, // 10% jitter
        }
    }
}

/// Decides whether and when a failed ledger call is tried again
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create new policy
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Policy with default settings
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Configured attempt limit (at least one)
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base_delay = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(retry.min(i32::MAX as u32) as i32);

        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        let jitter_range = capped_delay * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Whether `attempts` made so far allow another try after `error`
    pub fn should_retry(&self, attempts: u32, error: &LedgerError) -> bool {
        error.is_retryable() && attempts < self.max_attempts()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_defaults()
    }
}
