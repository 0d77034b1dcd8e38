use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff for opening a completion stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; zero disables retrying.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub multiplier: u32,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 1000,
            multiplier: 2,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = (self.multiplier as u64).saturating_pow(exponent);
        let millis = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}
