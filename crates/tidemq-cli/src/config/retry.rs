//! Redelivery configuration.

use std::time::Duration;

use serde::Deserialize;
use tidemq_client::RetryPolicy;

/// Redelivery of unreleased QoS 2 receipts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub interval_ms: u64,
    /// Multiplier applied to the interval after each attempt.
    pub backoff: f64,
    pub max_interval_ms: u64,
    /// Attempts before the connection is given up on (0 retries forever).
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            interval_ms: policy.interval.as_millis() as u64,
            backoff: policy.backoff,
            max_interval_ms: policy.max_interval.as_millis() as u64,
            max_attempts: policy.max_attempts,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_ms == 0 {
            return Err("retry.interval_ms must be at least 1".into());
        }
        if !self.backoff.is_finite() || self.backoff < 1.0 {
            return Err("retry.backoff must be at least 1.0".into());
        }
        if self.max_interval_ms < self.interval_ms {
            return Err("retry.max_interval_ms must not be below retry.interval_ms".into());
        }
        Ok(())
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .interval(Duration::from_millis(self.interval_ms))
            .backoff(self.backoff)
            .max_interval(Duration::from_millis(self.max_interval_ms))
            .max_attempts(self.max_attempts)
    }
}
