//! Redelivery schedule for unacknowledged QoS 2 receipts.

use std::time::Duration;

/// Default wait before the first redelivery.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Default cap on the wait between redeliveries.
pub const DEFAULT_MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of redeliveries before the connection is given up on.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Bounded retry with optional exponential back-off.
///
/// The wait before attempt `n` (1-based) is `interval * backoff^(n-1)`,
/// capped at `max_interval`. `max_attempts == 0` retries forever.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub backoff: f64,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            backoff: 1.0,
            max_interval: DEFAULT_MAX_RETRY_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Retry at a fixed interval, forever.
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            backoff: 1.0,
            max_interval: interval,
            max_attempts: 0,
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_interval(mut self, max: Duration) -> Self {
        self.max_interval = max;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Wait before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff.max(1.0).powi(exponent);
        let secs = self.interval.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            return self.max_interval.max(self.interval);
        }
        Duration::from_secs_f64(secs)
    }

    /// True once `attempts` retries have been made and no more are allowed.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fixed_interval() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(7), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default()
            .interval(Duration::from_secs(1))
            .backoff(2.0)
            .max_interval(Duration::from_secs(10));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(500), Duration::from_secs(10));
    }

    #[test]
    fn test_exhaustion() {
        let policy = RetryPolicy::default().max_attempts(3);
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(!RetryPolicy::unbounded(Duration::from_secs(5)).is_exhausted(u32::MAX));
    }
}
