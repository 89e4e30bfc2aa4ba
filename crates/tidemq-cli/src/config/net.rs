//! Dispatcher and socket configuration.

use std::time::Duration;

use serde::Deserialize;
use tidemq_net::DispatcherConfig;

/// Default dispatcher poll wait in milliseconds.
pub const DEFAULT_POLL_WAIT_MS: u64 = 10;

/// Default socket send timeout in milliseconds.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 1000;

/// Default client tick in milliseconds.
pub const DEFAULT_TICK_MS: u64 = 50;

/// Dispatcher and socket configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Bounded wait of one dispatcher iteration.
    #[serde(default = "default_poll_wait_ms")]
    pub poll_wait_ms: u64,
    /// Maximum time a connect, handshake or send may stay blocked.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Period of the client task.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_poll_wait_ms() -> u64 {
    DEFAULT_POLL_WAIT_MS
}
fn default_send_timeout_ms() -> u64 {
    DEFAULT_SEND_TIMEOUT_MS
}
fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            poll_wait_ms: DEFAULT_POLL_WAIT_MS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            tick_ms: DEFAULT_TICK_MS,
        }
    }
}

impl NetConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_wait_ms == 0 {
            return Err("net.poll_wait_ms must be at least 1".into());
        }
        if self.tick_ms == 0 {
            return Err("net.tick_ms must be at least 1".into());
        }
        Ok(())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default().poll_wait(Duration::from_millis(self.poll_wait_ms))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_tick_fails() {
        let config = NetConfig {
            tick_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dispatcher_config() {
        let config = NetConfig {
            poll_wait_ms: 25,
            ..Default::default()
        };
        assert_eq!(
            config.dispatcher_config().poll_wait,
            Duration::from_millis(25)
        );
    }
}
