//! Logging configuration.

use serde::Deserialize;

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self.level.to_ascii_lowercase().as_str() {
            "off" | "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            // env_logger also takes per-module directives
            level if level.contains('=') => Ok(()),
            level => Err(format!("Unknown log level: {}", level)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        for level in ["info", "DEBUG", "tidemq_net=trace"] {
            let config = LogConfig {
                level: level.to_string(),
            };
            assert!(config.validate().is_ok(), "{}", level);
        }
        let config = LogConfig {
            level: "loud".to_string(),
        };
        assert!(config.validate().is_err());
    }
}
