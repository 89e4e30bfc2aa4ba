//! Command line client configuration.
//!
//! Supports configuration from:
//! - TOML file (default: `tidemq.toml`)
//! - Environment variables with `TIDEMQ__` prefix (double underscore for nesting)
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! Environment variable examples:
//! - `TIDEMQ__MQTT__BROKER=broker.local:1883`
//! - `TIDEMQ__MQTT__QOS=1`
//! - `TIDEMQ__LOG__LEVEL=debug`
//!
//! In-file substitution examples:
//! ```toml
//! [mqtt]
//! broker = "${MQTT_HOST:-localhost}:${MQTT_PORT:-1883}"
//! ```

mod log;
mod mqtt;
mod net;
mod retry;
mod tls;

use std::path::Path;
use std::sync::OnceLock;

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use tidemq_client::ClientConfig;

pub use log::LogConfig;
pub use mqtt::{MqttConfig, DEFAULT_BROKER, DEFAULT_KEEP_ALIVE};
pub use net::NetConfig;
pub use retry::RetryConfig;
pub use tls::TlsConfig;

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static pattern is valid")
    })
}

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string()
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub mqtt: MqttConfig,
    pub net: NetConfig,
    pub tls: TlsConfig,
    pub retry: RetryConfig,
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// Config parsing/loading error.
    Config(config::ConfigError),
    /// Invalid configuration value.
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl Config {
    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("mqtt.broker", DEFAULT_BROKER)?
            .set_default("mqtt.keep_alive", DEFAULT_KEEP_ALIVE as i64)?
            .set_default("mqtt.clean_session", true)?
            .set_default("mqtt.auto_reconnect", true)?
            .set_default("mqtt.qos", 0)?
            // TLS defaults (disabled by default)
            .set_default("tls.enabled", false)?
            .set_default("tls.accept_invalid_certs", false)?;
        Ok(builder)
    }

    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error; defaults and the environment apply.
    /// Environment overrides use the `TIDEMQ__` prefix with double
    /// underscores for nesting, e.g. `TIDEMQ__MQTT__CLIENT_ID=probe`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults()?;

        // Load from file with env var substitution
        let path = path.as_ref();
        if path.is_file() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("TIDEMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment overrides.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content);
        let cfg = Self::defaults()?
            .add_source(File::from_str(&substituted, FileFormat::Toml))
            .build()?;
        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate().map_err(ConfigError::Validation)?;
        self.mqtt.validate().map_err(ConfigError::Validation)?;
        self.net.validate().map_err(ConfigError::Validation)?;
        self.tls.validate().map_err(ConfigError::Validation)?;
        self.retry.validate().map_err(ConfigError::Validation)?;
        Ok(())
    }

    /// Client settings from all sections, except TLS which needs the
    /// certificate files loaded.
    pub fn client_config(&self) -> ClientConfig {
        self.mqtt
            .client_config()
            .send_timeout(self.net.send_timeout())
            .tick(self.net.tick())
            .retry(self.retry.policy())
    }
}
