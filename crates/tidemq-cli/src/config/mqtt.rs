//! Broker connection configuration.

use std::time::Duration;

use serde::Deserialize;
use tidemq_client::{ClientConfig, QoS};

/// Default broker address.
pub const DEFAULT_BROKER: &str = "localhost:1883";

/// Default keep-alive in seconds.
pub const DEFAULT_KEEP_ALIVE: u64 = 60;

/// Default wait for an acknowledgement in milliseconds.
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 5000;

/// Default wait before reconnecting in milliseconds.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;

/// Broker connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker address as `host:port`.
    #[serde(default = "default_broker")]
    pub broker: String,
    /// Client identifier (default: `tidemq-<pid>`).
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keep-alive in seconds (0 disables).
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Outgoing publish queue capacity.
    #[serde(default = "default_max_outgoing")]
    pub max_outgoing: usize,
    /// Largest inbound packet in bytes.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// QoS used for publishing and subscribing (0, 1, or 2).
    pub qos: u8,
}

fn default_broker() -> String {
    DEFAULT_BROKER.to_string()
}
fn default_client_id() -> String {
    format!("tidemq-{}", std::process::id())
}
fn default_keep_alive() -> u64 {
    DEFAULT_KEEP_ALIVE
}
fn default_true() -> bool {
    true
}
fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}
fn default_ack_timeout_ms() -> u64 {
    DEFAULT_ACK_TIMEOUT_MS
}
fn default_max_outgoing() -> usize {
    ClientConfig::default().max_outgoing
}
fn default_max_packet_size() -> usize {
    ClientConfig::default().max_packet_size
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            auto_reconnect: true,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            max_outgoing: default_max_outgoing(),
            max_packet_size: default_max_packet_size(),
            qos: 0,
        }
    }
}

impl MqttConfig {
    /// Validate the MQTT configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.broker.is_empty() {
            return Err("mqtt.broker must not be empty".into());
        }
        if self.qos > 2 {
            return Err("mqtt.qos must be 0, 1, or 2".into());
        }
        if self.keep_alive > u64::from(u16::MAX) {
            return Err(format!("mqtt.keep_alive must be at most {}", u16::MAX));
        }
        if self.max_outgoing == 0 {
            return Err("mqtt.max_outgoing must be at least 1".into());
        }
        if self.max_packet_size == 0 {
            return Err("mqtt.max_packet_size must be at least 1".into());
        }
        if self.password.is_some() && self.username.is_none() {
            return Err("mqtt.password requires mqtt.username".into());
        }
        if self.client_id.is_empty() && !self.clean_session {
            return Err("an empty mqtt.client_id requires mqtt.clean_session".into());
        }
        Ok(())
    }

    pub fn qos(&self) -> QoS {
        QoS::try_from(self.qos).unwrap_or_default()
    }

    /// Client settings from this section.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.client_id.as_str())
            .keep_alive(Duration::from_secs(self.keep_alive))
            .clean_session(self.clean_session)
            .auto_reconnect(self.auto_reconnect)
            .reconnect_delay(Duration::from_millis(self.reconnect_delay_ms))
            .ack_timeout(Duration::from_millis(self.ack_timeout_ms))
            .max_outgoing(self.max_outgoing)
            .max_packet_size(self.max_packet_size);
        if let Some(username) = &self.username {
            config.username = Some(username.clone());
            config.password = self.password.as_ref().map(|p| p.as_bytes().to_vec());
        }
        config
    }
}
