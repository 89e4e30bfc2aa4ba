//! Client configuration types.

use std::time::Duration;

use tidemq_core::DEFAULT_MAX_PACKET_SIZE;
use tidemq_net::{SocketOptions, TlsSetup};

use crate::retry::RetryPolicy;

/// Default number of queued outgoing publishes.
pub const DEFAULT_MAX_OUTGOING: usize = 10;

/// Default wait for a broker acknowledgement.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait before reconnecting.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default time to let a DISCONNECT drain before closing the socket.
pub const DEFAULT_DISCONNECT_LINGER: Duration = Duration::from_secs(2);

/// Default period of the client task.
pub const DEFAULT_TICK: Duration = Duration::from_millis(50);

/// Default socket send timeout for the broker connection.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client identifier.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Keep-alive interval (zero disables).
    pub keep_alive: Duration,
    /// Clean session flag.
    pub clean_session: bool,
    /// Reconnect after the connection drops.
    pub auto_reconnect: bool,
    /// Wait before reconnecting.
    pub reconnect_delay: Duration,
    /// Wait for a broker acknowledgement before the connection is given up on.
    pub ack_timeout: Duration,
    /// Time allowed for the DISCONNECT packet to go out.
    pub disconnect_linger: Duration,
    /// Period of the client task.
    pub tick: Duration,
    /// Outgoing publish queue capacity.
    pub max_outgoing: usize,
    /// Largest inbound packet; bigger ones are drained and dropped.
    pub max_packet_size: usize,
    /// Socket send timeout (also bounds connect and TLS handshake).
    pub send_timeout: Duration,
    /// Capacity of the application event channel.
    pub event_queue_size: usize,
    /// QoS 2 receipt redelivery.
    pub retry: RetryPolicy,
    /// TLS for the broker connection.
    pub tls: Option<TlsSetup>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            auto_reconnect: true,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            disconnect_linger: DEFAULT_DISCONNECT_LINGER,
            tick: DEFAULT_TICK,
            max_outgoing: DEFAULT_MAX_OUTGOING,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            event_queue_size: 64,
            retry: RetryPolicy::default(),
            tls: None,
        }
    }
}

impl ClientConfig {
    /// Create a new config with the given client ID.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    /// Set the client ID.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Set username and password.
    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the keep-alive interval. Rounded down to whole seconds on the wire.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn disconnect_linger(mut self, linger: Duration) -> Self {
        self.disconnect_linger = linger;
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn max_outgoing(mut self, max: usize) -> Self {
        self.max_outgoing = max;
        self
    }

    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn tls(mut self, tls: TlsSetup) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Keep-alive in whole seconds as sent in CONNECT.
    pub(crate) fn keep_alive_secs(&self) -> u16 {
        self.keep_alive.as_secs().min(u64::from(u16::MAX)) as u16
    }

    /// Options for the broker socket. The receive timeout allows one second
    /// of slack on top of the keep-alive.
    pub(crate) fn socket_options(&self) -> SocketOptions {
        let receive_timeout = if self.keep_alive.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_secs(u64::from(self.keep_alive_secs())) + Duration::from_secs(1)
        };
        SocketOptions::default()
            .send_timeout(self.send_timeout)
            .receive_timeout(receive_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_timeout_follows_keep_alive() {
        let config = ClientConfig::new("c").keep_alive(Duration::from_secs(30));
        assert_eq!(config.socket_options().receive_timeout, Duration::from_secs(31));
        assert_eq!(config.socket_options().send_timeout, DEFAULT_SEND_TIMEOUT);

        let config = config.keep_alive(Duration::ZERO);
        assert_eq!(config.socket_options().receive_timeout, Duration::ZERO);
    }

    #[test]
    fn test_keep_alive_is_clamped() {
        let config = ClientConfig::new("c").keep_alive(Duration::from_secs(100_000));
        assert_eq!(config.keep_alive_secs(), u16::MAX);
    }
}
