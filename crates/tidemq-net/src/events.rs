//! Events raised by sockets and the network layer.

use std::net::SocketAddr;

/// Notification from a socket to the task that owns it.
#[derive(Debug)]
pub enum SocketEvent<T> {
    /// A complete inbound packet.
    DataAvailable(T),
    /// The last queued outbound packet has been written.
    TransmitBufferEmpty,
    /// The connection came up or went down.
    ConnectionStatus(ConnectionStatus),
}

/// Connection state change of a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected(SocketAddr),
    Disconnected { reason: String },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected(_))
    }
}

/// Availability of the network as a whole.
///
/// Published on a [`crate::Broker`]; the dispatcher defers socket starts
/// while the network is down and clients reconnect when it comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Up,
    Down,
}
