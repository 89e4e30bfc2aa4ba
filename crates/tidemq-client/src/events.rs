//! Client events and state types.

use std::time::Duration;

use bytes::Bytes;
use tidemq_core::packet::{ConnackCode, Publish, QoS};

/// Application message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was published to.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// QoS the message was delivered with.
    pub qos: QoS,
    /// Whether this is a retained message.
    pub retain: bool,
}

impl From<&Publish> for Message {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: String::from_utf8_lossy(&publish.topic).into_owned(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}

/// Events returned by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Broker accepted the connection.
    Connected {
        /// Whether a previous session was restored.
        session_present: bool,
    },
    /// Broker refused the connection.
    Refused(ConnackCode),
    /// Connection lost or closed.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// About to reconnect.
    Reconnecting {
        /// Reconnection attempt since the last successful connect (1-based).
        attempt: u32,
        /// Delay that preceded this attempt.
        delay: Duration,
    },
    /// Received a publish message.
    Message(Message),
}

/// Client state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientState {
    /// No broker session; waiting for the transport.
    Idle,
    /// CONNECT sent, waiting for CONNACK.
    ConnectToBroker { clean_session: bool },
    /// Session established.
    Run {
        clean_session: bool,
        /// Outstanding packets from a previous connection have been dealt with.
        reconnect_handled: bool,
    },
    /// DISCONNECT queued, waiting for it to go out.
    Disconnect { since: std::time::Instant },
    /// Transport lost; waiting to reconnect.
    Disconnected,
}

impl ClientState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            ClientState::Idle => "Idle",
            ClientState::ConnectToBroker { .. } => "ConnectToBroker",
            ClientState::Run { .. } => "Run",
            ClientState::Disconnect { .. } => "Disconnect",
            ClientState::Disconnected => "Disconnected",
        }
    }
}
