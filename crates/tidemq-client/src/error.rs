//! Client error types.

use std::io;

use thiserror::Error;

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] tidemq_core::Error),

    #[error("Network error: {0}")]
    Net(#[from] tidemq_net::NetError),

    #[error("Not connected")]
    NotConnected,

    #[error("Outgoing queue is full")]
    QueueFull,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
