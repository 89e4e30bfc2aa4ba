//! Error types for tidemq-net.

use std::io;

use thiserror::Error;

/// Transport error type.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to resolve address: {0}")]
    Resolve(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Dispatcher is not running")]
    DispatcherGone,
}

pub type Result<T> = std::result::Result<T, NetError>;
