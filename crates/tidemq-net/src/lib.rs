//! tidemq-net - non-blocking sockets for framed protocols.
//!
//! A single [`Dispatcher`] thread owns every socket and drives it from a mio
//! poll loop. Sockets are generic over a [`tidemq_core::Protocol`] that
//! tells them how to cut the byte stream into packets; plain TCP and rustls
//! TLS transports are supported on both the connecting and accepting side.
//!
//! Applications hold a [`SocketHandle`] to queue packets and receive
//! [`SocketEvent`]s on a bounded channel. A full event channel throttles the
//! socket instead of dropping data.

pub mod broker;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod options;
pub mod server;
pub mod socket;
pub mod tls;
pub mod transmit;
pub mod transport;

#[cfg(test)]
mod testing;

pub use broker::Broker;
pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use error::{NetError, Result};
pub use events::{ConnectionStatus, NetworkStatus, SocketEvent};
pub use options::{DispatcherConfig, SocketOptions};
pub use server::{AcceptedClient, ClientPool, PoolSlot, ServerHandle};
pub use socket::{resolve, SocketHandle, SocketId, SocketState};
pub use tls::{TlsConfig, TlsSetup};
