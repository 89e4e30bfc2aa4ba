//! tidemq-client - MQTT 3.1.1 client with QoS 0/1/2 delivery.
//!
//! The client keeps one connection to a broker on top of the tidemq
//! dispatcher, reconnects when it drops and resumes unacknowledged
//! deliveries.
//!
//! # Example
//!
//! ```ignore
//! use tidemq_client::{Client, ClientConfig, ClientEvent, QoS};
//! use tidemq_net::{Dispatcher, DispatcherConfig};
//!
//! let (dispatcher, _thread) = Dispatcher::spawn(DispatcherConfig::default())?;
//! let (client, events) = Client::new(ClientConfig::new("sensor-1"), dispatcher)?;
//! client.connect_to("localhost:1883", true)?;
//!
//! client.subscribe("commands/#", QoS::AtLeastOnce);
//! client.publish("sensors/temp", "25.5", QoS::AtLeastOnce, false)?;
//!
//! for event in events {
//!     if let ClientEvent::Message(message) = event {
//!         println!("{}: {:?}", message.topic, message.payload);
//!     }
//! }
//! ```

mod client;
mod config;
mod context;
mod error;
mod events;
mod inflight;
mod publication;
mod retry;
mod subscription;

pub use client::Client;
pub use config::ClientConfig;
pub use context::ClientContext;
pub use error::{ClientError, Result};
pub use events::{ClientEvent, Message};
pub use inflight::InFlight;
pub use publication::{Outgoing, Publication};
pub use retry::RetryPolicy;
pub use subscription::Subscription;

// Re-export useful types from core
pub use tidemq_core::packet::{ConnackCode, Publish, QoS};
