//! tidemq-core - MQTT 3.1.1 framing and codec.
//!
//! This crate provides the framing contract transports are written against,
//! the incremental MQTT packet assembler, the framed and typed packet
//! representations and the packet identifier allocator. It is shared by the
//! network and client crates.

pub mod error;
pub mod frame;
pub mod framing;
pub mod packet;
pub mod packet_id;
pub mod protocol;
pub mod varint;

pub use error::{Error, ProtocolError, Result};
pub use frame::MqttPacket;
pub use framing::{Disassembly, Protocol};
pub use packet::*;
pub use packet_id::{next_packet_id, PacketIdAllocator};
pub use protocol::{MqttProtocol, DEFAULT_MAX_PACKET_SIZE};
