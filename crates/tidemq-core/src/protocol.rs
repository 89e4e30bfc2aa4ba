//! Incremental MQTT packet assembly.

use crate::frame::MqttPacket;
use crate::framing::Protocol;
use crate::varint::{self, CONTINUATION_BIT, MAX_ENCODED_LEN};

/// Default limit on the remaining length of an inbound packet.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    RemainingLength,
    Data,
}

/// Assembles [`MqttPacket`]s from a byte stream.
///
/// Reads the fixed header byte, then the remaining length one byte at a time,
/// then the body in one request. Packets whose remaining length exceeds
/// `max_packet_size` are drained in chunks of at most that size into the
/// same region of the buffer and handed out flagged as too big.
#[derive(Debug)]
pub struct MqttProtocol {
    state: State,
    remaining_bytes_to_read: usize,
    bytes_received: usize,
    header_len: usize,
    max_packet_size: usize,
    too_big: bool,
    error: bool,
}

impl MqttProtocol {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            state: State::Start,
            remaining_bytes_to_read: 1,
            bytes_received: 0,
            header_len: 0,
            max_packet_size: max_packet_size.max(1),
            too_big: false,
            error: false,
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    pub fn is_too_big(&self) -> bool {
        self.too_big
    }

    fn header_complete(&mut self, packet: &mut MqttPacket) {
        self.header_len = self.bytes_received;
        let remaining = match varint::decode(&packet.data[1..self.header_len]) {
            Ok(Some((value, _))) => value,
            _ => {
                self.error = true;
                return;
            }
        };

        self.remaining_bytes_to_read = remaining;
        if remaining > self.max_packet_size {
            log::debug!(
                "Too big packet detected: {} > {}",
                remaining,
                self.max_packet_size
            );
            self.too_big = true;
            packet.too_big = true;
            self.state = State::Data;
        } else if remaining > 0 {
            self.state = State::Data;
        }
    }
}

impl Default for MqttProtocol {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl Protocol for MqttProtocol {
    type Packet = MqttPacket;

    fn wanted_amount(&mut self, _packet: &mut MqttPacket) -> usize {
        if self.too_big {
            self.remaining_bytes_to_read.min(self.max_packet_size)
        } else {
            self.remaining_bytes_to_read
        }
    }

    fn write_pos<'a>(&mut self, packet: &'a mut MqttPacket) -> &'a mut [u8] {
        if self.bytes_received == 0 {
            packet.data.clear();
            packet.too_big = false;
        }

        let wanted = self.wanted_amount(packet);
        let (required, pos) = if self.too_big {
            // Drained bytes all land right after the header and are never read
            (self.header_len + self.max_packet_size, self.header_len)
        } else {
            (self.bytes_received + wanted, self.bytes_received)
        };

        packet.data.resize(required, 0);
        &mut packet.data[pos..]
    }

    fn on_bytes_received(&mut self, packet: &mut MqttPacket, length: usize) {
        if length == 0 || self.error {
            return;
        }
        self.bytes_received += length;

        match self.state {
            State::Start => {
                self.state = State::RemainingLength;
                self.remaining_bytes_to_read = 1;
            }
            State::RemainingLength => {
                let last = packet.data[self.bytes_received - 1];
                if last & CONTINUATION_BIT == 0 {
                    self.header_complete(packet);
                } else if self.bytes_received - 1 >= MAX_ENCODED_LEN {
                    log::error!("Invalid remaining length");
                    self.error = true;
                } else {
                    self.remaining_bytes_to_read = 1;
                }
            }
            State::Data => {
                self.remaining_bytes_to_read = self.remaining_bytes_to_read.saturating_sub(length);
            }
        }

        if self.remaining_bytes_to_read == 0 && !self.too_big {
            packet.data.truncate(self.bytes_received);
        }
    }

    fn is_complete(&self, _packet: &MqttPacket) -> bool {
        !self.error && self.state != State::Start && self.remaining_bytes_to_read == 0
    }

    fn is_error(&self) -> bool {
        self.error
    }

    fn packet_consumed(&mut self) {
        self.state = State::Start;
        self.error = false;
        self.too_big = false;
        self.remaining_bytes_to_read = 1;
        self.bytes_received = 0;
        self.header_len = 0;
    }

    fn reset(&mut self) {
        self.packet_consumed();
    }
}
