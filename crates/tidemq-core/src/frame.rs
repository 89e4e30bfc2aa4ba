//! Framed MQTT packet buffer.
//!
//! [`MqttPacket`] holds the raw bytes of one control packet: fixed header,
//! variable header and payload. Both the inbound assembler and the outbound
//! encoder work on this type; [`crate::packet::Packet`] is the typed view.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::framing::Disassembly;
use crate::packet::{PacketType, QoS};
use crate::varint;

/// DUP flag bit in the fixed header of a PUBLISH.
pub const DUP_FLAG: u8 = 0x08;

/// Raw bytes of a single MQTT control packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MqttPacket {
    pub(crate) data: Vec<u8>,
    pub(crate) too_big: bool,
}

impl MqttPacket {
    /// Build a packet from type, fixed header flags and body.
    pub fn build(packet_type: PacketType, flags: u8, body: &[u8]) -> Result<Self> {
        let mut data = Vec::with_capacity(1 + varint::encoded_len(body.len()) + body.len());
        data.push(((packet_type as u8) << 4) | (flags & 0x0F));
        varint::encode_to_vec(body.len(), &mut data)?;
        data.extend_from_slice(body);
        Ok(Self {
            data,
            too_big: false,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Set when the announced remaining length exceeded the receive limit.
    ///
    /// The bytes of such a packet were overwritten while draining and must not
    /// be interpreted.
    pub fn is_too_big(&self) -> bool {
        self.too_big
    }

    /// Convert into immutable bytes for queueing and retransmission.
    pub fn freeze(self) -> Bytes {
        Bytes::from(self.data)
    }

    pub fn packet_type(&self) -> Result<PacketType> {
        let first = self
            .data
            .first()
            .ok_or(ProtocolError::IncompletePacket { needed: 1, have: 0 })?;
        Ok(PacketType::try_from(first >> 4)?)
    }

    /// Lower four bits of the fixed header.
    pub fn flags(&self) -> u8 {
        self.data.first().map_or(0, |b| b & 0x0F)
    }

    /// QoS bits of the fixed header.
    ///
    /// Only meaningful for PUBLISH; other types use these bits as reserved flags.
    pub fn qos(&self) -> Result<QoS> {
        Ok(QoS::try_from((self.flags() >> 1) & 0x03)?)
    }

    pub fn is_dup(&self) -> bool {
        self.flags() & DUP_FLAG != 0
    }

    pub fn is_retain(&self) -> bool {
        self.flags() & 0x01 != 0
    }

    /// Mark the packet as a redelivery. Touches only the DUP bit.
    pub fn set_dup_flag(&mut self) {
        if let Some(first) = self.data.first_mut() {
            *first |= DUP_FLAG;
        }
    }

    /// Remaining length and fixed header size, once the length is complete.
    fn header(&self) -> Result<(usize, usize)> {
        if self.data.len() < 2 {
            return Err(ProtocolError::IncompletePacket {
                needed: 2,
                have: self.data.len(),
            }
            .into());
        }
        match varint::decode(&self.data[1..])? {
            Some((remaining, consumed)) => Ok((remaining, 1 + consumed)),
            None => Err(ProtocolError::IncompletePacket {
                needed: self.data.len() + 1,
                have: self.data.len(),
            }
            .into()),
        }
    }

    /// Value of the remaining length field.
    pub fn remaining_length(&self) -> Result<usize> {
        self.header().map(|(remaining, _)| remaining)
    }

    /// Offset of the variable header, i.e. the fixed header length.
    pub fn variable_header_start(&self) -> Result<usize> {
        self.header().map(|(_, start)| start)
    }

    pub fn has_packet_identifier(&self) -> bool {
        match self.packet_type() {
            Ok(PacketType::Publish) => self.qos().map_or(false, |q| q != QoS::AtMostOnce),
            Ok(t) => t.has_packet_identifier(),
            Err(_) => false,
        }
    }

    pub fn has_payload(&self) -> bool {
        self.packet_type().map_or(false, PacketType::has_payload)
    }

    fn topic_length(&self, start: usize) -> Result<usize> {
        match self.data.get(start..start + 2) {
            Some(len) => Ok(u16::from_be_bytes([len[0], len[1]]) as usize),
            None => Err(ProtocolError::MalformedPacket("PUBLISH without topic length".into()).into()),
        }
    }

    /// Length of the variable header for this packet type.
    pub fn variable_header_length(&self) -> Result<usize> {
        let start = self.variable_header_start()?;
        let len = match self.packet_type()? {
            // Protocol name (2 + 4), level, connect flags, keep alive
            PacketType::Connect => 10,
            PacketType::Connack => 2,
            PacketType::Publish => {
                let id_len = if self.has_packet_identifier() { 2 } else { 0 };
                2 + self.topic_length(start)? + id_len
            }
            PacketType::Pingreq | PacketType::Pingresp | PacketType::Disconnect => 0,
            _ => 2,
        };
        Ok(len)
    }

    /// Number of payload bytes present in the buffer.
    pub fn payload_length(&self) -> Result<usize> {
        let start = self.variable_header_start()? + self.variable_header_length()?;
        Ok(self.data.len().saturating_sub(start))
    }

    /// Packet identifier, for packet kinds that carry one.
    pub fn packet_identifier(&self) -> Option<u16> {
        if !self.has_packet_identifier() {
            return None;
        }
        let start = self.variable_header_start().ok()?;
        let offset = match self.packet_type().ok()? {
            PacketType::Publish => start + 2 + self.topic_length(start).ok()?,
            _ => start,
        };
        let id = self.data.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([id[0], id[1]]))
    }

    /// Topic of a PUBLISH.
    pub fn topic(&self) -> Option<&[u8]> {
        if self.packet_type().ok()? != PacketType::Publish {
            return None;
        }
        let start = self.variable_header_start().ok()? + 2;
        let len = self.topic_length(start - 2).ok()?;
        self.data.get(start..start + len)
    }

    /// Payload bytes, empty if the packet has none.
    pub fn payload(&self) -> &[u8] {
        let start = self
            .variable_header_start()
            .and_then(|s| Ok(s + self.variable_header_length()?));
        match start {
            Ok(start) if start <= self.data.len() => &self.data[start..],
            _ => &[],
        }
    }

    /// Everything after the fixed header.
    pub fn body(&self) -> Result<&[u8]> {
        let start = self.variable_header_start()?;
        Ok(&self.data[start.min(self.data.len())..])
    }

    /// Check that the lengths of the packet add up.
    ///
    /// Fails for packets that were drained because they exceeded the receive
    /// limit, for truncated or padded buffers, for a variable header that runs
    /// past the remaining length and for a payload on a type that has none.
    pub fn validate_packet(&self) -> std::result::Result<(), ProtocolError> {
        let (remaining, header_len) = self.header().map_err(into_protocol)?;

        if self.too_big {
            return Err(ProtocolError::PacketTooLarge {
                size: remaining,
                max: self.data.len().saturating_sub(header_len),
            });
        }

        let left_over = self.data.len() as isize - (header_len + remaining) as isize;
        if left_over != 0 {
            return Err(ProtocolError::LengthMismatch(left_over));
        }

        let packet_type = self.packet_type().map_err(into_protocol)?;
        let var_len = self.variable_header_length().map_err(into_protocol)?;
        if var_len > remaining {
            return Err(ProtocolError::MalformedPacket(format!(
                "{} variable header of {} bytes exceeds remaining length {}",
                packet_type.as_str(),
                var_len,
                remaining
            )));
        }

        if !packet_type.has_payload() && remaining > var_len {
            return Err(ProtocolError::MalformedPacket(format!(
                "{} carries {} unexpected payload bytes",
                packet_type.as_str(),
                remaining - var_len
            )));
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate_packet().is_ok()
    }

    /// Log the packet layout at trace level.
    pub fn dump(&self, header: &str) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }
        let name = self.packet_type().map_or("UNKNOWN", PacketType::as_str);
        log::trace!(
            "{}: [{}] raw={} fix={:?} var={:?} pay={:?} id={:?} q={:?} r={} d={}",
            header,
            name,
            self.data.len(),
            self.variable_header_start().ok(),
            self.variable_header_length().ok(),
            self.payload_length().ok(),
            self.packet_identifier(),
            self.qos().ok().map(|q| q as u8),
            self.is_retain(),
            self.is_dup(),
        );
        if self.has_payload() && !self.payload().is_empty() {
            log::trace!("{}: {}", header, String::from_utf8_lossy(self.payload()));
        }
    }
}

fn into_protocol(err: crate::error::Error) -> ProtocolError {
    match err {
        crate::error::Error::Protocol(e) => e,
        crate::error::Error::Io(e) => ProtocolError::MalformedPacket(e.to_string()),
    }
}

impl From<Vec<u8>> for MqttPacket {
    fn from(data: Vec<u8>) -> Self {
        Self {
            data,
            too_big: false,
        }
    }
}

impl From<Bytes> for MqttPacket {
    fn from(data: Bytes) -> Self {
        Self::from(data.to_vec())
    }
}

impl Disassembly for MqttPacket {
    fn send_length(&self) -> usize {
        self.data.len()
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_flags() {
        // 0x3D = PUBLISH, DUP=1, QoS=2, RETAIN=1
        let packet = MqttPacket::from(vec![0x3D, 0x05, 0x00, 0x01, b't', 0x00, 0x01]);
        assert_eq!(packet.packet_type().unwrap(), PacketType::Publish);
        assert_eq!(packet.qos().unwrap(), QoS::ExactlyOnce);
        assert!(packet.is_dup());
        assert!(packet.is_retain());
        assert_eq!(packet.packet_identifier(), Some(1));
        assert_eq!(packet.topic(), Some(&b"t"[..]));
        assert!(packet.is_valid());
    }

    #[test]
    fn test_set_dup_flag_only_touches_bit_3() {
        let mut packet = MqttPacket::from(vec![0x32, 0x05, 0x00, 0x01, b't', 0x00, 0x01]);
        packet.set_dup_flag();
        assert_eq!(packet.as_slice()[0], 0x3A);
        assert_eq!(packet.qos().unwrap(), QoS::AtLeastOnce);
        assert!(!packet.is_retain());
    }

    #[test]
    fn test_layout_of_qos1_publish() {
        let packet = MqttPacket::build(
            PacketType::Publish,
            0x02,
            &[0x00, 0x03, b'a', b'/', b'b', 0x12, 0x34, b'x', b'y', b'z'],
        )
        .unwrap();
        assert_eq!(packet.remaining_length().unwrap(), 10);
        assert_eq!(packet.variable_header_start().unwrap(), 2);
        assert_eq!(packet.variable_header_length().unwrap(), 7);
        assert_eq!(packet.payload_length().unwrap(), 3);
        assert_eq!(packet.payload(), b"xyz");
        assert_eq!(packet.packet_identifier(), Some(0x1234));
    }

    #[test]
    fn test_build_uses_multi_byte_length() {
        let body = vec![0u8; 200];
        let packet = MqttPacket::build(PacketType::Publish, 0, &{
            let mut b = vec![0x00, 0x01, b't'];
            b.extend_from_slice(&body);
            b
        })
        .unwrap();
        assert_eq!(packet.variable_header_start().unwrap(), 3);
        assert_eq!(packet.remaining_length().unwrap(), 203);
        assert!(packet.is_valid());
    }

    #[test]
    fn test_validate_detects_truncation() {
        let packet = MqttPacket::from(vec![0x40, 0x02, 0x00]);
        assert_eq!(
            packet.validate_packet(),
            Err(ProtocolError::LengthMismatch(-1))
        );
    }

    #[test]
    fn test_validate_rejects_payload_on_puback() {
        let packet = MqttPacket::from(vec![0x40, 0x03, 0x00, 0x01, 0xFF]);
        assert!(matches!(
            packet.validate_packet(),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_validate_rejects_topic_past_end() {
        let packet = MqttPacket::from(vec![0x30, 0x03, 0x00, 0x09, b't']);
        assert!(!packet.is_valid());
    }

    #[test]
    fn test_too_big_is_invalid() {
        let mut packet = MqttPacket::from(vec![0x30, 0x80, 0x01, 0x00, 0x00]);
        packet.too_big = true;
        assert_eq!(
            packet.validate_packet(),
            Err(ProtocolError::PacketTooLarge { size: 128, max: 2 })
        );
    }

    #[test]
    fn test_zero_length_packets_valid() {
        assert!(MqttPacket::from(vec![0xD0, 0x00]).is_valid());
        assert!(MqttPacket::from(vec![0xE0, 0x00]).is_valid());
        assert_eq!(MqttPacket::from(vec![0xD0, 0x00]).packet_identifier(), None);
    }
}
