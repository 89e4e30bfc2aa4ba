//! MQTT 3.1.1 packet types and codec.
//!
//! [`Packet`] is the closed set of control packets. Decoding works on a
//! complete, validated [`MqttPacket`] frame; encoding produces one.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::frame::MqttPacket;

/// Protocol name sent in CONNECT.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

impl PacketType {
    /// Fixed header flags mandated for this type (PUBLISH carries its own).
    pub fn fixed_flags(self) -> u8 {
        match self {
            PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe => 0x02,
            _ => 0x00,
        }
    }

    /// Whether packets of this type carry a packet identifier.
    ///
    /// PUBLISH only does for QoS > 0, which the frame decides from its flags.
    pub fn has_packet_identifier(self) -> bool {
        matches!(
            self,
            PacketType::Puback
                | PacketType::Pubrec
                | PacketType::Pubrel
                | PacketType::Pubcomp
                | PacketType::Subscribe
                | PacketType::Suback
                | PacketType::Unsubscribe
                | PacketType::Unsuback
        )
    }

    /// Whether packets of this type carry a payload.
    pub fn has_payload(self) -> bool {
        matches!(
            self,
            PacketType::Connect
                | PacketType::Publish
                | PacketType::Subscribe
                | PacketType::Suback
                | PacketType::Unsubscribe
        )
    }

    /// Human readable name used in packet dumps.
    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::Connect => "CONNECT",
            PacketType::Connack => "CONNACK",
            PacketType::Publish => "PUBLISH",
            PacketType::Puback => "PUBACK",
            PacketType::Pubrec => "PUBREC",
            PacketType::Pubrel => "PUBREL",
            PacketType::Pubcomp => "PUBCOMP",
            PacketType::Subscribe => "SUBSCRIBE",
            PacketType::Suback => "SUBACK",
            PacketType::Unsubscribe => "UNSUBSCRIBE",
            PacketType::Unsuback => "UNSUBACK",
            PacketType::Pingreq => "PINGREQ",
            PacketType::Pingresp => "PINGRESP",
            PacketType::Disconnect => "DISCONNECT",
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT packet names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQos(value)),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnackCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::UnacceptableProtocolVersion),
            2 => Ok(ConnackCode::IdentifierRejected),
            3 => Ok(ConnackCode::ServerUnavailable),
            4 => Ok(ConnackCode::BadUsernamePassword),
            5 => Ok(ConnackCode::NotAuthorized),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid CONNACK return code: {}",
                value
            ))),
        }
    }
}

/// SUBACK return code for a rejected topic filter.
pub const SUBACK_FAILURE: u8 = 0x80;

/// MQTT Packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// CONNACK packet data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: Bytes,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    /// Topic as a string slice, if it is valid UTF-8.
    pub fn topic_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.topic).ok()
    }
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

impl From<Publish> for Packet {
    fn from(publish: Publish) -> Self {
        Packet::Publish(publish)
    }
}

impl From<Subscribe> for Packet {
    fn from(subscribe: Subscribe) -> Self {
        Packet::Subscribe(subscribe)
    }
}

impl From<Unsubscribe> for Packet {
    fn from(unsubscribe: Unsubscribe) -> Self {
        Packet::Unsubscribe(unsubscribe)
    }
}

impl Packet {
    /// Control packet type.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback { .. } => PacketType::Puback,
            Packet::Pubrec { .. } => PacketType::Pubrec,
            Packet::Pubrel { .. } => PacketType::Pubrel,
            Packet::Pubcomp { .. } => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback { .. } => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Packet identifier, for packets that carry one.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(p) => p.packet_id,
            Packet::Puback { packet_id }
            | Packet::Pubrec { packet_id }
            | Packet::Pubrel { packet_id }
            | Packet::Pubcomp { packet_id }
            | Packet::Unsuback { packet_id } => Some(*packet_id),
            Packet::Subscribe(s) => Some(s.packet_id),
            Packet::Suback(s) => Some(s.packet_id),
            Packet::Unsubscribe(u) => Some(u.packet_id),
            _ => None,
        }
    }

    /// Decode a complete frame.
    ///
    /// The frame is validated first; oversized frames and frames whose
    /// lengths do not add up are rejected without looking at their contents.
    pub fn decode(frame: &MqttPacket) -> Result<Packet> {
        frame.validate_packet()?;

        let packet_type = frame.packet_type()?;
        let flags = frame.flags();

        // MQTT-3.6.1-1, MQTT-3.8.1-1, MQTT-3.10.1-1
        if packet_type != PacketType::Publish && flags != packet_type.fixed_flags() {
            return Err(ProtocolError::MalformedPacket(format!(
                "{:?} fixed header flags must be {:#04x}, got {:#04x}",
                packet_type,
                packet_type.fixed_flags(),
                flags
            ))
            .into());
        }

        let body = frame.body()?;
        let packet = match packet_type {
            PacketType::Connect => decode_connect(body)?,
            PacketType::Connack => decode_connack(body)?,
            PacketType::Publish => decode_publish(flags, body)?,
            PacketType::Puback => Packet::Puback {
                packet_id: Decoder::new(body).read_u16()?,
            },
            PacketType::Pubrec => Packet::Pubrec {
                packet_id: Decoder::new(body).read_u16()?,
            },
            PacketType::Pubrel => Packet::Pubrel {
                packet_id: Decoder::new(body).read_u16()?,
            },
            PacketType::Pubcomp => Packet::Pubcomp {
                packet_id: Decoder::new(body).read_u16()?,
            },
            PacketType::Subscribe => decode_subscribe(body)?,
            PacketType::Suback => decode_suback(body)?,
            PacketType::Unsubscribe => decode_unsubscribe(body)?,
            PacketType::Unsuback => Packet::Unsuback {
                packet_id: Decoder::new(body).read_u16()?,
            },
            PacketType::Pingreq => Packet::Pingreq,
            PacketType::Pingresp => Packet::Pingresp,
            PacketType::Disconnect => Packet::Disconnect,
        };

        Ok(packet)
    }

    /// Serialize into a frame ready for transmission.
    pub fn encode(&self) -> Result<MqttPacket> {
        let mut body = Vec::new();
        let mut flags = self.packet_type().fixed_flags();

        match self {
            Packet::Connect(connect) => encode_connect(connect, &mut body)?,
            Packet::Connack(connack) => {
                body.push(u8::from(connack.session_present));
                body.push(connack.code as u8);
            }
            Packet::Publish(publish) => {
                flags = publish_flags(publish);
                encode_publish(publish, &mut body)?;
            }
            Packet::Puback { packet_id }
            | Packet::Pubrec { packet_id }
            | Packet::Pubrel { packet_id }
            | Packet::Pubcomp { packet_id }
            | Packet::Unsuback { packet_id } => body.extend_from_slice(&packet_id.to_be_bytes()),
            Packet::Subscribe(subscribe) => {
                body.extend_from_slice(&subscribe.packet_id.to_be_bytes());
                for (topic, qos) in &subscribe.topics {
                    append_string(topic.as_bytes(), &mut body)?;
                    body.push(*qos as u8);
                }
            }
            Packet::Suback(suback) => {
                body.extend_from_slice(&suback.packet_id.to_be_bytes());
                body.extend_from_slice(&suback.return_codes);
            }
            Packet::Unsubscribe(unsubscribe) => {
                body.extend_from_slice(&unsubscribe.packet_id.to_be_bytes());
                for topic in &unsubscribe.topics {
                    append_string(topic.as_bytes(), &mut body)?;
                }
            }
            Packet::Pingreq | Packet::Pingresp | Packet::Disconnect => {}
        }

        MqttPacket::build(self.packet_type(), flags, &body)
    }
}

/// Decoder for packet bodies.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 }.into());
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::IncompletePacket {
                needed: 2,
                have: self.remaining(),
            }
            .into());
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            }
            .into());
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Length-prefixed raw bytes.
    pub fn read_binary(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_binary()?;
        // MQTT-1.5.3-2: UTF-8 string MUST NOT contain null character U+0000
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            )
            .into());
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let bytes = &self.buf[self.pos..];
        self.pos = self.buf.len();
        bytes
    }
}

/// Append a 16-bit length prefixed string.
pub fn append_string(value: &[u8], buf: &mut Vec<u8>) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        ProtocolError::MalformedPacket(format!("string of {} bytes is too long", value.len()))
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(value);
    Ok(())
}

fn publish_flags(publish: &Publish) -> u8 {
    let mut flags = (publish.qos as u8) << 1;
    if publish.dup {
        flags |= 0x08;
    }
    if publish.retain {
        flags |= 0x01;
    }
    flags
}

fn encode_connect(connect: &Connect, buf: &mut Vec<u8>) -> Result<()> {
    if connect.password.is_some() && connect.username.is_none() {
        return Err(
            ProtocolError::MalformedPacket("CONNECT password without user name".to_string())
                .into(),
        );
    }

    // Protocol name is a constant and can't overflow the length prefix
    buf.extend_from_slice(&(PROTOCOL_NAME.len() as u16).to_be_bytes());
    buf.extend_from_slice(PROTOCOL_NAME.as_bytes());
    buf.push(PROTOCOL_LEVEL);

    let mut connect_flags = 0u8;
    if connect.clean_session {
        connect_flags |= 0x02;
    }
    if connect.password.is_some() {
        connect_flags |= 0x40;
    }
    if connect.username.is_some() {
        connect_flags |= 0x80;
    }
    buf.push(connect_flags);
    buf.extend_from_slice(&connect.keep_alive.to_be_bytes());

    // Payload, in order: client identifier, user name, password. Lengths are
    // clamped rather than failing since the fields come from local config.
    for field in [
        Some(connect.client_id.as_bytes()),
        connect.username.as_ref().map(|u| u.as_bytes()),
        connect.password.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        let len = field.len().min(u16::MAX as usize);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
        buf.extend_from_slice(&field[..len]);
    }
    Ok(())
}

fn encode_publish(publish: &Publish, buf: &mut Vec<u8>) -> Result<()> {
    append_string(&publish.topic, buf)?;

    match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, _) => {}
        (_, Some(id)) => buf.extend_from_slice(&id.to_be_bytes()),
        (qos, None) => {
            return Err(ProtocolError::MalformedPacket(format!(
                "QoS {} PUBLISH without packet identifier",
                qos as u8
            ))
            .into())
        }
    }

    buf.extend_from_slice(&publish.payload);
    Ok(())
}

fn decode_connect(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);

    let protocol_name = dec.read_string()?;
    if protocol_name != PROTOCOL_NAME {
        return Err(ProtocolError::MalformedPacket(format!(
            "Invalid protocol name: {}",
            protocol_name
        ))
        .into());
    }
    let level = dec.read_u8()?;
    if level != PROTOCOL_LEVEL {
        return Err(ProtocolError::MalformedPacket(format!(
            "Unsupported protocol level: {}",
            level
        ))
        .into());
    }

    let flags = dec.read_u8()?;
    // MQTT-3.1.2-3: reserved flag must be zero
    if flags & 0x01 != 0 {
        return Err(ProtocolError::MalformedPacket("CONNECT reserved flag set".into()).into());
    }
    if flags & 0x04 != 0 {
        return Err(ProtocolError::MalformedPacket("Will messages are not supported".into()).into());
    }
    let keep_alive = dec.read_u16()?;
    let client_id = dec.read_string()?;

    let username = if flags & 0x80 != 0 {
        Some(dec.read_string()?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(dec.read_binary()?.to_vec())
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        client_id,
        keep_alive,
        clean_session: flags & 0x02 != 0,
        username,
        password,
    }))
}

fn decode_connack(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let ack_flags = dec.read_u8()?;
    let code = ConnackCode::try_from(dec.read_u8()?)?;
    Ok(Packet::Connack(Connack {
        session_present: ack_flags & 0x01 != 0,
        code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    let mut dec = Decoder::new(body);
    let topic = dec.read_binary()?;

    let packet_id = if qos != QoS::AtMostOnce {
        Some(dec.read_u16()?)
    } else {
        None
    };

    let payload = dec.read_rest();

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: Bytes::copy_from_slice(topic),
        packet_id,
        payload: Bytes::copy_from_slice(payload),
    }))
}

fn decode_subscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let topic = dec.read_string()?;

        // MQTT-4.7.3-1: Topic Filter must be at least 1 character
        if topic.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "Topic filter must be at least 1 character".into(),
            )
            .into());
        }

        let qos = QoS::try_from(dec.read_u8()?)?;
        topics.push((topic, qos));
    }

    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBSCRIBE with no topics".into()).into());
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
}

fn decode_suback(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;
    let return_codes = dec.read_rest().to_vec();
    Ok(Packet::Suback(Suback {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let topic = dec.read_string()?;
        if topic.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "Topic filter must be at least 1 character".into(),
            )
            .into());
        }
        topics.push(topic);
    }

    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("UNSUBSCRIBE with no topics".into()).into());
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, topics }))
}
