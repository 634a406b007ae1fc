//! MQTT 3.1.1 control packets and their wire encoding.
//!
//! Every packet is encoded into, and decoded from, a plain byte slice. Decoded
//! packets borrow their strings and payloads from the input slice, so decoding
//! never copies message data.
//!
//! # Wire Format
//!
//! Each packet starts with a fixed header:
//!
//! ```text
//! ┌───────────────┬───────────────┬───────────────────────────────┐
//! │ type (4 bits) │ flags (4 bits)│ remaining length (1-4 bytes)  │
//! └───────────────┴───────────────┴───────────────────────────────┘
//! ```
//!
//! The remaining length counts every byte after the fixed header. It is a
//! variable-length integer carrying 7 bits per byte, least significant group
//! first, with the high bit set on every byte except the last.
//!
//! Strings and binary fields carry a 2-byte big-endian length prefix.
//!
//! # Examples
//!
//! ```rust
//! use libmqtt::network::application::mqtt::packet::{Packet, Publish, QoS};
//!
//! let publish = Publish {
//!     dup: false,
//!     qos: QoS::AtLeastOnce,
//!     retain: false,
//!     topic: "sensors/temperature",
//!     packet_id: 7,
//!     payload: b"23.5",
//! };
//!
//! let mut buf = [0u8; 64];
//! let len = Packet::Publish(publish).encode(&mut buf).unwrap();
//!
//! let (decoded, consumed) = Packet::decode(&buf[..len]).unwrap().unwrap();
//! assert_eq!(consumed, len);
//! assert_eq!(decoded, Packet::Publish(publish));
//! ```

use heapless::Vec;

use super::error::Error;

/// Protocol name carried in every CONNECT packet.
pub const PROTOCOL_NAME: &str = "MQTT";
/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;
/// Largest value the remaining length field can carry.
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;
/// Most topics a single SUBSCRIBE or UNSUBSCRIBE may carry.
pub const MAX_TOPICS: usize = 8;

// CONNECT flag bits
const CONNECT_RESERVED: u8 = 0x01;
const CONNECT_CLEAN_SESSION: u8 = 0x02;
const CONNECT_WILL_FLAG: u8 = 0x04;
const CONNECT_WILL_QOS_SHIFT: u8 = 3;
const CONNECT_WILL_QOS_MASK: u8 = 0x18;
const CONNECT_WILL_RETAIN: u8 = 0x20;
const CONNECT_PASSWORD: u8 = 0x40;
const CONNECT_USER_NAME: u8 = 0x80;

// PUBLISH flag bits
const PUBLISH_DUP: u8 = 0x08;
const PUBLISH_QOS_MASK: u8 = 0x06;
const PUBLISH_RETAIN: u8 = 0x01;

const SUBACK_FAILURE: u8 = 0x80;

/// The fourteen MQTT 3.1.1 control packet types.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ControlType {
    /// Client request to connect to a broker.
    Connect = 1,
    /// Connect acknowledgement.
    ConnAck = 2,
    /// Publish message.
    Publish = 3,
    /// QoS 1 publish acknowledgement.
    PubAck = 4,
    /// QoS 2 publish received, part 1.
    PubRec = 5,
    /// QoS 2 publish release, part 2.
    PubRel = 6,
    /// QoS 2 publish complete, part 3.
    PubComp = 7,
    /// Subscribe request.
    Subscribe = 8,
    /// Subscribe acknowledgement.
    SubAck = 9,
    /// Unsubscribe request.
    Unsubscribe = 10,
    /// Unsubscribe acknowledgement.
    UnsubAck = 11,
    /// Ping request.
    PingReq = 12,
    /// Ping response.
    PingResp = 13,
    /// Client is disconnecting.
    Disconnect = 14,
}

impl ControlType {
    /// Fixed header flags this type must carry, or `None` for PUBLISH whose
    /// flags are variable.
    fn required_flags(self) -> Option<u8> {
        match self {
            ControlType::Publish => None,
            ControlType::PubRel | ControlType::Subscribe | ControlType::Unsubscribe => Some(0x02),
            _ => Some(0x00),
        }
    }
}

impl TryFrom<u8> for ControlType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ControlType::Connect),
            2 => Ok(ControlType::ConnAck),
            3 => Ok(ControlType::Publish),
            4 => Ok(ControlType::PubAck),
            5 => Ok(ControlType::PubRec),
            6 => Ok(ControlType::PubRel),
            7 => Ok(ControlType::PubComp),
            8 => Ok(ControlType::Subscribe),
            9 => Ok(ControlType::SubAck),
            10 => Ok(ControlType::Unsubscribe),
            11 => Ok(ControlType::UnsubAck),
            12 => Ok(ControlType::PingReq),
            13 => Ok(ControlType::PingResp),
            14 => Ok(ControlType::Disconnect),
            _ => Err(Error::InvalidControlType),
        }
    }
}

/// Quality of Service levels for MQTT messages.
///
/// # Examples
///
/// ```rust
/// use libmqtt::network::application::mqtt::QoS;
///
/// assert_eq!(QoS::AtMostOnce as u8, 0);
/// assert_eq!(QoS::try_from(2), Ok(QoS::ExactlyOnce));
/// assert!(QoS::try_from(3).is_err());
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    /// **QoS 0**: At most once delivery. No acknowledgement.
    #[default]
    AtMostOnce = 0,
    /// **QoS 1**: At least once delivery. Acknowledged with PUBACK.
    AtLeastOnce = 1,
    /// **QoS 2**: Exactly once delivery. Four-way PUBLISH, PUBREC, PUBREL,
    /// PUBCOMP handshake.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(Error::InvalidQos),
        }
    }
}

/// The fixed header that starts every MQTT packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FixedHeader {
    /// Packet type from the high nibble of the first byte.
    pub control_type: ControlType,
    /// Flags from the low nibble of the first byte.
    pub flags: u8,
    /// Number of bytes following the fixed header.
    pub remaining_length: u32,
}

impl FixedHeader {
    /// Number of bytes this header occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        1 + remaining_length_len(self.remaining_length)
    }

    /// Total packet size: header plus body.
    pub fn packet_len(&self) -> usize {
        self.encoded_len() + self.remaining_length as usize
    }

    /// Writes the header to the start of `buf`, returning the bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, Error> {
        validate_flags(self.control_type, self.flags)?;
        if self.remaining_length > MAX_REMAINING_LENGTH {
            return Err(Error::InvalidRemainingLength);
        }
        if buf.len() < self.encoded_len() {
            return Err(Error::BufferTooSmall);
        }
        buf[0] = ((self.control_type as u8) << 4) | self.flags;
        let len = encode_remaining_length(&mut buf[1..], self.remaining_length)?;
        Ok(1 + len)
    }

    /// Parses a fixed header from the start of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` ends before the header does.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, Error> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        let control_type = ControlType::try_from(first >> 4)?;
        let flags = first & 0x0F;
        validate_flags(control_type, flags)?;

        match decode_remaining_length(&buf[1..])? {
            Some((remaining_length, len)) => Ok(Some((
                Self {
                    control_type,
                    flags,
                    remaining_length,
                },
                1 + len,
            ))),
            None => Ok(None),
        }
    }
}

fn validate_flags(control_type: ControlType, flags: u8) -> Result<(), Error> {
    if flags > 0x0F {
        return Err(Error::InvalidFlags);
    }
    match control_type.required_flags() {
        Some(required) if flags != required => Err(Error::InvalidFlags),
        Some(_) => Ok(()),
        None => {
            let qos = QoS::try_from((flags & PUBLISH_QOS_MASK) >> 1)?;
            // [MQTT-3.3.1-2] DUP must be 0 for QoS 0
            if qos == QoS::AtMostOnce && flags & PUBLISH_DUP != 0 {
                return Err(Error::InvalidFlags);
            }
            Ok(())
        }
    }
}

/// Number of bytes needed to encode `len` as a remaining length.
pub fn remaining_length_len(len: u32) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Encodes `len` as a variable-length remaining length.
///
/// # Errors
///
/// * [`Error::InvalidRemainingLength`] - `len` exceeds [`MAX_REMAINING_LENGTH`]
/// * [`Error::BufferTooSmall`] - `buf` cannot hold the encoding
pub fn encode_remaining_length(buf: &mut [u8], mut len: u32) -> Result<usize, Error> {
    if len > MAX_REMAINING_LENGTH {
        return Err(Error::InvalidRemainingLength);
    }
    if buf.len() < remaining_length_len(len) {
        return Err(Error::BufferTooSmall);
    }
    let mut i = 0;
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf[i] = byte;
        i += 1;
        if len == 0 {
            break;
        }
    }
    Ok(i)
}

/// Decodes a variable-length remaining length from the start of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed.
///
/// # Errors
///
/// * [`Error::InvalidRemainingLength`] - a fifth continuation byte is needed
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(u32, usize)>, Error> {
    let mut value: u32 = 0;
    let mut multiplier: u32 = 1;
    for (i, &byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(Error::InvalidRemainingLength);
        }
        value += u32::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if buf.len() >= 4 {
        Err(Error::InvalidRemainingLength)
    } else {
        Ok(None)
    }
}

/// Last will and testament, published by the broker if the client vanishes.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Will<'a> {
    /// Topic the will message is published to.
    pub topic: &'a str,
    /// Will message payload.
    pub message: &'a [u8],
    /// QoS of the will publication.
    pub qos: QoS,
    /// Whether the broker retains the will message.
    pub retain: bool,
}

/// CONNECT packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Connect<'a> {
    /// Client identifier. May be empty only together with `clean_session`.
    pub client_id: &'a str,
    /// Keep-alive interval in seconds, 0 disables it.
    pub keep_alive: u16,
    /// Discard any previous session state.
    pub clean_session: bool,
    /// Optional last will.
    pub will: Option<Will<'a>>,
    /// Optional user name.
    pub username: Option<&'a str>,
    /// Optional password; requires `username`.
    pub password: Option<&'a [u8]>,
}

impl Connect<'_> {
    /// The connect-flags byte for this request.
    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.clean_session {
            flags |= CONNECT_CLEAN_SESSION;
        }
        if let Some(will) = &self.will {
            flags |= CONNECT_WILL_FLAG;
            flags |= (will.qos as u8) << CONNECT_WILL_QOS_SHIFT;
            if will.retain {
                flags |= CONNECT_WILL_RETAIN;
            }
        }
        if self.username.is_some() {
            flags |= CONNECT_USER_NAME;
        }
        if self.password.is_some() {
            flags |= CONNECT_PASSWORD;
        }
        flags
    }

    fn validate(&self) -> Result<(), Error> {
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::PasswordWithoutUsername);
        }
        if self.client_id.is_empty() && !self.clean_session {
            return Err(Error::CleanSessionRequired);
        }
        if let Some(will) = &self.will {
            if will.topic.is_empty() {
                return Err(Error::InvalidWill);
            }
        }
        Ok(())
    }

    fn body_len(&self) -> usize {
        let mut len = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2;
        len += 2 + self.client_id.len();
        if let Some(will) = &self.will {
            len += 2 + will.topic.len() + 2 + will.message.len();
        }
        if let Some(username) = self.username {
            len += 2 + username.len();
        }
        if let Some(password) = self.password {
            len += 2 + password.len();
        }
        len
    }

    fn write_body(&self, w: &mut Writer<'_>) -> Result<(), Error> {
        w.put_str(PROTOCOL_NAME)?;
        w.put_u8(PROTOCOL_LEVEL)?;
        w.put_u8(self.flags())?;
        w.put_u16(self.keep_alive)?;
        w.put_str(self.client_id)?;
        if let Some(will) = &self.will {
            w.put_str(will.topic)?;
            w.put_binary(will.message)?;
        }
        if let Some(username) = self.username {
            w.put_str(username)?;
        }
        if let Some(password) = self.password {
            w.put_binary(password)?;
        }
        Ok(())
    }

    fn read_body<'a>(r: &mut Reader<'a>) -> Result<Connect<'a>, Error> {
        if r.get_str()? != PROTOCOL_NAME || r.get_u8()? != PROTOCOL_LEVEL {
            return Err(Error::MalformedPacket);
        }
        let flags = r.get_u8()?;
        if flags & CONNECT_RESERVED != 0 {
            return Err(Error::MalformedPacket);
        }
        let has_will = flags & CONNECT_WILL_FLAG != 0;
        let will_qos = QoS::try_from((flags & CONNECT_WILL_QOS_MASK) >> CONNECT_WILL_QOS_SHIFT)?;
        let will_retain = flags & CONNECT_WILL_RETAIN != 0;
        if !has_will && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(Error::InvalidWill);
        }
        if flags & CONNECT_PASSWORD != 0 && flags & CONNECT_USER_NAME == 0 {
            return Err(Error::PasswordWithoutUsername);
        }

        let keep_alive = r.get_u16()?;
        let client_id = r.get_str()?;
        let will = if has_will {
            Some(Will {
                topic: r.get_str()?,
                message: r.get_binary()?,
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };
        let username = if flags & CONNECT_USER_NAME != 0 {
            Some(r.get_str()?)
        } else {
            None
        };
        let password = if flags & CONNECT_PASSWORD != 0 {
            Some(r.get_binary()?)
        } else {
            None
        };

        Ok(Connect {
            client_id,
            keep_alive,
            clean_session: flags & CONNECT_CLEAN_SESSION != 0,
            will,
            username,
            password,
        })
    }
}

/// CONNACK return codes.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ConnectReturnCode {
    /// Connection accepted.
    Accepted = 0,
    /// The broker does not support protocol level 4.
    UnacceptableProtocolVersion = 1,
    /// The client identifier is not allowed.
    IdentifierRejected = 2,
    /// The MQTT service is unavailable.
    ServerUnavailable = 3,
    /// Malformed user name or password.
    BadUserNameOrPassword = 4,
    /// The client is not authorized to connect.
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnectReturnCode::Accepted),
            1 => Ok(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Ok(ConnectReturnCode::IdentifierRejected),
            3 => Ok(ConnectReturnCode::ServerUnavailable),
            4 => Ok(ConnectReturnCode::BadUserNameOrPassword),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            _ => Err(Error::ConnackForbiddenCode),
        }
    }
}

/// CONNACK packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ConnAck {
    /// The broker resumed a stored session.
    pub session_present: bool,
    /// Outcome of the connection attempt.
    pub return_code: ConnectReturnCode,
}

/// PUBLISH packet, in either direction.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Publish<'a> {
    /// This is a retransmission.
    pub dup: bool,
    /// Delivery guarantee.
    pub qos: QoS,
    /// The broker should keep this as the topic's last known value.
    pub retain: bool,
    /// Topic name; never contains wildcards.
    pub topic: &'a str,
    /// Packet identifier; 0 for QoS 0.
    pub packet_id: u16,
    /// Application payload.
    pub payload: &'a [u8],
}

impl Publish<'_> {
    /// The fixed header flags for this message.
    pub fn flags(&self) -> u8 {
        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= PUBLISH_DUP;
        }
        if self.retain {
            flags |= PUBLISH_RETAIN;
        }
        flags
    }

    fn validate(&self) -> Result<(), Error> {
        validate_topic_name(self.topic)?;
        if self.qos == QoS::AtMostOnce && self.dup {
            return Err(Error::InvalidFlags);
        }
        if self.qos != QoS::AtMostOnce && self.packet_id == 0 {
            return Err(Error::MalformedRequest);
        }
        Ok(())
    }

    fn body_len(&self) -> usize {
        let id_len = if self.qos == QoS::AtMostOnce { 0 } else { 2 };
        2 + self.topic.len() + id_len + self.payload.len()
    }
}

/// Reads the QoS level from the first byte of an encoded PUBLISH.
pub(crate) fn publish_qos(first_byte: u8) -> QoS {
    match (first_byte & PUBLISH_QOS_MASK) >> 1 {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Sets the DUP bit in the first byte of an encoded PUBLISH.
pub(crate) fn set_publish_dup(first_byte: &mut u8) {
    *first_byte |= PUBLISH_DUP;
}

fn validate_topic_name(topic: &str) -> Result<(), Error> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(Error::InvalidTopic);
    }
    Ok(())
}

/// SUBSCRIBE packet.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Subscribe<'a> {
    /// Packet identifier.
    pub packet_id: u16,
    /// Topic filters with their requested maximum QoS, in request order.
    pub topics: Vec<(&'a str, QoS), MAX_TOPICS>,
}

impl<'a> Subscribe<'a> {
    /// Builds a request from a slice of `(topic filter, QoS)` pairs.
    ///
    /// # Errors
    ///
    /// * [`Error::TooManyTopics`] - more than [`MAX_TOPICS`] pairs
    pub fn new(packet_id: u16, topics: &[(&'a str, QoS)]) -> Result<Self, Error> {
        let topics = Vec::from_slice(topics).map_err(|_| Error::TooManyTopics)?;
        Ok(Self { packet_id, topics })
    }
}

/// A SUBACK return code.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubscribeReturnCode {
    /// Subscription accepted with this maximum QoS.
    Success(QoS),
    /// Subscription refused.
    Failure,
}

impl SubscribeReturnCode {
    fn to_byte(self) -> u8 {
        match self {
            SubscribeReturnCode::Success(qos) => qos as u8,
            SubscribeReturnCode::Failure => SUBACK_FAILURE,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            SUBACK_FAILURE => Ok(SubscribeReturnCode::Failure),
            _ => QoS::try_from(byte)
                .map(SubscribeReturnCode::Success)
                .map_err(|_| Error::MalformedPacket),
        }
    }
}

/// SUBACK packet.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SubAck {
    /// Identifier of the SUBSCRIBE being acknowledged.
    pub packet_id: u16,
    /// One code per requested topic, in request order.
    pub return_codes: Vec<SubscribeReturnCode, MAX_TOPICS>,
}

/// UNSUBSCRIBE packet.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Unsubscribe<'a> {
    /// Packet identifier.
    pub packet_id: u16,
    /// Topic filters to remove, in request order.
    pub topics: Vec<&'a str, MAX_TOPICS>,
}

impl<'a> Unsubscribe<'a> {
    /// Builds a request from a slice of topic filters.
    ///
    /// # Errors
    ///
    /// * [`Error::TooManyTopics`] - more than [`MAX_TOPICS`] filters
    pub fn new(packet_id: u16, topics: &[&'a str]) -> Result<Self, Error> {
        let topics = Vec::from_slice(topics).map_err(|_| Error::TooManyTopics)?;
        Ok(Self { packet_id, topics })
    }
}

/// A decoded or to-be-encoded MQTT control packet.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet<'a> {
    /// CONNECT
    Connect(Connect<'a>),
    /// CONNACK
    ConnAck(ConnAck),
    /// PUBLISH
    Publish(Publish<'a>),
    /// PUBACK with its packet id
    PubAck(u16),
    /// PUBREC with its packet id
    PubRec(u16),
    /// PUBREL with its packet id
    PubRel(u16),
    /// PUBCOMP with its packet id
    PubComp(u16),
    /// SUBSCRIBE
    Subscribe(Subscribe<'a>),
    /// SUBACK
    SubAck(SubAck),
    /// UNSUBSCRIBE
    Unsubscribe(Unsubscribe<'a>),
    /// UNSUBACK with its packet id
    UnsubAck(u16),
    /// PINGREQ
    PingReq,
    /// PINGRESP
    PingResp,
    /// DISCONNECT
    Disconnect,
}

impl<'a> Packet<'a> {
    /// The control packet type of this packet.
    pub fn control_type(&self) -> ControlType {
        match self {
            Packet::Connect(_) => ControlType::Connect,
            Packet::ConnAck(_) => ControlType::ConnAck,
            Packet::Publish(_) => ControlType::Publish,
            Packet::PubAck(_) => ControlType::PubAck,
            Packet::PubRec(_) => ControlType::PubRec,
            Packet::PubRel(_) => ControlType::PubRel,
            Packet::PubComp(_) => ControlType::PubComp,
            Packet::Subscribe(_) => ControlType::Subscribe,
            Packet::SubAck(_) => ControlType::SubAck,
            Packet::Unsubscribe(_) => ControlType::Unsubscribe,
            Packet::UnsubAck(_) => ControlType::UnsubAck,
            Packet::PingReq => ControlType::PingReq,
            Packet::PingResp => ControlType::PingResp,
            Packet::Disconnect => ControlType::Disconnect,
        }
    }

    /// The packet identifier, for packet types that carry one.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(p) if p.qos != QoS::AtMostOnce => Some(p.packet_id),
            Packet::PubAck(id)
            | Packet::PubRec(id)
            | Packet::PubRel(id)
            | Packet::PubComp(id)
            | Packet::UnsubAck(id) => Some(*id),
            Packet::Subscribe(s) => Some(s.packet_id),
            Packet::SubAck(s) => Some(s.packet_id),
            Packet::Unsubscribe(u) => Some(u.packet_id),
            _ => None,
        }
    }

    fn flags(&self) -> u8 {
        match self {
            Packet::Publish(p) => p.flags(),
            other => other.control_type().required_flags().unwrap_or(0),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        match self {
            Packet::Connect(c) => c.validate(),
            Packet::Publish(p) => p.validate(),
            Packet::Subscribe(s) => {
                if s.packet_id == 0 || s.topics.is_empty() {
                    return Err(Error::MalformedRequest);
                }
                if s.topics.iter().any(|(filter, _)| filter.is_empty()) {
                    return Err(Error::InvalidTopic);
                }
                Ok(())
            }
            Packet::Unsubscribe(u) => {
                if u.packet_id == 0 || u.topics.is_empty() {
                    return Err(Error::MalformedRequest);
                }
                if u.topics.iter().any(|filter| filter.is_empty()) {
                    return Err(Error::InvalidTopic);
                }
                Ok(())
            }
            Packet::SubAck(s) if s.return_codes.is_empty() => Err(Error::MalformedRequest),
            _ => Ok(()),
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Packet::Connect(c) => c.body_len(),
            Packet::ConnAck(_) => 2,
            Packet::Publish(p) => p.body_len(),
            Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubRel(_)
            | Packet::PubComp(_)
            | Packet::UnsubAck(_) => 2,
            Packet::Subscribe(s) => 2 + s.topics.iter().map(|(t, _)| 2 + t.len() + 1).sum::<usize>(),
            Packet::SubAck(s) => 2 + s.return_codes.len(),
            Packet::Unsubscribe(u) => 2 + u.topics.iter().map(|t| 2 + t.len()).sum::<usize>(),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
        }
    }

    fn header(&self) -> Result<FixedHeader, Error> {
        let remaining_length = u32::try_from(self.body_len())
            .ok()
            .filter(|len| *len <= MAX_REMAINING_LENGTH)
            .ok_or(Error::InvalidRemainingLength)?;
        Ok(FixedHeader {
            control_type: self.control_type(),
            flags: self.flags(),
            remaining_length,
        })
    }

    /// Total number of bytes [`encode`](Self::encode) will write.
    pub fn encoded_len(&self) -> Result<usize, Error> {
        self.validate()?;
        Ok(self.header()?.packet_len())
    }

    /// Encodes the packet into the start of `buf`, returning the bytes written.
    ///
    /// The packet is validated and `buf` is checked for size before anything
    /// is written, so on error `buf` is untouched.
    ///
    /// # Errors
    ///
    /// * Request-construction errors such as [`Error::PasswordWithoutUsername`]
    ///   or [`Error::InvalidTopic`]
    /// * [`Error::InvalidRemainingLength`] - the body is too large for MQTT
    /// * [`Error::BufferTooSmall`] - `buf` cannot hold the packet
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.validate()?;
        let header = self.header()?;
        let total = header.packet_len();
        if buf.len() < total {
            return Err(Error::BufferTooSmall);
        }

        let header_len = header.encode(buf)?;
        let mut w = Writer::new(&mut buf[header_len..total]);
        match self {
            Packet::Connect(c) => c.write_body(&mut w)?,
            Packet::ConnAck(c) => {
                w.put_u8(u8::from(c.session_present))?;
                w.put_u8(c.return_code as u8)?;
            }
            Packet::Publish(p) => {
                w.put_str(p.topic)?;
                if p.qos != QoS::AtMostOnce {
                    w.put_u16(p.packet_id)?;
                }
                w.put_slice(p.payload)?;
            }
            Packet::PubAck(id)
            | Packet::PubRec(id)
            | Packet::PubRel(id)
            | Packet::PubComp(id)
            | Packet::UnsubAck(id) => w.put_u16(*id)?,
            Packet::Subscribe(s) => {
                w.put_u16(s.packet_id)?;
                for (filter, qos) in &s.topics {
                    w.put_str(filter)?;
                    w.put_u8(*qos as u8)?;
                }
            }
            Packet::SubAck(s) => {
                w.put_u16(s.packet_id)?;
                for code in &s.return_codes {
                    w.put_u8(code.to_byte())?;
                }
            }
            Packet::Unsubscribe(u) => {
                w.put_u16(u.packet_id)?;
                for filter in &u.topics {
                    w.put_str(filter)?;
                }
            }
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => {}
        }
        Ok(total)
    }

    /// Decodes one packet from the start of `buf`.
    ///
    /// Returns the packet and the number of bytes it occupied, or `Ok(None)`
    /// when `buf` holds only part of a packet.
    ///
    /// # Errors
    ///
    /// Any decode error: [`Error::InvalidControlType`], [`Error::InvalidFlags`],
    /// [`Error::InvalidQos`], [`Error::InvalidRemainingLength`],
    /// [`Error::MalformedPacket`] and the CONNECT/CONNACK specific variants.
    pub fn decode(buf: &'a [u8]) -> Result<Option<(Packet<'a>, usize)>, Error> {
        let Some((header, header_len)) = FixedHeader::decode(buf)? else {
            return Ok(None);
        };
        let total = header.packet_len();
        if buf.len() < total {
            return Ok(None);
        }
        let packet = Self::decode_body(&header, &buf[header_len..total])?;
        Ok(Some((packet, total)))
    }

    fn decode_body(header: &FixedHeader, body: &'a [u8]) -> Result<Packet<'a>, Error> {
        let mut r = Reader::new(body);
        let packet = match header.control_type {
            ControlType::Connect => Packet::Connect(Connect::read_body(&mut r)?),
            ControlType::ConnAck => {
                if body.len() != 2 {
                    return Err(Error::MalformedPacket);
                }
                let ack_flags = r.get_u8()?;
                if ack_flags & !0x01 != 0 {
                    return Err(Error::ConnackForbiddenFlags);
                }
                Packet::ConnAck(ConnAck {
                    session_present: ack_flags == 0x01,
                    return_code: ConnectReturnCode::try_from(r.get_u8()?)?,
                })
            }
            ControlType::Publish => {
                let qos = QoS::try_from((header.flags & PUBLISH_QOS_MASK) >> 1)?;
                let topic = r.get_str()?;
                let packet_id = if qos == QoS::AtMostOnce {
                    0
                } else {
                    match r.get_u16()? {
                        0 => return Err(Error::MalformedPacket),
                        id => id,
                    }
                };
                Packet::Publish(Publish {
                    dup: header.flags & PUBLISH_DUP != 0,
                    qos,
                    retain: header.flags & PUBLISH_RETAIN != 0,
                    topic,
                    packet_id,
                    payload: r.rest(),
                })
            }
            ControlType::PubAck => Packet::PubAck(read_packet_id_only(&mut r)?),
            ControlType::PubRec => Packet::PubRec(read_packet_id_only(&mut r)?),
            ControlType::PubRel => Packet::PubRel(read_packet_id_only(&mut r)?),
            ControlType::PubComp => Packet::PubComp(read_packet_id_only(&mut r)?),
            ControlType::UnsubAck => Packet::UnsubAck(read_packet_id_only(&mut r)?),
            ControlType::Subscribe => {
                let packet_id = r.get_u16()?;
                let mut topics = Vec::new();
                while !r.is_empty() {
                    let filter = r.get_str()?;
                    let requested = r.get_u8()?;
                    if requested & 0xFC != 0 {
                        return Err(Error::MalformedPacket);
                    }
                    topics
                        .push((filter, QoS::try_from(requested)?))
                        .map_err(|_| Error::TooManyTopics)?;
                }
                if topics.is_empty() {
                    return Err(Error::MalformedPacket);
                }
                Packet::Subscribe(Subscribe { packet_id, topics })
            }
            ControlType::SubAck => {
                let packet_id = r.get_u16()?;
                let mut return_codes = Vec::new();
                while !r.is_empty() {
                    let code = SubscribeReturnCode::from_byte(r.get_u8()?)?;
                    return_codes
                        .push(code)
                        .map_err(|_| Error::MalformedPacket)?;
                }
                if return_codes.is_empty() {
                    return Err(Error::MalformedPacket);
                }
                Packet::SubAck(SubAck {
                    packet_id,
                    return_codes,
                })
            }
            ControlType::Unsubscribe => {
                let packet_id = r.get_u16()?;
                let mut topics = Vec::new();
                while !r.is_empty() {
                    topics
                        .push(r.get_str()?)
                        .map_err(|_| Error::TooManyTopics)?;
                }
                if topics.is_empty() {
                    return Err(Error::MalformedPacket);
                }
                Packet::Unsubscribe(Unsubscribe { packet_id, topics })
            }
            ControlType::PingReq => Packet::PingReq,
            ControlType::PingResp => Packet::PingResp,
            ControlType::Disconnect => Packet::Disconnect,
        };

        if !r.is_empty() {
            return Err(Error::MalformedPacket);
        }
        Ok(packet)
    }
}

fn read_packet_id_only(r: &mut Reader<'_>) -> Result<u16, Error> {
    if r.remaining() != 2 {
        return Err(Error::MalformedPacket);
    }
    r.get_u16()
}

/// Bounds-checked cursor over an output slice.
struct Writer<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl<'b> Writer<'b> {
    fn new(buf: &'b mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put_slice(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(Error::BufferTooSmall);
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn put_u8(&mut self, value: u8) -> Result<(), Error> {
        self.put_slice(&[value])
    }

    fn put_u16(&mut self, value: u16) -> Result<(), Error> {
        self.put_slice(&value.to_be_bytes())
    }

    fn put_binary(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let len = u16::try_from(bytes.len()).map_err(|_| Error::MalformedRequest)?;
        self.put_u16(len)?;
        self.put_slice(bytes)
    }

    fn put_str(&mut self, s: &str) -> Result<(), Error> {
        self.put_binary(s.as_bytes())
    }
}

/// Bounds-checked cursor over an input slice.
struct Reader<'b> {
    buf: &'b [u8],
    pos: usize,
}

impl<'b> Reader<'b> {
    fn new(buf: &'b [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'b [u8], Error> {
        if n > self.remaining() {
            return Err(Error::MalformedPacket);
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn get_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16, Error> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn get_binary(&mut self) -> Result<&'b [u8], Error> {
        let len = self.get_u16()? as usize;
        self.take(len)
    }

    fn get_str(&mut self) -> Result<&'b str, Error> {
        core::str::from_utf8(self.get_binary()?).map_err(|_| Error::MalformedPacket)
    }

    fn rest(&mut self) -> &'b [u8] {
        let bytes = &self.buf[self.pos..];
        self.pos = self.buf.len();
        bytes
    }
}
