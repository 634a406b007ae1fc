//! Error types for the MQTT codec, message queue and client engine

use core::fmt;

use super::packet::ConnectReturnCode;
use crate::network::error::Error as NetworkError;

/// Everything that can go wrong while building, parsing or exchanging MQTT
/// packets.
///
/// The variants fall into four groups:
///
/// - **Request construction**: the caller asked for something the protocol
///   forbids. Nothing has been written to any buffer.
/// - **Decoding**: the peer sent bytes that are not valid MQTT. The client
///   treats these as fatal to the current connection.
/// - **Resources**: a fixed-size buffer is exhausted. Nothing was changed, the
///   call can be retried once space is freed.
/// - **Session**: transport failures, refused connections, timeouts and
///   misuse of the client state machine.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// The control packet type nibble is reserved (0 or 15) or not one a
    /// client accepts.
    InvalidControlType,
    /// The fixed header flags are not valid for the control packet type.
    InvalidFlags,
    /// A QoS value of 3 was found.
    InvalidQos,
    /// Will flag, will QoS and will retain bits disagree.
    InvalidWill,
    /// A password was given without a user name.
    PasswordWithoutUsername,
    /// An empty client identifier requires a clean session.
    CleanSessionRequired,
    /// A topic name is empty or contains wildcards.
    InvalidTopic,
    /// More than eight topics in one SUBSCRIBE or UNSUBSCRIBE.
    TooManyTopics,
    /// A request violates the protocol in some other way (no topics, zero
    /// packet id, string longer than 65535 bytes).
    MalformedRequest,
    /// A packet is truncated or internally inconsistent.
    MalformedPacket,
    /// A remaining length needs more than four bytes.
    InvalidRemainingLength,
    /// CONNACK carried reserved acknowledge flags.
    ConnackForbiddenFlags,
    /// CONNACK carried an unknown return code.
    ConnackForbiddenCode,
    /// An output buffer is too small for the encoded packet.
    BufferTooSmall,
    /// The message queue has no room for another packet.
    QueueFull,
    /// The receive buffer cannot hold the next inbound packet.
    RecvBufferTooSmall,
    /// An operation other than `connect` was issued before `connect`.
    ConnectNotCalled,
    /// `connect` was issued on a session that is already up.
    AlreadyConnected,
    /// The broker rejected the client identifier.
    ClientIdRejected,
    /// The broker refused the connection.
    ConnectionRefused(ConnectReturnCode),
    /// Acknowledgements stopped arriving and the retry bound was exceeded.
    ResponseTimeout,
    /// A reconnect was requested but no reconnect handler is installed.
    NoReconnectHandler,
    /// The transport reported a hard failure.
    Transport(NetworkError),
}

impl Error {
    /// Whether this error ends the current connection.
    ///
    /// Request-construction and resource errors leave the session intact.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidControlType
                | Error::InvalidFlags
                | Error::InvalidQos
                | Error::InvalidWill
                | Error::MalformedPacket
                | Error::InvalidRemainingLength
                | Error::ConnackForbiddenFlags
                | Error::ConnackForbiddenCode
                | Error::RecvBufferTooSmall
                | Error::ClientIdRejected
                | Error::ConnectionRefused(_)
                | Error::ResponseTimeout
                | Error::Transport(_)
        )
    }
}

impl From<NetworkError> for Error {
    fn from(error: NetworkError) -> Self {
        Error::Transport(error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidControlType => f.write_str("invalid control packet type"),
            Error::InvalidFlags => f.write_str("invalid fixed header flags"),
            Error::InvalidQos => f.write_str("invalid QoS level"),
            Error::InvalidWill => f.write_str("inconsistent will flags"),
            Error::PasswordWithoutUsername => f.write_str("password given without user name"),
            Error::CleanSessionRequired => {
                f.write_str("empty client identifier requires a clean session")
            }
            Error::InvalidTopic => f.write_str("invalid topic name"),
            Error::TooManyTopics => f.write_str("too many topics in one request"),
            Error::MalformedRequest => f.write_str("malformed request"),
            Error::MalformedPacket => f.write_str("malformed packet"),
            Error::InvalidRemainingLength => f.write_str("invalid remaining length"),
            Error::ConnackForbiddenFlags => f.write_str("CONNACK with reserved flags"),
            Error::ConnackForbiddenCode => f.write_str("CONNACK with unknown return code"),
            Error::BufferTooSmall => f.write_str("output buffer too small"),
            Error::QueueFull => f.write_str("message queue full"),
            Error::RecvBufferTooSmall => f.write_str("receive buffer too small"),
            Error::ConnectNotCalled => f.write_str("connect was not called"),
            Error::AlreadyConnected => f.write_str("already connected"),
            Error::ClientIdRejected => f.write_str("client identifier rejected"),
            Error::ConnectionRefused(code) => write!(f, "connection refused: {:?}", code),
            Error::ResponseTimeout => f.write_str("response timeout"),
            Error::NoReconnectHandler => f.write_str("no reconnect handler installed"),
            Error::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::InvalidControlType => defmt::write!(f, "InvalidControlType"),
            Error::InvalidFlags => defmt::write!(f, "InvalidFlags"),
            Error::InvalidQos => defmt::write!(f, "InvalidQos"),
            Error::InvalidWill => defmt::write!(f, "InvalidWill"),
            Error::PasswordWithoutUsername => defmt::write!(f, "PasswordWithoutUsername"),
            Error::CleanSessionRequired => defmt::write!(f, "CleanSessionRequired"),
            Error::InvalidTopic => defmt::write!(f, "InvalidTopic"),
            Error::TooManyTopics => defmt::write!(f, "TooManyTopics"),
            Error::MalformedRequest => defmt::write!(f, "MalformedRequest"),
            Error::MalformedPacket => defmt::write!(f, "MalformedPacket"),
            Error::InvalidRemainingLength => defmt::write!(f, "InvalidRemainingLength"),
            Error::ConnackForbiddenFlags => defmt::write!(f, "ConnackForbiddenFlags"),
            Error::ConnackForbiddenCode => defmt::write!(f, "ConnackForbiddenCode"),
            Error::BufferTooSmall => defmt::write!(f, "BufferTooSmall"),
            Error::QueueFull => defmt::write!(f, "QueueFull"),
            Error::RecvBufferTooSmall => defmt::write!(f, "RecvBufferTooSmall"),
            Error::ConnectNotCalled => defmt::write!(f, "ConnectNotCalled"),
            Error::AlreadyConnected => defmt::write!(f, "AlreadyConnected"),
            Error::ClientIdRejected => defmt::write!(f, "ClientIdRejected"),
            Error::ConnectionRefused(code) => defmt::write!(f, "ConnectionRefused({})", code),
            Error::ResponseTimeout => defmt::write!(f, "ResponseTimeout"),
            Error::NoReconnectHandler => defmt::write!(f, "NoReconnectHandler"),
            Error::Transport(e) => defmt::write!(f, "Transport({})", e),
        }
    }
}
