//! Session options, engine tunables and JSON broker settings.

use core::fmt::Write as _;

use heapless::String;
use serde::{Deserialize, Serialize};

use super::error::Error;
use super::packet::{Connect, Will};

/// Default keep-alive interval in seconds.
pub const DEFAULT_KEEP_ALIVE: u16 = 60;
/// Default seconds to wait for an acknowledgement before counting a timeout.
pub const DEFAULT_RESPONSE_TIMEOUT: u64 = 30;
/// Default number of consecutive timeouts tolerated before giving up.
pub const DEFAULT_MAX_TIMEOUTS: u32 = 3;
/// Longest `host:port` string [`Settings::remote`] produces.
pub const MAX_REMOTE_LEN: usize = 128;

/// Configuration options for an MQTT session.
///
/// These options are turned into the CONNECT packet, both on the first
/// connect and every reconnect.
///
/// # Examples
///
/// ```rust
/// use libmqtt::network::application::mqtt::Options;
///
/// let options = Options {
///     keep_alive_seconds: 120,
///     username: Some("device"),
///     password: Some(b"secret"),
///     ..Options::new("my_iot_device")
/// };
/// assert!(options.clean_session);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options<'a> {
    /// The client identifier, must be unique within the broker.
    ///
    /// If a client connects with an identifier already in use by another
    /// client, the broker disconnects the existing client. An empty
    /// identifier asks the broker to assign one and requires
    /// `clean_session`.
    pub client_id: &'a str,

    /// The keep-alive time interval in seconds.
    ///
    /// The client sends a PINGREQ when nothing else was sent for this long.
    /// A value of 0 disables keep-alive.
    pub keep_alive_seconds: u16,

    /// Whether to start a clean session.
    ///
    /// - `true`: the broker discards previous session state, and the client
    ///   drops its queued messages on reconnect
    /// - `false`: the broker resumes the previous session, and the client
    ///   resends unacknowledged messages with DUP set on reconnect
    pub clean_session: bool,

    /// Last will published by the broker if the client disappears.
    pub will: Option<Will<'a>>,

    /// User name for authentication.
    pub username: Option<&'a str>,

    /// Password for authentication; requires `username`.
    pub password: Option<&'a [u8]>,
}

impl<'a> Options<'a> {
    /// Options with a 60 second keep-alive and a clean session.
    pub fn new(client_id: &'a str) -> Self {
        Self {
            client_id,
            keep_alive_seconds: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            will: None,
            username: None,
            password: None,
        }
    }

    /// The CONNECT packet for these options.
    pub fn to_connect(&self) -> Connect<'a> {
        Connect {
            client_id: self.client_id,
            keep_alive: self.keep_alive_seconds,
            clean_session: self.clean_session,
            will: self.will,
            username: self.username,
            password: self.password,
        }
    }
}

/// Client engine tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Seconds to wait for an acknowledgement before counting a timeout.
    pub response_timeout: u64,
    /// Timeouts in a row tolerated before the session is abandoned.
    pub max_timeouts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            max_timeouts: DEFAULT_MAX_TIMEOUTS,
        }
    }
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u16 {
    DEFAULT_KEEP_ALIVE
}

fn default_clean_session() -> bool {
    true
}

fn default_response_timeout() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT
}

fn default_max_timeouts() -> u32 {
    DEFAULT_MAX_TIMEOUTS
}

/// A broker session description, usually loaded from a JSON document.
///
/// Strings borrow from the JSON text, so they must not contain escape
/// sequences.
///
/// # Examples
///
/// ```rust
/// use libmqtt::network::application::mqtt::Settings;
///
/// let json = r#"{"host":"test.mosquitto.org","client_id":"listener","keep_alive":30}"#;
/// let settings = Settings::from_json(json).unwrap();
///
/// assert_eq!(settings.remote().unwrap().as_str(), "test.mosquitto.org:1883");
/// assert_eq!(settings.options().keep_alive_seconds, 30);
/// assert_eq!(settings.config().response_timeout, 30);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings<'a> {
    /// Broker host name or address.
    pub host: &'a str,
    /// Broker TCP port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Client identifier.
    #[serde(default)]
    pub client_id: &'a str,
    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u16,
    /// Start a clean session.
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Optional user name.
    #[serde(borrow, default, skip_serializing_if = "Option::is_none")]
    pub username: Option<&'a str>,
    /// Optional password.
    #[serde(borrow, default, skip_serializing_if = "Option::is_none")]
    pub password: Option<&'a str>,
    /// Acknowledgement timeout in seconds.
    #[serde(default = "default_response_timeout")]
    pub response_timeout: u64,
    /// Timeouts in a row tolerated.
    #[serde(default = "default_max_timeouts")]
    pub max_timeouts: u32,
}

impl<'a> Settings<'a> {
    /// Parses settings from JSON text.
    ///
    /// # Errors
    ///
    /// * [`Error::MalformedRequest`] - the text is not a valid settings object
    pub fn from_json(json: &'a str) -> Result<Self, Error> {
        serde_json_core::from_str::<Settings<'a>>(json)
            .map(|(settings, _)| settings)
            .map_err(|_| Error::MalformedRequest)
    }

    /// Serializes the settings into `buf`, returning the bytes written.
    ///
    /// # Errors
    ///
    /// * [`Error::BufferTooSmall`] - `buf` cannot hold the JSON text
    pub fn to_json(&self, buf: &mut [u8]) -> Result<usize, Error> {
        serde_json_core::to_slice(self, buf).map_err(|_| Error::BufferTooSmall)
    }

    /// The `host:port` address to hand to a [`Connect`](crate::network::Connect).
    ///
    /// # Errors
    ///
    /// * [`Error::MalformedRequest`] - the address is longer than
    ///   [`MAX_REMOTE_LEN`]
    pub fn remote(&self) -> Result<String<MAX_REMOTE_LEN>, Error> {
        let mut remote = String::new();
        write!(remote, "{}:{}", self.host, self.port).map_err(|_| Error::MalformedRequest)?;
        Ok(remote)
    }

    /// Session options described by these settings.
    pub fn options(&self) -> Options<'a> {
        Options {
            client_id: self.client_id,
            keep_alive_seconds: self.keep_alive,
            clean_session: self.clean_session,
            will: None,
            username: self.username,
            password: self.password.map(str::as_bytes),
        }
    }

    /// Engine tunables described by these settings.
    pub fn config(&self) -> Config {
        Config {
            response_timeout: self.response_timeout,
            max_timeouts: self.max_timeouts,
        }
    }
}
