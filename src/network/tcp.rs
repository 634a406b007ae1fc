//! Non-blocking TCP transport over `std::net`.
//!
//! ```rust,no_run
//! use libmqtt::network::Connect;
//! use libmqtt::network::tcp::TcpConnector;
//!
//! let connection = TcpConnector.connect("test.mosquitto.org:1883").unwrap();
//! ```

use std::io::{ErrorKind, Read as StdRead, Write as StdWrite};
use std::net::{Shutdown, TcpStream};
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::Error;
use super::{Close, Connect, Connection, Read, Write};
use crate::network::application::mqtt::Clock;

fn classify(error: &std::io::Error, fallback: Error) -> Error {
    match error.kind() {
        ErrorKind::WouldBlock | ErrorKind::Interrupted => Error::WouldBlock,
        ErrorKind::TimedOut => Error::Timeout,
        ErrorKind::ConnectionRefused => Error::ConnectionRefused,
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => Error::ConnectionClosed,
        ErrorKind::NotConnected => Error::NotOpen,
        _ => fallback,
    }
}

/// A TCP stream in non-blocking mode.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
}

impl TcpConnection {
    /// Wraps `stream`, switching it to non-blocking mode.
    pub fn new(stream: TcpStream) -> Result<Self, Error> {
        stream
            .set_nonblocking(true)
            .map_err(|e| classify(&e, Error::ProtocolError))?;
        stream
            .set_nodelay(true)
            .map_err(|e| classify(&e, Error::ProtocolError))?;
        Ok(Self { stream })
    }
}

impl Read for TcpConnection {
    type Error = Error;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => Err(Error::ConnectionClosed),
            Ok(n) => Ok(n),
            Err(e) => Err(classify(&e, Error::ReadError)),
        }
    }
}

impl Write for TcpConnection {
    type Error = Error;

    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.stream
            .write(buf)
            .map_err(|e| classify(&e, Error::WriteError))
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.stream
            .flush()
            .map_err(|e| classify(&e, Error::WriteError))
    }
}

impl Close for TcpConnection {
    type Error = Error;

    fn close(self) -> Result<(), Self::Error> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(classify(&e, Error::ProtocolError)),
        }
    }
}

impl Connection for TcpConnection {}

/// Opens [`TcpConnection`]s to `host:port` addresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connect for TcpConnector {
    type Connection = TcpConnection;
    type Error = Error;

    fn connect(&mut self, remote: &str) -> Result<Self::Connection, Self::Error> {
        let stream = TcpStream::connect(remote).map_err(|e| match e.kind() {
            ErrorKind::InvalidInput => Error::InvalidAddress,
            _ => classify(&e, Error::ConnectionRefused),
        })?;
        TcpConnection::new(stream)
    }
}

/// Seconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs())
    }
}
