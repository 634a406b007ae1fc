//! A network abstraction layer for embedded systems
//!
//! This module provides the byte-stream traits the protocol code is written
//! against. They model a non-blocking connection: a read or write that cannot
//! make progress right now reports that instead of waiting, so a caller can
//! resume from where it stopped on its next poll.
//!

#![allow(missing_docs)]
#![deny(unsafe_code)]

/// Common error types for network operations
pub mod error;

/// Application layer protocols
pub mod application;

/// TCP transport over `std::net`
#[cfg(feature = "std")]
pub mod tcp;

use error::IoError;

/// Re-exports of common traits
pub mod prelude {
    pub use super::error::IoError;
    pub use super::{Close, Connect, Connection, Read, Write};
}

pub trait Read {
    /// Associated error type
    type Error: IoError;
    /// Read data from the connection.
    ///
    /// Returns the number of bytes placed in `buf`. `Ok(0)` means no data is
    /// available yet; a peer that went away must be reported as an error.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}

pub trait Write {
    /// Associated error type
    type Error: IoError;
    /// Write data to the connection.
    ///
    /// May accept fewer bytes than offered. `Ok(0)` means the connection
    /// cannot take more data right now.
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error>;
    /// Flush the write buffer
    fn flush(&mut self) -> Result<(), Self::Error>;
}

pub trait Close {
    /// Associated error type
    type Error: IoError;
    /// Close the connection
    fn close(self) -> Result<(), Self::Error>;
}

/// A synchronous connection
pub trait Connection: Read + Write + Close {}

/// A synchronous connector (client)
pub trait Connect {
    /// Associated connection type
    type Connection: Connection;
    /// Associated error type
    type Error: IoError;
    /// Open a connection to `remote`, typically `"host:port"`.
    fn connect(&mut self, remote: &str) -> Result<Self::Connection, Self::Error>;
}
