//! # libmqtt - bounded-memory MQTT client engine
//!
//! A poll-driven MQTT 3.1.1 client designed for embedded systems and any other
//! place where memory has to be sized up front. The engine never allocates:
//! outbound packets live in a caller-supplied arena, inbound packets are decoded
//! in place from a caller-supplied receive buffer.
//!
//! ## Features
//!
//! ### Protocol
//! - **Packet codec**: every MQTT 3.1.1 control packet, encoded and decoded
//!   against plain byte slices
//! - **Message queue**: a single fixed-size arena tracking in-flight messages
//!   until they are acknowledged
//! - **Client engine**: connect handshake, QoS 0/1/2 publish, subscribe,
//!   keep-alive, response timeouts and reconnection, all driven by
//!   [`Client::sync`](network::application::mqtt::Client::sync)
//!
//! ### Transport
//! - Connection agnostic: anything implementing the [`network`] traits works
//! - Optional `std` TCP transport for hosted targets
//!
//! ## Usage
//!
//! ```rust,no_run
//! use libmqtt::network::application::mqtt::{Client, Options, Publish, QoS};
//! # use libmqtt::network::Connection;
//! # struct MockConnection;
//! # impl Connection for MockConnection {}
//! # impl libmqtt::network::Read for MockConnection {
//! #     type Error = libmqtt::network::error::Error;
//! #     fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Self::Error> { Ok(0) }
//! # }
//! # impl libmqtt::network::Write for MockConnection {
//! #     type Error = libmqtt::network::error::Error;
//! #     fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> { Ok(buf.len()) }
//! #     fn flush(&mut self) -> Result<(), Self::Error> { Ok(()) }
//! # }
//! # impl libmqtt::network::Close for MockConnection {
//! #     type Error = libmqtt::network::error::Error;
//! #     fn close(self) -> Result<(), Self::Error> { Ok(()) }
//! # }
//!
//! let mut sendbuf = [0u8; 1024];
//! let mut recvbuf = [0u8; 512];
//! let clock = || 0u64;
//! let handler = |publish: &Publish<'_>| {
//!     let _ = (publish.topic, publish.payload);
//! };
//!
//! let mut client = Client::new(MockConnection, &mut sendbuf, &mut recvbuf, handler, clock);
//! client.connect(Options::new("my_device")).unwrap();
//! client.subscribe(&[("sensors/+", QoS::AtLeastOnce)]).unwrap();
//! client.publish("sensors/temperature", b"23.5", QoS::AtMostOnce.into()).unwrap();
//!
//! loop {
//!     client.sync().unwrap();
//! }
//! ```
//!
//! ## Optional Features
//!
//! - `std`: TCP transport, system clock and reconnect helper (default: disabled)
//! - `defmt`: `defmt` logging and `defmt::Format` implementations

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

mod fmt;

/// Network abstraction layer: transport traits and the MQTT protocol engine.
///
/// The transport traits describe a non-blocking byte stream; the MQTT client
/// in [`network::application::mqtt`] is written purely against them.
pub mod network;
