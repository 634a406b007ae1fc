//! MQTT 3.1.1 protocol implementation for embedded systems.
//!
//! This module provides an MQTT 3.1.1 client engine designed for `no_std`
//! environments. MQTT (Message Queuing Telemetry Transport) is a lightweight
//! publish-subscribe messaging protocol well suited to IoT applications.
//!
//! # Protocol Overview
//!
//! MQTT uses a publish-subscribe pattern where:
//! - **Publishers** send messages to topics
//! - **Subscribers** receive messages from topics they're interested in
//! - **Brokers** route messages between publishers and subscribers
//!
//! # Layout
//!
//! - [`packet`]: encoding and decoding of every control packet
//! - [`queue`]: the outbound message queue kept in one fixed buffer
//! - [`client`]: the poll-driven session engine built on both
//! - [`config`]: session options, engine tunables and JSON settings
//! - [`error`]: the error type shared by all of the above
//!
//! # Usage
//!
//! ```rust,no_run
//! use libmqtt::network::application::mqtt::{Client, Options, Publish, QoS};
//! # use libmqtt::network::error::Error;
//! # struct MockConnection;
//! # impl libmqtt::network::Connection for MockConnection {}
//! # impl libmqtt::network::Read for MockConnection {
//! #     type Error = Error;
//! #     fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Self::Error> { Ok(0) }
//! # }
//! # impl libmqtt::network::Write for MockConnection {
//! #     type Error = Error;
//! #     fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> { Ok(buf.len()) }
//! #     fn flush(&mut self) -> Result<(), Self::Error> { Ok(()) }
//! # }
//! # impl libmqtt::network::Close for MockConnection {
//! #     type Error = Error;
//! #     fn close(self) -> Result<(), Self::Error> { Ok(()) }
//! # }
//!
//! let mut send_buf = [0u8; 1024];
//! let mut recv_buf = [0u8; 512];
//! let handler = |publish: &Publish<'_>| {
//!     let _ = (publish.topic, publish.payload);
//! };
//! let mut client = Client::new(MockConnection, &mut send_buf, &mut recv_buf, handler, || 0u64);
//!
//! client.connect(Options::new("iot_device_123")).unwrap();
//! client.subscribe(&[("sensors/+", QoS::AtLeastOnce)]).unwrap();
//! client.publish("status", b"online", QoS::AtMostOnce.into()).unwrap();
//!
//! loop {
//!     client.sync().unwrap();
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod packet;
pub mod queue;


pub use client::{
    Client, ClientState, Clock, Event, Handler, PublishOptions, Reconnect, Redial,
};
pub use config::{Config, Options, Settings};
pub use error::Error;
pub use packet::{
    ConnectReturnCode, ControlType, Packet, Publish, QoS, SubscribeReturnCode, Will,
};
pub use queue::{MessageQueue, MessageState, QueuedMessage};
