//! MQTT 3.1.1 client engine.
//!
//! The [`Client`] never blocks and never owns a thread. Operations such as
//! [`Client::publish`] only encode a packet into the message queue; all
//! network traffic happens inside [`Client::sync`], which the application
//! calls repeatedly from its own loop.
//!
//! # Session Lifecycle
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──CONNACK──▶ Connected ◀──ack──┐
//!      ▲                          │                      │               │
//!      │                          │ refused              │ timeout       │
//!      └──────────────────────────┴── fatal error ◀──────┴──▶ Degraded ──┘
//! ```
//!
//! Each call to [`Client::sync`] runs three steps:
//!
//! 1. **Flush**: write Unsent queue entries in order, resuming a partially
//!    written packet at the byte where the transport stopped accepting data.
//!    Sends a PINGREQ when nothing was sent for a keep-alive interval.
//! 2. **Receive**: read what the transport has, decode every complete packet
//!    and match acknowledgements to queued requests. Inbound PUBLISH packets
//!    go straight to the [`Handler`].
//! 3. **Timeout**: when the oldest unacknowledged request is older than the
//!    response timeout, count a timeout and resend. Past the retry bound the
//!    session fails with [`Error::ResponseTimeout`].

use core::fmt;

use super::config::{Config, Options};
use super::error::Error;
use super::packet::{
    self, ConnAck, ConnectReturnCode, ControlType, FixedHeader, Packet, Publish, QoS, SubAck,
    Subscribe, SubscribeReturnCode, Unsubscribe,
};
use super::queue::{MessageQueue, MessageState, QueuedMessage, DESCRIPTOR_SIZE};
use crate::network::error::{Error as NetworkError, IoError};
use crate::network::{Connect, Connection};

/// Seed of the packet identifier sequence.
const PACKET_ID_SEED: u16 = 163;
/// Feedback taps of the 16-bit Galois LFSR generating packet identifiers.
const PACKET_ID_TAPS: u16 = 0xB400;

/// Connection state of a [`Client`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClientState {
    /// No session. Initial state, and the state after a fatal error or a
    /// sent DISCONNECT.
    Disconnected,
    /// CONNECT queued or sent, waiting for CONNACK.
    Connecting,
    /// Session established.
    Connected,
    /// Session established but acknowledgements are timing out.
    Degraded,
}

/// A source of the current time in seconds.
///
/// Any `Fn() -> u64` closure is a clock.
pub trait Clock {
    /// Current time in seconds from an arbitrary, monotonic origin.
    fn now(&self) -> u64;
}

impl<F> Clock for F
where
    F: Fn() -> u64,
{
    fn now(&self) -> u64 {
        self()
    }
}

/// Session events reported to a [`Handler`] besides inbound messages.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Event<'e> {
    /// CONNACK accepted the connection.
    Connected {
        /// The broker resumed a stored session.
        session_present: bool,
    },
    /// An outbound QoS 1 or QoS 2 publication finished its handshake.
    Published {
        /// Identifier returned by [`Client::publish`].
        packet_id: u16,
    },
    /// SUBACK arrived for a subscribe request.
    Subscribed {
        /// Identifier returned by [`Client::subscribe`].
        packet_id: u16,
        /// Grant per requested topic, in request order.
        return_codes: &'e [SubscribeReturnCode],
    },
    /// UNSUBACK arrived for an unsubscribe request.
    Unsubscribed {
        /// Identifier returned by [`Client::unsubscribe`].
        packet_id: u16,
    },
    /// PINGRESP arrived.
    Pong,
    /// An acknowledgement matched no queued request.
    UnknownAck {
        /// Type of the acknowledgement.
        control_type: ControlType,
        /// Packet identifier it carried, 0 if none.
        packet_id: u16,
    },
}

/// Receives what the broker sends.
///
/// Any `FnMut(&Publish<'_>)` closure is a handler that ignores events.
///
/// # Examples
///
/// ```rust
/// use libmqtt::network::application::mqtt::{Event, Handler, Publish};
///
/// #[derive(Default)]
/// struct Counter {
///     messages: usize,
///     pongs: usize,
/// }
///
/// impl Handler for Counter {
///     fn on_publish(&mut self, _publish: &Publish<'_>) {
///         self.messages += 1;
///     }
///
///     fn on_event(&mut self, event: &Event<'_>) {
///         if let Event::Pong = event {
///             self.pongs += 1;
///         }
///     }
/// }
/// ```
pub trait Handler {
    /// Called once per inbound PUBLISH, from inside [`Client::sync`].
    fn on_publish(&mut self, publish: &Publish<'_>);

    /// Called for every other session event.
    fn on_event(&mut self, event: &Event<'_>) {
        let _ = event;
    }

    /// Called at the start of every [`Client::sync`], before any traffic.
    ///
    /// Returning an error skips the rest of that call and hands the error to
    /// the caller. The session itself is not touched.
    fn on_sync(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl<F> Handler for F
where
    F: FnMut(&Publish<'_>),
{
    fn on_publish(&mut self, publish: &Publish<'_>) {
        self(publish)
    }
}

/// Produces a fresh connection to the broker for [`Client::reconnect`].
pub trait Reconnect<C> {
    /// Opens a new connection.
    fn reconnect(&mut self) -> Result<C, NetworkError>;
}

/// A [`Reconnect`] that dials the same remote again through a [`Connect`].
#[derive(Debug)]
pub struct Redial<'r, N> {
    network: N,
    remote: &'r str,
}

impl<'r, N: Connect> Redial<'r, N> {
    /// Redials `remote` through `network` on every reconnect.
    pub fn new(network: N, remote: &'r str) -> Self {
        Self { network, remote }
    }
}

impl<N: Connect> Reconnect<N::Connection> for Redial<'_, N> {
    fn reconnect(&mut self) -> Result<N::Connection, NetworkError> {
        self.network.connect(self.remote).map_err(|e| e.kind())
    }
}

/// Flags of an outbound PUBLISH.
///
/// A bare [`QoS`] converts into options with `retain` and `dup` cleared.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Delivery guarantee.
    pub qos: QoS,
    /// Ask the broker to retain the message.
    pub retain: bool,
    /// Mark the first transmission as a duplicate. Not allowed with QoS 0.
    pub dup: bool,
}

impl From<QoS> for PublishOptions {
    fn from(qos: QoS) -> Self {
        Self {
            qos,
            ..Self::default()
        }
    }
}

/// Acknowledgements a client accepts, detached from the receive buffer.
enum Ack {
    ConnAck(ConnAck),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    SubAck(SubAck),
    UnsubAck(u16),
    PingResp,
}

/// An MQTT 3.1.1 client for publish-subscribe messaging.
///
/// The client works over any [`Connection`] and keeps all packet state in two
/// caller-supplied buffers: one holds the outbound [`MessageQueue`], the other
/// collects inbound bytes until a whole packet has arrived.
///
/// # Type Parameters
///
/// * `C` - The connection type implementing [`Connection`]
/// * `H` - The [`Handler`] receiving inbound messages and events
/// * `K` - The [`Clock`] used for keep-alive and timeouts
pub struct Client<'a, C: Connection, H: Handler, K: Clock> {
    connection: Option<C>,
    handler: H,
    clock: K,
    reconnector: Option<&'a mut dyn Reconnect<C>>,
    queue: MessageQueue<'a>,
    recv_buf: &'a mut [u8],
    recv_len: usize,
    state: ClientState,
    error: Option<Error>,
    pid_lfsr: u16,
    options: Option<Options<'a>>,
    config: Config,
    time_of_last_send: u64,
    number_of_timeouts: u32,
    typical_response_time: Option<f32>,
    sending: Option<usize>,
    send_offset: usize,
}

impl<C: Connection, H: Handler, K: Clock> fmt::Debug for Client<'_, C, H, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state)
            .field("error", &self.error)
            .field("queued", &self.queue.len())
            .field("recv_len", &self.recv_len)
            .field("send_offset", &self.send_offset)
            .field("number_of_timeouts", &self.number_of_timeouts)
            .finish_non_exhaustive()
    }
}

impl<'a, C: Connection, H: Handler, K: Clock> Client<'a, C, H, K> {
    /// Creates a disconnected client.
    ///
    /// `send_buf` backs the outbound message queue and bounds how much can
    /// be waiting for transmission or acknowledgement. `recv_buf` must be
    /// large enough for the largest packet the broker will send.
    pub fn new(
        connection: C,
        send_buf: &'a mut [u8],
        recv_buf: &'a mut [u8],
        handler: H,
        clock: K,
    ) -> Self {
        Self {
            connection: Some(connection),
            handler,
            clock,
            reconnector: None,
            queue: MessageQueue::new(send_buf),
            recv_buf,
            recv_len: 0,
            state: ClientState::Disconnected,
            error: None,
            pid_lfsr: PACKET_ID_SEED,
            options: None,
            config: Config::default(),
            time_of_last_send: 0,
            number_of_timeouts: 0,
            typical_response_time: None,
            sending: None,
            send_offset: 0,
        }
    }

    /// Installs a reconnect handler.
    ///
    /// With one installed, [`sync`](Self::sync) reconnects by itself after a
    /// fatal error instead of returning it.
    pub fn with_reconnect(mut self, reconnector: &'a mut dyn Reconnect<C>) -> Self {
        self.reconnector = Some(reconnector);
        self
    }

    /// Replaces the engine tunables.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Current connection state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// The fatal error that ended the session, if any.
    pub fn error(&self) -> Option<Error> {
        self.error
    }

    /// The outbound message queue.
    pub fn queue(&self) -> &MessageQueue<'a> {
        &self.queue
    }

    /// The current connection.
    pub fn connection(&self) -> Option<&C> {
        self.connection.as_ref()
    }

    /// The current connection, mutably.
    pub fn connection_mut(&mut self) -> Option<&mut C> {
        self.connection.as_mut()
    }

    /// The message handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The message handler, mutably.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Session options given to [`connect`](Self::connect).
    pub fn options(&self) -> Option<&Options<'a>> {
        self.options.as_ref()
    }

    /// Moving average of acknowledgement round trips in seconds.
    pub fn typical_response_time(&self) -> Option<f32> {
        self.typical_response_time
    }

    /// Queues a CONNECT for `options`.
    ///
    /// The packet goes out on the next [`sync`](Self::sync). The options are
    /// kept and reused by every reconnect.
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadyConnected`] - the session is not Disconnected
    /// * [`Error::PasswordWithoutUsername`], [`Error::CleanSessionRequired`],
    ///   [`Error::InvalidWill`] - the options are inconsistent
    /// * [`Error::QueueFull`] - no room in the message queue
    pub fn connect(&mut self, options: Options<'a>) -> Result<(), Error> {
        if self.state != ClientState::Disconnected {
            return Err(Error::AlreadyConnected);
        }
        if let Some(error) = self.error {
            return Err(error);
        }
        pack(&mut self.queue, &Packet::Connect(options.to_connect()), self.sending.is_none())?;
        self.options = Some(options);
        self.state = ClientState::Connecting;
        self.time_of_last_send = self.clock.now();
        debug!("CONNECT queued");
        Ok(())
    }

    /// Queues a PUBLISH and returns its packet identifier, 0 for QoS 0.
    ///
    /// # Errors
    ///
    /// * [`Error::ConnectNotCalled`] - no session was ever requested
    /// * [`Error::InvalidTopic`] - `topic` is empty or contains wildcards
    /// * [`Error::InvalidFlags`] - `dup` requested with QoS 0
    /// * [`Error::QueueFull`] - no room in the message queue
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// client.publish("sensors/temperature", b"23.5", QoS::AtMostOnce.into())?;
    /// client.publish(
    ///     "status",
    ///     b"online",
    ///     PublishOptions { qos: QoS::AtLeastOnce, retain: true, dup: false },
    /// )?;
    /// ```
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<u16, Error> {
        self.ensure_session()?;
        let packet_id = match options.qos {
            QoS::AtMostOnce => 0,
            _ => self.next_packet_id(),
        };
        let publish = Publish {
            dup: options.dup,
            qos: options.qos,
            retain: options.retain,
            topic,
            packet_id,
            payload,
        };
        pack(&mut self.queue, &Packet::Publish(publish), self.sending.is_none())?;
        if packet_id != 0 {
            self.pid_lfsr = packet_id;
        }
        Ok(packet_id)
    }

    /// Queues a SUBSCRIBE for up to eight `(filter, QoS)` pairs and returns
    /// its packet identifier.
    ///
    /// # Errors
    ///
    /// * [`Error::ConnectNotCalled`] - no session was ever requested
    /// * [`Error::TooManyTopics`] - more than eight pairs
    /// * [`Error::MalformedRequest`] - no pairs
    /// * [`Error::QueueFull`] - no room in the message queue
    pub fn subscribe(&mut self, topics: &[(&str, QoS)]) -> Result<u16, Error> {
        self.ensure_session()?;
        let packet_id = self.next_packet_id();
        let subscribe = Subscribe::new(packet_id, topics)?;
        pack(&mut self.queue, &Packet::Subscribe(subscribe), self.sending.is_none())?;
        self.pid_lfsr = packet_id;
        Ok(packet_id)
    }

    /// Queues an UNSUBSCRIBE for up to eight filters and returns its packet
    /// identifier.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&mut self, topics: &[&str]) -> Result<u16, Error> {
        self.ensure_session()?;
        let packet_id = self.next_packet_id();
        let unsubscribe = Unsubscribe::new(packet_id, topics)?;
        pack(&mut self.queue, &Packet::Unsubscribe(unsubscribe), self.sending.is_none())?;
        self.pid_lfsr = packet_id;
        Ok(packet_id)
    }

    /// Queues a PINGREQ.
    pub fn ping(&mut self) -> Result<(), Error> {
        self.ensure_session()?;
        pack(&mut self.queue, &Packet::PingReq, self.sending.is_none())?;
        Ok(())
    }

    /// Queues a DISCONNECT. The client is Disconnected once it has been sent.
    pub fn disconnect(&mut self) -> Result<(), Error> {
        self.ensure_session()?;
        pack(&mut self.queue, &Packet::Disconnect, self.sending.is_none())?;
        Ok(())
    }

    /// Opens a new connection through the installed reconnect handler and
    /// restarts the session on it.
    ///
    /// # Errors
    ///
    /// * [`Error::NoReconnectHandler`] - none was installed
    /// * [`Error::Transport`] - the handler could not connect
    pub fn reconnect(&mut self) -> Result<(), Error> {
        let reconnector = self
            .reconnector
            .as_mut()
            .ok_or(Error::NoReconnectHandler)?;
        let connection = reconnector.reconnect()?;
        self.reconnect_with(connection)
    }

    /// Restarts the session on `connection`.
    ///
    /// The previous connection is closed and buffered input dropped. With a
    /// clean session the message queue is emptied; otherwise every
    /// unacknowledged request is resent, publications with DUP set. A fresh
    /// CONNECT is sent ahead of everything else.
    ///
    /// # Errors
    ///
    /// * [`Error::ConnectNotCalled`] - there are no session options to reuse
    /// * [`Error::QueueFull`] - the preserved session leaves no room for the
    ///   CONNECT; the client is left as it was and `connection` is dropped
    pub fn reconnect_with(&mut self, connection: C) -> Result<(), Error> {
        let options = self.options.ok_or(Error::ConnectNotCalled)?;
        let connect = Packet::Connect(options.to_connect());

        let (kept, kept_bytes) = if options.clean_session {
            (0, 0)
        } else {
            self.queue
                .iter()
                .filter(|m| survives_reconnect(m))
                .fold((0, 0), |(count, bytes), m| (count + 1, bytes + m.size))
        };
        let needed = kept_bytes + connect.encoded_len()? + (kept + 1) * DESCRIPTOR_SIZE;
        if needed > self.queue.capacity() {
            warn!("no room to resume session, {} bytes needed", needed);
            return Err(Error::QueueFull);
        }

        if let Some(previous) = self.connection.replace(connection) {
            if let Err(e) = previous.close() {
                warn!("closing previous connection failed: {}", e.kind());
            }
        }

        self.recv_len = 0;
        self.sending = None;
        self.send_offset = 0;
        self.error = None;
        self.number_of_timeouts = 0;

        if options.clean_session {
            self.queue.clear();
        } else {
            for index in 0..self.queue.len() {
                let Some(message) = self.queue.get(index) else {
                    continue;
                };
                let state = if survives_reconnect(&message) {
                    MessageState::Unsent
                } else {
                    MessageState::Complete
                };
                self.queue.set_state(index, state);
            }
            self.queue.clean();
        }

        pack(&mut self.queue, &connect, true)?;
        self.state = ClientState::Connecting;
        self.time_of_last_send = self.clock.now();
        info!("reconnecting, {} requests pending", self.queue.len());
        Ok(())
    }

    /// Drives the session: flushes queued packets, processes inbound packets
    /// and checks for timeouts.
    ///
    /// Must be called repeatedly. Never blocks: a transport that cannot take
    /// or give data right now simply ends the step.
    ///
    /// # Errors
    ///
    /// Fatal errors (see [`Error::is_fatal`]) end the session: the state
    /// becomes Disconnected and every later call returns the same error until
    /// a reconnect. With a reconnect handler installed the next call
    /// reconnects instead. An error from [`Handler::on_sync`] is returned
    /// as is.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.handler.on_sync()?;
        if let Some(error) = self.error {
            if self.reconnector.is_none() {
                return Err(error);
            }
            info!("reconnecting after {}", error);
            self.reconnect()?;
        }
        if self.options.is_none() {
            return Err(Error::ConnectNotCalled);
        }

        let now = self.clock.now();
        match self.step(now) {
            Ok(()) => {
                if self.sending.is_none() {
                    self.queue.clean();
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!("session failed: {}", e);
                self.error = Some(e);
                self.state = ClientState::Disconnected;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn step(&mut self, now: u64) -> Result<(), Error> {
        self.flush(now)?;
        if self.keep_alive_due(now) {
            match pack(&mut self.queue, &Packet::PingReq, self.sending.is_none()) {
                Ok(_) => {
                    debug!("keep-alive ping");
                    self.flush(now)?;
                }
                Err(Error::QueueFull) => warn!("no room for keep-alive ping"),
                Err(e) => return Err(e),
            }
        }
        if self.state == ClientState::Disconnected {
            return Ok(());
        }
        self.receive(now)?;
        self.check_timeouts(now)
    }

    fn ensure_session(&self) -> Result<(), Error> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.options.is_none() {
            return Err(Error::ConnectNotCalled);
        }
        Ok(())
    }

    /// Next identifier of the sequence not held by a live queue entry.
    ///
    /// Does not advance the sequence; callers store the returned value once
    /// the request is queued.
    fn next_packet_id(&self) -> u16 {
        let mut lfsr = self.pid_lfsr;
        loop {
            let lsb = lfsr & 1;
            lfsr >>= 1;
            if lsb == 1 {
                lfsr ^= PACKET_ID_TAPS;
            }
            if !self.queue.holds_packet_id(lfsr) {
                return lfsr;
            }
        }
    }

    fn keep_alive_due(&self, now: u64) -> bool {
        let keep_alive = self.options.map_or(0, |o| u64::from(o.keep_alive_seconds));
        keep_alive > 0
            && matches!(self.state, ClientState::Connected | ClientState::Degraded)
            && now > self.time_of_last_send.saturating_add(keep_alive)
            && self.queue.find(ControlType::PingReq, None).is_none()
    }

    /// First Unsent entry allowed on the wire right now.
    fn next_sendable(&self) -> Option<usize> {
        let qos2_in_flight = (0..self.queue.len()).any(|index| {
            self.queue.get(index).is_some_and(|m| {
                m.state == MessageState::AwaitingAck && self.is_qos2_publish(index, &m)
            })
        });

        (0..self.queue.len()).find(|&index| {
            let Some(message) = self.queue.get(index) else {
                return false;
            };
            if message.state != MessageState::Unsent {
                return false;
            }
            if self.state == ClientState::Connecting && message.control_type != ControlType::Connect {
                return false;
            }
            !(qos2_in_flight && self.is_qos2_publish(index, &message))
        })
    }

    fn is_qos2_publish(&self, index: usize, message: &QueuedMessage) -> bool {
        message.control_type == ControlType::Publish
            && self
                .queue
                .payload(index)
                .and_then(|bytes| bytes.first())
                .is_some_and(|&first| packet::publish_qos(first) == QoS::ExactlyOnce)
    }

    fn flush(&mut self, now: u64) -> Result<(), Error> {
        if self.state == ClientState::Disconnected {
            return Ok(());
        }
        loop {
            let index = match self.sending.or_else(|| self.next_sendable()) {
                Some(index) => index,
                None => return Ok(()),
            };
            if !self.send(index, now)? {
                return Ok(());
            }
            if self.state == ClientState::Disconnected {
                return Ok(());
            }
        }
    }

    /// Writes the entry at `index`, returning false when the transport
    /// stopped accepting data before the packet was complete.
    fn send(&mut self, index: usize, now: u64) -> Result<bool, Error> {
        let Some(mut message) = self.queue.get(index) else {
            self.sending = None;
            self.send_offset = 0;
            return Ok(true);
        };
        let connection = self
            .connection
            .as_mut()
            .ok_or(Error::Transport(NetworkError::NotOpen))?;
        let bytes = self.queue.payload(index).unwrap_or(&[]);

        while self.send_offset < bytes.len() {
            match connection.write(&bytes[self.send_offset..]) {
                Ok(0) => {
                    self.sending = Some(index);
                    trace!("{} partially sent, {} bytes", message.control_type, self.send_offset);
                    return Ok(false);
                }
                Ok(n) => self.send_offset += n,
                Err(e) if e.kind().is_would_block() => {
                    self.sending = Some(index);
                    trace!("{} partially sent, {} bytes", message.control_type, self.send_offset);
                    return Ok(false);
                }
                Err(e) => return Err(Error::Transport(e.kind())),
            }
        }
        if let Err(e) = connection.flush() {
            if !e.kind().is_would_block() {
                return Err(Error::Transport(e.kind()));
            }
        }

        self.sending = None;
        self.send_offset = 0;
        self.time_of_last_send = now;
        trace!("{} sent, id {}", message.control_type, message.packet_id);

        message.time_sent = now;
        if message.state != MessageState::Complete {
            message.state = match message.control_type {
                ControlType::PubAck | ControlType::PubComp | ControlType::Disconnect => {
                    MessageState::Complete
                }
                ControlType::Publish if message.packet_id == 0 => MessageState::Complete,
                ControlType::Publish => {
                    if let Some(first) = self.queue.payload_mut(index).and_then(|b| b.first_mut()) {
                        packet::set_publish_dup(first);
                    }
                    MessageState::AwaitingAck
                }
                _ => MessageState::AwaitingAck,
            };
        }
        self.queue.set(index, &message);

        if message.control_type == ControlType::Disconnect {
            info!("disconnected");
            self.state = ClientState::Disconnected;
        }
        Ok(true)
    }

    fn receive(&mut self, now: u64) -> Result<(), Error> {
        loop {
            let was_full = self.recv_len == self.recv_buf.len();
            let mut progressed = false;
            if !was_full {
                let connection = self
                    .connection
                    .as_mut()
                    .ok_or(Error::Transport(NetworkError::NotOpen))?;
                match connection.read(&mut self.recv_buf[self.recv_len..]) {
                    Ok(0) => {}
                    Ok(n) => {
                        self.recv_len += n;
                        progressed = true;
                    }
                    Err(e) if e.kind().is_would_block() => {}
                    Err(e) => return Err(Error::Transport(e.kind())),
                }
            }

            let consumed = self.process_received(now)?;
            if !progressed && !(was_full && consumed) {
                return Ok(());
            }
        }
    }

    /// Handles every complete packet in the receive buffer, returning whether
    /// any was consumed.
    ///
    /// A packet whose answer finds no room in the message queue stays at the
    /// front of the buffer until a later call.
    fn process_received(&mut self, now: u64) -> Result<bool, Error> {
        let mut consumed = false;
        loop {
            let handled = match self.handle_front(now) {
                Err(Error::QueueFull) => {
                    self.settle_buffered_acks(now)?;
                    self.handle_front(now)
                }
                handled => handled,
            };
            let len = match handled {
                Ok(Some(len)) => len,
                Ok(None) => return Ok(consumed),
                Err(Error::QueueFull) => {
                    warn!("no room to answer inbound packet, holding it");
                    return Ok(consumed);
                }
                Err(e) => return Err(e),
            };
            self.recv_buf.copy_within(len..self.recv_len, 0);
            self.recv_len -= len;
            consumed = true;
        }
    }

    /// Handles the packet at the front of the receive buffer and returns its
    /// length, or `None` while it is incomplete.
    fn handle_front(&mut self, now: u64) -> Result<Option<usize>, Error> {
        let (ack, len) = {
            let received = &self.recv_buf[..self.recv_len];
            let Some((packet, len)) = Packet::decode(received)? else {
                if let Some((header, _)) = FixedHeader::decode(received)? {
                    if header.packet_len() > self.recv_buf.len() {
                        return Err(Error::RecvBufferTooSmall);
                    }
                }
                return Ok(None);
            };
            let ack = match packet {
                Packet::Publish(publish) => {
                    if acknowledge_publish(&mut self.queue, &publish, self.sending.is_none())? {
                        self.handler.on_publish(&publish);
                    }
                    None
                }
                Packet::ConnAck(connack) => Some(Ack::ConnAck(connack)),
                Packet::PubAck(id) => Some(Ack::PubAck(id)),
                Packet::PubRec(id) => Some(Ack::PubRec(id)),
                Packet::PubRel(id) => Some(Ack::PubRel(id)),
                Packet::PubComp(id) => Some(Ack::PubComp(id)),
                Packet::SubAck(suback) => Some(Ack::SubAck(suback)),
                Packet::UnsubAck(id) => Some(Ack::UnsubAck(id)),
                Packet::PingResp => Some(Ack::PingResp),
                other => {
                    error!("unexpected {} from broker", other.control_type());
                    return Err(Error::InvalidControlType);
                }
            };
            (ack, len)
        };
        if let Some(ack) = ack {
            self.handle_ack(ack, now)?;
        }
        Ok(Some(len))
    }

    /// Handles the acknowledgements buffered right behind the front packet.
    ///
    /// Only acknowledgements that complete a request without queueing an
    /// answer are taken, so handling them can only free queue space. The
    /// scan stops at the first packet of any other kind.
    fn settle_buffered_acks(&mut self, now: u64) -> Result<(), Error> {
        let Some((_, mut offset)) = Packet::decode(&self.recv_buf[..self.recv_len])? else {
            return Ok(());
        };
        loop {
            let (ack, len) = {
                let Some((packet, len)) = Packet::decode(&self.recv_buf[offset..self.recv_len])?
                else {
                    return Ok(());
                };
                let ack = match packet {
                    Packet::PubAck(id) => Ack::PubAck(id),
                    Packet::PubComp(id) => Ack::PubComp(id),
                    Packet::SubAck(suback) => Ack::SubAck(suback),
                    Packet::UnsubAck(id) => Ack::UnsubAck(id),
                    Packet::PingResp => Ack::PingResp,
                    _ => return Ok(()),
                };
                (ack, len)
            };
            trace!("settling buffered acknowledgement ahead of a held packet");
            self.handle_ack(ack, now)?;
            self.recv_buf.copy_within(offset + len..self.recv_len, offset);
            self.recv_len -= len;
        }
    }

    fn handle_ack(&mut self, ack: Ack, now: u64) -> Result<(), Error> {
        let can_compact = self.sending.is_none();
        match ack {
            Ack::ConnAck(connack) => {
                if self
                    .complete(ControlType::Connect, None, ControlType::ConnAck, now)
                    .is_none()
                {
                    return Ok(());
                }
                match connack.return_code {
                    ConnectReturnCode::Accepted => {
                        info!("connected, session present: {}", connack.session_present);
                        self.state = ClientState::Connected;
                        self.handler.on_event(&Event::Connected {
                            session_present: connack.session_present,
                        });
                        Ok(())
                    }
                    ConnectReturnCode::IdentifierRejected => Err(Error::ClientIdRejected),
                    code => Err(Error::ConnectionRefused(code)),
                }
            }
            Ack::PubAck(id) => {
                if self
                    .complete(ControlType::Publish, Some(id), ControlType::PubAck, now)
                    .is_some()
                {
                    self.handler.on_event(&Event::Published { packet_id: id });
                }
                Ok(())
            }
            Ack::PubRec(id) => {
                if self.queue.find(ControlType::PubRel, Some(id)).is_some() {
                    debug!("duplicate PUBREC for {}", id);
                    return Ok(());
                }
                if self.queue.find(ControlType::Publish, Some(id)).is_some() {
                    pack(&mut self.queue, &Packet::PubRel(id), can_compact)?;
                }
                self.complete(ControlType::Publish, Some(id), ControlType::PubRec, now);
                Ok(())
            }
            Ack::PubRel(id) => {
                pack(&mut self.queue, &Packet::PubComp(id), can_compact)?;
                self.complete(ControlType::PubRec, Some(id), ControlType::PubRel, now);
                Ok(())
            }
            Ack::PubComp(id) => {
                if self
                    .complete(ControlType::PubRel, Some(id), ControlType::PubComp, now)
                    .is_some()
                {
                    self.handler.on_event(&Event::Published { packet_id: id });
                }
                Ok(())
            }
            Ack::SubAck(suback) => {
                let id = suback.packet_id;
                if let Some(requested) = self.requested_topics(id) {
                    if requested != suback.return_codes.len() {
                        error!(
                            "SUBACK {} carries {} grants for {} topics",
                            id,
                            suback.return_codes.len(),
                            requested
                        );
                        return Err(Error::MalformedPacket);
                    }
                }
                if self
                    .complete(ControlType::Subscribe, Some(id), ControlType::SubAck, now)
                    .is_some()
                {
                    for (position, code) in suback.return_codes.iter().enumerate() {
                        if *code == SubscribeReturnCode::Failure {
                            warn!("subscription {} of request {} refused", position, id);
                        }
                    }
                    self.handler.on_event(&Event::Subscribed {
                        packet_id: id,
                        return_codes: &suback.return_codes,
                    });
                }
                Ok(())
            }
            Ack::UnsubAck(id) => {
                if self
                    .complete(ControlType::Unsubscribe, Some(id), ControlType::UnsubAck, now)
                    .is_some()
                {
                    self.handler.on_event(&Event::Unsubscribed { packet_id: id });
                }
                Ok(())
            }
            Ack::PingResp => {
                if self
                    .complete(ControlType::PingReq, None, ControlType::PingResp, now)
                    .is_some()
                {
                    self.handler.on_event(&Event::Pong);
                }
                Ok(())
            }
        }
    }

    /// Number of topic filters in the live SUBSCRIBE carrying `packet_id`.
    fn requested_topics(&self, packet_id: u16) -> Option<usize> {
        let index = self.queue.find(ControlType::Subscribe, Some(packet_id))?;
        match Packet::decode(self.queue.payload(index)?) {
            Ok(Some((Packet::Subscribe(subscribe), _))) => Some(subscribe.topics.len()),
            _ => None,
        }
    }

    /// Marks the queued `request` answered by `ack` as Complete.
    ///
    /// An acknowledgement without a matching request is reported and
    /// otherwise ignored.
    fn complete(
        &mut self,
        request: ControlType,
        packet_id: Option<u16>,
        ack: ControlType,
        now: u64,
    ) -> Option<QueuedMessage> {
        let Some(index) = self.queue.find(request, packet_id) else {
            let packet_id = packet_id.unwrap_or(0);
            warn!("{} for unknown request {}", ack, packet_id);
            self.handler.on_event(&Event::UnknownAck {
                control_type: ack,
                packet_id,
            });
            return None;
        };
        let message = self.queue.get(index)?;
        self.queue.set_state(index, MessageState::Complete);

        self.number_of_timeouts = 0;
        if self.state == ClientState::Degraded {
            self.state = ClientState::Connected;
        }
        let elapsed = now.saturating_sub(message.time_sent) as f32;
        self.typical_response_time = Some(match self.typical_response_time {
            Some(typical) => 0.875 * typical + 0.125 * elapsed,
            None => elapsed,
        });
        Some(message)
    }

    fn check_timeouts(&mut self, now: u64) -> Result<(), Error> {
        if self.sending.is_some() {
            return Ok(());
        }
        let timeout = self.config.response_timeout;
        let Some(oldest) = self
            .queue
            .iter()
            .filter(|m| m.state == MessageState::AwaitingAck)
            .map(|m| m.time_sent)
            .min()
        else {
            return Ok(());
        };
        if now <= oldest.saturating_add(timeout) {
            return Ok(());
        }

        self.number_of_timeouts += 1;
        warn!("response timeout {} of {}", self.number_of_timeouts, self.config.max_timeouts);
        if self.number_of_timeouts > self.config.max_timeouts {
            return Err(Error::ResponseTimeout);
        }
        if self.state == ClientState::Connected {
            self.state = ClientState::Degraded;
        }

        for index in 0..self.queue.len() {
            let Some(message) = self.queue.get(index) else {
                continue;
            };
            if message.state != MessageState::AwaitingAck
                || now <= message.time_sent.saturating_add(timeout)
            {
                continue;
            }
            let state = if message.control_type == ControlType::PingReq {
                MessageState::Complete
            } else {
                MessageState::Unsent
            };
            self.queue.set_state(index, state);
        }
        Ok(())
    }
}

/// Whether a queued entry is resent when a session is resumed.
fn survives_reconnect(message: &QueuedMessage) -> bool {
    message.state != MessageState::Complete
        && !matches!(
            message.control_type,
            ControlType::Connect | ControlType::PingReq | ControlType::Disconnect
        )
}

/// Encodes `packet` into the free region of `queue` and registers it.
///
/// When the packet does not fit and `can_compact` is set, Complete entries are
/// reclaimed first. Compaction moves entries, so it is skipped while a packet
/// is partially written.
fn pack(queue: &mut MessageQueue<'_>, packet: &Packet<'_>, can_compact: bool) -> Result<usize, Error> {
    let len = match packet.encode(queue.free_mut()) {
        Ok(len) => len,
        Err(Error::BufferTooSmall) if can_compact => {
            queue.clean();
            packet.encode(queue.free_mut()).map_err(|e| match e {
                Error::BufferTooSmall => Error::QueueFull,
                other => other,
            })?
        }
        Err(Error::BufferTooSmall) => return Err(Error::QueueFull),
        Err(e) => return Err(e),
    };
    queue.register(len, packet.control_type(), packet.packet_id().unwrap_or(0))
}

/// Queues the acknowledgement an inbound PUBLISH needs and returns whether it
/// should be delivered to the handler.
///
/// A QoS 2 message whose PUBREC is still queued is a redelivery and is not
/// delivered again.
fn acknowledge_publish(
    queue: &mut MessageQueue<'_>,
    publish: &Publish<'_>,
    can_compact: bool,
) -> Result<bool, Error> {
    match publish.qos {
        QoS::AtMostOnce => Ok(true),
        QoS::AtLeastOnce => {
            pack(queue, &Packet::PubAck(publish.packet_id), can_compact)?;
            Ok(true)
        }
        QoS::ExactlyOnce => {
            if queue
                .find(ControlType::PubRec, Some(publish.packet_id))
                .is_some()
            {
                debug!("duplicate QoS 2 PUBLISH {}", publish.packet_id);
                return Ok(false);
            }
            pack(queue, &Packet::PubRec(publish.packet_id), can_compact)?;
            Ok(true)
        }
    }
}
