//! Outbound message queue living in one caller-supplied byte buffer.
//!
//! The buffer is shared by two fronts that grow towards each other:
//!
//! ```text
//! ┌──────────────────────────────┬───────────┬────────┬────────┬────────┐
//! │ packet bytes ──▶             │   free    │ desc 2 │ desc 1 │ desc 0 │
//! └──────────────────────────────┴───────────┴────────┴────────┴────────┘
//! 0                            curr                                   len
//! ```
//!
//! Encoded packets are appended at the front. Each packet gets a fixed-size
//! descriptor stored at the back, the first descriptor occupying the last
//! [`DESCRIPTOR_SIZE`] bytes. Registration fails as a whole when the two
//! fronts would meet, so the queue never needs dynamic allocation.

use super::error::Error;
use super::packet::ControlType;

/// Size of one serialized descriptor.
///
/// Layout: `start: u32`, `size: u32`, `time_sent: u64`, `packet_id: u16`,
/// `control_type: u8`, `state: u8`, 4 bytes of padding. All little endian.
pub const DESCRIPTOR_SIZE: usize = 24;

/// Delivery state of a queued message.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageState {
    /// Registered, not yet fully written to the transport.
    Unsent,
    /// Written, waiting for the matching acknowledgement.
    AwaitingAck,
    /// Done; the space is reclaimed by the next [`MessageQueue::clean`].
    Complete,
}

impl MessageState {
    fn to_byte(self) -> u8 {
        match self {
            MessageState::Unsent => 0,
            MessageState::AwaitingAck => 1,
            MessageState::Complete => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(MessageState::Unsent),
            1 => Some(MessageState::AwaitingAck),
            2 => Some(MessageState::Complete),
            _ => None,
        }
    }
}

/// Descriptor of one queued packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct QueuedMessage {
    /// Offset of the packet bytes in the buffer.
    pub start: usize,
    /// Length of the packet bytes.
    pub size: usize,
    /// Delivery state.
    pub state: MessageState,
    /// Clock reading when the packet was last fully sent.
    pub time_sent: u64,
    /// Type of the queued packet.
    pub control_type: ControlType,
    /// Packet identifier, 0 for packets without one.
    pub packet_id: u16,
}

impl QueuedMessage {
    fn to_bytes(self) -> [u8; DESCRIPTOR_SIZE] {
        let mut bytes = [0u8; DESCRIPTOR_SIZE];
        bytes[0..4].copy_from_slice(&(self.start as u32).to_le_bytes());
        bytes[4..8].copy_from_slice(&(self.size as u32).to_le_bytes());
        bytes[8..16].copy_from_slice(&self.time_sent.to_le_bytes());
        bytes[16..18].copy_from_slice(&self.packet_id.to_le_bytes());
        bytes[18] = self.control_type as u8;
        bytes[19] = self.state.to_byte();
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let mut time_sent = [0u8; 8];
        time_sent.copy_from_slice(&bytes[8..16]);
        Some(Self {
            start: u32_at(0) as usize,
            size: u32_at(4) as usize,
            time_sent: u64::from_le_bytes(time_sent),
            packet_id: u16::from_le_bytes([bytes[16], bytes[17]]),
            control_type: ControlType::try_from(bytes[18]).ok()?,
            state: MessageState::from_byte(bytes[19])?,
        })
    }
}

/// A FIFO of encoded outbound packets and their delivery state.
///
/// # Examples
///
/// ```rust
/// use libmqtt::network::application::mqtt::packet::{ControlType, Packet};
/// use libmqtt::network::application::mqtt::queue::{MessageQueue, MessageState};
///
/// let mut buf = [0u8; 256];
/// let mut queue = MessageQueue::new(&mut buf);
///
/// let len = Packet::PingReq.encode(queue.free_mut()).unwrap();
/// let index = queue.register(len, ControlType::PingReq, 0).unwrap();
///
/// assert_eq!(queue.payload(index), Some(&[0xC0, 0x00][..]));
/// assert_eq!(queue.get(index).unwrap().state, MessageState::Unsent);
/// assert_eq!(queue.find(ControlType::PingReq, None), Some(index));
/// ```
#[derive(Debug)]
pub struct MessageQueue<'a> {
    buf: &'a mut [u8],
    curr: usize,
    len: usize,
}

impl<'a> MessageQueue<'a> {
    /// Creates an empty queue over `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            curr: 0,
            len: 0,
        }
    }

    /// Number of descriptors, including Complete ones not yet cleaned.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the queue holds no descriptors.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total size of the backing buffer.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn descriptor_offset(&self, index: usize) -> usize {
        self.buf.len() - (index + 1) * DESCRIPTOR_SIZE
    }

    /// End of the region available to the next packet, keeping room for its
    /// descriptor.
    fn free_end(&self) -> usize {
        self.buf
            .len()
            .saturating_sub((self.len + 1) * DESCRIPTOR_SIZE)
            .max(self.curr)
    }

    /// Bytes available for the next packet.
    pub fn free_space(&self) -> usize {
        self.free_end() - self.curr
    }

    /// The free region to encode the next packet into before registering it.
    pub fn free_mut(&mut self) -> &mut [u8] {
        let end = self.free_end();
        &mut self.buf[self.curr..end]
    }

    /// Claims the first `nbytes` of the free region as a new Unsent entry.
    ///
    /// Returns the index of the new entry.
    ///
    /// # Errors
    ///
    /// * [`Error::QueueFull`] - the fronts would overlap; the queue is left
    ///   exactly as it was
    pub fn register(
        &mut self,
        nbytes: usize,
        control_type: ControlType,
        packet_id: u16,
    ) -> Result<usize, Error> {
        if (self.len + 1) * DESCRIPTOR_SIZE > self.buf.len() || nbytes > self.free_space() {
            return Err(Error::QueueFull);
        }
        let index = self.len;
        let message = QueuedMessage {
            start: self.curr,
            size: nbytes,
            state: MessageState::Unsent,
            time_sent: 0,
            control_type,
            packet_id,
        };
        self.len += 1;
        self.curr += nbytes;
        self.write_descriptor(index, &message);
        Ok(index)
    }

    fn write_descriptor(&mut self, index: usize, message: &QueuedMessage) {
        let offset = self.descriptor_offset(index);
        self.buf[offset..offset + DESCRIPTOR_SIZE].copy_from_slice(&message.to_bytes());
    }

    /// The descriptor at `index`, oldest first.
    pub fn get(&self, index: usize) -> Option<QueuedMessage> {
        if index >= self.len {
            return None;
        }
        let offset = self.descriptor_offset(index);
        QueuedMessage::from_bytes(&self.buf[offset..offset + DESCRIPTOR_SIZE])
    }

    /// Overwrites the mutable fields of the descriptor at `index`.
    ///
    /// The packet location is owned by the queue; `start` and `size` in
    /// `message` are ignored.
    pub fn set(&mut self, index: usize, message: &QueuedMessage) {
        if let Some(current) = self.get(index) {
            let updated = QueuedMessage {
                start: current.start,
                size: current.size,
                ..*message
            };
            self.write_descriptor(index, &updated);
        }
    }

    /// Changes the state of the entry at `index`.
    pub fn set_state(&mut self, index: usize, state: MessageState) {
        if let Some(mut message) = self.get(index) {
            message.state = state;
            self.write_descriptor(index, &message);
        }
    }

    /// Encoded packet bytes of the entry at `index`.
    pub fn payload(&self, index: usize) -> Option<&[u8]> {
        let message = self.get(index)?;
        self.buf.get(message.start..message.start + message.size)
    }

    /// Mutable packet bytes of the entry at `index`.
    pub fn payload_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let message = self.get(index)?;
        self.buf.get_mut(message.start..message.start + message.size)
    }

    /// Iterates the descriptors oldest first.
    pub fn iter(&self) -> impl Iterator<Item = QueuedMessage> + '_ {
        (0..self.len).filter_map(move |index| self.get(index))
    }

    /// Index of the oldest entry of `control_type` that is not Complete.
    ///
    /// With `packet_id` set only entries carrying that id match.
    pub fn find(&self, control_type: ControlType, packet_id: Option<u16>) -> Option<usize> {
        (0..self.len).find(|&index| {
            self.get(index).is_some_and(|m| {
                m.state != MessageState::Complete
                    && m.control_type == control_type
                    && packet_id.is_none_or(|id| m.packet_id == id)
            })
        })
    }

    /// Whether a live entry already carries packet identifier `id`.
    pub fn holds_packet_id(&self, id: u16) -> bool {
        self.iter()
            .any(|m| m.state != MessageState::Complete && m.packet_id == id)
    }

    /// Removes all Complete entries, moving the rest down while keeping their
    /// order.
    pub fn clean(&mut self) {
        let mut kept = 0;
        let mut curr = 0;
        for index in 0..self.len {
            let Some(mut message) = self.get(index) else {
                continue;
            };
            if message.state == MessageState::Complete {
                continue;
            }
            if message.start != curr {
                self.buf
                    .copy_within(message.start..message.start + message.size, curr);
                message.start = curr;
            }
            curr += message.size;
            self.write_descriptor(kept, &message);
            kept += 1;
        }
        self.len = kept;
        self.curr = curr;
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.len = 0;
        self.curr = 0;
    }
}
