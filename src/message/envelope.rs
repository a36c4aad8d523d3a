use crate::colored::Colorize;
use crate::zfx_id::Id;

use tai64::Tai64N;

use std::fmt;
use std::time::Duration;

use super::PROTOCOL_VERSION;

/// Determines how a received message is dispatched.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Handshake,
    Data,
    Control,
    Heartbeat,
    Sync,
    /// A type code from a newer protocol revision. Kept so that it can be logged and
    /// ignored instead of failing the whole connection.
    Unknown(u8),
}

impl MessageType {
    pub fn code(&self) -> u8 {
        match self {
            MessageType::Handshake => 0,
            MessageType::Data => 1,
            MessageType::Control => 2,
            MessageType::Heartbeat => 3,
            MessageType::Sync => 4,
            MessageType::Unknown(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> MessageType {
        match code {
            0 => MessageType::Handshake,
            1 => MessageType::Data,
            2 => MessageType::Control,
            3 => MessageType::Heartbeat,
            4 => MessageType::Sync,
            other => MessageType::Unknown(other),
        }
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MessageType::Handshake => write!(fmt, "{}", "HANDSHAKE".cyan()),
            MessageType::Data => write!(fmt, "{}", "DATA".blue()),
            MessageType::Control => write!(fmt, "{}", "CONTROL".magenta()),
            MessageType::Heartbeat => write!(fmt, "{}", "HEARTBEAT".dimmed()),
            MessageType::Sync => write!(fmt, "{}", "SYNC".yellow()),
            MessageType::Unknown(code) => write!(fmt, "UNKNOWN({})", code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    pub fn bits(&self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Priority> {
        match bits {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            _ => None,
        }
    }
}

const ENCRYPTED: u8 = 0b0000_0001;
const COMPRESSED: u8 = 0b0000_0010;
const PRIORITY_SHIFT: u8 = 2;
const PRIORITY_MASK: u8 = 0b0000_1100;
const RETRYABLE: u8 = 0b0001_0000;
const ACK_REQUESTED: u8 = 0b0010_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flags {
    pub encrypted: bool,
    pub compressed: bool,
    pub priority: Priority,
    pub retryable: bool,
    pub ack_requested: bool,
}

impl Flags {
    pub fn to_byte(&self) -> u8 {
        let mut byte = self.priority.bits() << PRIORITY_SHIFT;
        if self.encrypted {
            byte |= ENCRYPTED;
        }
        if self.compressed {
            byte |= COMPRESSED;
        }
        if self.retryable {
            byte |= RETRYABLE;
        }
        if self.ack_requested {
            byte |= ACK_REQUESTED;
        }
        byte
    }

    /// Parses the flag byte. Unassigned high bits are ignored; an invalid priority is not.
    pub fn from_byte(byte: u8) -> Option<Flags> {
        let priority = Priority::from_bits((byte & PRIORITY_MASK) >> PRIORITY_SHIFT)?;
        Some(Flags {
            encrypted: byte & ENCRYPTED != 0,
            compressed: byte & COMPRESSED != 0,
            priority,
            retryable: byte & RETRYABLE != 0,
            ack_requested: byte & ACK_REQUESTED != 0,
        })
    }
}

/// How the payload bytes are to be interpreted once decrypted and decompressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    /// Opaque application bytes.
    Raw,
    /// A bincode encoded node protocol value.
    Bincode,
}

impl Encoding {
    pub fn code(&self) -> u8 {
        match self {
            Encoding::Raw => 0,
            Encoding::Bincode => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Encoding> {
        match code {
            0 => Some(Encoding::Raw),
            1 => Some(Encoding::Bincode),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Compression {
    None,
    Deflate,
}

impl Compression {
    pub fn code(&self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Deflate => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Compression> {
        match code {
            0 => Some(Compression::None),
            1 => Some(Compression::Deflate),
            _ => None,
        }
    }
}

/// Position of this message within a chunked transfer. Unchunked messages are `0 of 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: u32,
    pub count: u32,
}

impl ChunkInfo {
    pub fn single() -> Self {
        ChunkInfo { index: 0, count: 1 }
    }

    pub fn is_single(&self) -> bool {
        self.count == 1
    }
}

/// The unit of communication between two nodes.
#[derive(Clone, PartialEq)]
pub struct Message {
    pub version: u16,
    pub message_id: Id,
    pub timestamp: Tai64N,
    pub kind: MessageType,
    pub sender: Id,
    pub receiver: Id,
    pub flags: Flags,
    pub encoding: Encoding,
    pub compression: Compression,
    pub chunk: ChunkInfo,
    pub payload: Vec<u8>,
    /// Detached ed25519 signature over [Message::signing_bytes]. Empty until secured.
    pub signature: Vec<u8>,
}

impl Message {
    /// A new unsigned, unchunked message stamped with the current time.
    pub fn new(kind: MessageType, sender: Id, receiver: Id, payload: Vec<u8>) -> Message {
        Message {
            version: PROTOCOL_VERSION,
            message_id: Id::generate(),
            timestamp: Tai64N::now(),
            kind,
            sender,
            receiver,
            flags: Flags::default(),
            encoding: Encoding::Raw,
            compression: Compression::None,
            chunk: ChunkInfo::single(),
            payload,
            signature: vec![],
        }
    }

    pub fn heartbeat(sender: Id, receiver: Id) -> Message {
        Message::new(MessageType::Heartbeat, sender, receiver, vec![])
    }

    /// Bytes covered by the signature: the serialized header followed by the payload.
    pub fn signing_bytes(&self) -> Vec<u8> {
        super::codec::encode_unsigned(self)
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    /// Whether the message was originated more than `max_age` ago. Timestamps from the
    /// future are not stale.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        match Tai64N::now().duration_since(&self.timestamp) {
            Ok(age) => age > max_age,
            Err(_) => false,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "MSG({:?} {} {}->{} [{}/{}] {}B)",
            self.kind,
            format!("{}", self.message_id).yellow(),
            self.sender,
            self.receiver,
            self.chunk.index + 1,
            self.chunk.count,
            self.payload.len(),
        )
    }
}
