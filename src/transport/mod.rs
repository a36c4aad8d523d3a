//! Chunked, flow-controlled delivery of payloads over one connection.
//!
//! Outbound payloads are (optionally) compressed, admitted by the connection's
//! [FlowController](crate::flow::FlowController), split into chunks and secured chunk by
//! chunk. Inbound chunks are opened, reassembled, deduplicated, acknowledged on request
//! and finally handed to the node as a [Delivery].
mod chunker;
mod reassembly;
mod transport;

pub use chunker::{compress, decompress, split};
pub use reassembly::{Expired, Reassembler};
pub use transport::{Inbound, Transport};

use crate::message::{Encoding, MessageType, Priority};
use crate::zfx_id::Id;

use tokio_util::sync::CancellationToken;

use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Largest payload carried by one chunk.
    pub chunk_size: usize,
    /// Flow control window in bytes.
    pub window_size: usize,
    /// Largest (uncompressed) payload accepted by `send` and by reassembly.
    pub max_payload_size: usize,
    pub ack_timeout_ms: u64,
    pub reassembly_timeout_ms: u64,
    /// Incomplete inbound messages held at once; chunks starting further ones are dropped.
    pub max_partial_messages: usize,
    /// How long completed message ids and resend buffers are retained.
    pub dedup_window_ms: u64,
    /// Older messages are dropped on receipt. Keep it within the dedup window, so that a
    /// replayed message is either stale or recognized as a duplicate.
    pub max_message_age_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            chunk_size: 64 * 1024,
            window_size: 1024 * 1024,
            max_payload_size: 16 * 1024 * 1024,
            ack_timeout_ms: 5_000,
            reassembly_timeout_ms: 10_000,
            max_partial_messages: 256,
            dedup_window_ms: 60_000,
            max_message_age_ms: 60_000,
        }
    }
}

impl TransportSettings {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn max_message_age(&self) -> Duration {
        Duration::from_millis(self.max_message_age_ms)
    }
}

/// Per-send options.
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub kind: MessageType,
    pub priority: Priority,
    pub compress: bool,
    pub encrypt: bool,
    /// Wait for the receiver to acknowledge the complete message.
    pub require_ack: bool,
    /// Keep the message around so that the receiver can ask for it again.
    pub retryable: bool,
    pub encoding: Encoding,
    /// Bounds both flow control admission and the acknowledgement wait.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            kind: MessageType::Data,
            priority: Priority::Normal,
            compress: false,
            encrypt: false,
            require_ack: false,
            retryable: false,
            encoding: Encoding::Raw,
            timeout: None,
            cancel: None,
        }
    }
}

impl SendOptions {
    /// Options for bincode encoded node protocol messages.
    pub fn protocol(kind: MessageType) -> Self {
        SendOptions { kind, encoding: Encoding::Bincode, ..SendOptions::default() }
    }
}

/// Transport level CONTROL payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Control {
    Ack { message_id: Id },
    Resend { message_id: Id },
    /// The message could not be reassembled in time and was discarded.
    Incomplete { message_id: Id },
    Close { reason: String },
}

/// A complete inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub from: Id,
    pub message_id: Id,
    pub kind: MessageType,
    pub encoding: Encoding,
    pub payload: Vec<u8>,
}
