//! The wire envelope exchanged between nodes.
//!
//! A [Message] is a fixed binary header, an opaque payload and a detached signature. The
//! [codec] module turns messages into bytes and back, validating everything a receiver
//! relies on before a message is handed further up.
pub mod codec;
mod envelope;

pub use codec::{decode, encode, FrameCodec, HEADER_LEN, MAX_PAYLOAD_SIZE};
pub use envelope::*;

/// Protocol version 1.0. The major version lives in the high byte.
pub const PROTOCOL_VERSION: u16 = 0x0100;

/// Highest major version this implementation understands.
pub const HIGHEST_MAJOR_VERSION: u8 = 1;

pub fn major_version(version: u16) -> u8 {
    (version >> 8) as u8
}
