//! Binary encoding of [Message].
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! magic(2) version(2) type(1) flags(1) encoding(1) compression(1)
//! message_id(32) timestamp(12) sender(32) receiver(32)
//! chunk_index(4) chunk_count(4) payload_len(4)
//! payload(payload_len) signature_len(1) signature(signature_len)
//! ```
use crate::zfx_id::Id;
use crate::{Error, Result};

use super::envelope::*;
use super::{major_version, HIGHEST_MAJOR_VERSION};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tai64::Tai64N;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

const MAGIC: &[u8; 2] = b"ZM";

/// Size of the fixed header preceding the payload.
pub const HEADER_LEN: usize = 128;

/// Upper bound for a single message payload (one chunk).
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Upper bound for the number of chunks a transfer may be split into.
pub const MAX_CHUNK_COUNT: u32 = 1 << 20;

const SIGNATURE_LEN: usize = 64;

const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD_SIZE + 1 + SIGNATURE_LEN;

/// Serializes the header and payload, without the signature block.
pub(crate) fn encode_unsigned(message: &Message) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + message.payload.len() + 1 + SIGNATURE_LEN);
    buf.put_slice(MAGIC);
    buf.put_u16(message.version);
    buf.put_u8(message.kind.code());
    buf.put_u8(message.flags.to_byte());
    buf.put_u8(message.encoding.code());
    buf.put_u8(message.compression.code());
    buf.put_slice(message.message_id.as_bytes());
    buf.put_slice(&message.timestamp.to_bytes());
    buf.put_slice(message.sender.as_bytes());
    buf.put_slice(message.receiver.as_bytes());
    buf.put_u32(message.chunk.index);
    buf.put_u32(message.chunk.count);
    buf.put_u32(message.payload.len() as u32);
    buf.put_slice(&message.payload);
    buf.to_vec()
}

pub fn encode(message: &Message) -> Vec<u8> {
    let mut bytes = encode_unsigned(message);
    bytes.push(message.signature.len() as u8);
    bytes.extend_from_slice(&message.signature);
    bytes
}

fn read_id(buf: &mut &[u8]) -> Id {
    let mut bytes = [0u8; 32];
    buf.copy_to_slice(&mut bytes);
    Id::from(bytes)
}

/// Decodes and validates a message.
///
/// Unknown message types decode successfully (see [MessageType::Unknown]); everything else
/// that does not match the layout is `MalformedMessage`.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::MalformedMessage("truncated header"));
    }
    let mut buf = bytes;
    if &buf[..2] != MAGIC {
        return Err(Error::MalformedMessage("bad magic"));
    }
    buf.advance(2);

    let version = buf.get_u16();
    if major_version(version) > HIGHEST_MAJOR_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let kind = MessageType::from_code(buf.get_u8());
    let flags = Flags::from_byte(buf.get_u8()).ok_or(Error::MalformedMessage("bad priority"))?;
    let encoding =
        Encoding::from_code(buf.get_u8()).ok_or(Error::MalformedMessage("unknown encoding"))?;
    let compression = Compression::from_code(buf.get_u8())
        .ok_or(Error::MalformedMessage("unknown compression"))?;
    let message_id = read_id(&mut buf);
    let mut timestamp = [0u8; 12];
    buf.copy_to_slice(&mut timestamp);
    let timestamp =
        Tai64N::from_slice(&timestamp).map_err(|_| Error::MalformedMessage("bad timestamp"))?;
    let sender = read_id(&mut buf);
    let receiver = read_id(&mut buf);

    let chunk = ChunkInfo { index: buf.get_u32(), count: buf.get_u32() };
    if chunk.count == 0 || chunk.count > MAX_CHUNK_COUNT {
        return Err(Error::MalformedMessage("bad chunk count"));
    }
    if chunk.index >= chunk.count {
        return Err(Error::MalformedMessage("chunk index out of range"));
    }

    let payload_len = buf.get_u32() as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(Error::MalformedMessage("payload too large"));
    }
    if buf.remaining() < payload_len + 1 {
        return Err(Error::MalformedMessage("truncated payload"));
    }
    let payload = buf[..payload_len].to_vec();
    buf.advance(payload_len);

    let signature_len = buf.get_u8() as usize;
    if signature_len != 0 && signature_len != SIGNATURE_LEN {
        return Err(Error::MalformedMessage("bad signature length"));
    }
    if buf.remaining() != signature_len {
        return Err(Error::MalformedMessage("signature length mismatch"));
    }
    let signature = buf.to_vec();

    Ok(Message {
        version,
        message_id,
        timestamp,
        kind,
        sender,
        receiver,
        flags,
        encoding,
        compression,
        chunk,
        payload,
        signature,
    })
}

/// Length-prefixed message framing for byte streams.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder().max_frame_length(MAX_FRAME_LEN).new_codec();
        FrameCodec { inner }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match self.inner.decode(src)? {
            Some(frame) => decode(&frame).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let bytes = Bytes::from(encode(&item));
        self.inner.encode(bytes, dst)?;
        Ok(())
    }
}
