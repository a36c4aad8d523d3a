use crate::{Error, Result};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use std::io::{Read, Write};

pub fn compress(payload: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(payload.len() / 2), flate2::Compression::default());
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}

/// Inflates `payload`, refusing output larger than `limit`.
pub fn decompress(payload: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut out = vec![];
    let mut decoder = DeflateDecoder::new(payload).take(limit as u64 + 1);
    decoder.read_to_end(&mut out).map_err(|_| Error::MalformedMessage("bad compressed payload"))?;
    if out.len() > limit {
        return Err(Error::MalformedMessage("decompressed payload too large"));
    }
    Ok(out)
}

/// Splits a payload into chunks of at most `chunk_size` bytes. An empty payload is one
/// empty chunk.
pub fn split(payload: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    if payload.is_empty() {
        return vec![payload];
    }
    payload.chunks(chunk_size.max(1)).collect()
}
