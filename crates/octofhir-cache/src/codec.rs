//! Payload encoding shared by both tiers.
//!
//! Values are serialized as MessagePack. Remote payloads above the configured
//! threshold are additionally gzip-compressed; readers detect the gzip magic
//! and fall back to the raw bytes when decompression fails, so entries written
//! under a different threshold stay readable.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CacheError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Serialize a value to MessagePack.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CacheError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Deserialize a MessagePack payload.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CacheError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Gzip-compress a payload.
pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::fast());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Inflate a gzip payload.
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[inline]
pub fn is_compressed(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

/// Compress `bytes` when compression is enabled and the payload exceeds `threshold`.
///
/// A compression failure leaves the payload raw; readers accept both forms.
pub fn maybe_compress(bytes: Vec<u8>, enabled: bool, threshold: usize) -> Vec<u8> {
    if !enabled || bytes.len() <= threshold {
        return bytes;
    }
    match compress(&bytes) {
        Ok(compressed) => compressed,
        Err(e) => {
            tracing::warn!(error = %e, size = bytes.len(), "payload compression failed, storing raw");
            bytes
        }
    }
}

/// Undo `maybe_compress` without knowing which threshold the writer used.
pub fn unwrap_payload(bytes: Vec<u8>) -> Vec<u8> {
    if !is_compressed(&bytes) {
        return bytes;
    }
    match decompress(&bytes) {
        Ok(inflated) => inflated,
        Err(e) => {
            tracing::debug!(error = %e, "payload has gzip magic but is not gzip, reading raw");
            bytes
        }
    }
}
