//! Persisted bucket encoding.
//!
//! Layout of a stored bucket:
//!
//! ```text
//! [framing: u8][payload ...]
//! ```
//!
//! Framing `0x00` stores the payload as-is, `0x01` stores it zstd-compressed.
//! The payload is a little-endian `u16` schema version followed by the
//! bincode encoding of the [`Bucket`]. Both framings are accepted on read.

use thiserror::Error;

use crate::bucket::Bucket;
use crate::item::Item;

/// Current payload schema version.
pub const SCHEMA_VERSION: u16 = 1;

const ZSTD_LEVEL: i32 = 3;

/// First byte of every persisted bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Framing {
    Raw = 0x00,
    Zstd = 0x01,
}

impl Framing {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Raw),
            0x01 => Some(Self::Zstd),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty entry")]
    Empty,

    #[error("unknown framing byte {0:#04x}")]
    UnknownFraming(u8),

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("truncated payload")]
    Truncated,

    #[error("unsupported schema version {0}")]
    UnsupportedSchema(u16),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Encodes and decodes bucket records.
#[derive(Clone, Copy, Debug)]
pub struct Codec {
    compress: bool,
}

impl Codec {
    pub fn new(compress: bool) -> Self {
        Self { compress }
    }

    pub fn encode(&self, bucket: &Bucket) -> Result<Vec<u8>, CodecError> {
        let mut payload = SCHEMA_VERSION.to_le_bytes().to_vec();
        bincode::serialize_into(&mut payload, bucket)
            .map_err(|e| CodecError::Serialization(e.to_string()))?;

        if self.compress {
            let compressed = zstd::encode_all(payload.as_slice(), ZSTD_LEVEL)
                .map_err(|e| CodecError::CompressionFailed(e.to_string()))?;
            if compressed.len() < payload.len() {
                return Ok(frame(Framing::Zstd, &compressed));
            }
        }
        Ok(frame(Framing::Raw, &payload))
    }

    /// Decode a persisted bucket. The result's `size` is `bytes.len()`.
    pub fn decode(&self, bytes: &[u8]) -> Result<Bucket, CodecError> {
        let (&first, body) = bytes.split_first().ok_or(CodecError::Empty)?;
        let payload = match Framing::from_byte(first).ok_or(CodecError::UnknownFraming(first))? {
            Framing::Raw => body.to_vec(),
            Framing::Zstd => zstd::decode_all(body)
                .map_err(|e| CodecError::DecompressionFailed(e.to_string()))?,
        };
        if payload.len() < 2 {
            return Err(CodecError::Truncated);
        }
        let version = u16::from_le_bytes([payload[0], payload[1]]);
        if version != SCHEMA_VERSION {
            return Err(CodecError::UnsupportedSchema(version));
        }
        let mut bucket: Bucket = bincode::deserialize(&payload[2..])
            .map_err(|e| CodecError::Serialization(e.to_string()))?;
        bucket.size = bytes.len();
        Ok(bucket)
    }

    /// Uncompressed encoded size of one item inside a bucket.
    pub fn item_size(item: &Item) -> Result<usize, CodecError> {
        bincode::serialized_size(&(&item.id, &item.payload))
            .map(|n| n as usize)
            .map_err(|e| CodecError::Serialization(e.to_string()))
    }
}

fn frame(framing: Framing, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(framing as u8);
    out.extend_from_slice(payload);
    out
}
