//! Record codec
//!
//! Serializes a single log record and verifies its checksum.

use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;

use crate::error::{CaskError, Result};

/// Fixed header size: CRC (4) + Timestamp (8) + KeyLen (4) + ValueLen (4)
pub const HEADER_SIZE: usize = 20;

/// Value payload marking a logical delete
pub const TOMBSTONE: &[u8] = &[0];

/// Largest encodable record; lengths and offsets are 32-bit signed on disk
pub const MAX_RECORD_SIZE: usize = i32::MAX as usize;

/// The fixed-size prefix of every record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub crc: u32,
    pub timestamp: i64,
    pub key_len: i32,
    pub value_len: i32,
}

impl RecordHeader {
    /// Parse a header from its 20 on-disk bytes
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut buf = &bytes[..];
        Self {
            crc: buf.get_u32(),
            timestamp: buf.get_i64(),
            key_len: buf.get_i32(),
            value_len: buf.get_i32(),
        }
    }

    /// Length of key + value, or None if either length is negative
    pub fn body_len(&self) -> Option<usize> {
        let key_len = usize::try_from(self.key_len).ok()?;
        let value_len = usize::try_from(self.value_len).ok()?;
        Some(key_len + value_len)
    }
}

/// A single immutable log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// CRC32 of everything after this field
    pub crc: u32,

    /// Nanoseconds since the Unix epoch, issued by the writing engine
    pub timestamp: i64,

    pub key: Vec<u8>,

    pub value: Vec<u8>,
}

impl Record {
    /// Build a record and compute its checksum
    pub fn new(key: Vec<u8>, value: Vec<u8>, timestamp: i64) -> Self {
        let crc = Self::compute_crc(timestamp, &key, &value);
        Self {
            crc,
            timestamp,
            key,
            value,
        }
    }

    /// Build a tombstone for `key`
    pub fn tombstone(key: Vec<u8>, timestamp: i64) -> Self {
        Self::new(key, TOMBSTONE.to_vec(), timestamp)
    }

    pub fn is_tombstone(&self) -> bool {
        self.value == TOMBSTONE
    }

    pub fn key_len(&self) -> usize {
        self.key.len()
    }

    pub fn value_len(&self) -> usize {
        self.value.len()
    }

    /// Total bytes this record occupies on disk
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.key.len() + self.value.len()
    }

    /// CRC32 over `timestamp ∥ key_len ∥ value_len ∥ key ∥ value`
    pub fn compute_crc(timestamp: i64, key: &[u8], value: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&timestamp.to_be_bytes());
        hasher.update(&(key.len() as i32).to_be_bytes());
        hasher.update(&(value.len() as i32).to_be_bytes());
        hasher.update(key);
        hasher.update(value);
        hasher.finalize()
    }

    /// Encode to the on-disk layout
    ///
    /// Callers must keep `encoded_len()` within `MAX_RECORD_SIZE`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    /// Append the on-disk layout to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32(self.crc);
        buf.put_i64(self.timestamp);
        buf.put_i32(self.key.len() as i32);
        buf.put_i32(self.value.len() as i32);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
    }

    /// Rebuild a record from its header, key and value bytes
    ///
    /// Recomputes the CRC and fails with `ChecksumMismatch` if it differs from
    /// the stored one. Location fields of the error are zero; segment readers
    /// fill them in.
    pub fn decode(header: &[u8; HEADER_SIZE], key: Vec<u8>, value: Vec<u8>) -> Result<Self> {
        let parsed = RecordHeader::decode(header);

        if usize::try_from(parsed.key_len).ok() != Some(key.len())
            || usize::try_from(parsed.value_len).ok() != Some(value.len())
        {
            return Err(CaskError::CorruptRecord {
                segment_id: 0,
                offset: 0,
                reason: format!(
                    "header lengths ({}, {}) do not match body ({}, {})",
                    parsed.key_len,
                    parsed.value_len,
                    key.len(),
                    value.len()
                ),
            });
        }

        let mut hasher = Hasher::new();
        hasher.update(&header[4..]);
        hasher.update(&key);
        hasher.update(&value);
        let computed = hasher.finalize();

        if computed != parsed.crc {
            return Err(CaskError::ChecksumMismatch {
                segment_id: 0,
                offset: 0,
                stored: parsed.crc,
                computed,
            });
        }

        Ok(Self {
            crc: parsed.crc,
            timestamp: parsed.timestamp,
            key,
            value,
        })
    }

    /// Decode a complete encoded record from a single buffer
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(CaskError::ShortRead {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[..HEADER_SIZE]);
        let parsed = RecordHeader::decode(&header);
        let (key_len, value_len) = match (
            usize::try_from(parsed.key_len),
            usize::try_from(parsed.value_len),
        ) {
            (Ok(k), Ok(v)) => (k, v),
            _ => {
                return Err(CaskError::CorruptRecord {
                    segment_id: 0,
                    offset: 0,
                    reason: "negative length in header".to_string(),
                })
            }
        };
        let expected = HEADER_SIZE + key_len + value_len;
        if bytes.len() < expected {
            return Err(CaskError::ShortRead {
                expected,
                actual: bytes.len(),
            });
        }
        let key = bytes[HEADER_SIZE..HEADER_SIZE + key_len].to_vec();
        let value = bytes[HEADER_SIZE + key_len..expected].to_vec();
        Self::decode(&header, key, value)
    }
}

/// Offset of the first complete, checksum-valid record in `bytes`, if any
///
/// Every start offset is tried, so this is linear in `bytes.len()`; headers
/// whose body would run past the buffer are rejected before hashing.
pub fn find_valid_record(bytes: &[u8]) -> Option<usize> {
    let last_start = bytes.len().checked_sub(HEADER_SIZE)?;
    (0..=last_start).find(|&start| is_valid_record(&bytes[start..]))
}

fn is_valid_record(bytes: &[u8]) -> bool {
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&bytes[..HEADER_SIZE]);
    let parsed = RecordHeader::decode(&header);

    match parsed.body_len().and_then(|body| body.checked_add(HEADER_SIZE)) {
        Some(end) if end <= bytes.len() => crc32fast::hash(&bytes[4..end]) == parsed.crc,
        _ => false,
    }
}
