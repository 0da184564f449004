//! Value compression
//!
//! Applied to values at the engine's public boundary. The storage core and
//! merge never look inside a value; they store and move the encoded bytes
//! verbatim.

use std::io::{Read, Write};

use snap::read::FrameDecoder;
use snap::write::FrameEncoder;

use crate::error::{CaskError, Result};

/// Value compression applied at the engine boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Values are stored verbatim
    #[default]
    None,

    /// Values are stored as snappy frames
    ///
    /// The framed format always carries a stream header, so an encoded value
    /// can never collide with the one-byte tombstone.
    Snappy,
}

impl Compression {
    /// Turn a caller's value into the bytes stored in the log
    pub fn encode(&self, value: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(value.to_vec()),
            Compression::Snappy => {
                let mut encoder = FrameEncoder::new(Vec::with_capacity(value.len() / 2 + 16));
                encoder
                    .write_all(value)
                    .map_err(|e| CaskError::Compression(e.to_string()))?;
                encoder
                    .into_inner()
                    .map_err(|e| CaskError::Compression(e.error().to_string()))
            }
        }
    }

    /// Turn stored bytes back into the caller's value
    pub fn decode(&self, stored: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(stored),
            Compression::Snappy => {
                let mut value = Vec::with_capacity(stored.len() * 2);
                FrameDecoder::new(stored.as_slice())
                    .read_to_end(&mut value)
                    .map_err(|e| CaskError::Compression(e.to_string()))?;
                Ok(value)
            }
        }
    }
}
