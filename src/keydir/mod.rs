//! KeyDir Module
//!
//! In-memory index from each live key to the location of its newest value.
//!
//! ## Responsibilities
//! - O(1) point lookups without touching disk
//! - Individually atomic add/get/delete under an internal RwLock
//! - Key iteration over a snapshot, never over the live map
//!
//! ## Data Structure Choice
//! HashMap wrapped in a parking_lot RwLock:
//! - Bitcask needs no key ordering (range scans are not supported)
//! - Many concurrent `get`/`has` readers, writes are already serialized by
//!   the engine's write lock

mod table;

pub use table::{KeyDir, Keys};

/// Location of a key's newest value on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDirEntry {
    /// Segment holding the record
    pub segment_id: u32,

    /// Length of the value payload
    pub value_size: u32,

    /// Byte offset of the value payload within the segment
    pub value_offset: u32,

    /// Timestamp of the record
    pub timestamp: i64,
}

impl KeyDirEntry {
    pub fn new(segment_id: u32, value_size: u32, value_offset: u32, timestamp: i64) -> Self {
        Self {
            segment_id,
            value_size,
            value_offset,
            timestamp,
        }
    }
}
