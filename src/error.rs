//! Error types for caskdb
//!
//! Provides a unified error type for all operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using CaskError
pub type Result<T> = std::result::Result<T, CaskError>;

/// Unified error type for caskdb operations
#[derive(Debug, Error)]
pub enum CaskError {
    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Key must not be empty")]
    EmptyKey,

    #[error("Key not found")]
    KeyNotFound,

    /// The stored form of the value is the single byte 0x00, which the log
    /// format reserves for tombstones.
    #[error("Value is indistinguishable from a tombstone")]
    ValueIsTombstone,

    #[error("Record of {size} bytes exceeds the {max} byte record limit")]
    RecordTooLarge { size: usize, max: usize },

    #[error("Engine is closed")]
    Closed,

    // -------------------------------------------------------------------------
    // Integrity Errors
    // -------------------------------------------------------------------------
    #[error(
        "Checksum mismatch in segment {segment_id} at offset {offset}: stored {stored:#010x}, computed {computed:#010x}"
    )]
    ChecksumMismatch {
        segment_id: u32,
        offset: u64,
        stored: u32,
        computed: u32,
    },

    #[error("Corrupt record in segment {segment_id} at offset {offset}: {reason}")]
    CorruptRecord {
        segment_id: u32,
        offset: u64,
        reason: String,
    },

    /// End-of-file artifact of an unclean shutdown. Recovery drops it.
    #[error("Trailing partial record in segment {segment_id} at offset {offset}")]
    TrailingPartialRecord { segment_id: u32, offset: u64 },

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Truncated write: expected {expected} bytes, wrote {actual}")]
    TruncatedWrite { expected: usize, actual: usize },

    #[error("Segment I/O error on {path}: {source}")]
    SegmentIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data directory {0} is locked by another writer")]
    Locked(PathBuf),

    // -------------------------------------------------------------------------
    // Value Codec Errors
    // -------------------------------------------------------------------------
    #[error("Compression error: {0}")]
    Compression(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CaskError {
    /// Wrap an I/O error with the segment path it happened on
    pub(crate) fn segment_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CaskError::SegmentIo {
            path: path.into(),
            source,
        }
    }

    /// Whether this error is the benign end-of-file artifact of a crash
    pub fn is_trailing_partial(&self) -> bool {
        matches!(self, CaskError::TrailingPartialRecord { .. })
    }
}
