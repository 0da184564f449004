//! Segment Module
//!
//! Append-only segment files holding the log of records.
//!
//! ## Responsibilities
//! - Encode/decode records with a CRC32 over everything but the checksum
//! - Append to the single active segment and report value offsets
//! - Sequential replay for recovery and merge
//! - Random-access value reads for `get`
//!
//! ## Record Format (big-endian)
//! ```text
//! ┌──────────┬───────────────┬─────────────┬───────────────┬───────┬─────────┐
//! │ CRC (4)  │ Timestamp (8) │ KeyLen (4)  │ ValueLen (4)  │  Key  │  Value  │
//! └──────────┴───────────────┴─────────────┴───────────────┴───────┴─────────┘
//!  ◄──────────────────── 20 byte header ──────────────────►
//! ```
//!
//! A tombstone is a record whose value is the single byte `0x00`.
//!
//! ## Directory Layout
//! Segments are named by a zero-padded, 9 digit id so that lexicographic
//! and numeric order coincide: `000000000.data`, `000000001.data`, ...
//! The highest id is the active segment.

mod reader;
mod record;
mod recovery;
mod writer;

use std::path::{Path, PathBuf};

pub use reader::{read_value_at, ReadEntry, SegmentIterator, SegmentReader};
pub use record::{find_valid_record, Record, RecordHeader, HEADER_SIZE, MAX_RECORD_SIZE, TOMBSTONE};
pub use recovery::{Recovery, RecoveryResult};
pub use writer::SegmentWriter;

/// File suffix shared by every segment
pub const SEGMENT_SUFFIX: &str = ".data";

/// Number of digits in a segment file name
const SEGMENT_ID_WIDTH: usize = 9;

/// Largest ID that still fits the fixed-width file name
pub const MAX_SEGMENT_ID: u32 = 999_999_999;

/// Generate the file path for a segment with given ID
/// 7 → "{dir}/000000007.data"
pub fn segment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{:09}{}", id, SEGMENT_SUFFIX))
}

/// Parse a segment ID from a path
/// "000000042.data" → Some(42), anything else → None
pub fn parse_segment_id(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let digits = name.strip_suffix(SEGMENT_SUFFIX)?;
    if digits.len() != SEGMENT_ID_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
