//! Segment Recovery
//!
//! Rebuilds the key index at startup by replaying every segment.

use std::fs::{self, OpenOptions};
use std::path::Path;

use crate::error::{CaskError, Result};
use crate::keydir::{KeyDir, KeyDirEntry};

use super::reader::{ReadEntry, SegmentReader};
use super::{parse_segment_id, segment_path};

/// Replays segment files into a KeyDir
pub struct Recovery;

/// Result of a recovery or verification pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of segment files replayed
    pub segments_scanned: u64,

    /// Complete, valid records read (tombstones included)
    pub records_recovered: u64,

    /// Tombstones among `records_recovered`
    pub tombstones: u64,

    /// Keys live after replay
    pub live_keys: u64,

    /// Bytes of trailing partial records dropped
    pub partial_bytes_dropped: u64,

    /// Whether the last segment was cut back to its last complete record
    pub was_truncated: bool,

    /// Largest record timestamp seen
    pub last_timestamp: i64,

    /// Highest segment ID found, if any
    pub last_segment_id: Option<u32>,
}

impl Recovery {
    /// List segment IDs in `dir`, ascending
    ///
    /// Files that do not follow the segment naming pattern are ignored.
    pub fn list_segments(dir: &Path) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(dir).map_err(|e| CaskError::segment_io(dir, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| CaskError::segment_io(dir, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(id) = parse_segment_id(&path) {
                ids.push(id);
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }

    /// Replay all segments in `dir` into `keydir`
    ///
    /// This will:
    /// 1. Replay segments in ascending ID order, records in file order
    /// 2. Drop a trailing partial record in any segment
    /// 3. Truncate the last segment back to its last complete record, so the
    ///    active segment never resumes appending after garbage
    /// 4. Fail on any checksum mismatch or corrupt header, including a length
    ///    that runs past the end of a segment with valid records after it
    pub fn recover(dir: &Path, keydir: &KeyDir) -> Result<RecoveryResult> {
        Self::scan(dir, keydir, true)
    }

    /// Replay all segments without modifying any file
    pub fn verify(dir: &Path) -> Result<RecoveryResult> {
        let scratch = KeyDir::new();
        Self::scan(dir, &scratch, false)
    }

    fn scan(dir: &Path, keydir: &KeyDir, repair: bool) -> Result<RecoveryResult> {
        let ids = Self::list_segments(dir)?;
        let mut result = RecoveryResult {
            last_segment_id: ids.last().copied(),
            ..Default::default()
        };

        for (i, &id) in ids.iter().enumerate() {
            let is_last = i + 1 == ids.len();
            let valid_len = Self::replay_segment(dir, id, keydir, &mut result)?;

            if let Some(valid_len) = valid_len {
                if repair && is_last {
                    Self::truncate(dir, id, valid_len)?;
                    result.was_truncated = true;
                }
            }
        }

        result.live_keys = keydir.len() as u64;

        tracing::info!(
            segments = result.segments_scanned,
            records = result.records_recovered,
            tombstones = result.tombstones,
            live_keys = result.live_keys,
            partial_bytes = result.partial_bytes_dropped,
            "Segment replay complete"
        );

        Ok(result)
    }

    /// Replay one segment into `keydir`
    ///
    /// Returns the length of the valid prefix if the segment ended in a
    /// partial record, None if it ended cleanly.
    fn replay_segment(
        dir: &Path,
        id: u32,
        keydir: &KeyDir,
        result: &mut RecoveryResult,
    ) -> Result<Option<u64>> {
        let reader = SegmentReader::open(dir, id)?;
        let file_len = reader.len();
        let mut entries = reader.entries();
        result.segments_scanned += 1;

        while let Some(next) = entries.next() {
            match next {
                Ok(entry) => {
                    Self::apply(id, &entry, keydir)?;
                    result.records_recovered += 1;
                    if entry.record.is_tombstone() {
                        result.tombstones += 1;
                    }
                    result.last_timestamp = result.last_timestamp.max(entry.record.timestamp);
                }
                Err(e) if e.is_trailing_partial() => {
                    let valid_len = entries.position();
                    let dropped = file_len - valid_len;
                    result.partial_bytes_dropped += dropped;
                    tracing::warn!(
                        segment_id = id,
                        offset = valid_len,
                        dropped_bytes = dropped,
                        "Dropping trailing partial record"
                    );
                    return Ok(Some(valid_len));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Apply one replayed record: the last record seen for a key wins
    fn apply(segment_id: u32, entry: &ReadEntry, keydir: &KeyDir) -> Result<()> {
        let record = &entry.record;
        if record.is_tombstone() {
            keydir.delete(&record.key);
            return Ok(());
        }

        let value_offset =
            u32::try_from(entry.value_offset()).map_err(|_| CaskError::CorruptRecord {
                segment_id,
                offset: entry.offset,
                reason: "value offset exceeds 32 bits".to_string(),
            })?;
        let value_size =
            u32::try_from(record.value_len()).map_err(|_| CaskError::CorruptRecord {
                segment_id,
                offset: entry.offset,
                reason: "value size exceeds 32 bits".to_string(),
            })?;

        keydir.add(
            record.key.clone(),
            KeyDirEntry::new(segment_id, value_size, value_offset, record.timestamp),
        );
        Ok(())
    }

    fn truncate(dir: &Path, id: u32, valid_len: u64) -> Result<()> {
        let path = segment_path(dir, id);
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| CaskError::segment_io(&path, e))?;
        file.set_len(valid_len)
            .and_then(|_| file.sync_all())
            .map_err(|e| CaskError::segment_io(&path, e))?;

        tracing::info!(segment_id = id, len = valid_len, "Truncated segment to last complete record");
        Ok(())
    }
}
