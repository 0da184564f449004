//! Segment Reader
//!
//! Sequential replay of a segment, and random-access value reads.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{CaskError, Result};

use super::record::{find_valid_record, Record, RecordHeader, HEADER_SIZE};
use super::segment_path;

/// A record read during replay, with its position in the segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEntry {
    pub record: Record,

    /// Byte offset of the record start
    pub offset: u64,
}

impl ReadEntry {
    /// Byte offset of the value payload (what the key index stores)
    pub fn value_offset(&self) -> u64 {
        self.offset + (HEADER_SIZE + self.record.key.len()) as u64
    }

    /// Byte offset just past this record
    pub fn end_offset(&self) -> u64 {
        self.offset + self.record.encoded_len() as u64
    }
}

/// Reads records from a segment in file order
pub struct SegmentReader {
    segment_id: u32,
    path: PathBuf,
    file: BufReader<File>,
    /// Offset of the next record
    position: u64,
    /// File length captured at open; segments being replayed are not growing
    len: u64,
}

impl SegmentReader {
    /// Open segment `id` in `dir` for sequential reading
    pub fn open(dir: &Path, id: u32) -> Result<Self> {
        let path = segment_path(dir, id);
        let file = File::open(&path).map_err(|e| CaskError::segment_io(&path, e))?;
        let len = file
            .metadata()
            .map_err(|e| CaskError::segment_io(&path, e))?
            .len();

        Ok(Self {
            segment_id: id,
            path,
            file: BufReader::new(file),
            position: 0,
            len,
        })
    }

    /// Read the next record
    ///
    /// Returns:
    /// - `Ok(Some(entry))`: a complete, checksum-valid record
    /// - `Ok(None)`: clean end of segment
    /// - `Err(TrailingPartialRecord)`: the file ends inside the last record
    /// - `Err(ChecksumMismatch | CorruptRecord)`: a complete but invalid record,
    ///   or a header whose length runs past the end with valid records after it
    pub fn next_record(&mut self) -> Result<Option<ReadEntry>> {
        let remaining = self.len - self.position;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < HEADER_SIZE as u64 {
            return Err(self.partial());
        }

        let mut header = [0u8; HEADER_SIZE];
        self.read_exact(&mut header)?;
        let parsed = RecordHeader::decode(&header);

        let body_len = parsed.body_len().ok_or_else(|| CaskError::CorruptRecord {
            segment_id: self.segment_id,
            offset: self.position,
            reason: format!(
                "negative length in header (key_len={}, value_len={})",
                parsed.key_len, parsed.value_len
            ),
        })?;
        if remaining < (HEADER_SIZE + body_len) as u64 {
            return Err(self.overrun(&parsed)?);
        }

        let mut key = vec![0u8; parsed.key_len as usize];
        self.read_exact(&mut key)?;
        let mut value = vec![0u8; parsed.value_len as usize];
        self.read_exact(&mut value)?;

        let record = Record::decode(&header, key, value).map_err(|e| self.locate(e))?;
        let entry = ReadEntry {
            record,
            offset: self.position,
        };
        self.position = entry.end_offset();

        Ok(Some(entry))
    }

    /// Iterate over all records, stopping after the first error
    pub fn entries(self) -> SegmentIterator {
        SegmentIterator {
            reader: self,
            done: false,
        }
    }

    /// Offset of the next record, i.e. the length of the valid prefix so far
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn segment_id(&self) -> u32 {
        self.segment_id
    }

    /// File length at open
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact(buf)
            .map_err(|e| CaskError::segment_io(&self.path, e))
    }

    fn partial(&self) -> CaskError {
        CaskError::TrailingPartialRecord {
            segment_id: self.segment_id,
            offset: self.position,
        }
    }

    /// Classify a header whose record runs past the end of the file
    ///
    /// A torn append leaves a prefix of the final record only. If a complete,
    /// checksum-valid record exists anywhere after this header, the length
    /// field itself is damaged and the bytes after it must not be dropped.
    fn overrun(&mut self, parsed: &RecordHeader) -> Result<CaskError> {
        let start = self.position + 1;
        self.file
            .seek(SeekFrom::Start(start))
            .map_err(|e| CaskError::segment_io(&self.path, e))?;

        let mut tail = Vec::new();
        (&mut self.file)
            .take(self.len - start)
            .read_to_end(&mut tail)
            .map_err(|e| CaskError::segment_io(&self.path, e))?;

        Ok(match find_valid_record(&tail) {
            Some(found) => CaskError::CorruptRecord {
                segment_id: self.segment_id,
                offset: self.position,
                reason: format!(
                    "lengths (key_len={}, value_len={}) run past end of segment, \
                     but a valid record follows at offset {}",
                    parsed.key_len,
                    parsed.value_len,
                    start + found as u64
                ),
            },
            None => self.partial(),
        })
    }

    /// Attach this segment's location to a codec error
    fn locate(&self, err: CaskError) -> CaskError {
        match err {
            CaskError::ChecksumMismatch {
                stored, computed, ..
            } => CaskError::ChecksumMismatch {
                segment_id: self.segment_id,
                offset: self.position,
                stored,
                computed,
            },
            CaskError::CorruptRecord { reason, .. } => CaskError::CorruptRecord {
                segment_id: self.segment_id,
                offset: self.position,
                reason,
            },
            other => other,
        }
    }
}

/// Iterator over segment records
pub struct SegmentIterator {
    reader: SegmentReader,
    done: bool,
}

impl SegmentIterator {
    /// Length of the valid prefix read so far
    pub fn position(&self) -> u64 {
        self.reader.position()
    }
}

impl Iterator for SegmentIterator {
    type Item = Result<ReadEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_record() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Read `size` value bytes at `offset` from the segment at `path`
///
/// Opens an independent read-only handle per call, so no handle is ever
/// cached across a merge.
pub fn read_value_at(path: &Path, offset: u64, size: usize) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| CaskError::segment_io(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| CaskError::segment_io(path, e))?;

    let mut value = Vec::with_capacity(size);
    file.take(size as u64)
        .read_to_end(&mut value)
        .map_err(|e| CaskError::segment_io(path, e))?;

    if value.len() != size {
        return Err(CaskError::ShortRead {
            expected: size,
            actual: value.len(),
        });
    }

    Ok(value)
}
