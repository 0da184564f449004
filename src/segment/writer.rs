//! Segment Writer
//!
//! Owns the active segment and appends records to it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::BytesMut;

use crate::config::SyncStrategy;
use crate::error::{CaskError, Result};

use super::record::{Record, HEADER_SIZE, MAX_RECORD_SIZE};
use super::segment_path;

/// Appends records to the single writable segment
///
/// Each append reaches the OS in one write before it returns, so a value is
/// readable through an independent handle as soon as `append` succeeds.
/// Durability is governed by the sync strategy and `sync()`.
pub struct SegmentWriter {
    id: u32,
    path: PathBuf,
    file: File,
    /// Scratch buffer reused to encode each record
    buffer: BytesMut,
    /// Current end of the file, where the next record starts
    offset: u64,
    sync_strategy: SyncStrategy,
    unsynced_writes: usize,
}

impl SegmentWriter {
    /// Open (creating if absent) segment `id` in `dir` for appending
    ///
    /// The write offset resumes at the current file length.
    pub fn open(dir: &Path, id: u32, sync_strategy: SyncStrategy) -> Result<Self> {
        let path = segment_path(dir, id);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| CaskError::segment_io(&path, e))?;
        let offset = file
            .metadata()
            .map_err(|e| CaskError::segment_io(&path, e))?
            .len();

        tracing::debug!(segment_id = id, offset, "Opened active segment");

        Ok(Self {
            id,
            path,
            file,
            buffer: BytesMut::with_capacity(4096),
            offset,
            sync_strategy,
            unsynced_writes: 0,
        })
    }

    /// Append a record and return the byte offset of its value payload
    pub fn append(&mut self, key: &[u8], value: &[u8], timestamp: i64) -> Result<u64> {
        let record_len = HEADER_SIZE + key.len() + value.len();
        if record_len > MAX_RECORD_SIZE {
            return Err(CaskError::RecordTooLarge {
                size: record_len,
                max: MAX_RECORD_SIZE,
            });
        }

        let record = Record::new(key.to_vec(), value.to_vec(), timestamp);
        self.buffer.clear();
        record.encode_into(&mut self.buffer);

        let record_start = self.offset;
        self.write_buffer(record_start)?;
        self.offset += record_len as u64;

        self.unsynced_writes += 1;
        match self.sync_strategy {
            SyncStrategy::EveryWrite => self.sync()?,
            SyncStrategy::EveryNWrites { count } if self.unsynced_writes >= count => {
                self.sync()?
            }
            _ => {}
        }

        Ok(record_start + (HEADER_SIZE + key.len()) as u64)
    }

    /// Write the encoded record, rolling the file back on failure so that a
    /// failed append never leaves a partial record in front of later ones
    fn write_buffer(&mut self, record_start: u64) -> Result<()> {
        let expected = self.buffer.len();
        let mut written = 0;

        while written < expected {
            match self.file.write(&self.buffer[written..]) {
                Ok(0) => {
                    self.rollback(record_start);
                    return Err(CaskError::TruncatedWrite {
                        expected,
                        actual: written,
                    });
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.rollback(record_start);
                    return Err(CaskError::segment_io(&self.path, e));
                }
            }
        }

        Ok(())
    }

    fn rollback(&mut self, record_start: u64) {
        if let Err(e) = self.file.set_len(record_start) {
            tracing::error!(
                segment_id = self.id,
                offset = record_start,
                error = %e,
                "Failed to roll back partial append"
            );
        }
    }

    /// Force everything written so far to durable storage
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .flush()
            .and_then(|_| self.file.sync_data())
            .map_err(|e| CaskError::segment_io(&self.path, e))?;
        self.unsynced_writes = 0;
        Ok(())
    }

    /// Sync and release the handle
    pub fn close(mut self) -> Result<()> {
        self.sync()?;
        tracing::debug!(segment_id = self.id, offset = self.offset, "Closed segment");
        Ok(())
    }

    /// Segment ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current file length (next record start)
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes appended since the last sync
    pub fn unsynced_writes(&self) -> usize {
        self.unsynced_writes
    }
}
