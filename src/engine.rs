//! Engine Module
//!
//! The storage engine facade: owns the data directory, the active segment,
//! the key index and the merge worker.
//!
//! ## Responsibilities
//! - Rebuild the key index from segments on open
//! - Serialize writes and rotate the active segment when it fills up
//! - Serve reads straight from segment files via the key index
//! - Run merge cycles, in the background or on demand

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

use crate::config::{Config, MergeTrigger};
use crate::error::{CaskError, Result};
use crate::keydir::{KeyDir, KeyDirEntry, Keys};
use crate::merge::{self, MergeStats, MergeWorker};
use crate::segment::{
    read_value_at, segment_path, ReadEntry, Recovery, RecoveryResult, SegmentWriter, HEADER_SIZE,
    MAX_SEGMENT_ID, TOMBSTONE,
};

/// Name of the advisory lock file inside the data directory
pub const LOCK_FILENAME: &str = "LOCK";

/// The main storage engine
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes** (set/delete/merge relocation): serialized by the `writer`
///   mutex, which owns the active segment
///   - Append to segment, then update the key index, all under the lock
///
/// - **Reads** (get/has/keys): never take the writer lock
///   - Key index lookups take its internal read lock
///   - `get` holds the segment gate (shared) from lookup until the value is
///     read, so merge cannot delete the file underneath it
///
/// - **Merge**: at most one cycle at a time, guarded by `merging`
///   - Takes the segment gate exclusively only while deleting files
///
/// Only one process may open a data directory: `open` takes an exclusive
/// lock on `LOCK` and holds it until the engine is dropped.
pub struct Engine {
    inner: Arc<EngineInner>,

    /// Background merge thread, absent when the trigger is `Disabled`
    worker: Option<MergeWorker>,

    recovery: RecoveryResult,
}

/// State shared between the engine handle and the merge worker
pub(crate) struct EngineInner {
    config: Config,

    /// Active segment; `None` once the engine is closed
    writer: Mutex<Option<SegmentWriter>>,

    keydir: KeyDir,

    /// Shared by readers, exclusive while merge deletes segment files
    segment_gate: RwLock<()>,

    merging: AtomicBool,
    shutting_down: AtomicBool,

    /// Timestamp of the newest record written or recovered
    last_timestamp: AtomicI64,

    /// Records on disk, live or dead, tombstones included
    total_records: AtomicU64,

    /// Segment files below the active one
    sealed_segments: AtomicU64,
    merges_completed: AtomicU64,

    /// Held for the engine's lifetime; the OS releases the lock on close
    _lock: File,
}

/// Point-in-time counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub live_keys: u64,
    pub total_records: u64,
    /// Overwritten values, deleted values and tombstones still on disk
    pub dead_records: u64,
    pub active_segment_id: Option<u32>,
    /// Segment files a merge would rewrite
    pub sealed_segments: u64,
    pub merges_completed: u64,
    pub merge_in_progress: bool,
}

impl Engine {
    /// Open or create an engine with the given config
    ///
    /// On startup:
    /// 1. Validate config and create the data directory
    /// 2. Take the directory lock (fails with `Locked` if held)
    /// 3. Replay all segments into a fresh key index
    /// 4. Resume appending to the highest segment (or create segment 0)
    /// 5. Start the merge worker unless merging is disabled
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let data_dir = config.data_dir.clone();
        fs::create_dir_all(&data_dir).map_err(|e| CaskError::segment_io(&data_dir, e))?;

        let lock = Self::lock_dir(&data_dir)?;

        let keydir = KeyDir::new();
        let recovery = Recovery::recover(&data_dir, &keydir)?;

        let active_id = recovery.last_segment_id.unwrap_or(0);
        let writer = SegmentWriter::open(&data_dir, active_id, config.sync_strategy)?;

        let inner = Arc::new(EngineInner {
            writer: Mutex::new(Some(writer)),
            keydir,
            segment_gate: RwLock::new(()),
            merging: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            last_timestamp: AtomicI64::new(recovery.last_timestamp),
            total_records: AtomicU64::new(recovery.records_recovered),
            sealed_segments: AtomicU64::new(recovery.segments_scanned.saturating_sub(1)),
            merges_completed: AtomicU64::new(0),
            _lock: lock,
            config,
        });

        let worker = match inner.config.merge_trigger {
            MergeTrigger::Disabled => None,
            _ => Some(MergeWorker::spawn(Arc::clone(&inner))?),
        };

        tracing::info!(
            data_dir = %data_dir.display(),
            active_segment = active_id,
            live_keys = recovery.live_keys,
            "Engine opened"
        );

        Ok(Self {
            inner,
            worker,
            recovery,
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    fn lock_dir(data_dir: &Path) -> Result<File> {
        let path = data_dir.join(LOCK_FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| CaskError::segment_io(&path, e))?;

        file.try_lock_exclusive()
            .map_err(|_| CaskError::Locked(data_dir.to_path_buf()))?;
        Ok(file)
    }

    /// Get the value stored under `key`
    ///
    /// Fails with `KeyNotFound` if the key is absent or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let stored = self.inner.read_value(key)?;
        self.inner.config.compression.decode(stored)
    }

    /// Store `value` under `key`, replacing any previous value
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(CaskError::EmptyKey);
        }

        let stored = self.inner.config.compression.encode(value)?;
        if stored == TOMBSTONE {
            return Err(CaskError::ValueIsTombstone);
        }

        self.inner.write(key, &stored)
    }

    /// Delete `key`
    ///
    /// Always appends a tombstone, even if the key is absent, so that any
    /// older copy in a segment awaiting merge stays shadowed.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(CaskError::EmptyKey);
        }
        self.inner.remove(key)
    }

    /// Whether `key` currently has a value (no disk access)
    pub fn has(&self, key: &[u8]) -> bool {
        self.inner.keydir.contains(key)
    }

    /// Snapshot of all live keys, in no particular order
    pub fn keys(&self) -> Keys {
        self.inner.keydir.keys()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.inner.keydir.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.keydir.is_empty()
    }

    /// Force the active segment to durable storage
    pub fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    /// Run a merge cycle now
    ///
    /// Returns `None` if a cycle was already in progress.
    pub fn merge(&self) -> Result<Option<MergeStats>> {
        merge::run_cycle(&self.inner)
    }

    pub fn stats(&self) -> EngineStats {
        let (total, live) = self.inner.record_counts();
        EngineStats {
            live_keys: live,
            total_records: total,
            dead_records: total.saturating_sub(live),
            active_segment_id: self.inner.writer.lock().as_ref().map(SegmentWriter::id),
            sealed_segments: self.inner.sealed_segments(),
            merges_completed: self.inner.merges_completed.load(Ordering::Relaxed),
            merge_in_progress: self.inner.merging.load(Ordering::Acquire),
        }
    }

    /// Close the engine gracefully
    ///
    /// Stops the merge worker (aborting any cycle in progress), then syncs
    /// and releases the active segment.
    pub fn close(mut self) -> Result<()> {
        self.stop_worker();

        if let Some(writer) = self.inner.writer.lock().take() {
            writer.close()?;
        }

        tracing::info!(data_dir = %self.inner.config.data_dir.display(), "Engine closed");
        Ok(())
    }

    fn stop_worker(&mut self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        self.inner.data_dir()
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// ID of the segment currently receiving writes
    pub fn active_segment_id(&self) -> Result<u32> {
        self.inner.active_segment_id()
    }

    /// IDs of all segment files on disk, ascending
    pub fn segment_ids(&self) -> Result<Vec<u32>> {
        Recovery::list_segments(self.inner.data_dir())
    }

    /// What the startup replay found
    pub fn recovery_result(&self) -> &RecoveryResult {
        &self.recovery
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_worker();

        if let Some(mut writer) = self.inner.writer.lock().take() {
            if let Err(e) = writer.sync() {
                tracing::warn!(error = %e, "Failed to sync active segment on drop");
            }
        }
    }
}

// =============================================================================
// Shared internals (engine handle and merge worker)
// =============================================================================

impl EngineInner {
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// (total records on disk, live keys)
    pub(crate) fn record_counts(&self) -> (u64, u64) {
        (
            self.total_records.load(Ordering::Relaxed),
            self.keydir.len() as u64,
        )
    }

    pub(crate) fn sealed_segments(&self) -> u64 {
        self.sealed_segments.load(Ordering::Relaxed)
    }

    pub(crate) fn active_segment_id(&self) -> Result<u32> {
        self.writer
            .lock()
            .as_ref()
            .map(SegmentWriter::id)
            .ok_or(CaskError::Closed)
    }

    /// Claim the merge slot; None if a cycle is already running
    pub(crate) fn try_begin_merge(&self) -> Option<&AtomicBool> {
        self.merging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| &self.merging)
    }

    pub(crate) fn record_merge_completed(&self) {
        self.merges_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Account for a merged segment file and its `records` after removal
    pub(crate) fn forget_segment(&self, records: u64) {
        let _ = self
            .total_records
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
                Some(total.saturating_sub(records))
            });
        let _ = self
            .sealed_segments
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |sealed| {
                Some(sealed.saturating_sub(1))
            });
    }

    /// Exclusive hold on segment files, blocking new reads until released
    pub(crate) fn lock_segments_for_removal(&self) -> RwLockWriteGuard<'_, ()> {
        self.segment_gate.write()
    }

    pub(crate) fn sync(&self) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(CaskError::Closed)?;
        writer.sync()
    }

    fn read_value(&self, key: &[u8]) -> Result<Vec<u8>> {
        let _gate = self.segment_gate.read();
        let entry = self.keydir.get(key).ok_or(CaskError::KeyNotFound)?;

        read_value_at(
            &segment_path(self.data_dir(), entry.segment_id),
            u64::from(entry.value_offset),
            entry.value_size as usize,
        )
    }

    fn write(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(CaskError::Closed)?;

        let timestamp = self.next_timestamp();
        let entry = self.append(writer, key, value, timestamp)?;
        self.keydir.add(key.to_vec(), entry);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(CaskError::Closed)?;

        let timestamp = self.next_timestamp();
        self.append(writer, key, TOMBSTONE, timestamp)?;
        self.keydir.delete(key);
        Ok(())
    }

    /// Copy a record from an old segment into the active one if the key
    /// index still points at exactly that record
    ///
    /// Returns whether the record was live (and therefore relocated).
    pub(crate) fn relocate_if_live(&self, segment_id: u32, entry: &ReadEntry) -> Result<bool> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(CaskError::Closed)?;

        let record = &entry.record;
        let is_live = self.keydir.get(&record.key).is_some_and(|current| {
            current.segment_id == segment_id
                && u64::from(current.value_offset) == entry.value_offset()
                && current.timestamp == record.timestamp
        });
        if !is_live {
            return Ok(false);
        }

        let relocated = self.append(writer, &record.key, &record.value, record.timestamp)?;
        self.keydir.add(record.key.clone(), relocated);
        Ok(true)
    }

    /// Append a record to the active segment, rotating first if it would
    /// overflow. Caller holds the writer lock.
    fn append(
        &self,
        writer: &mut SegmentWriter,
        key: &[u8],
        value: &[u8],
        timestamp: i64,
    ) -> Result<KeyDirEntry> {
        let record_len = (HEADER_SIZE + key.len() + value.len()) as u64;
        if writer.offset() > 0 && writer.offset() + record_len > self.config.max_segment_size {
            self.rotate(writer)?;
        }

        let value_offset = writer.append(key, value, timestamp)?;
        self.total_records.fetch_add(1, Ordering::Relaxed);

        let value_offset = u32::try_from(value_offset).map_err(|_| CaskError::RecordTooLarge {
            size: record_len as usize,
            max: self.config.max_segment_size as usize,
        })?;
        // append rejects records over i32::MAX, so the value length fits
        let value_size = value.len() as u32;

        Ok(KeyDirEntry::new(writer.id(), value_size, value_offset, timestamp))
    }

    /// Seal the active segment and start the next one
    fn rotate(&self, writer: &mut SegmentWriter) -> Result<()> {
        let next_id = writer.id() + 1;
        if next_id > MAX_SEGMENT_ID {
            return Err(CaskError::Config(format!(
                "segment ID space exhausted at {}",
                writer.id()
            )));
        }

        writer.sync()?;
        let next = SegmentWriter::open(self.data_dir(), next_id, self.config.sync_strategy)?;
        let sealed = std::mem::replace(writer, next);
        let (sealed_id, sealed_size) = (sealed.id(), sealed.offset());
        sealed.close()?;
        self.sealed_segments.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            sealed_segment = sealed_id,
            sealed_size,
            active_segment = next_id,
            "Rotated active segment"
        );
        Ok(())
    }

    /// Next record timestamp in nanoseconds since the epoch
    ///
    /// Strictly greater than every timestamp written or recovered before, even
    /// if the wall clock stalls or steps back. Caller holds the writer lock.
    fn next_timestamp(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        let last = self.last_timestamp.load(Ordering::Relaxed);
        let timestamp = now.max(last.saturating_add(1));
        self.last_timestamp.store(timestamp, Ordering::Relaxed);
        timestamp
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.inner.config.data_dir)
            .field("live_keys", &self.inner.keydir.len())
            .field("background_merge", &self.worker.is_some())
            .finish()
    }
}
