//! Merge (compaction)
//!
//! Reclaims space held by overwritten and deleted records.
//!
//! A cycle takes every segment older than the active one, re-appends each
//! record the key index still points at into the active segment (keeping its
//! original timestamp), then deletes the old files:
//!
//! ```text
//!   before:  [000000000] [000000001] [000000002*]
//!               a=1 b=1     a=2 ~b      c=1
//!
//!   after:                            [000000002*]
//!                                       c=1 a=2
//! ```
//!
//! A record is live only if the index entry for its key names exactly this
//! segment, this value offset and this timestamp. Every relocation happens
//! under the engine's write lock, so a concurrent set or delete either lands
//! before the check (and the stale record is skipped) or after the relocation
//! (and simply supersedes it).
//!
//! Files are deleted in ascending ID order after the active segment has been
//! synced. If deletion stops part way, only a prefix of old segments is gone:
//! a tombstone is never removed while an older value it shadows survives.

mod trigger;
mod worker;

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub use trigger::{MergeSchedule, TriggerInput};
pub(crate) use worker::MergeWorker;

use crate::engine::EngineInner;
use crate::error::{CaskError, Result};
use crate::segment::{segment_path, Recovery, SegmentReader};

/// Outcome of a completed merge cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Old segment files merged and deleted
    pub segments_merged: usize,

    /// Records read from the old segments
    pub records_scanned: u64,

    /// Live records copied into the active segment
    pub records_relocated: u64,

    /// Stale records and tombstones dropped
    pub records_dropped: u64,

    /// Total size of the deleted files
    pub bytes_before: u64,

    /// Bytes appended to the active segment by relocation
    pub bytes_relocated: u64,

    pub duration: Duration,
}

impl MergeStats {
    pub fn bytes_reclaimed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_relocated)
    }
}

/// Clears the in-progress flag on every exit path
struct MergingGuard<'a>(&'a AtomicBool);

impl Drop for MergingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Run one merge cycle
///
/// Returns `Ok(None)` when another cycle is already running or the engine
/// began shutting down mid-cycle (nothing is deleted in that case).
pub(crate) fn run_cycle(inner: &EngineInner) -> Result<Option<MergeStats>> {
    let Some(_guard) = inner.try_begin_merge().map(MergingGuard) else {
        tracing::debug!("Merge already in progress, skipping");
        return Ok(None);
    };

    let start = Instant::now();
    let active_id = inner.active_segment_id()?;
    let candidates: Vec<u32> = Recovery::list_segments(inner.data_dir())?
        .into_iter()
        .filter(|&id| id < active_id)
        .collect();

    if candidates.is_empty() {
        tracing::debug!(active_segment = active_id, "Nothing to merge");
        inner.record_merge_completed();
        return Ok(Some(MergeStats::default()));
    }

    tracing::info!(
        segments = candidates.len(),
        active_segment = active_id,
        "Starting merge"
    );

    let mut stats = MergeStats {
        segments_merged: candidates.len(),
        ..Default::default()
    };
    let mut scanned_per_segment = Vec::with_capacity(candidates.len());

    for &id in &candidates {
        let reader = SegmentReader::open(inner.data_dir(), id)?;
        stats.bytes_before += reader.len();
        let mut scanned = 0u64;

        for next in reader.entries() {
            if inner.is_shutting_down() {
                tracing::info!(segment_id = id, "Merge aborted, engine is closing");
                return Ok(None);
            }

            let entry = match next {
                Ok(entry) => entry,
                Err(e) if e.is_trailing_partial() => {
                    tracing::warn!(segment_id = id, error = %e, "Ignoring partial record in old segment");
                    break;
                }
                Err(e) => return Err(e),
            };

            scanned += 1;
            if inner.relocate_if_live(id, &entry)? {
                stats.records_relocated += 1;
                stats.bytes_relocated += entry.record.encoded_len() as u64;
            } else {
                stats.records_dropped += 1;
            }
        }

        stats.records_scanned += scanned;
        scanned_per_segment.push((id, scanned));
    }

    // Relocated records must be durable before their old copies disappear
    inner.sync()?;

    {
        let _gate = inner.lock_segments_for_removal();
        for &(id, scanned) in &scanned_per_segment {
            let path = segment_path(inner.data_dir(), id);
            if let Err(e) = fs::remove_file(&path) {
                tracing::error!(segment_id = id, error = %e, "Failed to remove merged segment");
                return Err(CaskError::segment_io(&path, e));
            }
            inner.forget_segment(scanned);
            tracing::debug!(segment_id = id, "Removed merged segment");
        }
    }

    stats.duration = start.elapsed();
    inner.record_merge_completed();

    tracing::info!(
        segments = stats.segments_merged,
        scanned = stats.records_scanned,
        relocated = stats.records_relocated,
        dropped = stats.records_dropped,
        reclaimed_bytes = stats.bytes_reclaimed(),
        duration_ms = stats.duration.as_millis() as u64,
        "Merge complete"
    );

    Ok(Some(stats))
}
