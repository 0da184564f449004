//! Merge triggers
//!
//! Decides, on each worker tick, whether a merge cycle should start.

use std::time::Instant;

use chrono::{Local, NaiveDate, Timelike};

use crate::config::MergeTrigger;

/// Snapshot of everything a trigger looks at
#[derive(Debug, Clone, Copy)]
pub struct TriggerInput {
    pub now: Instant,

    /// Local wall-clock hour (0-23)
    pub local_hour: u32,

    /// Local calendar date
    pub local_date: NaiveDate,

    /// Records on disk, live or dead
    pub total_records: u64,

    /// Records the key index still points at
    pub live_records: u64,

    /// Segment files below the active one
    pub sealed_segments: u64,
}

impl TriggerInput {
    /// Capture the current time alongside the given record and segment counts
    pub fn capture(total_records: u64, live_records: u64, sealed_segments: u64) -> Self {
        let local = Local::now();
        Self {
            now: Instant::now(),
            local_hour: local.hour(),
            local_date: local.date_naive(),
            total_records,
            live_records,
            sealed_segments,
        }
    }

    pub fn dead_records(&self) -> u64 {
        self.total_records.saturating_sub(self.live_records)
    }

    /// Share of on-disk records that are overwritten, deleted or tombstones
    pub fn dead_ratio(&self) -> f64 {
        if self.total_records == 0 {
            return 0.0;
        }
        self.dead_records() as f64 / self.total_records as f64
    }
}

/// A trigger plus the memory of when it last fired
#[derive(Debug, Clone)]
pub struct MergeSchedule {
    trigger: MergeTrigger,
    started: Instant,
    last_merge: Option<Instant>,
    last_merge_date: Option<NaiveDate>,
}

impl MergeSchedule {
    pub fn new(trigger: MergeTrigger, now: Instant) -> Self {
        Self {
            trigger,
            started: now,
            last_merge: None,
            last_merge_date: None,
        }
    }

    pub fn trigger(&self) -> MergeTrigger {
        self.trigger
    }

    /// Whether a cycle should run now
    pub fn should_merge(&self, input: &TriggerInput) -> bool {
        match self.trigger {
            MergeTrigger::Disabled => false,
            MergeTrigger::HourOfDay { hour } => {
                input.local_hour == hour && self.last_merge_date != Some(input.local_date)
            }
            MergeTrigger::Interval { every } => {
                let since = self.last_merge.unwrap_or(self.started);
                input.now.saturating_duration_since(since) >= every
            }
            MergeTrigger::DeadRatio {
                threshold,
                min_records,
            } => {
                // dead records that all sit in the active segment are out of reach
                input.sealed_segments > 0
                    && input.total_records >= min_records
                    && input.dead_ratio() >= threshold
            }
        }
    }

    /// Remember that a cycle ran (or was given up on) at `input`
    pub fn record_merge(&mut self, input: &TriggerInput) {
        self.last_merge = Some(input.now);
        self.last_merge_date = Some(input.local_date);
    }
}
