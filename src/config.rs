//! Configuration for caskdb
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CaskError, Result};

pub use crate::compression::Compression;

/// Main configuration for a caskdb instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── LOCK              (single-writer advisory lock)
    ///     ├── 000000000.data    (immutable segment)
    ///     └── 000000001.data    (active segment)
    pub data_dir: PathBuf,

    /// Segment size in bytes that triggers rotation to a new active segment
    pub max_segment_size: u64,

    // -------------------------------------------------------------------------
    // Durability Configuration
    // -------------------------------------------------------------------------
    /// How often the active segment is fsynced
    pub sync_strategy: SyncStrategy,

    // -------------------------------------------------------------------------
    // Merge Configuration
    // -------------------------------------------------------------------------
    /// When the background worker starts a merge cycle
    pub merge_trigger: MergeTrigger,

    /// How often the worker evaluates `merge_trigger`
    pub merge_check_interval: Duration,

    /// Backoff applied after a failed merge cycle
    pub merge_retry: RetryPolicy,

    // -------------------------------------------------------------------------
    // Value Codec
    // -------------------------------------------------------------------------
    /// Compression applied to values before they reach the log
    pub compression: Compression,
}

/// Sync strategy for the active segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N unsynced writes (balanced durability/performance)
    EveryNWrites { count: usize },

    /// Only fsync on explicit `sync()`, rotation and `close()`
    Manual,
}

/// Strategy deciding when a merge cycle should run
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MergeTrigger {
    /// Never merge in the background (manual `Engine::merge` still works)
    Disabled,

    /// Merge once per day, during the given local hour (0-23)
    HourOfDay { hour: u32 },

    /// Merge on a fixed period
    Interval { every: Duration },

    /// Merge when dead records make up at least `threshold` of all records,
    /// once at least `min_records` records are on disk
    DeadRatio { threshold: f64, min_records: u64 },
}

/// Bounded exponential backoff for failed merge cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial: Duration,

    /// Ceiling for the doubled delay
    pub max: Duration,

    /// Retries before giving up until the trigger fires again
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./caskdb_data"),
            max_segment_size: 64 * 1024 * 1024, // 64 MB
            sync_strategy: SyncStrategy::EveryNWrites { count: 100 },
            merge_trigger: MergeTrigger::DeadRatio {
                threshold: 0.5,
                min_records: 1024,
            },
            merge_check_interval: Duration::from_secs(60),
            merge_retry: RetryPolicy::default(),
            compression: Compression::None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.max_segment_size == 0 {
            return Err(CaskError::Config(
                "max_segment_size must be greater than 0".to_string(),
            ));
        }
        // value offsets are stored as 32-bit integers in the key index
        if self.max_segment_size > i32::MAX as u64 {
            return Err(CaskError::Config(format!(
                "max_segment_size must not exceed {} bytes",
                i32::MAX
            )));
        }
        if let SyncStrategy::EveryNWrites { count: 0 } = self.sync_strategy {
            return Err(CaskError::Config(
                "EveryNWrites count must be greater than 0".to_string(),
            ));
        }
        match self.merge_trigger {
            MergeTrigger::HourOfDay { hour } if hour > 23 => {
                return Err(CaskError::Config(format!(
                    "merge hour must be in 0..=23, got {}",
                    hour
                )));
            }
            MergeTrigger::DeadRatio { threshold, .. } if !(0.0..=1.0).contains(&threshold) => {
                return Err(CaskError::Config(format!(
                    "dead ratio threshold must be in 0.0..=1.0, got {}",
                    threshold
                )));
            }
            MergeTrigger::Interval { every } if every.is_zero() => {
                return Err(CaskError::Config(
                    "merge interval must be greater than 0".to_string(),
                ));
            }
            _ => {}
        }
        if self.merge_check_interval.is_zero() {
            return Err(CaskError::Config(
                "merge_check_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all segments)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the segment rotation threshold (in bytes)
    pub fn max_segment_size(mut self, size: u64) -> Self {
        self.config.max_segment_size = size;
        self
    }

    /// Set the sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Set the merge trigger
    pub fn merge_trigger(mut self, trigger: MergeTrigger) -> Self {
        self.config.merge_trigger = trigger;
        self
    }

    /// Set how often the merge trigger is evaluated
    pub fn merge_check_interval(mut self, interval: Duration) -> Self {
        self.config.merge_check_interval = interval;
        self
    }

    /// Set the retry policy for failed merges
    pub fn merge_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.merge_retry = policy;
        self
    }

    /// Set value compression
    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
