//! # caskdb
//!
//! An embedded, log-structured key-value store in the Bitcask style:
//! - Append-only segment files with CRC32-checked records
//! - In-memory key index pointing at the newest value of every key
//! - One disk read per lookup
//! - Crash recovery by replaying segments on open
//! - Background merge that reclaims space from dead records
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │            (Single Writer / Multi Reader, dir LOCK)          │
//! └───────┬──────────────────────┬───────────────────────┬──────┘
//!         │ set/delete           │ get/has/keys          │ merge
//!         ▼                      ▼                       ▼
//!   ┌─────────────┐       ┌─────────────┐        ┌──────────────┐
//!   │   Segment   │       │   KeyDir    │        │ Merge Worker │
//!   │   Writer    │──────►│  (RwLock)   │◄───────│  (thread)    │
//!   │  (append)   │       └──────┬──────┘        └──────┬───────┘
//!   └──────┬──────┘              │                      │
//!          │                     ▼                      │
//!          │             ┌─────────────┐                │
//!          └────────────►│  Segments   │◄───────────────┘
//!                        │ 000000000.. │
//!                        └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use caskdb::{Config, Engine};
//!
//! let engine = Engine::open(Config::builder().data_dir("/tmp/caskdb").build())?;
//! engine.set(b"user:1", b"alice")?;
//! assert_eq!(engine.get(b"user:1")?, b"alice");
//! engine.delete(b"user:1")?;
//! assert!(!engine.has(b"user:1"));
//! engine.close()?;
//! # Ok::<(), caskdb::CaskError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod compression;

pub mod segment;
pub mod keydir;
pub mod merge;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{CaskError, Result};
pub use config::{Compression, Config, ConfigBuilder, MergeTrigger, RetryPolicy, SyncStrategy};
pub use engine::{Engine, EngineStats};
pub use keydir::{KeyDir, KeyDirEntry};
pub use merge::MergeStats;
pub use segment::{Recovery, RecoveryResult};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of caskdb
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
