//! Tests for merge (compaction)
//!
//! These tests verify:
//! - A merge with no sealed segments is a no-op
//! - Live values survive byte-identical; old segment files are removed
//! - Tombstoned keys stay deleted across merge and restart
//! - Relocated records keep their original timestamps
//! - Reads and writes running alongside merges never fail
//! - A failed merge deletes nothing and leaves the engine ready to merge again
//! - The background worker merges on its own, but not while every dead
//!   record is still in the active segment

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use caskdb::config::{Config, MergeTrigger, SyncStrategy};
use caskdb::engine::Engine;
use caskdb::segment::{segment_path, Recovery, SegmentReader};
use caskdb::CaskError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn small_segment_config(dir: &Path) -> Config {
    Config::builder()
        .data_dir(dir)
        .max_segment_size(256)
        .sync_strategy(SyncStrategy::Manual)
        .merge_trigger(MergeTrigger::Disabled)
        .build()
}

fn setup_temp_engine() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(small_segment_config(temp_dir.path())).unwrap();
    (temp_dir, engine)
}

/// Overwrite `keys` keys `rounds` times; returns the final value per key
fn churn(engine: &Engine, keys: usize, rounds: usize) -> HashMap<Vec<u8>, Vec<u8>> {
    let mut latest = HashMap::new();
    for round in 0..rounds {
        for k in 0..keys {
            let key = format!("key{:02}", k).into_bytes();
            let value = format!("value{:02}-r{:02}", k, round).into_bytes();
            engine.set(&key, &value).unwrap();
            latest.insert(key, value);
        }
    }
    latest
}

fn count_records_on_disk(dir: &Path) -> u64 {
    Recovery::list_segments(dir)
        .unwrap()
        .into_iter()
        .map(|id| SegmentReader::open(dir, id).unwrap().entries().count() as u64)
        .sum()
}

fn assert_values(engine: &Engine, expected: &HashMap<Vec<u8>, Vec<u8>>) {
    for (key, value) in expected {
        assert_eq!(&engine.get(key).unwrap(), value);
    }
    assert_eq!(engine.len(), expected.len());
}

// =============================================================================
// Basic Merge Tests
// =============================================================================

#[test]
fn test_merge_empty_engine() {
    let (_temp, engine) = setup_temp_engine();

    let stats = engine.merge().unwrap().unwrap();

    assert_eq!(stats.segments_merged, 0);
    assert_eq!(stats.records_scanned, 0);
    assert_eq!(engine.segment_ids().unwrap(), vec![0]);
}

#[test]
fn test_merge_single_active_segment_is_untouched() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .merge_trigger(MergeTrigger::Disabled)
        .build();
    let engine = Engine::open(config).unwrap();
    engine.set(b"a", b"1").unwrap();
    engine.set(b"a", b"2").unwrap();

    let stats = engine.merge().unwrap().unwrap();

    assert_eq!(stats.segments_merged, 0);
    assert_eq!(engine.stats().total_records, 2);
    assert_eq!(engine.get(b"a").unwrap(), b"2");
}

#[test]
fn test_merge_reclaims_dead_records() {
    let (temp, engine) = setup_temp_engine();
    let expected = churn(&engine, 10, 8);

    let before_ids = engine.segment_ids().unwrap();
    let active_before = engine.active_segment_id().unwrap();
    assert!(before_ids.len() > 2);
    assert_eq!(engine.stats().sealed_segments as usize, before_ids.len() - 1);

    let stats = engine.merge().unwrap().unwrap();

    assert_eq!(stats.segments_merged, before_ids.len() - 1);
    assert_eq!(
        stats.records_relocated + stats.records_dropped,
        stats.records_scanned
    );
    assert!(stats.records_dropped > 0);
    assert!(stats.bytes_reclaimed() > 0);

    // Only the old active segment and anything rotated to since remain
    let after_ids = engine.segment_ids().unwrap();
    assert!(after_ids.iter().all(|&id| id >= active_before));
    assert_eq!(engine.stats().sealed_segments as usize, after_ids.len() - 1);
    for id in before_ids.iter().filter(|&&id| id < active_before) {
        assert!(!segment_path(temp.path(), *id).exists());
    }

    assert_values(&engine, &expected);
    assert_eq!(engine.stats().total_records, count_records_on_disk(temp.path()));
    assert_eq!(engine.stats().merges_completed, 1);
}

#[test]
fn test_merge_then_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let expected = {
        let engine = Engine::open(small_segment_config(temp_dir.path())).unwrap();
        let expected = churn(&engine, 12, 6);
        engine.merge().unwrap();
        engine.close().unwrap();
        expected
    };

    let engine = Engine::open(small_segment_config(temp_dir.path())).unwrap();
    assert_values(&engine, &expected);
    assert_eq!(
        engine.recovery_result().records_recovered,
        count_records_on_disk(temp_dir.path())
    );
}

#[test]
fn test_merge_twice_is_stable() {
    let (_temp, engine) = setup_temp_engine();
    let expected = churn(&engine, 8, 5);

    engine.merge().unwrap();
    engine.merge().unwrap();

    assert_values(&engine, &expected);
    assert_eq!(engine.stats().merges_completed, 2);
}

// =============================================================================
// Tombstone Tests
// =============================================================================

#[test]
fn test_deleted_keys_stay_deleted_after_merge_and_restart() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(small_segment_config(temp_dir.path())).unwrap();
        engine.set(b"doomed", b"value").unwrap();
        engine.set(b"kept", b"value").unwrap();
        churn(&engine, 5, 3);
        engine.delete(b"doomed").unwrap();
        // Push the tombstone out of the active segment
        churn(&engine, 5, 3);

        let stats = engine.merge().unwrap().unwrap();
        assert!(stats.segments_merged > 0);
        assert!(!engine.has(b"doomed"));
        engine.close().unwrap();
    }

    let engine = Engine::open(small_segment_config(temp_dir.path())).unwrap();
    assert!(!engine.has(b"doomed"));
    assert!(matches!(engine.get(b"doomed"), Err(CaskError::KeyNotFound)));
    assert_eq!(engine.get(b"kept").unwrap(), b"value");
}

#[test]
fn test_merge_drops_tombstones() {
    let (temp, engine) = setup_temp_engine();
    for i in 0..20 {
        let key = format!("key{}", i);
        engine.set(key.as_bytes(), b"v").unwrap();
        engine.delete(key.as_bytes()).unwrap();
    }
    engine.set(b"last", b"v").unwrap();

    let active = engine.active_segment_id().unwrap();
    let stats = engine.merge().unwrap().unwrap();

    assert_eq!(stats.records_relocated, 0);
    assert_eq!(engine.segment_ids().unwrap(), vec![active]);
    assert!(count_records_on_disk(temp.path()) < 41);
}

// =============================================================================
// Relocation Tests
// =============================================================================

#[test]
fn test_relocation_keeps_original_timestamp() {
    let (temp, engine) = setup_temp_engine();
    engine.set(b"anchor", b"original").unwrap();

    let original_ts = SegmentReader::open(temp.path(), 0)
        .unwrap()
        .entries()
        .next()
        .unwrap()
        .unwrap()
        .record
        .timestamp;

    churn(&engine, 6, 4);
    engine.merge().unwrap();

    let relocated: Vec<_> = Recovery::list_segments(temp.path())
        .unwrap()
        .into_iter()
        .flat_map(|id| SegmentReader::open(temp.path(), id).unwrap().entries())
        .map(|e| e.unwrap().record)
        .filter(|r| r.key == b"anchor")
        .collect();

    assert_eq!(relocated.len(), 1);
    assert_eq!(relocated[0].timestamp, original_ts);
    assert_eq!(relocated[0].value, b"original");
}

// =============================================================================
// Failure Tests
// =============================================================================

#[test]
fn test_failed_merge_keeps_every_segment() {
    let (temp, engine) = setup_temp_engine();
    // Every record in the early segments is overwritten by the last round
    let expected = churn(&engine, 10, 8);
    let before_ids = engine.segment_ids().unwrap();
    assert!(before_ids.len() > 2);

    let path = segment_path(temp.path(), 1);
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let result = engine.merge();
    assert!(matches!(
        result,
        Err(CaskError::ChecksumMismatch { segment_id: 1, .. })
    ));

    let after_ids = engine.segment_ids().unwrap();
    assert!(before_ids.iter().all(|id| after_ids.contains(id)));
    assert_values(&engine, &expected);

    let stats = engine.stats();
    assert!(!stats.merge_in_progress);
    assert_eq!(stats.merges_completed, 0);

    // The merge slot was released, so the next attempt runs and fails the same way
    assert!(matches!(
        engine.merge(),
        Err(CaskError::ChecksumMismatch { segment_id: 1, .. })
    ));
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_merge_concurrent_with_reads_and_writes() {
    let (_temp, engine) = setup_temp_engine();
    let engine = Arc::new(engine);

    for i in 0..30 {
        engine.set(format!("stable{}", i).as_bytes(), format!("s{}", i).as_bytes()).unwrap();
    }
    churn(&engine, 10, 5);

    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut round = 0u64;
            while !stop.load(Ordering::Relaxed) {
                for k in 0..10 {
                    let key = format!("key{:02}", k);
                    engine.set(key.as_bytes(), format!("w{}", round).as_bytes()).unwrap();
                }
                round += 1;
            }
            round
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    for i in 0..30 {
                        let value = engine.get(format!("stable{}", i).as_bytes()).unwrap();
                        assert_eq!(value, format!("s{}", i).into_bytes());
                    }
                    for k in 0..10 {
                        // Never deleted, so always readable
                        engine.get(format!("key{:02}", k).as_bytes()).unwrap();
                    }
                }
            })
        })
        .collect();

    for _ in 0..5 {
        engine.merge().unwrap();
        thread::sleep(Duration::from_millis(5));
    }

    stop.store(true, Ordering::Relaxed);
    let rounds = writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(engine.stats().merges_completed, 5);
    for i in 0..30 {
        assert_eq!(
            engine.get(format!("stable{}", i).as_bytes()).unwrap(),
            format!("s{}", i).into_bytes()
        );
    }
    if rounds > 0 {
        let last = format!("w{}", rounds - 1).into_bytes();
        for k in 0..10 {
            assert_eq!(engine.get(format!("key{:02}", k).as_bytes()).unwrap(), last);
        }
    }
}

// =============================================================================
// Background Worker Tests
// =============================================================================

#[test]
fn test_background_worker_merges_on_interval() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .max_segment_size(256)
        .sync_strategy(SyncStrategy::Manual)
        .merge_trigger(MergeTrigger::Interval {
            every: Duration::from_millis(20),
        })
        .merge_check_interval(Duration::from_millis(10))
        .build();
    let engine = Engine::open(config).unwrap();
    let expected = churn(&engine, 10, 6);

    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.stats().merges_completed == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }

    assert!(engine.stats().merges_completed > 0);
    assert_values(&engine, &expected);
    engine.close().unwrap();
}

#[test]
fn test_background_worker_merges_on_dead_ratio() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .max_segment_size(256)
        .sync_strategy(SyncStrategy::Manual)
        .merge_trigger(MergeTrigger::DeadRatio {
            threshold: 0.5,
            min_records: 20,
        })
        .merge_check_interval(Duration::from_millis(10))
        .build();
    let engine = Engine::open(config).unwrap();
    let expected = churn(&engine, 5, 10);

    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.stats().merges_completed == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }

    assert!(engine.stats().merges_completed > 0);
    assert!(engine.stats().dead_records < 50);
    assert_values(&engine, &expected);
}

#[test]
fn test_dead_ratio_waits_for_a_sealed_segment() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .sync_strategy(SyncStrategy::Manual)
        .merge_trigger(MergeTrigger::DeadRatio {
            threshold: 0.5,
            min_records: 20,
        })
        .merge_check_interval(Duration::from_millis(10))
        .build();
    let engine = Engine::open(config).unwrap();

    // 50 overwrites of one key, all inside the default-sized active segment
    for i in 0..50 {
        engine.set(b"hot", format!("v{}", i).as_bytes()).unwrap();
    }
    assert_eq!(engine.stats().sealed_segments, 0);
    assert!(engine.stats().dead_records >= 49);

    thread::sleep(Duration::from_millis(150));

    assert_eq!(engine.stats().merges_completed, 0);
    assert_eq!(engine.get(b"hot").unwrap(), b"v49");
}
