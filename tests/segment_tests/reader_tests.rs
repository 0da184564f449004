//! Tests for SegmentReader
//!
//! These tests verify:
//! - Records come back in file order with correct offsets
//! - A torn tail is reported as a trailing partial record
//! - A flipped byte in a complete record is a checksum mismatch with location
//! - Random-access value reads and short reads

use std::fs::{self, OpenOptions};
use std::io::Write;

use caskdb::config::SyncStrategy;
use caskdb::segment::{read_value_at, segment_path, SegmentReader, SegmentWriter, HEADER_SIZE};
use caskdb::CaskError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// Write `count` records to segment 0, returning the value offsets
fn write_segment(temp: &TempDir, count: usize) -> Vec<u64> {
    let mut writer = SegmentWriter::open(temp.path(), 0, SyncStrategy::Manual).unwrap();
    let offsets = (0..count)
        .map(|i| {
            writer
                .append(
                    format!("key{}", i).as_bytes(),
                    format!("value{}", i).as_bytes(),
                    i as i64,
                )
                .unwrap()
        })
        .collect();
    writer.close().unwrap();
    offsets
}

// =============================================================================
// Sequential Read Tests
// =============================================================================

#[test]
fn test_read_empty_segment() {
    let temp = TempDir::new().unwrap();
    write_segment(&temp, 0);

    let mut reader = SegmentReader::open(temp.path(), 0).unwrap();
    assert!(reader.is_empty());
    assert!(reader.next_record().unwrap().is_none());
}

#[test]
fn test_read_records_in_order() {
    let temp = TempDir::new().unwrap();
    let offsets = write_segment(&temp, 5);

    let entries: Vec<_> = SegmentReader::open(temp.path(), 0)
        .unwrap()
        .entries()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(entries.len(), 5);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.record.key, format!("key{}", i).into_bytes());
        assert_eq!(entry.record.value, format!("value{}", i).into_bytes());
        assert_eq!(entry.record.timestamp, i as i64);
        assert_eq!(entry.value_offset(), offsets[i]);
    }
    assert_eq!(entries[0].offset, 0);
    assert_eq!(entries[1].offset, entries[0].end_offset());
}

#[test]
fn test_reader_position_tracks_valid_prefix() {
    let temp = TempDir::new().unwrap();
    write_segment(&temp, 3);

    let mut reader = SegmentReader::open(temp.path(), 0).unwrap();
    let first = reader.next_record().unwrap().unwrap();
    assert_eq!(reader.position(), first.end_offset());

    while reader.next_record().unwrap().is_some() {}
    assert_eq!(reader.position(), reader.len());
}

// =============================================================================
// Partial and Corrupt Tail Tests
// =============================================================================

#[test]
fn test_torn_header_is_trailing_partial() {
    let temp = TempDir::new().unwrap();
    write_segment(&temp, 2);
    let path = segment_path(temp.path(), 0);
    let valid_len = fs::metadata(&path).unwrap().len();

    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0xAB; HEADER_SIZE - 1]).unwrap();

    let mut entries = SegmentReader::open(temp.path(), 0).unwrap().entries();
    assert!(entries.next().unwrap().is_ok());
    assert!(entries.next().unwrap().is_ok());

    let err = entries.next().unwrap().unwrap_err();
    assert!(err.is_trailing_partial());
    assert_eq!(entries.position(), valid_len);
    assert!(entries.next().is_none());
}

#[test]
fn test_torn_body_is_trailing_partial() {
    let temp = TempDir::new().unwrap();
    write_segment(&temp, 3);
    let path = segment_path(temp.path(), 0);
    let len = fs::metadata(&path).unwrap().len();

    // Cut the last record in half
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len - 4)
        .unwrap();

    let results: Vec<_> = SegmentReader::open(temp.path(), 0).unwrap().entries().collect();
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok() && results[1].is_ok());
    assert!(matches!(
        results[2],
        Err(CaskError::TrailingPartialRecord { segment_id: 0, .. })
    ));
}

#[test]
fn test_flipped_value_byte_is_checksum_mismatch() {
    let temp = TempDir::new().unwrap();
    let offsets = write_segment(&temp, 3);
    let path = segment_path(temp.path(), 0);

    let mut bytes = fs::read(&path).unwrap();
    bytes[offsets[1] as usize] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let mut entries = SegmentReader::open(temp.path(), 0).unwrap().entries();
    let first = entries.next().unwrap().unwrap();

    match entries.next().unwrap() {
        Err(CaskError::ChecksumMismatch {
            segment_id, offset, ..
        }) => {
            assert_eq!(segment_id, 0);
            assert_eq!(offset, first.end_offset());
        }
        other => panic!("expected checksum mismatch, got {:?}", other),
    }
    assert!(entries.next().is_none());
}

#[test]
fn test_negative_length_is_corrupt() {
    let temp = TempDir::new().unwrap();
    write_segment(&temp, 1);
    let path = segment_path(temp.path(), 0);

    let mut bytes = fs::read(&path).unwrap();
    bytes[16..20].copy_from_slice(&(-7i32).to_be_bytes());
    fs::write(&path, &bytes).unwrap();

    let mut reader = SegmentReader::open(temp.path(), 0).unwrap();
    assert!(matches!(
        reader.next_record(),
        Err(CaskError::CorruptRecord { segment_id: 0, offset: 0, .. })
    ));
}

#[test]
fn test_overrunning_length_before_valid_records_is_corrupt() {
    let temp = TempDir::new().unwrap();
    write_segment(&temp, 3);
    let path = segment_path(temp.path(), 0);

    let mut bytes = fs::read(&path).unwrap();
    bytes[12..16].copy_from_slice(&4096i32.to_be_bytes());
    fs::write(&path, &bytes).unwrap();

    let mut reader = SegmentReader::open(temp.path(), 0).unwrap();
    assert!(matches!(
        reader.next_record(),
        Err(CaskError::CorruptRecord { segment_id: 0, offset: 0, .. })
    ));
}

#[test]
fn test_overrunning_length_in_last_record_is_trailing_partial() {
    let temp = TempDir::new().unwrap();
    write_segment(&temp, 3);
    let path = segment_path(temp.path(), 0);

    let mut reader = SegmentReader::open(temp.path(), 0).unwrap();
    reader.next_record().unwrap();
    reader.next_record().unwrap();
    let last = reader.position() as usize;

    let mut bytes = fs::read(&path).unwrap();
    bytes[last + 12..last + 16].copy_from_slice(&4096i32.to_be_bytes());
    fs::write(&path, &bytes).unwrap();

    let results: Vec<_> = SegmentReader::open(temp.path(), 0).unwrap().entries().collect();
    assert_eq!(results.len(), 3);
    assert!(matches!(
        results[2],
        Err(CaskError::TrailingPartialRecord { segment_id: 0, .. })
    ));
}

// =============================================================================
// Random Access Tests
// =============================================================================

#[test]
fn test_read_value_at() {
    let temp = TempDir::new().unwrap();
    let offsets = write_segment(&temp, 4);
    let path = segment_path(temp.path(), 0);

    assert_eq!(read_value_at(&path, offsets[2], 6).unwrap(), b"value2");
    assert_eq!(read_value_at(&path, offsets[0], 0).unwrap(), b"");
}

#[test]
fn test_read_value_past_end_is_short_read() {
    let temp = TempDir::new().unwrap();
    let offsets = write_segment(&temp, 1);
    let path = segment_path(temp.path(), 0);

    assert!(matches!(
        read_value_at(&path, offsets[0], 100),
        Err(CaskError::ShortRead {
            expected: 100,
            actual: 6
        })
    ));
}

#[test]
fn test_read_value_missing_segment() {
    let temp = TempDir::new().unwrap();
    let path = segment_path(temp.path(), 9);

    assert!(matches!(
        read_value_at(&path, 0, 1),
        Err(CaskError::SegmentIo { .. })
    ));
}
