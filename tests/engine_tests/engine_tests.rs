//! Tests for Database
//!
//! These tests verify:
//! - Basic get/put/delete operations
//! - Sequence number assignment and lookup by sequence
//! - Flush, header commit and the WAL threshold
//! - Recovery from the newest valid header (clean and torn files)
//! - Document count / data size bookkeeping
//! - Concurrent writers on one handle

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use cinderkv::storage::Store;
use cinderkv::{CinderError, CommitMode, Config, Database, SyncStrategy};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn file_config(dir: &TempDir) -> Config {
    Config::builder()
        .data_dir(dir.path())
        .sync_strategy(SyncStrategy::EveryHeader)
        .build()
}

fn setup_temp_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::open(file_config(&temp_dir)).unwrap();
    (temp_dir, db)
}

fn setup_memory_db() -> Database {
    Database::open(Config::builder().in_memory().build()).unwrap()
}

fn value(db: &Database, key: &[u8]) -> Option<Vec<u8>> {
    db.get(key).unwrap().map(|b| b.to_vec())
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_open_creates_generation_file() {
    let temp_dir = TempDir::new().unwrap();
    let data_dir = temp_dir.path().join("mydb");
    let config = Config::builder().data_dir(&data_dir).name("books").build();

    let db = Database::open(config).unwrap();

    assert!(data_dir.exists());
    assert!(Store::generation_path(&data_dir, "books", 0).exists());
    assert_eq!(db.name(), "books");
    assert_eq!(db.info().revision, 1);
    assert_eq!(db.info().seqnum, 0);
}

#[test]
fn test_put_get() {
    let db = setup_memory_db();

    db.put(b"hello", b"world").unwrap();

    assert_eq!(db.get(b"hello").unwrap(), Some(Bytes::from_static(b"world")));
}

#[test]
fn test_get_nonexistent_key() {
    let db = setup_memory_db();

    assert_eq!(db.get(b"nonexistent").unwrap(), None);
    assert!(!db.contains(b"nonexistent").unwrap());
}

#[test]
fn test_put_overwrite() {
    let db = setup_memory_db();

    db.put(b"key", b"value1").unwrap();
    db.put(b"key", b"value2").unwrap();

    assert_eq!(value(&db, b"key"), Some(b"value2".to_vec()));
}

#[test]
fn test_delete() {
    let db = setup_memory_db();

    db.put(b"key", b"value").unwrap();
    db.delete(b"key").unwrap();

    assert_eq!(db.get(b"key").unwrap(), None);
    assert!(!db.contains(b"key").unwrap());
}

#[test]
fn test_delete_after_flush_shadows_index() {
    let db = setup_memory_db();

    db.put(b"key", b"value").unwrap();
    db.flush().unwrap();
    db.delete(b"key").unwrap();

    assert_eq!(db.get(b"key").unwrap(), None);

    db.flush().unwrap();
    assert_eq!(db.get(b"key").unwrap(), None);
}

#[test]
fn test_empty_value() {
    let db = setup_memory_db();

    db.put(b"key", b"").unwrap();

    assert_eq!(value(&db, b"key"), Some(Vec::new()));
    assert!(db.contains(b"key").unwrap());
}

#[test]
fn test_binary_keys_and_values() {
    let db = setup_memory_db();
    let key = vec![0u8, 1, 2, 255, 254];
    let val = vec![0u8; 1000];

    db.put(&key, &val).unwrap();

    assert_eq!(value(&db, &key), Some(val));
}

// =============================================================================
// Key Validation Tests
// =============================================================================

#[test]
fn test_empty_key_rejected() {
    let db = setup_memory_db();

    assert!(matches!(db.put(b"", b"v"), Err(CinderError::InvalidArgument(_))));
    assert!(matches!(db.delete(b""), Err(CinderError::InvalidArgument(_))));
}

#[test]
fn test_oversized_key_rejected() {
    let db = Database::open(Config::builder().in_memory().max_key_len(8).build()).unwrap();

    db.put(b"12345678", b"ok").unwrap();
    let result = db.put(b"123456789", b"too long");

    assert!(matches!(result, Err(CinderError::InvalidArgument(_))));
    assert_eq!(db.info().seqnum, 1);
}

#[test]
fn test_invalid_config_rejected() {
    let result = Database::open(Config::builder().in_memory().wal_threshold(0).build());
    assert!(matches!(result, Err(CinderError::Config(_))));

    let result = Database::open(Config::builder().in_memory().name("").build());
    assert!(matches!(result, Err(CinderError::Config(_))));

    let result = Database::open(Config::builder().in_memory().max_headers(0).build());
    assert!(matches!(result, Err(CinderError::Config(_))));
}

// =============================================================================
// Sequence Number Tests
// =============================================================================

#[test]
fn test_sequence_numbers_start_at_one() {
    let db = setup_memory_db();

    assert_eq!(db.put(b"a", b"1").unwrap(), 1);
    assert_eq!(db.put(b"b", b"2").unwrap(), 2);
    assert_eq!(db.delete(b"a").unwrap(), 3);
    assert_eq!(db.info().seqnum, 3);
}

#[test]
fn test_get_by_seq() {
    let db = setup_memory_db();

    db.put(b"a", b"v1").unwrap();
    db.put(b"b", b"v2").unwrap();
    db.put(b"a", b"v3").unwrap();

    let entry = db.get_by_seq(3).unwrap();
    assert_eq!(entry.key, b"a".to_vec());
    assert_eq!(entry.value, Some(Bytes::from_static(b"v3")));

    assert_eq!(db.get_by_seq(2).unwrap().key, b"b".to_vec());

    // Overwritten, never assigned, and reserved sequence numbers
    assert!(matches!(db.get_by_seq(1), Err(CinderError::KeyNotFound)));
    assert!(matches!(db.get_by_seq(99), Err(CinderError::KeyNotFound)));
    assert!(matches!(db.get_by_seq(0), Err(CinderError::KeyNotFound)));
}

#[test]
fn test_get_by_seq_after_flush() {
    let db = setup_memory_db();

    db.put(b"a", b"v1").unwrap();
    db.put(b"b", b"v2").unwrap();
    db.flush().unwrap();

    let entry = db.get_by_seq(1).unwrap();
    assert_eq!(entry.key, b"a".to_vec());
    assert_eq!(entry.value, Some(Bytes::from_static(b"v1")));
}

// =============================================================================
// Flush & Commit Tests
// =============================================================================

#[test]
fn test_flush_writes_header_and_clears_wal() {
    let db = setup_memory_db();

    db.put(b"a", b"1").unwrap();
    db.put(b"b", b"2").unwrap();
    assert_eq!(db.info().wal_dirty, 2);

    db.flush().unwrap();

    let info = db.info();
    assert_eq!(info.revision, 2);
    assert_eq!(info.wal_dirty, 0);
    assert_eq!(info.wal_entries, 0);
    assert_eq!(info.last_wal_flush_header, info.last_header);
    assert_eq!(value(&db, b"a"), Some(b"1".to_vec()));
}

#[test]
fn test_flush_with_nothing_to_merge_is_noop() {
    let db = setup_memory_db();

    db.flush().unwrap();

    assert_eq!(db.info().revision, 1);
}

#[test]
fn test_wal_threshold_triggers_flush() {
    let db = Database::open(Config::builder().in_memory().wal_threshold(4).build()).unwrap();

    for i in 0..3 {
        db.put(format!("key{}", i).as_bytes(), b"v").unwrap();
    }
    assert_eq!(db.info().wal_dirty, 3);
    assert_eq!(db.info().revision, 1);

    db.put(b"key3", b"v").unwrap();

    let info = db.info();
    assert_eq!(info.wal_dirty, 0);
    assert_eq!(info.revision, 2);
    for i in 0..4 {
        assert!(db.contains(format!("key{}", i).as_bytes()).unwrap());
    }
}

#[test]
fn test_commit_normal_keeps_wal_when_configured() {
    let config = Config::builder()
        .in_memory()
        .wal_flush_before_commit(false)
        .build();
    let db = Database::open(config).unwrap();
    let opened_with = db.info().last_wal_flush_header;

    db.put(b"a", b"1").unwrap();
    let revision = db.commit(CommitMode::Normal).unwrap();

    let info = db.info();
    assert_eq!(revision, 2);
    assert_eq!(info.wal_dirty, 1);
    assert_eq!(info.last_wal_flush_header, opened_with);
    assert_ne!(info.last_header, opened_with);

    let headers = db.headers();
    let last = headers.last().unwrap();
    assert_eq!(last.seqnum, 1);
    assert_eq!(last.index_seq, 0);
    assert!(last.restorable);
}

#[test]
fn test_commit_flush_wal() {
    let config = Config::builder()
        .in_memory()
        .wal_flush_before_commit(false)
        .build();
    let db = Database::open(config).unwrap();

    db.put(b"a", b"1").unwrap();
    db.commit(CommitMode::FlushWal).unwrap();

    let info = db.info();
    assert_eq!(info.wal_dirty, 0);
    assert_eq!(info.last_wal_flush_header, info.last_header);
}

#[test]
fn test_commit_flushes_by_default() {
    let db = setup_memory_db();

    db.put(b"a", b"1").unwrap();
    db.commit(CommitMode::Normal).unwrap();

    assert_eq!(db.info().wal_dirty, 0);
}

#[test]
fn test_headers_listed_oldest_first() {
    let db = setup_memory_db();

    db.put(b"a", b"1").unwrap();
    db.flush().unwrap();
    db.put(b"b", b"2").unwrap();
    db.flush().unwrap();

    let revisions: Vec<u64> = db.headers().iter().map(|h| h.revision).collect();
    assert_eq!(revisions, vec![1, 2, 3]);
    assert!(db.headers().iter().all(|h| h.restorable));
}

#[test]
fn test_flush_up_to_merges_prefix() {
    let db = setup_memory_db();
    db.put(b"a", b"1").unwrap();
    db.put(b"b", b"2").unwrap();
    db.put(b"c", b"3").unwrap();

    db.flush_up_to(2).unwrap();

    let info = db.info();
    assert_eq!(info.revision, 2);
    assert_eq!(info.seqnum, 3);
    assert_eq!(info.wal_dirty, 1);
    assert_eq!(info.wal_entries, 1);
    assert_eq!(info.last_wal_flush_header, info.last_header);

    let last = *db.headers().last().unwrap();
    assert_eq!(last.seqnum, 3);
    assert_eq!(last.index_seq, 2);
    assert!(last.restorable);
    for (key, expected) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3")] {
        assert_eq!(value(&db, key), Some(expected.to_vec()));
    }

    db.flush().unwrap();
    assert_eq!(db.info().wal_dirty, 0);
    assert_eq!(db.headers().last().unwrap().index_seq, 3);
    assert_eq!(value(&db, b"c"), Some(b"3".to_vec()));
}

#[test]
fn test_flush_up_to_rejects_out_of_range() {
    let db = setup_memory_db();
    db.put(b"a", b"1").unwrap();
    db.put(b"b", b"2").unwrap();

    assert!(matches!(db.flush_up_to(3), Err(CinderError::InvalidArgument(_))));

    db.flush().unwrap();
    assert!(matches!(db.flush_up_to(1), Err(CinderError::InvalidArgument(_))));

    // Already merged
    let revision = db.info().revision;
    db.flush_up_to(2).unwrap();
    assert_eq!(db.info().revision, revision);
}

#[test]
fn test_header_history_is_bounded() {
    let db = Database::open(Config::builder().in_memory().max_headers(3).build()).unwrap();
    for i in 1..=6 {
        db.put(format!("key{}", i).as_bytes(), b"v").unwrap();
        db.flush().unwrap();
    }

    let revisions: Vec<u64> = db.headers().iter().map(|h| h.revision).collect();
    assert_eq!(revisions, vec![5, 6, 7]);
    assert!(matches!(db.open_snapshot(Some(2)), Err(CinderError::InvalidSnapshot(_))));
    assert!(matches!(db.rollback(2), Err(CinderError::CorruptHeader(_))));

    db.rollback(4).unwrap();
    assert!(db.contains(b"key4").unwrap());
    assert!(!db.contains(b"key5").unwrap());
    assert_eq!(db.headers().len(), 3);
}

#[test]
fn test_header_history_bounded_on_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .max_headers(3)
        .build();
    {
        let db = Database::open(config.clone()).unwrap();
        for i in 0..5 {
            db.put(format!("key{}", i).as_bytes(), b"v").unwrap();
            db.flush().unwrap();
        }
        db.close().unwrap();
    }

    let db = Database::open(config).unwrap();

    let revisions: Vec<u64> = db.headers().iter().map(|h| h.revision).collect();
    assert_eq!(revisions, vec![5, 6, 7]);
    assert_eq!(db.info().ndocs, 5);
}

// =============================================================================
// Accounting Tests
// =============================================================================

#[test]
fn test_document_count_and_size() {
    let db = setup_memory_db();

    db.put(b"a", b"12345").unwrap();
    db.put(b"b", b"123").unwrap();
    assert_eq!(db.info().ndocs, 2);
    assert_eq!(db.info().datasize, 8);

    // Overwrite replaces the old size
    db.put(b"a", b"1").unwrap();
    assert_eq!(db.info().ndocs, 2);
    assert_eq!(db.info().datasize, 4);

    db.delete(b"b").unwrap();
    assert_eq!(db.info().ndocs, 1);
    assert_eq!(db.info().datasize, 1);

    // Deleting a missing key changes nothing
    db.delete(b"missing").unwrap();
    assert_eq!(db.info().ndocs, 1);
}

#[test]
fn test_document_count_survives_flush() {
    let db = setup_memory_db();

    db.put(b"a", b"1").unwrap();
    db.put(b"b", b"2").unwrap();
    db.flush().unwrap();
    db.delete(b"a").unwrap();

    assert_eq!(db.info().ndocs, 1);
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_reopen_after_close() {
    let temp_dir = TempDir::new().unwrap();

    {
        let db = Database::open(file_config(&temp_dir)).unwrap();
        db.put(b"a", b"1").unwrap();
        db.put(b"b", b"2").unwrap();
        db.delete(b"a").unwrap();
        db.close().unwrap();
    }

    let db = Database::open(file_config(&temp_dir)).unwrap();
    assert_eq!(db.get(b"a").unwrap(), None);
    assert_eq!(value(&db, b"b"), Some(b"2".to_vec()));

    let info = db.info();
    assert_eq!(info.seqnum, 3);
    assert_eq!(info.ndocs, 1);
    assert_eq!(info.generation, 0);

    // Sequence numbers continue where they left off
    assert_eq!(db.put(b"c", b"3").unwrap(), 4);
}

#[test]
fn test_unflushed_writes_lost_on_crash() {
    let temp_dir = TempDir::new().unwrap();

    {
        let db = Database::open(file_config(&temp_dir)).unwrap();
        db.put(b"durable", b"1").unwrap();
        db.flush().unwrap();
        db.put(b"volatile", b"2").unwrap();
        // Dropped without close: the WAL is gone
    }

    let db = Database::open(file_config(&temp_dir)).unwrap();
    assert_eq!(value(&db, b"durable"), Some(b"1".to_vec()));
    assert_eq!(db.get(b"volatile").unwrap(), None);
    assert_eq!(db.info().seqnum, 1);
}

#[test]
fn test_recovery_truncates_torn_tail() {
    let temp_dir = TempDir::new().unwrap();
    let path = Store::generation_path(temp_dir.path(), "cinder", 0);

    {
        let db = Database::open(file_config(&temp_dir)).unwrap();
        db.put(b"a", b"1").unwrap();
        db.flush().unwrap();
    }
    let clean_len = std::fs::metadata(&path).unwrap().len();

    // Half-written frame at the end
    {
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 200, 0, 0, 0, 7, 7]).unwrap();
    }

    let db = Database::open(file_config(&temp_dir)).unwrap();
    assert_eq!(value(&db, b"a"), Some(b"1".to_vec()));
    assert_eq!(std::fs::metadata(&path).unwrap().len(), clean_len);
}

#[test]
fn test_recovery_falls_back_past_corrupt_header() {
    let temp_dir = TempDir::new().unwrap();
    let path = Store::generation_path(temp_dir.path(), "cinder", 0);

    let last_header = {
        let db = Database::open(file_config(&temp_dir)).unwrap();
        db.put(b"a", b"1").unwrap();
        db.flush().unwrap();
        db.put(b"b", b"2").unwrap();
        db.flush().unwrap();
        db.info().last_header.unwrap()
    };

    // Damage the payload of the newest header so its checksum fails
    {
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(last_header + 9)).unwrap();
        file.write_all(&[0xAB; 4]).unwrap();
    }

    let db = Database::open(file_config(&temp_dir)).unwrap();
    assert_eq!(value(&db, b"a"), Some(b"1".to_vec()));
    assert_eq!(db.get(b"b").unwrap(), None);
    assert_eq!(db.info().revision, 2);
    assert_eq!(db.info().seqnum, 1);
}

#[test]
fn test_open_removes_stale_generations() {
    let temp_dir = TempDir::new().unwrap();

    {
        let db = Database::open(file_config(&temp_dir)).unwrap();
        db.put(b"a", b"1").unwrap();
        db.close().unwrap();
    }

    // A newer generation without any header, as left by an interrupted compaction
    let stale = Store::generation_path(temp_dir.path(), "cinder", 7);
    std::fs::write(&stale, b"not a block file").unwrap();

    let db = Database::open(file_config(&temp_dir)).unwrap();
    assert!(!stale.exists());
    assert_eq!(db.info().generation, 0);
    assert_eq!(value(&db, b"a"), Some(b"1".to_vec()));
}

#[test]
fn test_open_path_convenience() {
    let temp_dir = TempDir::new().unwrap();

    let db = Database::open_path(temp_dir.path()).unwrap();
    db.put(b"k", b"v").unwrap();
    db.close().unwrap();

    let db = Database::open_path(temp_dir.path()).unwrap();
    assert_eq!(value(&db, b"k"), Some(b"v".to_vec()));
}

#[test]
fn test_sync_every_n_headers() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .sync_strategy(SyncStrategy::EveryNHeaders { count: 3 })
        .build();
    let db = Database::open(config).unwrap();

    for i in 0..5u8 {
        db.put(&[b'k', i], b"v").unwrap();
        db.flush().unwrap();
    }

    assert_eq!(db.info().revision, 6);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_writers() {
    let (_temp, db) = setup_temp_db();
    let db = Arc::new(db);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let mut seqs = Vec::new();
                for i in 0..50 {
                    let key = format!("t{}-k{}", t, i);
                    seqs.push(db.put(key.as_bytes(), b"value").unwrap());
                }
                seqs
            })
        })
        .collect();

    let mut all: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 200);
    assert_eq!(db.info().seqnum, 200);
    assert_eq!(db.info().ndocs, 200);

    for t in 0..4 {
        for i in 0..50 {
            let key = format!("t{}-k{}", t, i);
            assert!(db.contains(key.as_bytes()).unwrap());
        }
    }
}

#[test]
fn test_concurrent_readers_during_flush() {
    let db = Arc::new(Database::open(Config::builder().in_memory().wal_threshold(16).build()).unwrap());
    for i in 0..100 {
        db.put(format!("key{:03}", i).as_bytes(), b"stable").unwrap();
    }

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for i in 100..300 {
                db.put(format!("key{:03}", i).as_bytes(), b"new").unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for _ in 0..20 {
                    for i in 0..100 {
                        let got = db.get(format!("key{:03}", i).as_bytes()).unwrap();
                        assert_eq!(got, Some(Bytes::from_static(b"stable")));
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(db.info().ndocs, 300);
}
