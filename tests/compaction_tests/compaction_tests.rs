//! Tests for Online Compaction
//!
//! These tests verify:
//! - Compaction transparency (same iterator output before and after)
//! - Generation switch, old file removal and reopen
//! - Writes and reads concurrent with a background compaction
//! - Abort leaves the old generation authoritative
//! - Uncommitted transaction writes and open snapshots survive cutover

use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use cinderkv::storage::Store;
use cinderkv::{
    CinderError, CompactionState, Config, Database, Entry, Isolation, IterOptions,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn file_config(dir: &TempDir) -> Config {
    Config::builder().data_dir(dir.path()).wal_threshold(64).build()
}

fn setup_temp_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::open(file_config(&temp_dir)).unwrap();
    (temp_dir, db)
}

fn collect(db: &Database) -> Vec<Entry> {
    db.iter(IterOptions::keys())
        .unwrap()
        .collect::<cinderkv::Result<Vec<_>>>()
        .unwrap()
}

/// Overwrites, deletes and both flushed and unflushed data
fn populate(db: &Database) {
    for i in 0..300 {
        db.put(format!("key{:04}", i).as_bytes(), format!("v{}", i).as_bytes())
            .unwrap();
    }
    for i in (0..300).step_by(3) {
        db.put(format!("key{:04}", i).as_bytes(), b"rewritten").unwrap();
    }
    db.flush().unwrap();
    for i in (0..300).step_by(5) {
        db.delete(format!("key{:04}", i).as_bytes()).unwrap();
    }
    db.put(b"wal-only", b"fresh").unwrap();
}

/// Value `populate` leaves under `key{i:04}`
fn populated_value(i: usize) -> Option<Bytes> {
    if i % 5 == 0 {
        None
    } else if i % 3 == 0 {
        Some(Bytes::from_static(b"rewritten"))
    } else {
        Some(Bytes::from(format!("v{}", i)))
    }
}

fn strip_source(entries: Vec<Entry>) -> Vec<(Vec<u8>, u64, Option<Bytes>)> {
    entries.into_iter().map(|e| (e.key, e.seq, e.value)).collect()
}

// =============================================================================
// Synchronous Compaction Tests
// =============================================================================

#[test]
fn test_compaction_is_transparent() {
    let (_temp, db) = setup_temp_db();
    populate(&db);
    let before = strip_source(collect(&db));
    let info_before = db.info();

    let status = db.compact().unwrap();

    assert_eq!(status.state, CompactionState::Committed);
    assert_eq!(status.copied, before.len() as u64);
    assert_eq!(status.total, info_before.ndocs);

    let after = strip_source(collect(&db));
    assert_eq!(before, after);

    let info = db.info();
    assert_eq!(info.seqnum, info_before.seqnum);
    assert_eq!(info.ndocs, info_before.ndocs);
    assert_eq!(info.datasize, info_before.datasize);
    assert_eq!(info.wal_dirty, 0);
    assert!(!info.compacting);
}

#[test]
fn test_compaction_switches_generation_file() {
    let (temp, db) = setup_temp_db();
    populate(&db);

    db.compact().unwrap();

    assert_eq!(db.info().generation, 1);
    assert!(!Store::generation_path(temp.path(), "cinder", 0).exists());
    assert!(Store::generation_path(temp.path(), "cinder", 1).exists());

    db.compact().unwrap();
    assert_eq!(db.info().generation, 2);
    assert!(!Store::generation_path(temp.path(), "cinder", 1).exists());
}

#[test]
fn test_compaction_shrinks_file() {
    let (_temp, db) = setup_temp_db();
    for round in 0..20 {
        for i in 0..20 {
            db.put(format!("key{}", i).as_bytes(), format!("round{}", round).as_bytes())
                .unwrap();
        }
        db.flush().unwrap();
    }
    let size_before = db.info().file_size;

    db.compact().unwrap();

    assert!(db.info().file_size < size_before);
    assert_eq!(db.get(b"key7").unwrap(), Some(Bytes::from_static(b"round19")));
}

#[test]
fn test_compaction_resets_header_history() {
    let (_temp, db) = setup_temp_db();
    populate(&db);

    db.compact().unwrap();

    let headers = db.headers();
    assert_eq!(headers.len(), 1);
    assert_eq!(headers[0].seqnum, db.info().seqnum);
    assert_eq!(headers[0].index_seq, headers[0].seqnum);
    assert!(headers[0].restorable);
}

#[test]
fn test_reopen_after_compaction() {
    let temp_dir = TempDir::new().unwrap();
    let expected = {
        let db = Database::open(file_config(&temp_dir)).unwrap();
        populate(&db);
        db.compact().unwrap();
        db.put(b"after", b"compaction").unwrap();
        let expected = strip_source(collect(&db));
        db.close().unwrap();
        expected
    };

    let db = Database::open(file_config(&temp_dir)).unwrap();

    assert_eq!(db.info().generation, 1);
    assert_eq!(strip_source(collect(&db)), expected);
}

#[test]
fn test_writes_after_compaction() {
    let (_temp, db) = setup_temp_db();
    populate(&db);
    let seqnum = db.info().seqnum;

    db.compact().unwrap();
    let seq = db.put(b"key0001", b"post").unwrap();
    db.delete(b"key0002").unwrap();
    db.flush().unwrap();

    assert_eq!(seq, seqnum + 1);
    assert_eq!(db.get(b"key0001").unwrap(), Some(Bytes::from_static(b"post")));
    assert_eq!(db.get(b"key0002").unwrap(), None);
}

#[test]
fn test_compaction_of_empty_database() {
    let db = Database::open(Config::builder().in_memory().build()).unwrap();

    let status = db.compact().unwrap();

    assert_eq!(status.copied, 0);
    assert_eq!(db.info().generation, 1);
    assert!(collect(&db).is_empty());
}

// =============================================================================
// Readers & Transactions Across Cutover
// =============================================================================

#[test]
fn test_snapshot_survives_compaction() {
    let (temp, db) = setup_temp_db();
    db.put(b"a", b"old").unwrap();
    db.flush().unwrap();

    let snapshot = db.open_snapshot(None).unwrap();
    db.put(b"a", b"new").unwrap();
    db.compact().unwrap();

    assert_eq!(snapshot.get(b"a").unwrap(), Some(Bytes::from_static(b"old")));
    assert_eq!(db.get(b"a").unwrap(), Some(Bytes::from_static(b"new")));

    // The old generation lives as long as the snapshot
    let old = Store::generation_path(temp.path(), "cinder", 0);
    assert!(old.exists());
    snapshot.close();
    assert!(!old.exists());
}

#[test]
fn test_pending_transaction_survives_compaction() {
    let (temp, db) = setup_temp_db();
    db.put(b"a", b"1").unwrap();

    let mut txn = db.begin(Isolation::ReadCommitted).unwrap();
    txn.put(b"b", b"pending").unwrap();

    db.compact().unwrap();

    assert_eq!(txn.get(b"b").unwrap(), Some(Bytes::from_static(b"pending")));
    assert_eq!(db.get(b"b").unwrap(), None);
    txn.commit().unwrap();
    drop(txn);

    assert_eq!(db.get(b"b").unwrap(), Some(Bytes::from_static(b"pending")));
    assert!(!Store::generation_path(temp.path(), "cinder", 0).exists());
}

#[test]
fn test_transaction_writes_racing_cutover() {
    let (_temp, db) = setup_temp_db();
    populate(&db);
    let db = Arc::new(db);

    let mut txn = db.begin(Isolation::ReadCommitted).unwrap();
    txn.put(b"txn-before", b"1").unwrap();
    let handle = db.start_compaction().unwrap();
    for i in 0..100 {
        txn.put(format!("txn{:03}", i).as_bytes(), b"pending").unwrap();
    }
    let status = handle.wait().unwrap();
    assert_eq!(status.state, CompactionState::Committed);

    txn.commit().unwrap();
    drop(txn);

    assert_eq!(db.get(b"txn-before").unwrap(), Some(Bytes::from_static(b"1")));
    for i in 0..100 {
        let got = db.get(format!("txn{:03}", i).as_bytes()).unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"pending")));
    }
    db.flush().unwrap();
    assert_eq!(collect(&db).len() as u64, db.info().ndocs);
}

#[test]
fn test_rollback_refused_while_compacting() {
    let (_temp, db) = setup_temp_db();
    populate(&db);
    let db = Arc::new(db);

    let handle = db.start_compaction().unwrap();
    let result = db.rollback(1);
    let status = handle.wait().unwrap();

    assert_eq!(status.state, CompactionState::Committed);
    // Either the compaction was still running, or its fresh header history
    // no longer reaches back that far
    assert!(matches!(
        result,
        Err(CinderError::InvalidArgument(_)) | Err(CinderError::CorruptHeader(_))
    ));
}

// =============================================================================
// Background Compaction Tests
// =============================================================================

#[test]
fn test_concurrent_writes_during_compaction() {
    let (_temp, db) = setup_temp_db();
    populate(&db);
    let db = Arc::new(db);

    let handle = db.start_compaction().unwrap();

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for i in 0..400 {
                let key = format!("key{:04}", i);
                db.put(key.as_bytes(), format!("during{}", i).as_bytes())
                    .unwrap();
                if i % 7 == 0 {
                    db.delete(key.as_bytes()).unwrap();
                }
            }
        })
    };

    writer.join().unwrap();
    let status = handle.wait().unwrap();
    assert_eq!(status.state, CompactionState::Committed);
    assert_eq!(db.info().generation, 1);

    for i in 0..400 {
        let key = format!("key{:04}", i);
        let got = db.get(key.as_bytes()).unwrap();
        if i % 7 == 0 {
            assert_eq!(got, None, "{}", key);
        } else {
            assert_eq!(got, Some(Bytes::from(format!("during{}", i))), "{}", key);
        }
    }
    assert_eq!(db.get(b"wal-only").unwrap(), Some(Bytes::from_static(b"fresh")));

    // Everything written during the compaction also survives a flush
    db.flush().unwrap();
    let live = collect(&db);
    assert_eq!(live.len() as u64, db.info().ndocs);
}

#[test]
fn test_writes_racing_cutover_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let db = Arc::new(Database::open(file_config(&temp_dir)).unwrap());
        populate(&db);

        let handle = db.start_compaction().unwrap();
        let writer = {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..200 {
                    db.put(format!("race{:03}", i).as_bytes(), format!("v{}", i).as_bytes())
                        .unwrap();
                }
            })
        };
        let reader = {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for _ in 0..20 {
                    for i in (1..300).step_by(7) {
                        let got = db.get(format!("key{:04}", i).as_bytes()).unwrap();
                        assert_eq!(got, populated_value(i), "key{:04}", i);
                    }
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
        let status = handle.wait().unwrap();
        assert_eq!(status.state, CompactionState::Committed);

        let db = Arc::try_unwrap(db).unwrap();
        db.close().unwrap();
    }

    let db = Database::open(file_config(&temp_dir)).unwrap();

    assert_eq!(db.info().generation, 1);
    for i in 0..200 {
        let got = db.get(format!("race{:03}", i).as_bytes()).unwrap();
        assert_eq!(got, Some(Bytes::from(format!("v{}", i))));
    }
    assert_eq!(db.get(b"wal-only").unwrap(), Some(Bytes::from_static(b"fresh")));
    assert_eq!(collect(&db).len() as u64, db.info().ndocs);
}

#[test]
fn test_reads_during_compaction_match() {
    let (_temp, db) = setup_temp_db();
    populate(&db);
    let expected = strip_source(collect(&db));
    let db = Arc::new(db);

    let handle = db.start_compaction().unwrap();
    for _ in 0..5 {
        assert_eq!(strip_source(collect(&db)), expected);
    }
    handle.wait().unwrap();

    assert_eq!(strip_source(collect(&db)), expected);
}

#[test]
fn test_compaction_already_running() {
    let (_temp, db) = setup_temp_db();
    populate(&db);
    let db = Arc::new(db);

    let handle = db.start_compaction().unwrap();
    let second = db.compact();
    handle.wait().unwrap();

    match second {
        // The first one finished before the second began
        Ok(status) => assert_eq!(status.state, CompactionState::Committed),
        Err(e) => assert!(matches!(e, CinderError::InvalidArgument(_))),
    }
}

#[test]
fn test_abort_keeps_old_generation() {
    let (temp, db) = setup_temp_db();
    populate(&db);
    let expected = strip_source(collect(&db));
    let db = Arc::new(db);

    let handle = db.start_compaction().unwrap();
    handle.abort();
    let result = handle.wait();

    match result {
        Err(CinderError::CompactionAborted(_)) => {
            assert_eq!(db.info().generation, 0);
            assert!(!db.info().compacting);
            assert!(Store::generation_path(temp.path(), "cinder", 0).exists());
            assert!(!Store::generation_path(temp.path(), "cinder", 1).exists());
        }
        // The copy finished before the abort request was seen
        Ok(status) => assert_eq!(status.state, CompactionState::Committed),
        Err(other) => panic!("unexpected error: {}", other),
    }
    assert_eq!(strip_source(collect(&db)), expected);

    // The handle keeps working and can compact again
    db.put(b"later", b"1").unwrap();
    db.compact().unwrap();
    assert_eq!(db.get(b"later").unwrap(), Some(Bytes::from_static(b"1")));
}

#[test]
fn test_progress_reports_totals() {
    let (_temp, db) = setup_temp_db();
    populate(&db);
    let ndocs = db.info().ndocs;
    let db = Arc::new(db);

    let handle = db.start_compaction().unwrap();
    let progress = handle.progress();
    assert_eq!(progress.total, ndocs);
    assert!(progress.copied <= ndocs);

    let status = handle.wait().unwrap();
    assert_eq!(status.copied, ndocs);
}
