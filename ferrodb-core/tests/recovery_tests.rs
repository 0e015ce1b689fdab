// Crash and corruption recovery over a full database
// The discipline throughout: no panics - damage surfaces as Err or as a
// logged quarantine, never as silent loss.

use ferrodb_core::wal::{list_segments, WalManager, WalRecord, WalRecordKind, WAL_HEADER_SIZE};
use ferrodb_core::{Config, Database, Document, FerroError};
use serde_json::json;
use std::fs;
use tempfile::TempDir;

fn doc_image(id: &str, n: i64) -> serde_json::Value {
    serde_json::to_value(Document::from_value(json!({"_id": id, "n": n})).unwrap()).unwrap()
}

/// Hand-write a WAL as a crashed process would have left it, then open a
/// database over the directory.
fn write_wal(tmp: &TempDir, build: impl FnOnce(&WalManager)) {
    let wal = WalManager::open(tmp.path().join("wal"), 1 << 20, 8).unwrap();
    build(&wal);
}

#[test]
fn test_database_open_replays_committed_wal() {
    let tmp = TempDir::new().unwrap();
    write_wal(&tmp, |wal| {
        wal.append(WalRecord::begin(1)).unwrap();
        wal.append_op(1, WalRecordKind::Insert, "users", "u1", None, Some(doc_image("u1", 1)))
            .unwrap();
        wal.append(WalRecord::commit(1)).unwrap();

        wal.append(WalRecord::begin(2)).unwrap();
        wal.append_op(2, WalRecordKind::Insert, "users", "u2", None, Some(doc_image("u2", 2)))
            .unwrap();
        // tx 2 never commits
    });

    let db = Database::open_at(tmp.path()).unwrap();
    // The collection itself was materialized by replay
    assert_eq!(db.list_collections(), vec!["users".to_string()]);
    assert!(db.get(None, "users", "u1").unwrap().is_some());
    assert!(db.get(None, "users", "u2").unwrap().is_none());
}

#[test]
fn test_replay_applies_updates_and_deletes_in_lsn_order() {
    let tmp = TempDir::new().unwrap();
    write_wal(&tmp, |wal| {
        wal.append(WalRecord::begin(1)).unwrap();
        wal.append_op(1, WalRecordKind::Insert, "c", "x", None, Some(doc_image("x", 1)))
            .unwrap();
        wal.append_op(
            1,
            WalRecordKind::Update,
            "c",
            "x",
            Some(doc_image("x", 1)),
            Some(doc_image("x", 2)),
        )
        .unwrap();
        wal.append_op(1, WalRecordKind::Insert, "c", "y", None, Some(doc_image("y", 9)))
            .unwrap();
        wal.append_op(1, WalRecordKind::Delete, "c", "y", Some(doc_image("y", 9)), None)
            .unwrap();
        wal.append(WalRecord::commit(1)).unwrap();
    });

    let db = Database::open_at(tmp.path()).unwrap();
    let x = db.get(None, "c", "x").unwrap().unwrap();
    assert_eq!(x.data.get("n"), Some(&json!(2)));
    assert!(db.get(None, "c", "y").unwrap().is_none());
}

#[test]
fn test_partial_tail_record_is_tolerated() {
    let tmp = TempDir::new().unwrap();
    write_wal(&tmp, |wal| {
        wal.append(WalRecord::begin(1)).unwrap();
        wal.append_op(1, WalRecordKind::Insert, "c", "x", None, Some(doc_image("x", 1)))
            .unwrap();
        wal.append(WalRecord::commit(1)).unwrap();
    });
    // Crash mid-append: a torn record at the tail
    let (_, segment) = list_segments(&tmp.path().join("wal")).unwrap().pop().unwrap();
    let mut bytes = fs::read(&segment).unwrap();
    let mut torn = WalRecord::begin(2).encode().unwrap();
    torn.truncate(WAL_HEADER_SIZE / 2);
    bytes.extend(torn);
    fs::write(&segment, bytes).unwrap();

    let db = Database::open_at(tmp.path()).unwrap();
    assert!(db.get(None, "c", "x").unwrap().is_some());
}

#[test]
fn test_corrupt_record_fails_closed_by_default() {
    let tmp = TempDir::new().unwrap();
    write_wal(&tmp, |wal| {
        wal.append(WalRecord::begin(1)).unwrap();
        wal.append_op(1, WalRecordKind::Insert, "c", "x", None, Some(doc_image("x", 1)))
            .unwrap();
        wal.append(WalRecord::commit(1)).unwrap();
    });
    // Flip a byte inside the insert record's body
    let (_, segment) = list_segments(&tmp.path().join("wal")).unwrap().pop().unwrap();
    let mut bytes = fs::read(&segment).unwrap();
    let begin_len = WalRecord::begin(1).encode().unwrap().len();
    bytes[begin_len + WAL_HEADER_SIZE + 4] ^= 0xFF;
    fs::write(&segment, bytes).unwrap();

    let err = Database::open_at(tmp.path()).unwrap_err();
    assert!(matches!(err, FerroError::CorruptedLog(_)));

    // With the skip flag recovery continues past the damaged record
    let mut config = Config::default();
    config.storage.data_path = tmp.path().to_path_buf();
    config.storage.skip_corrupted_wal = true;
    let db = Database::open(config).unwrap();
    // The damaged insert was skipped, so nothing was materialized
    assert!(db.list_collections().is_empty());
}

#[test]
fn test_checkpoint_truncation_bounds_future_replay() {
    let tmp = TempDir::new().unwrap();
    {
        let db = Database::open_at(tmp.path()).unwrap();
        db.create_collection("c").unwrap();
        for i in 0..20 {
            db.insert(None, "c", json!({"_id": format!("d{}", i), "n": i})).unwrap();
        }
        db.checkpoint().unwrap();
        db.shutdown();
    }
    {
        // Clean reopen finds everything without replaying old segments
        let db = Database::open_at(tmp.path()).unwrap();
        assert_eq!(db.count(None, "c", None).unwrap(), 20);
        db.shutdown();
    }
}

#[test]
fn test_repeated_crash_recover_cycles_converge() {
    let tmp = TempDir::new().unwrap();
    for round in 0..3u64 {
        let db = Database::open_at(tmp.path()).unwrap();
        if round == 0 {
            db.create_collection("c").unwrap();
        }
        db.insert(None, "c", json!({"_id": format!("d{}", round), "round": round}))
            .unwrap();
        db.flush().unwrap();
        // Abandon without shutdown, like a kill -9
        std::mem::forget(db);
    }

    let db = Database::open_at(tmp.path()).unwrap();
    assert_eq!(db.count(None, "c", None).unwrap(), 3);
    for round in 0..3u64 {
        let doc = db.get(None, "c", &format!("d{}", round)).unwrap().unwrap();
        assert_eq!(doc.meta.version, 1);
    }
}

#[test]
fn test_corrupted_document_file_quarantined_on_open() {
    let tmp = TempDir::new().unwrap();
    {
        let db = Database::open_at(tmp.path()).unwrap();
        db.create_collection("c").unwrap();
        db.insert(None, "c", json!({"_id": "good", "n": 1})).unwrap();
        db.shutdown();
    }
    fs::write(tmp.path().join("c").join("bad.json"), b"{definitely not json").unwrap();

    let db = Database::open_at(tmp.path()).unwrap();
    assert_eq!(db.count(None, "c", None).unwrap(), 1);
    assert!(tmp.path().join("c").join("bad.json.corrupted").exists());
}
