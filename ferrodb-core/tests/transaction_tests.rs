// Transaction behavior over a full database: isolation levels, deadlock
// resolution, savepoints and timeout handling.

use ferrodb_core::{Config, Database, FerroError, IsolationLevel};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn data(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => panic!("expected object"),
    }
}

/// Short lock timeouts so blocked-writer tests finish quickly.
fn open_fast(tmp: &TempDir) -> Arc<Database> {
    let mut config = Config::default();
    config.storage.data_path = tmp.path().to_path_buf();
    config.transaction.lock_timeout_ms = 250;
    config.transaction.deadlock_interval_ms = 50;
    Arc::new(Database::open(config).unwrap())
}

fn seed(db: &Database) {
    db.create_collection("accounts").unwrap();
    db.insert(None, "accounts", json!({"_id": "a", "balance": 100})).unwrap();
    db.insert(None, "accounts", json!({"_id": "b", "balance": 100})).unwrap();
}

/// Generous lock timeout so the detector always wins the race against
/// plain lock expiry.
fn open_for_deadlock(tmp: &TempDir) -> Arc<Database> {
    let mut config = Config::default();
    config.storage.data_path = tmp.path().to_path_buf();
    config.transaction.lock_timeout_ms = 5_000;
    config.transaction.deadlock_interval_ms = 50;
    Arc::new(Database::open(config).unwrap())
}

#[test]
fn test_deadlock_one_victim_one_survivor() {
    let tmp = TempDir::new().unwrap();
    let db = open_for_deadlock(&tmp);
    seed(&db);

    // T1 locks a then wants b; T2 locks b then wants a
    let tx1 = db.begin(None).unwrap();
    let tx2 = db.begin(None).unwrap();
    db.replace(Some(tx1), "accounts", "a", data(json!({"balance": 90})), None)
        .unwrap();
    db.replace(Some(tx2), "accounts", "b", data(json!({"balance": 110})), None)
        .unwrap();

    let db1 = Arc::clone(&db);
    let t1 = std::thread::spawn(move || {
        let r = db1.replace(Some(tx1), "accounts", "b", data(json!({"balance": 80})), None);
        match r {
            Ok(_) => db1.commit(tx1).map(|_| "committed"),
            Err(e) => Err(e),
        }
    });
    let db2 = Arc::clone(&db);
    let t2 = std::thread::spawn(move || {
        let r = db2.replace(Some(tx2), "accounts", "a", data(json!({"balance": 120})), None);
        match r {
            Ok(_) => db2.commit(tx2).map(|_| "committed"),
            Err(e) => Err(e),
        }
    });

    let r1 = t1.join().unwrap();
    let r2 = t2.join().unwrap();

    let deadlocks = [&r1, &r2]
        .iter()
        .filter(|r| matches!(r, Err(FerroError::Deadlock(_))))
        .count();
    let commits = [&r1, &r2].iter().filter(|r| r.is_ok()).count();
    assert_eq!(deadlocks, 1, "exactly one victim: {:?} / {:?}", r1, r2);
    assert_eq!(commits, 1, "the survivor commits");

    // Wait-for graph must be empty once the dust settles
    assert_eq!(db.locks().waiter_count(), 0);
    assert!(db.locks().detect_once().is_empty());

    // The survivor's effects are consistent: both its writes or none of
    // the victim's
    let a = db.get(None, "accounts", "a").unwrap().unwrap();
    let b = db.get(None, "accounts", "b").unwrap().unwrap();
    if r1.is_ok() {
        assert_eq!(a.data.get("balance"), Some(&json!(90)));
        assert_eq!(b.data.get("balance"), Some(&json!(80)));
    } else {
        assert_eq!(b.data.get("balance"), Some(&json!(110)));
        assert_eq!(a.data.get("balance"), Some(&json!(120)));
    }
}

#[test]
fn test_read_committed_never_sees_in_flight_writes() {
    let tmp = TempDir::new().unwrap();
    let db = open_fast(&tmp);
    seed(&db);

    let writer = db.begin(None).unwrap();
    db.replace(Some(writer), "accounts", "a", data(json!({"balance": 0})), None)
        .unwrap();

    // The reader blocks on the writer's X lock and times out rather than
    // observing the uncommitted balance
    let reader = db.begin(Some(IsolationLevel::ReadCommitted)).unwrap();
    let err = db.get(Some(reader), "accounts", "a").unwrap_err();
    assert!(matches!(err, FerroError::LockTimeout(_)));
    assert!(err.retryable());

    db.commit(writer).unwrap();
    let doc = db.get(Some(reader), "accounts", "a").unwrap().unwrap();
    assert_eq!(doc.data.get("balance"), Some(&json!(0)));
    db.commit(reader).unwrap();
}

#[test]
fn test_read_uncommitted_observes_dirty_state() {
    let tmp = TempDir::new().unwrap();
    let db = open_fast(&tmp);
    seed(&db);

    let writer = db.begin(None).unwrap();
    db.replace(Some(writer), "accounts", "a", data(json!({"balance": 1})), None)
        .unwrap();

    let reader = db.begin(Some(IsolationLevel::ReadUncommitted)).unwrap();
    let doc = db.get(Some(reader), "accounts", "a").unwrap().unwrap();
    assert_eq!(doc.data.get("balance"), Some(&json!(1)), "dirty read expected");
    db.commit(reader).unwrap();
    db.rollback(writer).unwrap();

    // After the rollback the dirty value is gone
    let doc = db.get(None, "accounts", "a").unwrap().unwrap();
    assert_eq!(doc.data.get("balance"), Some(&json!(100)));
}

#[test]
fn test_repeatable_read_blocks_writers_until_commit() {
    let tmp = TempDir::new().unwrap();
    let db = open_fast(&tmp);
    seed(&db);

    let reader = db.begin(Some(IsolationLevel::RepeatableRead)).unwrap();
    let first = db.get(Some(reader), "accounts", "a").unwrap().unwrap();

    // A writer cannot upgrade past the reader's held S lock
    let err = db
        .replace(None, "accounts", "a", data(json!({"balance": 5})), None)
        .unwrap_err();
    assert!(matches!(err, FerroError::LockTimeout(_)));

    // The read repeats identically
    let second = db.get(Some(reader), "accounts", "a").unwrap().unwrap();
    assert_eq!(first, second);
    db.commit(reader).unwrap();

    // Once the reader is gone the write lands
    db.replace(None, "accounts", "a", data(json!({"balance": 5})), None)
        .unwrap();
}

#[test]
fn test_serializable_scan_blocks_phantom_insert() {
    let tmp = TempDir::new().unwrap();
    let db = open_fast(&tmp);
    seed(&db);

    let reader = db.begin(Some(IsolationLevel::Serializable)).unwrap();
    let rows = db
        .find_all(Some(reader), "accounts", &json!({"filter": {}}))
        .unwrap();
    assert_eq!(rows.len(), 2);

    // A membership change must wait behind the held range lock
    let err = db
        .insert(None, "accounts", json!({"_id": "c", "balance": 1}))
        .unwrap_err();
    assert!(matches!(err, FerroError::LockTimeout(_)));

    db.commit(reader).unwrap();
    db.insert(None, "accounts", json!({"_id": "c", "balance": 1})).unwrap();
}

#[test]
fn test_savepoint_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let db = open_fast(&tmp);
    seed(&db);

    let tx = db.begin(None).unwrap();
    db.replace(Some(tx), "accounts", "a", data(json!({"balance": 50})), None)
        .unwrap();
    db.savepoint(tx, "after_a").unwrap();
    db.replace(Some(tx), "accounts", "b", data(json!({"balance": 0})), None)
        .unwrap();

    db.rollback_to_savepoint(tx, "after_a").unwrap();
    // b's lock was released with the savepoint; another writer can take it
    db.replace(None, "accounts", "b", data(json!({"balance": 75})), None)
        .unwrap();

    db.commit(tx).unwrap();
    let a = db.get(None, "accounts", "a").unwrap().unwrap();
    let b = db.get(None, "accounts", "b").unwrap().unwrap();
    assert_eq!(a.data.get("balance"), Some(&json!(50)));
    assert_eq!(b.data.get("balance"), Some(&json!(75)));
}

#[test]
fn test_transaction_timeout_aborts_and_releases() {
    let tmp = TempDir::new().unwrap();
    let db = open_fast(&tmp);
    seed(&db);

    let tx = db
        .transactions()
        .begin(None, Some(Duration::from_millis(50)))
        .unwrap();
    db.replace(Some(tx), "accounts", "a", data(json!({"balance": 0})), None)
        .unwrap();

    // The sweeper runs every second; wait for it to fire
    std::thread::sleep(Duration::from_millis(1400));
    assert!(!db.transactions().is_active(tx));

    // The abort reverted the write and released the lock
    let doc = db.get(None, "accounts", "a").unwrap().unwrap();
    assert_eq!(doc.data.get("balance"), Some(&json!(100)));
    db.replace(None, "accounts", "a", data(json!({"balance": 7})), None)
        .unwrap();
}

#[test]
fn test_lock_timeout_leaves_transaction_alive() {
    let tmp = TempDir::new().unwrap();
    let db = open_fast(&tmp);
    seed(&db);

    let holder = db.begin(None).unwrap();
    db.replace(Some(holder), "accounts", "a", data(json!({"balance": 0})), None)
        .unwrap();

    let tx = db.begin(None).unwrap();
    let err = db
        .replace(Some(tx), "accounts", "a", data(json!({"balance": 1})), None)
        .unwrap_err();
    assert!(matches!(err, FerroError::LockTimeout(_)));

    // The losing transaction survives and can retry after the holder ends
    assert!(db.transactions().is_active(tx));
    db.commit(holder).unwrap();
    db.replace(Some(tx), "accounts", "a", data(json!({"balance": 1})), None)
        .unwrap();
    db.commit(tx).unwrap();
}
