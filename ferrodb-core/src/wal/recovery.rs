// wal/recovery.rs
// Checkpoint-based replay of committed transactions
//
// Replaying every committed operation in LSN order from the checkpoint
// reproduces the exact committed state; transactions without a commit or
// rollback record at end-of-log are treated as aborted.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use tracing::{info, warn};

use crate::document::Document;
use crate::error::{FerroError, Result};

use super::reader::WalSegmentReader;
use super::record::{WalRecord, WalRecordKind};
use super::writer::{list_segments, read_checkpoint};

/// One committed operation to re-apply to the store and indexes.
#[derive(Debug, Clone)]
pub struct RecoveredOp {
    pub lsn: u64,
    pub tx_id: u64,
    pub kind: WalRecordKind,
    pub collection: String,
    pub doc_id: String,
    /// Full document image for inserts and updates; None for deletes
    pub after: Option<Document>,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub segments_scanned: usize,
    pub records_scanned: usize,
    pub committed_transactions: usize,
    pub aborted_transactions: usize,
    pub applied_ops: usize,
    pub skipped_records: usize,
}

/// Scan the log directory and produce committed operations in LSN order.
///
/// `skip_corrupted` controls the CRC-mismatch policy: when set, a damaged
/// record is skipped and replay continues; otherwise recovery fails with
/// `CorruptedLog`. Framing damage (truncated tail) always terminates that
/// segment's replay.
pub fn replay(data_dir: &Path, skip_corrupted: bool) -> Result<(Vec<RecoveredOp>, RecoveryStats)> {
    let wal_dir = data_dir.join("wal");
    let mut stats = RecoveryStats::default();

    let start_lsn = read_checkpoint(&wal_dir)
        .map(|c| c.min_active_lsn)
        .unwrap_or(0);

    let mut ops_by_tx: HashMap<u64, Vec<WalRecord>> = HashMap::new();
    let mut committed: HashSet<u64> = HashSet::new();
    let mut seen_txs: HashSet<u64> = HashSet::new();

    for (index, path) in list_segments(&wal_dir)? {
        stats.segments_scanned += 1;
        let file = File::open(&path)?;
        let reader = WalSegmentReader::new(BufReader::new(file));

        for item in reader {
            let record = match item {
                Ok(record) => record,
                Err(FerroError::Corruption(msg)) => {
                    // Well-framed record with a bad checksum or body
                    if skip_corrupted {
                        warn!(segment = index, reason = %msg, "skipping damaged WAL record");
                        stats.skipped_records += 1;
                        continue;
                    }
                    return Err(FerroError::CorruptedLog(format!(
                        "segment {}: {}",
                        index, msg
                    )));
                }
                Err(FerroError::CorruptedLog(msg)) => {
                    // Truncated tail: everything after is unreadable. A torn
                    // final write is the normal crash shape, not an error.
                    warn!(segment = index, reason = %msg, "segment replay terminated");
                    break;
                }
                Err(other) => return Err(other),
            };

            stats.records_scanned += 1;
            if record.lsn < start_lsn {
                continue;
            }

            match record.kind {
                WalRecordKind::Begin => {
                    seen_txs.insert(record.tx_id);
                }
                WalRecordKind::Commit => {
                    seen_txs.insert(record.tx_id);
                    committed.insert(record.tx_id);
                }
                WalRecordKind::Rollback => {
                    seen_txs.insert(record.tx_id);
                }
                WalRecordKind::Checkpoint => {}
                WalRecordKind::Insert | WalRecordKind::Update | WalRecordKind::Delete => {
                    seen_txs.insert(record.tx_id);
                    ops_by_tx.entry(record.tx_id).or_default().push(record);
                }
            }
        }
    }

    stats.committed_transactions = committed.len();
    stats.aborted_transactions = seen_txs.len() - committed.len();

    // Committed operations only, in global LSN order
    let mut ops = Vec::new();
    for (tx_id, records) in ops_by_tx {
        if !committed.contains(&tx_id) {
            continue; // in-flight or rolled back: treated as aborted
        }
        for record in records {
            let collection = match record.body.collection.clone() {
                Some(c) => c,
                None => {
                    warn!(lsn = record.lsn, "operation record without collection, ignoring");
                    continue;
                }
            };
            let doc_id = match record.body.doc_id.clone() {
                Some(d) => d,
                None => {
                    warn!(lsn = record.lsn, "operation record without doc_id, ignoring");
                    continue;
                }
            };
            let after = match (&record.kind, record.body.after) {
                (WalRecordKind::Delete, _) => None,
                (_, Some(image)) => Some(serde_json::from_value::<Document>(image).map_err(
                    |e| FerroError::CorruptedLog(format!("bad after image at lsn {}: {}", record.lsn, e)),
                )?),
                (_, None) => {
                    return Err(FerroError::CorruptedLog(format!(
                        "missing after image at lsn {}",
                        record.lsn
                    )))
                }
            };
            ops.push(RecoveredOp {
                lsn: record.lsn,
                tx_id,
                kind: record.kind,
                collection,
                doc_id,
                after,
            });
        }
    }
    ops.sort_by_key(|op| op.lsn);
    stats.applied_ops = ops.len();

    info!(
        segments = stats.segments_scanned,
        records = stats.records_scanned,
        committed = stats.committed_transactions,
        ops = stats.applied_ops,
        "WAL replay complete"
    );

    Ok((ops, stats))
}
