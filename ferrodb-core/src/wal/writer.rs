// wal/writer.rs
// Segmented WAL appender with group fsync and checkpointing
//
// One logical appender guards LSN assignment and segment rolling; commit
// records are made durable before append() returns, other records ride a
// group-commit watermark.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use tracing::{info, warn};

use crate::error::Result;

use super::reader::WalSegmentReader;
use super::record::{WalRecord, WalRecordBody, WalRecordKind};

const CHECKPOINT_FILE: &str = "checkpoint";

/// Durable checkpoint marker, replaced atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    /// LSN of the checkpoint record itself
    pub checkpoint_lsn: u64,
    /// Oldest LSN still needed by recovery; segments entirely below this
    /// are safe to truncate
    pub min_active_lsn: u64,
}

/// List WAL segment files as (index, path), sorted by index.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if let Some(index) = name
            .strip_prefix("segment-")
            .and_then(|rest| rest.strip_suffix(".log"))
            .and_then(|num| num.parse::<u64>().ok())
        {
            segments.push((index, path));
        }
    }
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

pub fn read_checkpoint(dir: &Path) -> Option<CheckpointInfo> {
    let bytes = fs::read(dir.join(CHECKPOINT_FILE)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("segment-{}.log", index))
}

struct WalInner {
    segment: File,
    segment_index: u64,
    segment_bytes: u64,
    next_lsn: u64,
    unsynced: usize,
}

/// The write-ahead log manager.
pub struct WalManager {
    dir: PathBuf,
    max_segment_bytes: u64,
    sync_watermark: usize,
    inner: Mutex<WalInner>,
}

impl WalManager {
    /// Open the log directory, continuing the last segment. The next LSN
    /// resumes after the highest LSN found on disk.
    pub fn open(dir: impl Into<PathBuf>, max_segment_bytes: u64, sync_watermark: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let segments = list_segments(&dir)?;
        let mut max_lsn = 0u64;
        for (_, path) in &segments {
            let file = File::open(path)?;
            for record in WalSegmentReader::new(BufReader::new(file)) {
                match record {
                    Ok(r) => max_lsn = max_lsn.max(r.lsn),
                    // Damaged tails are recovery's concern, not the appender's
                    Err(_) => break,
                }
            }
        }

        let segment_index = segments.last().map(|(i, _)| *i).unwrap_or(0);
        let path = segment_path(&dir, segment_index);
        let segment = OpenOptions::new().create(true).append(true).open(&path)?;
        let segment_bytes = segment.metadata()?.len();

        Ok(WalManager {
            dir,
            max_segment_bytes,
            sync_watermark,
            inner: Mutex::new(WalInner {
                segment,
                segment_index,
                segment_bytes,
                next_lsn: max_lsn + 1,
                unsynced: 0,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Next LSN that will be assigned (exclusive upper bound of the log).
    pub fn next_lsn(&self) -> u64 {
        self.inner.lock().next_lsn
    }

    /// Append a record, assigning its LSN. The record is durable on return
    /// for commit, rollback and checkpoint kinds; other kinds are synced
    /// once the group watermark fills.
    ///
    /// An I/O failure here is fatal for the writing transaction: the
    /// coordinator must not report success past this point.
    pub fn append(&self, mut record: WalRecord) -> Result<u64> {
        let mut inner = self.inner.lock();
        record.lsn = inner.next_lsn;
        let bytes = record.encode()?;

        if inner.segment_bytes > 0 && inner.segment_bytes + bytes.len() as u64 > self.max_segment_bytes {
            self.roll_segment(&mut inner)?;
        }

        inner.segment.write_all(&bytes)?;
        inner.segment_bytes += bytes.len() as u64;
        inner.next_lsn += 1;
        inner.unsynced += 1;

        let force = matches!(
            record.kind,
            WalRecordKind::Commit | WalRecordKind::Rollback | WalRecordKind::Checkpoint
        );
        if force || inner.unsynced >= self.sync_watermark {
            inner.segment.sync_all()?;
            inner.unsynced = 0;
        }

        Ok(record.lsn)
    }

    /// Convenience append for operation records.
    pub fn append_op(
        &self,
        tx_id: u64,
        kind: WalRecordKind,
        collection: &str,
        doc_id: &str,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Result<u64> {
        self.append(WalRecord::new(
            tx_id,
            kind,
            WalRecordBody {
                collection: Some(collection.to_string()),
                doc_id: Some(doc_id.to_string()),
                before,
                after,
            },
        ))
    }

    /// Force everything written so far to disk.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.segment.sync_all()?;
        inner.unsynced = 0;
        Ok(())
    }

    fn roll_segment(&self, inner: &mut WalInner) -> Result<()> {
        inner.segment.sync_all()?;
        inner.segment_index += 1;
        let path = segment_path(&self.dir, inner.segment_index);
        inner.segment = OpenOptions::new().create(true).append(true).open(&path)?;
        inner.segment_bytes = 0;
        inner.unsynced = 0;
        info!(segment = inner.segment_index, "rolled WAL segment");
        Ok(())
    }

    /// Write a checkpoint: a checkpoint record (fsynced), then the
    /// atomically replaced checkpoint file, then truncation of segments
    /// entirely below `min_active_lsn`.
    pub fn checkpoint(&self, min_active_lsn: u64) -> Result<CheckpointInfo> {
        let checkpoint_lsn = self.append(WalRecord::checkpoint(min_active_lsn))?;

        let info = CheckpointInfo {
            checkpoint_lsn,
            min_active_lsn,
        };
        let tmp = self.dir.join(format!("{}.tmp", CHECKPOINT_FILE));
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&serde_json::to_vec(&info)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(CHECKPOINT_FILE))?;

        self.truncate_below(min_active_lsn)?;
        Ok(info)
    }

    /// Delete segments whose records all precede `min_active_lsn`. A
    /// segment is removable when the following segment starts at or below
    /// the minimum.
    fn truncate_below(&self, min_active_lsn: u64) -> Result<()> {
        // Hold the appender so the active segment cannot roll mid-truncate
        let _guard = self.inner.lock();
        let segments = list_segments(&self.dir)?;
        for window in segments.windows(2) {
            let (_, ref path) = window[0];
            let (_, ref next_path) = window[1];
            let next_first_lsn = match first_lsn(next_path)? {
                Some(lsn) => lsn,
                None => continue,
            };
            if next_first_lsn <= min_active_lsn {
                match fs::remove_file(path) {
                    Ok(()) => info!(segment = ?path, "truncated WAL segment"),
                    Err(e) => warn!(segment = ?path, error = %e, "could not truncate segment"),
                }
            }
        }
        Ok(())
    }
}

fn first_lsn(path: &Path) -> Result<Option<u64>> {
    let file = File::open(path)?;
    let mut reader = WalSegmentReader::new(BufReader::new(file));
    match reader.next() {
        Some(Ok(record)) => Ok(Some(record.lsn)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn collect_records(dir: &Path) -> Vec<WalRecord> {
        let mut records = Vec::new();
        for (_, path) in list_segments(dir).unwrap() {
            let file = File::open(path).unwrap();
            for record in WalSegmentReader::new(BufReader::new(file)) {
                records.push(record.unwrap());
            }
        }
        records
    }

    #[test]
    fn test_append_assigns_monotonic_lsns() {
        let tmp = TempDir::new().unwrap();
        let wal = WalManager::open(tmp.path(), 1 << 20, 8).unwrap();

        let a = wal.append(WalRecord::begin(1)).unwrap();
        let b = wal
            .append_op(1, WalRecordKind::Insert, "users", "u1", None, Some(serde_json::json!({})))
            .unwrap();
        let c = wal.append(WalRecord::commit(1)).unwrap();
        assert!(a < b && b < c);

        let records = collect_records(tmp.path());
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].lsn, a);
        assert_eq!(records[2].kind, WalRecordKind::Commit);
    }

    #[test]
    fn test_lsn_resumes_after_reopen() {
        let tmp = TempDir::new().unwrap();
        let last = {
            let wal = WalManager::open(tmp.path(), 1 << 20, 8).unwrap();
            wal.append(WalRecord::begin(1)).unwrap();
            wal.append(WalRecord::commit(1)).unwrap()
        };
        let wal = WalManager::open(tmp.path(), 1 << 20, 8).unwrap();
        let next = wal.append(WalRecord::begin(2)).unwrap();
        assert_eq!(next, last + 1);
    }

    #[test]
    fn test_segments_roll_at_size() {
        let tmp = TempDir::new().unwrap();
        // Tiny cap: every record rolls to a fresh segment
        let wal = WalManager::open(tmp.path(), 64, 8).unwrap();
        for tx in 0..5 {
            wal.append(WalRecord::begin(tx)).unwrap();
        }
        let segments = list_segments(tmp.path()).unwrap();
        assert!(segments.len() > 1, "expected rolling, got {:?}", segments);
        // All records still readable, in order
        let records = collect_records(tmp.path());
        assert_eq!(records.len(), 5);
        assert!(records.windows(2).all(|w| w[0].lsn < w[1].lsn));
    }

    #[test]
    fn test_checkpoint_truncates_old_segments() {
        let tmp = TempDir::new().unwrap();
        let wal = WalManager::open(tmp.path(), 64, 8).unwrap();
        for tx in 0..6 {
            wal.append(WalRecord::begin(tx)).unwrap();
            wal.append(WalRecord::commit(tx)).unwrap();
        }
        let before = list_segments(tmp.path()).unwrap().len();

        let min = wal.next_lsn();
        let info = wal.checkpoint(min).unwrap();
        assert_eq!(info.min_active_lsn, min);
        assert_eq!(read_checkpoint(tmp.path()), Some(info));

        let after = list_segments(tmp.path()).unwrap().len();
        assert!(after < before, "expected truncation: {} -> {}", before, after);

        // The surviving log still ends with the checkpoint record
        let records = collect_records(tmp.path());
        assert_eq!(records.last().unwrap().kind, WalRecordKind::Checkpoint);
    }

    #[test]
    fn test_checkpoint_keeps_needed_segments() {
        let tmp = TempDir::new().unwrap();
        let wal = WalManager::open(tmp.path(), 64, 8).unwrap();
        let first = wal.append(WalRecord::begin(1)).unwrap();
        for tx in 2..5 {
            wal.append(WalRecord::begin(tx)).unwrap();
        }
        // Oldest active transaction still needs the first record
        wal.checkpoint(first).unwrap();
        let records = collect_records(tmp.path());
        assert!(records.iter().any(|r| r.lsn == first));
    }

    #[test]
    fn test_no_checkpoint_file_until_first_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let _wal = WalManager::open(tmp.path(), 1 << 20, 8).unwrap();
        assert_eq!(read_checkpoint(tmp.path()), None);
    }
}
