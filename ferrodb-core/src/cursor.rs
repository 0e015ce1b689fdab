// ferrodb-core/src/cursor.rs
// Server-side cursors: batched draining with idle-timeout reclamation

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use tracing::debug;

use crate::error::{FerroError, Result};
use crate::transaction::TransactionId;

struct Cursor {
    remaining: VecDeque<Value>,
    created_at: Instant,
    last_touched: Instant,
    owner_tx: Option<TransactionId>,
}

/// First reply of a query: an initial batch plus a cursor id for the rest.
/// `cursor_id == 0` means the result was exhausted in the first batch.
#[derive(Debug, Clone)]
pub struct CursorReply {
    pub cursor_id: u64,
    pub batch: Vec<Value>,
    pub exhausted: bool,
}

pub struct CursorManager {
    cursors: DashMap<u64, Mutex<Cursor>>,
    next_id: AtomicU64,
    idle_timeout: Duration,
    default_batch: usize,
}

impl CursorManager {
    pub fn new(idle_timeout: Duration, default_batch: usize) -> Self {
        CursorManager {
            cursors: DashMap::new(),
            next_id: AtomicU64::new(1),
            idle_timeout,
            default_batch,
        }
    }

    pub fn default_batch(&self) -> usize {
        self.default_batch
    }

    /// Register a result set, draining the first batch immediately.
    pub fn open(
        &self,
        docs: Vec<Value>,
        batch_size: Option<usize>,
        owner_tx: Option<TransactionId>,
    ) -> CursorReply {
        let batch_size = batch_size.unwrap_or(self.default_batch).max(1);
        let mut remaining: VecDeque<Value> = docs.into();
        let batch: Vec<Value> = remaining.drain(..batch_size.min(remaining.len())).collect();

        if remaining.is_empty() {
            return CursorReply {
                cursor_id: 0,
                batch,
                exhausted: true,
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        self.cursors.insert(
            id,
            Mutex::new(Cursor {
                remaining,
                created_at: now,
                last_touched: now,
                owner_tx,
            }),
        );
        CursorReply {
            cursor_id: id,
            batch,
            exhausted: false,
        }
    }

    /// Advance a cursor by up to `n` documents, in stable result order.
    pub fn next_batch(&self, cursor_id: u64, n: Option<usize>) -> Result<CursorReply> {
        let n = n.unwrap_or(self.default_batch).max(1);
        let (batch, exhausted) = {
            let entry = self.cursors.get(&cursor_id).ok_or_else(|| {
                FerroError::DocumentNotFound(format!("cursor {} not found or expired", cursor_id))
            })?;
            let mut cursor = entry.lock();
            cursor.last_touched = Instant::now();
            let take = n.min(cursor.remaining.len());
            let batch: Vec<Value> = cursor.remaining.drain(..take).collect();
            (batch, cursor.remaining.is_empty())
        };

        if exhausted {
            self.cursors.remove(&cursor_id);
        }
        Ok(CursorReply {
            cursor_id: if exhausted { 0 } else { cursor_id },
            batch,
            exhausted,
        })
    }

    /// Drop a cursor, releasing its backing buffer. Returns whether it
    /// existed.
    pub fn kill(&self, cursor_id: u64) -> bool {
        self.cursors.remove(&cursor_id).is_some()
    }

    /// Kill every cursor owned by a transaction (rollback/commit cleanup).
    pub fn kill_owned_by(&self, tx: TransactionId) -> usize {
        let stale: Vec<u64> = self
            .cursors
            .iter()
            .filter(|entry| entry.value().lock().owner_tx == Some(tx))
            .map(|entry| *entry.key())
            .collect();
        let count = stale.len();
        for id in stale {
            self.cursors.remove(&id);
        }
        count
    }

    /// Drop cursors idle past the timeout. Returns how many were dropped.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(u64, Duration)> = self
            .cursors
            .iter()
            .filter(|entry| {
                let cursor = entry.value().lock();
                now.duration_since(cursor.last_touched) > self.idle_timeout
            })
            .map(|entry| {
                let age = now.duration_since(entry.value().lock().created_at);
                (*entry.key(), age)
            })
            .collect();
        let count = expired.len();
        for (id, age) in expired {
            self.cursors.remove(&id);
            debug!(cursor = id, lived = ?age, "cursor expired after idle timeout");
        }
        count
    }

    pub fn open_count(&self) -> usize {
        self.cursors.len()
    }
}
