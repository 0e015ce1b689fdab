// ferrodb-core/src/store/write_queue.rs
// Bounded asynchronous write queue for document durability
//
// Producers enqueue (collection, id, op) items and return immediately;
// back-pressure on a full channel is the only producer suspension point.
// Each document routes to a fixed worker by key hash, so per-document
// drain order always matches enqueue order. Workers persist with the
// temp-then-rename pattern: write <id>.json.tmp, fsync, atomic rename.

use std::fs::{self, OpenOptions};
use std::hash::{BuildHasher, Hash, Hasher};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use tracing::error;

use crate::error::{FerroError, Result};
use crate::store::doc_file_name;

/// Durable operation for one document.
#[derive(Debug)]
pub enum WriteOp {
    /// Persist the serialized document
    Put(Vec<u8>),
    /// Remove the document file
    Remove,
}

#[derive(Debug)]
struct WriteJob {
    collection: String,
    id: String,
    op: WriteOp,
}

enum WorkerMsg {
    Job(WriteJob),
    Flush(Sender<()>),
    Shutdown,
}

/// A durability failure surfaced to operators.
#[derive(Debug, Clone)]
pub struct WriteFailure {
    pub collection: String,
    pub id: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Multi-worker write queue over bounded channels.
pub struct WriteQueue {
    data_path: PathBuf,
    senders: Vec<Sender<WorkerMsg>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    failures: Arc<Mutex<Vec<WriteFailure>>>,
    router: ahash::RandomState,
    stopped: AtomicBool,
}

impl WriteQueue {
    pub fn start(data_path: PathBuf, workers: usize, capacity: usize) -> Self {
        assert!(workers > 0, "write queue needs at least one worker");
        let failures = Arc::new(Mutex::new(Vec::new()));
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let (tx, rx) = bounded::<WorkerMsg>(capacity);
            let worker_failures = Arc::clone(&failures);
            let root = data_path.clone();
            let handle = std::thread::Builder::new()
                .name(format!("ferrodb-write-{}", worker_id))
                .spawn(move || worker_loop(rx, root, worker_failures))
                .expect("spawn write worker");
            senders.push(tx);
            handles.push(handle);
        }

        WriteQueue {
            data_path,
            senders,
            handles: Mutex::new(handles),
            failures,
            router: ahash::RandomState::new(),
            stopped: AtomicBool::new(false),
        }
    }

    fn worker_for(&self, collection: &str, id: &str) -> usize {
        let mut hasher = self.router.build_hasher();
        collection.hash(&mut hasher);
        id.hash(&mut hasher);
        (hasher.finish() as usize) % self.senders.len()
    }

    /// Enqueue a durable write. Returns as soon as the job is queued; the
    /// send blocks only when the target worker's channel is full.
    pub fn enqueue(&self, collection: &str, id: &str, op: WriteOp) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(FerroError::Internal("write queue is shut down".into()));
        }
        let slot = self.worker_for(collection, id);
        self.senders[slot]
            .send(WorkerMsg::Job(WriteJob {
                collection: collection.to_string(),
                id: id.to_string(),
                op,
            }))
            .map_err(|_| FerroError::Internal("write worker exited".into()))
    }

    /// Block until every job enqueued before this call has been applied.
    pub fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = bounded::<()>(self.senders.len());
        for sender in &self.senders {
            sender
                .send(WorkerMsg::Flush(ack_tx.clone()))
                .map_err(|_| FerroError::Internal("write worker exited".into()))?;
        }
        drop(ack_tx);
        for _ in 0..self.senders.len() {
            ack_rx
                .recv()
                .map_err(|_| FerroError::Internal("write worker exited".into()))?;
        }
        Ok(())
    }

    /// Drain accumulated durability failures for operator inspection.
    pub fn take_failures(&self) -> Vec<WriteFailure> {
        std::mem::take(&mut *self.failures.lock())
    }

    pub fn data_path(&self) -> &PathBuf {
        &self.data_path
    }

    /// Stop workers after draining in-flight jobs.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for sender in &self.senders {
            let _ = sender.send(WorkerMsg::Shutdown);
        }
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<WorkerMsg>, root: PathBuf, failures: Arc<Mutex<Vec<WriteFailure>>>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            WorkerMsg::Job(job) => {
                if let Err(err) = apply_job(&root, &job) {
                    let op = match job.op {
                        WriteOp::Put(_) => "put",
                        WriteOp::Remove => "remove",
                    };
                    error!(
                        collection = %job.collection,
                        id = %job.id,
                        op,
                        error = %err,
                        "durable write failed"
                    );
                    failures.lock().push(WriteFailure {
                        collection: job.collection,
                        id: job.id,
                        error: err.to_string(),
                        at: Utc::now(),
                    });
                }
            }
            WorkerMsg::Flush(ack) => {
                let _ = ack.send(());
            }
            WorkerMsg::Shutdown => break,
        }
    }
}

fn apply_job(root: &std::path::Path, job: &WriteJob) -> Result<()> {
    let dir = root.join(&job.collection);
    let file = dir.join(doc_file_name(&job.id));

    match &job.op {
        WriteOp::Put(bytes) => {
            fs::create_dir_all(&dir)?;
            let tmp = file.with_extension("json.tmp");
            {
                let mut out = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&tmp)?;
                out.write_all(bytes)?;
                out.sync_all()?;
            }
            // A crash before this point leaves the previous file intact
            fs::rename(&tmp, &file)?;
            Ok(())
        }
        WriteOp::Remove => {
            match fs::remove_file(&file) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_then_read_back() {
        let tmp = TempDir::new().unwrap();
        let queue = WriteQueue::start(tmp.path().to_path_buf(), 2, 16);

        queue
            .enqueue("users", "u1", WriteOp::Put(br#"{"_id":"u1"}"#.to_vec()))
            .unwrap();
        queue.flush().unwrap();

        let written = fs::read_to_string(tmp.path().join("users").join("u1.json")).unwrap();
        assert_eq!(written, r#"{"_id":"u1"}"#);
        assert!(queue.take_failures().is_empty());
        queue.shutdown();
    }

    #[test]
    fn test_per_document_order_last_write_wins() {
        let tmp = TempDir::new().unwrap();
        let queue = WriteQueue::start(tmp.path().to_path_buf(), 4, 64);

        for version in 0..50 {
            let body = format!(r#"{{"_id":"u1","v":{}}}"#, version);
            queue
                .enqueue("users", "u1", WriteOp::Put(body.into_bytes()))
                .unwrap();
        }
        queue.flush().unwrap();

        let written = fs::read_to_string(tmp.path().join("users").join("u1.json")).unwrap();
        assert!(written.contains(r#""v":49"#));
        queue.shutdown();
    }

    #[test]
    fn test_remove_deletes_file_and_tolerates_absent() {
        let tmp = TempDir::new().unwrap();
        let queue = WriteQueue::start(tmp.path().to_path_buf(), 1, 16);

        queue
            .enqueue("users", "u1", WriteOp::Put(b"{}".to_vec()))
            .unwrap();
        queue.enqueue("users", "u1", WriteOp::Remove).unwrap();
        // Removing a document that never existed is not a failure
        queue.enqueue("users", "ghost", WriteOp::Remove).unwrap();
        queue.flush().unwrap();

        assert!(!tmp.path().join("users").join("u1.json").exists());
        assert!(queue.take_failures().is_empty());
        queue.shutdown();
    }

    #[test]
    fn test_no_tmp_files_left_after_flush() {
        let tmp = TempDir::new().unwrap();
        let queue = WriteQueue::start(tmp.path().to_path_buf(), 2, 16);
        for i in 0..20 {
            queue
                .enqueue("c", &format!("d{}", i), WriteOp::Put(b"{}".to_vec()))
                .unwrap();
        }
        queue.flush().unwrap();
        let leftovers: Vec<_> = fs::read_dir(tmp.path().join("c"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
        queue.shutdown();
    }

    #[test]
    fn test_enqueue_after_shutdown_errors() {
        let tmp = TempDir::new().unwrap();
        let queue = WriteQueue::start(tmp.path().to_path_buf(), 1, 4);
        queue.shutdown();
        assert!(queue.enqueue("c", "d", WriteOp::Remove).is_err());
    }
}
