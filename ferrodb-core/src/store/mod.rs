// ferrodb-core/src/store/mod.rs
// Hybrid document store: resident map fast path, per-document files slow path
//
// Authoritative mapping from (collection, id) to document. Mutations go to
// the resident map first and are made durable through the write queue; a
// crash mid-write leaves the previous file intact (temp-then-rename).

pub mod write_queue;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};

use tracing::{error, info, warn};

use crate::document::{Document, DocumentId};
use crate::error::{FerroError, Result};

pub use write_queue::{WriteFailure, WriteOp, WriteQueue};

/// Directories under the data path that never hold collections.
const RESERVED_DIRS: &[&str] = &["wal", "_system"];

/// Encode a document id into a filesystem-safe file name.
///
/// Ids are opaque client strings; anything outside [A-Za-z0-9_-] is
/// percent-encoded. The id itself is always recovered from the `_id`
/// field inside the file, never from the file name.
pub(crate) fn doc_file_name(id: &str) -> String {
    let mut name = String::with_capacity(id.len() + 5);
    for byte in id.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' => name.push(byte as char),
            other => name.push_str(&format!("%{:02X}", other)),
        }
    }
    name.push_str(".json");
    name
}

fn valid_collection_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('_')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
}

/// One collection's resident documents.
pub struct CollectionStore {
    name: String,
    dir: PathBuf,
    docs: DashMap<DocumentId, Document>,
}

impl CollectionStore {
    fn new(name: String, dir: PathBuf) -> Self {
        CollectionStore {
            name,
            dir,
            docs: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.docs.contains_key(id)
    }

    pub fn get_resident(&self, id: &str) -> Option<Document> {
        self.docs.get(id).map(|d| d.clone())
    }

    /// All resident documents, cloned. Iteration order is unspecified.
    pub fn scan(&self) -> Vec<Document> {
        self.docs.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn ids(&self) -> Vec<DocumentId> {
        self.docs.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Load every document file in the collection directory into memory.
    /// Files that fail to parse are quarantined with a `.corrupted` suffix.
    fn load_all(&self) -> Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut loaded = 0usize;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                // Stale temp files from an interrupted writer are dead weight
                if path.extension().map(|e| e == "tmp").unwrap_or(false) {
                    let _ = fs::remove_file(&path);
                }
                continue;
            }
            match load_document_file(&path) {
                Ok(Some(doc)) => {
                    self.docs.insert(doc.id.clone(), doc);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(loaded)
    }

    fn load_from_disk(&self, id: &str) -> Option<Document> {
        let path = self.dir.join(doc_file_name(id));
        if !path.exists() {
            return None;
        }
        match load_document_file(&path) {
            Ok(doc) => doc,
            Err(e) => {
                error!(file = ?path, error = %e, "failed reading document file");
                None
            }
        }
    }
}

/// Parse one document file; quarantine on deserialization failure.
fn load_document_file(path: &Path) -> Result<Option<Document>> {
    let bytes = fs::read(path)?;
    match serde_json::from_slice::<Document>(&bytes) {
        Ok(doc) => Ok(Some(doc)),
        Err(e) => {
            let quarantine = path.with_extension("json.corrupted");
            error!(
                file = ?path,
                moved_to = ?quarantine,
                error = %e,
                "corrupted document file moved aside"
            );
            if let Err(rename_err) = fs::rename(path, &quarantine) {
                error!(file = ?path, error = %rename_err, "could not quarantine file");
            }
            Ok(None)
        }
    }
}

/// The hybrid store over all collections.
pub struct DocumentStore {
    data_path: PathBuf,
    collections: DashMap<String, Arc<CollectionStore>>,
    queue: WriteQueue,
}

impl DocumentStore {
    /// Open the store, loading every collection directory found on disk.
    pub fn open(data_path: impl Into<PathBuf>, workers: usize, queue_capacity: usize) -> Result<Self> {
        let data_path = data_path.into();
        fs::create_dir_all(&data_path)?;

        let store = DocumentStore {
            queue: WriteQueue::start(data_path.clone(), workers, queue_capacity),
            collections: DashMap::new(),
            data_path,
        };

        for entry in fs::read_dir(&store.data_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if RESERVED_DIRS.contains(&name.as_str()) || name.starts_with('_') {
                continue;
            }
            let collection = Arc::new(CollectionStore::new(name.clone(), entry.path()));
            let loaded = collection.load_all()?;
            info!(collection = %name, documents = loaded, "loaded collection");
            store.collections.insert(name, collection);
        }

        Ok(store)
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    // ------------------------------------------------------------------
    // Collection lifecycle
    // ------------------------------------------------------------------

    pub fn create_collection(&self, name: &str) -> Result<()> {
        if !valid_collection_name(name) {
            return Err(FerroError::Validation(format!(
                "invalid collection name '{}'",
                name
            )));
        }
        if self.collections.contains_key(name) {
            return Err(FerroError::CollectionExists(name.to_string()));
        }
        let dir = self.data_path.join(name);
        fs::create_dir_all(&dir)?;
        self.collections
            .insert(name.to_string(), Arc::new(CollectionStore::new(name.to_string(), dir)));
        Ok(())
    }

    /// Drop a collection and its files. Returns whether it existed.
    pub fn drop_collection(&self, name: &str) -> Result<bool> {
        let removed = self.collections.remove(name);
        if removed.is_none() {
            return Ok(false);
        }
        // Drain in-flight writes before unlinking the directory
        self.queue.flush()?;
        let dir = self.data_path.join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(true)
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    pub fn collection(&self, name: &str) -> Result<Arc<CollectionStore>> {
        self.collections
            .get(name)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| FerroError::CollectionNotFound(name.to_string()))
    }

    pub fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Document CRUD
    // ------------------------------------------------------------------

    /// Insert a fresh document: version forced to 1, timestamps server-set.
    /// Fails with `DuplicateId` when the id is already resident or on disk.
    pub fn insert(&self, collection: &str, data: Map<String, Value>, id: DocumentId) -> Result<Document> {
        let coll = self.collection(collection)?;
        let doc = Document::new(id, data);

        // Atomic against a concurrent insert of the same id
        match coll.docs.entry(doc.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(FerroError::DuplicateId(doc.id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                // A non-resident file for this id means a stale leftover;
                // the slow path would resurrect it, so reject here too.
                if coll.load_from_disk(&doc.id).is_some() {
                    return Err(FerroError::DuplicateId(doc.id));
                }
                slot.insert(doc.clone());
            }
        }

        self.enqueue_put(collection, &doc)?;
        Ok(doc)
    }

    /// Fetch a document: resident copy if present, else loaded from disk
    /// into memory, else absent.
    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let coll = self.collection(collection)?;
        if let Some(doc) = coll.get_resident(id) {
            return Ok(Some(doc));
        }
        if let Some(doc) = coll.load_from_disk(id) {
            let resident = coll
                .docs
                .entry(id.to_string())
                .or_insert_with(|| doc.clone());
            return Ok(Some(resident.clone()));
        }
        Ok(None)
    }

    /// Replace a document's data. Returns (before, after) images; the
    /// version advances by exactly one.
    pub fn update(
        &self,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
    ) -> Result<(Document, Document)> {
        let coll = self.collection(collection)?;
        // Pull a disk-only document resident before mutating it
        if !coll.contains(id) && self.get(collection, id)?.is_none() {
            return Err(FerroError::DocumentNotFound(format!("{}/{}", collection, id)));
        }
        let mut entry = coll
            .docs
            .get_mut(id)
            .ok_or_else(|| FerroError::DocumentNotFound(format!("{}/{}", collection, id)))?;

        let before = entry.clone();
        entry.replace_data(data);
        let after = entry.clone();
        drop(entry);

        self.enqueue_put(collection, &after)?;
        Ok((before, after))
    }

    /// Remove a document. Returns the before image, or None when absent.
    pub fn delete(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let coll = self.collection(collection)?;
        // Make disk-only documents resident so the before image is real
        if !coll.contains(id) && self.get(collection, id)?.is_none() {
            return Ok(None);
        }
        let removed = coll.docs.remove(id).map(|(_, doc)| doc);
        if removed.is_some() {
            self.queue.enqueue(collection, id, WriteOp::Remove)?;
        }
        Ok(removed)
    }

    /// Install a document verbatim, preserving its metadata. Used by WAL
    /// recovery and rollback, where versions must reproduce exactly.
    pub fn load_raw(&self, collection: &str, doc: Document) -> Result<()> {
        let coll = self.collection(collection)?;
        coll.docs.insert(doc.id.clone(), doc.clone());
        self.enqueue_put(collection, &doc)?;
        Ok(())
    }

    /// Remove a document from memory and disk without returning an image.
    /// Counterpart of `load_raw` for recovery/rollback paths.
    pub fn remove_raw(&self, collection: &str, id: &str) -> Result<()> {
        let coll = self.collection(collection)?;
        coll.docs.remove(id);
        self.queue.enqueue(collection, id, WriteOp::Remove)?;
        Ok(())
    }

    pub fn exists(&self, collection: &str, id: &str) -> Result<bool> {
        Ok(self.get(collection, id)?.is_some())
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        Ok(self.collection(collection)?.len())
    }

    pub fn scan(&self, collection: &str) -> Result<Vec<Document>> {
        Ok(self.collection(collection)?.scan())
    }

    // ------------------------------------------------------------------
    // Durability plumbing
    // ------------------------------------------------------------------

    fn enqueue_put(&self, collection: &str, doc: &Document) -> Result<()> {
        let bytes = serde_json::to_vec(doc)?;
        self.queue.enqueue(collection, &doc.id, WriteOp::Put(bytes))
    }

    /// Block until all enqueued writes hit disk.
    pub fn flush(&self) -> Result<()> {
        self.queue.flush()
    }

    /// Durability failures since the last call; also logged at error level
    /// when they happen.
    pub fn take_write_failures(&self) -> Vec<WriteFailure> {
        self.queue.take_failures()
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.queue.flush() {
            warn!(error = %e, "flush during shutdown failed");
        }
        self.queue.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn data(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn open_store(tmp: &TempDir) -> DocumentStore {
        DocumentStore::open(tmp.path(), 2, 64).unwrap()
    }

    #[test]
    fn test_doc_file_name_escapes_unsafe_chars() {
        assert_eq!(doc_file_name("u1"), "u1.json");
        assert_eq!(doc_file_name("a/b"), "a%2Fb.json");
        assert_eq!(doc_file_name(".."), "%2E%2E.json");
    }

    #[test]
    fn test_insert_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.create_collection("users").unwrap();

        let doc = store
            .insert("users", data(json!({"name": "Alice"})), "u1".into())
            .unwrap();
        assert_eq!(doc.meta.version, 1);

        let got = store.get("users", "u1").unwrap().unwrap();
        assert_eq!(got, doc);
        assert!(store.get("users", "nope").unwrap().is_none());
    }

    #[test]
    fn test_insert_duplicate_id_fails() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.create_collection("users").unwrap();
        store.insert("users", data(json!({})), "u1".into()).unwrap();
        let err = store.insert("users", data(json!({})), "u1".into()).unwrap_err();
        assert!(matches!(err, FerroError::DuplicateId(_)));
    }

    #[test]
    fn test_update_bumps_version_by_one() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.create_collection("users").unwrap();
        store.insert("users", data(json!({"n": 1})), "u1".into()).unwrap();

        let (before, after) = store.update("users", "u1", data(json!({"n": 2}))).unwrap();
        assert_eq!(before.meta.version, 1);
        assert_eq!(after.meta.version, 2);
        assert_eq!(after.data.get("n"), Some(&json!(2)));
        assert_eq!(before.meta.created_at, after.meta.created_at);
    }

    #[test]
    fn test_update_missing_fails() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.create_collection("users").unwrap();
        let err = store.update("users", "ghost", data(json!({}))).unwrap_err();
        assert!(matches!(err, FerroError::DocumentNotFound(_)));
    }

    #[test]
    fn test_delete_twice_returns_absent() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.create_collection("users").unwrap();
        store.insert("users", data(json!({})), "u1".into()).unwrap();

        assert!(store.delete("users", "u1").unwrap().is_some());
        assert!(store.delete("users", "u1").unwrap().is_none());
        store.flush().unwrap();
        assert!(!tmp.path().join("users").join("u1.json").exists());
    }

    #[test]
    fn test_documents_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open_store(&tmp);
            store.create_collection("users").unwrap();
            store
                .insert("users", data(json!({"name": "A"})), "u1".into())
                .unwrap();
            store.shutdown();
        }
        {
            let store = open_store(&tmp);
            let doc = store.get("users", "u1").unwrap().unwrap();
            assert_eq!(doc.data.get("name"), Some(&json!("A")));
            assert_eq!(doc.meta.version, 1);
            assert_eq!(store.list_collections(), vec!["users".to_string()]);
        }
    }

    #[test]
    fn test_corrupted_file_is_quarantined_not_dropped() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open_store(&tmp);
            store.create_collection("users").unwrap();
            store.insert("users", data(json!({})), "good".into()).unwrap();
            store.shutdown();
        }
        fs::write(tmp.path().join("users").join("bad.json"), b"{not json").unwrap();
        {
            let store = open_store(&tmp);
            assert_eq!(store.count("users").unwrap(), 1);
            assert!(tmp
                .path()
                .join("users")
                .join("bad.json.corrupted")
                .exists());
        }
    }

    #[test]
    fn test_disk_fallback_loads_into_memory() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.create_collection("users").unwrap();

        // Place a file behind the resident map's back
        let doc = Document::new("cold".into(), data(json!({"x": 1})));
        fs::write(
            tmp.path().join("users").join("cold.json"),
            serde_json::to_vec(&doc).unwrap(),
        )
        .unwrap();

        let got = store.get("users", "cold").unwrap().unwrap();
        assert_eq!(got.data.get("x"), Some(&json!(1)));
        assert!(store.collection("users").unwrap().contains("cold"));
    }

    #[test]
    fn test_collection_name_validation() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        assert!(store.create_collection("users").is_ok());
        assert!(store.create_collection("users").is_err());
        assert!(store.create_collection("").is_err());
        assert!(store.create_collection("_system").is_err());
        assert!(store.create_collection("a/b").is_err());
    }

    #[test]
    fn test_drop_collection_removes_files() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.create_collection("users").unwrap();
        store.insert("users", data(json!({})), "u1".into()).unwrap();

        assert!(store.drop_collection("users").unwrap());
        assert!(!store.drop_collection("users").unwrap());
        assert!(!tmp.path().join("users").exists());
        assert!(store.get("users", "u1").is_err());
    }

    #[test]
    fn test_load_raw_preserves_version() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.create_collection("users").unwrap();

        let mut doc = Document::new("u1".into(), data(json!({"n": 1})));
        doc.touch();
        doc.touch();
        store.load_raw("users", doc.clone()).unwrap();

        let got = store.get("users", "u1").unwrap().unwrap();
        assert_eq!(got.meta.version, 3);
    }
}
