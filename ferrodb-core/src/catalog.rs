// ferrodb-core/src/catalog.rs
// Persisted catalog: collection names + index definitions
//
// Index definitions must survive restart (the trees themselves rebuild
// from documents at open). Stored as bincode at _system/catalog.bin with
// temp-then-rename replacement. Partial filters are kept as JSON text
// because bincode cannot round-trip a self-describing serde_json::Value.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tracing::error;

use crate::error::{FerroError, Result};
use crate::index::{IndexDefinition, IndexField, IndexKind};

const CATALOG_DIR: &str = "_system";
const CATALOG_FILE: &str = "catalog.bin";

/// Bincode-friendly index definition (partial filter as JSON text).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredIndexDef {
    name: String,
    fields: Vec<IndexField>,
    kind: IndexKind,
    unique: bool,
    sparse: bool,
    partial_filter_json: Option<String>,
    ttl_secs: Option<i64>,
}

impl StoredIndexDef {
    fn from_def(def: &IndexDefinition) -> Result<Self> {
        let partial_filter_json = match &def.partial_filter {
            Some(filter) => Some(serde_json::to_string(filter)?),
            None => None,
        };
        Ok(StoredIndexDef {
            name: def.name.clone(),
            fields: def.fields.clone(),
            kind: def.kind,
            unique: def.unique,
            sparse: def.sparse,
            partial_filter_json,
            ttl_secs: def.ttl_secs,
        })
    }

    fn into_def(self) -> Result<IndexDefinition> {
        let partial_filter = match self.partial_filter_json {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(IndexDefinition {
            name: self.name,
            fields: self.fields,
            kind: self.kind,
            unique: self.unique,
            sparse: self.sparse,
            partial_filter,
            ttl_secs: self.ttl_secs,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionEntry {
    created_at: DateTime<Utc>,
    indexes: Vec<StoredIndexDef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogState {
    collections: BTreeMap<String, CollectionEntry>,
}

/// The catalog store. All mutations persist immediately.
pub struct CatalogStore {
    path: PathBuf,
    state: RwLock<CatalogState>,
}

impl CatalogStore {
    /// Load the catalog, starting empty when none exists. A catalog that
    /// fails to decode is quarantined and logged, never silently dropped.
    pub fn load(data_path: &Path) -> Result<Self> {
        let dir = data_path.join(CATALOG_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(CATALOG_FILE);

        let state = if path.exists() {
            let bytes = fs::read(&path)?;
            match bincode::deserialize::<CatalogState>(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    let quarantine = path.with_extension("bin.corrupted");
                    error!(
                        file = ?path,
                        moved_to = ?quarantine,
                        error = %e,
                        "corrupted catalog moved aside"
                    );
                    let _ = fs::rename(&path, &quarantine);
                    CatalogState::default()
                }
            }
        } else {
            CatalogState::default()
        };

        Ok(CatalogStore {
            path,
            state: RwLock::new(state),
        })
    }

    fn save_locked(&self, state: &CatalogState) -> Result<()> {
        let bytes = bincode::serialize(state)
            .map_err(|e| FerroError::Internal(format!("catalog encode failed: {}", e)))?;
        let tmp = self.path.with_extension("bin.tmp");
        {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn add_collection(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        state
            .collections
            .entry(name.to_string())
            .or_insert_with(|| CollectionEntry {
                created_at: Utc::now(),
                indexes: Vec::new(),
            });
        self.save_locked(&state)
    }

    pub fn remove_collection(&self, name: &str) -> Result<bool> {
        let mut state = self.state.write();
        let removed = state.collections.remove(name).is_some();
        if removed {
            self.save_locked(&state)?;
        }
        Ok(removed)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.read().collections.contains_key(name)
    }

    pub fn collections(&self) -> Vec<String> {
        self.state.read().collections.keys().cloned().collect()
    }

    pub fn add_index(&self, collection: &str, def: &IndexDefinition) -> Result<()> {
        let stored = StoredIndexDef::from_def(def)?;
        let mut state = self.state.write();
        let entry = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| FerroError::CollectionNotFound(collection.to_string()))?;
        entry.indexes.retain(|i| i.name != def.name);
        entry.indexes.push(stored);
        self.save_locked(&state)
    }

    pub fn remove_index(&self, collection: &str, index_name: &str) -> Result<bool> {
        let mut state = self.state.write();
        let entry = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| FerroError::CollectionNotFound(collection.to_string()))?;
        let before = entry.indexes.len();
        entry.indexes.retain(|i| i.name != index_name);
        let removed = entry.indexes.len() < before;
        if removed {
            self.save_locked(&state)?;
        }
        Ok(removed)
    }

    pub fn indexes_of(&self, collection: &str) -> Result<Vec<IndexDefinition>> {
        let state = self.state.read();
        let entry = match state.collections.get(collection) {
            Some(entry) => entry,
            None => return Ok(Vec::new()),
        };
        entry
            .indexes
            .iter()
            .map(|stored| stored.clone().into_def())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_catalog_roundtrip_across_reload() {
        let tmp = TempDir::new().unwrap();
        {
            let catalog = CatalogStore::load(tmp.path()).unwrap();
            catalog.add_collection("users").unwrap();
            catalog
                .add_index("users", &IndexDefinition::single("email_idx", "email", true))
                .unwrap();
        }
        {
            let catalog = CatalogStore::load(tmp.path()).unwrap();
            assert!(catalog.contains("users"));
            let indexes = catalog.indexes_of("users").unwrap();
            assert_eq!(indexes.len(), 1);
            assert_eq!(indexes[0].name, "email_idx");
            assert!(indexes[0].is_unique());
        }
    }

    #[test]
    fn test_partial_filter_survives_reload() {
        let tmp = TempDir::new().unwrap();
        let def = IndexDefinition {
            name: "adults".into(),
            fields: vec![IndexField {
                path: "age".into(),
                direction: crate::index::IndexDirection::Asc,
            }],
            kind: IndexKind::Partial,
            unique: false,
            sparse: false,
            partial_filter: Some(json!({"age": {"$gte": 18}})),
            ttl_secs: None,
        };
        {
            let catalog = CatalogStore::load(tmp.path()).unwrap();
            catalog.add_collection("users").unwrap();
            catalog.add_index("users", &def).unwrap();
        }
        let catalog = CatalogStore::load(tmp.path()).unwrap();
        let indexes = catalog.indexes_of("users").unwrap();
        assert_eq!(indexes[0].partial_filter, Some(json!({"age": {"$gte": 18}})));
    }

    #[test]
    fn test_remove_collection_and_index() {
        let tmp = TempDir::new().unwrap();
        let catalog = CatalogStore::load(tmp.path()).unwrap();
        catalog.add_collection("users").unwrap();
        catalog
            .add_index("users", &IndexDefinition::single("i", "f", false))
            .unwrap();
        assert!(catalog.remove_index("users", "i").unwrap());
        assert!(!catalog.remove_index("users", "i").unwrap());
        assert!(catalog.remove_collection("users").unwrap());
        assert!(!catalog.contains("users"));
    }

    #[test]
    fn test_corrupted_catalog_is_quarantined() {
        let tmp = TempDir::new().unwrap();
        {
            let catalog = CatalogStore::load(tmp.path()).unwrap();
            catalog.add_collection("users").unwrap();
        }
        let path = tmp.path().join(CATALOG_DIR).join(CATALOG_FILE);
        fs::write(&path, b"garbage").unwrap();

        let catalog = CatalogStore::load(tmp.path()).unwrap();
        assert!(!catalog.contains("users"));
        assert!(path.with_extension("bin.corrupted").exists());
    }

    #[test]
    fn test_add_index_to_unknown_collection_fails() {
        let tmp = TempDir::new().unwrap();
        let catalog = CatalogStore::load(tmp.path()).unwrap();
        let err = catalog
            .add_index("ghost", &IndexDefinition::single("i", "f", false))
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
