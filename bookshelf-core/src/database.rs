// src/database.rs
// Database: storage ownership, collection registry, compaction

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::collection::Collection;
use crate::config::DatabaseConfig;
use crate::error::{BookshelfError, Result};
use crate::storage::{CompactionStats, StorageEngine};

/// Embedded document database.
///
/// Collections are created on first use. With a configured path every
/// change is appended to a single record log shared by all collections.
pub struct Database {
    config: DatabaseConfig,
    storage: Option<Arc<Mutex<StorageEngine>>>,
    /// Ordered by name; compaction locks collections in this order
    collections: RwLock<BTreeMap<String, Arc<Collection>>>,
}

impl Database {
    /// Open a database, replaying its record log if it has one
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        config.validate()?;

        let path = match &config.path {
            Some(path) => path.clone(),
            None => return Ok(Self::with_storage(config, None)),
        };

        let (storage, records) = StorageEngine::open(&path, config.sync_on_write)?;
        let total_records = records.len();
        let db = Self::with_storage(config, Some(Arc::new(Mutex::new(storage))));

        {
            let mut collections = db.collections.write();
            for record in records {
                let collection = collections
                    .entry(record.collection().to_string())
                    .or_insert_with_key(|name| Arc::new(Collection::new(name.clone(), db.storage.clone())));
                collection.replay(record)?;
            }
        }

        info!(
            target: "bookshelf::database",
            path = %path.display(),
            collections = db.collections.read().len(),
            records = total_records,
            "Opened database"
        );

        if let Some(ratio) = db.config.compact_on_open_ratio {
            let live: usize = db.collections.read().values().map(|c| c.live_record_count()).sum();
            let dead = total_records.saturating_sub(live);
            if total_records > 0 && dead as f64 / total_records as f64 > ratio {
                info!(target: "bookshelf::database", dead, total = total_records, "Compacting on open");
                db.compact()?;
            }
        }

        Ok(db)
    }

    /// Open a file-backed database with default settings
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(DatabaseConfig::at(path.as_ref()))
    }

    /// Purely in-memory database
    pub fn in_memory() -> Self {
        Self::with_storage(DatabaseConfig::in_memory(), None)
    }

    fn with_storage(config: DatabaseConfig, storage: Option<Arc<Mutex<StorageEngine>>>) -> Self {
        Database {
            config,
            storage,
            collections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Get a collection, creating it if it does not exist
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        if name.is_empty() || name.contains('$') {
            return Err(BookshelfError::InvalidQuery(format!("invalid collection name: '{}'", name)));
        }
        if let Some(collection) = self.collections.read().get(name) {
            return Ok(Arc::clone(collection));
        }

        let mut collections = self.collections.write();
        let collection = collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Collection::new(name.to_string(), self.storage.clone())));
        Ok(Arc::clone(collection))
    }

    /// Get an existing collection
    pub fn get_collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BookshelfError::CollectionNotFound(name.to_string()))
    }

    /// Collection names in ascending order
    pub fn list_collections(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    /// Rewrite the record log to live state only.
    ///
    /// Every collection is write-locked for the duration. In-memory
    /// databases have nothing to compact and report zeroed stats.
    pub fn compact(&self) -> Result<CompactionStats> {
        let storage = match &self.storage {
            Some(storage) => storage,
            None => return Ok(CompactionStats::default()),
        };

        let collections = self.collections.read();
        let mut guards = Vec::with_capacity(collections.len());
        let mut live = Vec::new();
        for collection in collections.values() {
            let (guard, records) = collection.lock_for_compaction();
            guards.push(guard);
            live.extend(records);
        }

        let stats = storage.lock().compact(&live)?;
        drop(guards);
        Ok(stats)
    }

    /// fsync the record log
    pub fn flush(&self) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.lock().flush()?;
        }
        Ok(())
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.config.path.as_deref()
    }

    pub fn is_in_memory(&self) -> bool {
        self.storage.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexSpec;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_in_memory_collections() {
        let db = Database::in_memory();
        assert!(db.is_in_memory());
        assert!(db.list_collections().is_empty());

        let books = db.collection("books").unwrap();
        books.insert_one(json!({"title": "Dune"})).unwrap();
        db.collection("authors").unwrap();

        assert_eq!(db.list_collections(), vec!["authors", "books"]);
        assert_eq!(db.collection("books").unwrap().len(), 1);
        assert!(matches!(db.get_collection("missing"), Err(BookshelfError::CollectionNotFound(_))));
        assert!(db.collection("").is_err());
        assert_eq!(db.compact().unwrap(), CompactionStats::default());
    }

    #[test]
    fn test_reopen_restores_state() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("books.db");

        {
            let db = Database::open_path(&path).unwrap();
            let books = db.collection("books").unwrap();
            books.insert_one(json!({"title": "Dune", "price": 10})).unwrap();
            books.insert_one(json!({"title": "Emma", "price": 8})).unwrap();
            books.update_one(&json!({"title": "Dune"}), &json!({"$set": {"price": 12}})).unwrap();
            books.create_index(IndexSpec::ascending("title")).unwrap();
            db.collection("reviews").unwrap().insert_one(json!({"stars": 5})).unwrap();
            db.flush().unwrap();
        }

        let db = Database::open_path(&path).unwrap();
        assert_eq!(db.list_collections(), vec!["books", "reviews"]);
        let books = db.get_collection("books").unwrap();
        assert_eq!(books.find_one(&json!({"title": "Dune"})).unwrap().unwrap()["price"], 12);
        assert_eq!(books.list_indexes(), vec!["_id_", "title_1"]);
        assert_eq!(books.insert_one(json!({"title": "Ulysses"})).unwrap(), crate::document::DocumentId::Int(3));
    }

    #[test]
    fn test_compact_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("books.db");

        {
            let db = Database::open_path(&path).unwrap();
            let books = db.collection("books").unwrap();
            for i in 0..10 {
                books.insert_one(json!({"n": i})).unwrap();
            }
            books.delete_many(&json!({"n": {"$lt": 8}})).unwrap();
        }
        let size_before = std::fs::metadata(&path).unwrap().len();

        let db = Database::open(DatabaseConfig::at(&path).with_compact_on_open_ratio(0.5)).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() < size_before);

        let books = db.get_collection("books").unwrap();
        assert_eq!(books.len(), 2);
        assert_eq!(books.insert_one(json!({"n": 10})).unwrap(), crate::document::DocumentId::Int(11));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DatabaseConfig::in_memory().with_sync_on_write(true);
        assert!(matches!(Database::open(config), Err(BookshelfError::Config(_))));
    }
}
