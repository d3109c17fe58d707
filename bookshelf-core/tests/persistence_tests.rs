// Record log persistence and compaction tests
use bookshelf_core::{BookshelfError, Database, DatabaseConfig, DocumentId, IndexSpec};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn db_path(temp_dir: &TempDir) -> std::path::PathBuf {
    temp_dir.path().join("books.db")
}

#[test]
fn test_reopen_restores_documents_and_indexes() {
    let temp_dir = TempDir::new().unwrap();
    let path = db_path(&temp_dir);

    {
        let db = Database::open(DatabaseConfig::at(&path).with_sync_on_write(true)).unwrap();
        let books = db.collection("books").unwrap();
        books.insert_one(json!({"title": "Clean Code", "author": "Robert C. Martin", "published_year": 2008})).unwrap();
        books.insert_one(json!({"title": "Atomic Habits", "author": "James Clear", "published_year": 2018})).unwrap();
        books.insert_one(json!({"title": "Dune", "author": "Frank Herbert", "published_year": 1965})).unwrap();
        books.create_index(IndexSpec::ascending("title")).unwrap();
        books
            .create_index(IndexSpec::ascending("author").then("published_year", bookshelf_core::SortDirection::Descending))
            .unwrap();
        books.update_one(&json!({"title": "Dune"}), &json!({"$set": {"price": 9.99}})).unwrap();
        books.delete_one(&json!({"title": "Atomic Habits"})).unwrap();
    }

    let db = Database::open_path(&path).unwrap();
    let books = db.get_collection("books").unwrap();

    assert_eq!(books.len(), 2);
    assert_eq!(books.find_one(&json!({"title": "Dune"})).unwrap().unwrap()["price"], 9.99);
    assert_eq!(books.list_indexes(), vec!["_id_", "title_1", "author_1_published_year_-1"]);

    let explain = books
        .explain(&json!({"title": "Clean Code"}), bookshelf_core::ExplainVerbosity::ExecutionStats)
        .unwrap();
    assert_eq!(explain["queryPlanner"]["winningPlan"]["stage"], "IXSCAN");
    assert_eq!(explain["executionStats"]["nReturned"], 1);
}

#[test]
fn test_unique_index_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = db_path(&temp_dir);

    {
        let db = Database::open_path(&path).unwrap();
        let books = db.collection("books").unwrap();
        books.create_index(IndexSpec::ascending("isbn").unique(true)).unwrap();
        books.insert_one(json!({"isbn": "978-0132350884"})).unwrap();
    }

    let db = Database::open_path(&path).unwrap();
    let books = db.get_collection("books").unwrap();
    let err = books.insert_one(json!({"isbn": "978-0132350884"})).unwrap_err();
    assert!(matches!(err, BookshelfError::DuplicateKey { .. }));
}

#[test]
fn test_dropped_index_stays_dropped() {
    let temp_dir = TempDir::new().unwrap();
    let path = db_path(&temp_dir);

    {
        let db = Database::open_path(&path).unwrap();
        let books = db.collection("books").unwrap();
        books.create_index(IndexSpec::ascending("title")).unwrap();
        books.drop_index("title_1").unwrap();
    }

    let db = Database::open_path(&path).unwrap();
    assert_eq!(db.get_collection("books").unwrap().list_indexes(), vec!["_id_"]);
}

#[test]
fn test_compaction_shrinks_file_and_preserves_state() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let path = db_path(&temp_dir);

    let db = Database::open_path(&path).unwrap();
    let books = db.collection("books").unwrap();
    for i in 0..50 {
        books.insert_one(json!({"title": format!("Book {}", i), "price": i})).unwrap();
    }
    books.update_many(&json!({}), &json!({"$inc": {"price": 1}})).unwrap();
    books.delete_many(&json!({"price": {"$lte": 40}})).unwrap();
    books.create_index(IndexSpec::ascending("price")).unwrap();

    let before = books.find(&json!({})).unwrap();
    let stats = db.compact().unwrap();

    assert_eq!(stats.records_before, 50 + 50 + 40 + 1);
    assert_eq!(stats.records_after, 10 + 1);
    assert!(stats.size_after < stats.size_before);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), stats.size_after);
    assert_eq!(books.find(&json!({})).unwrap(), before);

    // Writes after compaction are appended to the new log
    books.insert_one(json!({"title": "After"})).unwrap();
    drop(books);
    drop(db);

    let db = Database::open_path(&path).unwrap();
    let books = db.get_collection("books").unwrap();
    assert_eq!(books.len(), 11);
    assert_eq!(books.list_indexes(), vec!["_id_", "price_1"]);
    assert_eq!(books.find_one(&json!({"title": "After"})).unwrap().unwrap()["_id"], 51);
}

#[test]
fn test_ids_not_reused_after_compaction() {
    let temp_dir = TempDir::new().unwrap();
    let path = db_path(&temp_dir);

    {
        let db = Database::open_path(&path).unwrap();
        let books = db.collection("books").unwrap();
        for i in 0..5 {
            books.insert_one(json!({"n": i})).unwrap();
        }
        books.delete_many(&json!({"n": {"$gte": 3}})).unwrap();
        db.compact().unwrap();
    }

    let db = Database::open_path(&path).unwrap();
    let books = db.get_collection("books").unwrap();
    assert_eq!(books.len(), 3);
    assert_eq!(books.insert_one(json!({"n": 5})).unwrap(), DocumentId::Int(6));
}

#[test]
fn test_torn_tail_is_discarded_on_open() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let path = db_path(&temp_dir);

    {
        let db = Database::open_path(&path).unwrap();
        db.collection("books").unwrap().insert_one(json!({"title": "Dune"})).unwrap();
    }
    {
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x40, 0x00, 0x00]).unwrap();
    }

    let db = Database::open_path(&path).unwrap();
    let books = db.get_collection("books").unwrap();
    assert_eq!(books.len(), 1);
    books.insert_one(json!({"title": "Emma"})).unwrap();
    drop(books);
    drop(db);

    let db = Database::open_path(&path).unwrap();
    assert_eq!(db.get_collection("books").unwrap().len(), 2);
}

#[test]
fn test_foreign_file_is_corruption() {
    let temp_dir = TempDir::new().unwrap();
    let path = db_path(&temp_dir);
    std::fs::write(&path, b"this is not a record log at all").unwrap();

    assert!(matches!(Database::open_path(&path), Err(BookshelfError::Corruption(_))));
}

#[test]
fn test_config_file_drives_open() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("bookshelf.json");
    let data_path = db_path(&temp_dir);
    std::fs::write(
        &config_path,
        serde_json::to_string(&json!({"path": data_path, "sync_on_write": true})).unwrap(),
    )
    .unwrap();

    let config = DatabaseConfig::from_file(&config_path).unwrap();
    let db = Database::open(config).unwrap();
    assert!(!db.is_in_memory());
    assert_eq!(db.path(), Some(data_path.as_path()));
}
