// bookshelf-core/src/lib.rs
// Embedded book catalog store

pub mod error;
pub mod document;
pub mod value_order;
pub mod query;
pub mod find_options;
pub mod expression;
pub mod aggregation;
pub mod btree;
pub mod index;
pub mod query_planner;
pub mod storage;
pub mod config;
pub mod collection;
pub mod database;
pub mod catalog;

// Public exports
pub use error::{BookshelfError, Result};
pub use document::{Book, Document, DocumentId};
pub use query::Query;
pub use find_options::{FindOptions, Projection, SortDirection, SortSpec};
pub use aggregation::Pipeline;
pub use index::{IndexDefinition, IndexSpec};
pub use query_planner::{ExplainVerbosity, QueryPlan};
pub use storage::{CompactionStats, StorageEngine};
pub use config::DatabaseConfig;
pub use collection::{Collection, DeleteResult, UpdateResult};
pub use database::Database;
pub use catalog::{AuthorCount, BookCatalog, BookSummary, DecadeCount, GenrePrice};
