// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BookshelfError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("Collection '{0}' not found")]
    CollectionNotFound(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid projection: {0}")]
    InvalidProjection(String),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("skip/limit require an explicit sort order")]
    UnsortedPagination,

    #[error("Aggregation error: {0}")]
    AggregationError(String),

    #[error("Index error: {0}")]
    IndexError(String),

    #[error("Duplicate key in index '{index}': {key}")]
    DuplicateKey { index: String, key: String },

    #[error("Database corruption: {0}")]
    Corruption(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BookshelfError>;

impl From<bincode::Error> for BookshelfError {
    fn from(err: bincode::Error) -> Self {
        BookshelfError::Serialization(err.to_string())
    }
}
