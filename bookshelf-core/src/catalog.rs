// src/catalog.rs
// BookCatalog: typed operations over the `books` collection

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::collection::{Collection, DeleteResult, UpdateResult};
use crate::database::Database;
use crate::document::{Book, DocumentId};
use crate::error::{BookshelfError, Result};
use crate::expression::number;
use crate::find_options::{FindOptions, Projection, SortDirection, SortSpec};
use crate::index::IndexSpec;
use crate::query_planner::ExplainVerbosity;

/// Name of the collection the catalog works on
pub const BOOKS_COLLECTION: &str = "books";

/// Title, author and price of a book, without `_id`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookSummary {
    #[serde(default, deserialize_with = "crate::document::lenient::deserialize_string")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "crate::document::lenient::deserialize_string")]
    pub author: Option<String>,
    #[serde(default, deserialize_with = "crate::document::lenient::deserialize_float")]
    pub price: Option<f64>,
}

/// Mean price of one genre. Books without a genre form the `None` group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenrePrice {
    #[serde(rename = "_id", default, deserialize_with = "crate::document::lenient::deserialize_string")]
    pub genre: Option<String>,
    #[serde(rename = "avgPrice", default, deserialize_with = "crate::document::lenient::deserialize_float")]
    pub avg_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorCount {
    #[serde(rename = "_id", default, deserialize_with = "crate::document::lenient::deserialize_string")]
    pub author: Option<String>,
    pub count: u64,
}

/// Books per decade, where decade 201 covers 2010-2019
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecadeCount {
    #[serde(rename = "_id", default, deserialize_with = "crate::document::lenient::deserialize_integer")]
    pub decade: Option<i64>,
    pub count: u64,
}

/// Typed access to the book collection
#[derive(Clone)]
pub struct BookCatalog {
    books: Arc<Collection>,
}

impl BookCatalog {
    pub fn new(db: &Database) -> Result<Self> {
        Ok(Self::from_collection(db.collection(BOOKS_COLLECTION)?))
    }

    pub fn from_collection(books: Arc<Collection>) -> Self {
        BookCatalog { books }
    }

    /// The underlying collection, for untyped queries
    pub fn collection(&self) -> &Collection {
        &self.books
    }

    pub fn insert_book(&self, book: &Book) -> Result<DocumentId> {
        self.books.insert_one(Value::Object(book.to_fields()?))
    }

    pub fn insert_books(&self, books: &[Book]) -> Result<Vec<DocumentId>> {
        let documents = books
            .iter()
            .map(|b| b.to_fields().map(Value::Object))
            .collect::<Result<Vec<_>>>()?;
        self.books.insert_many(documents)
    }

    // ========== FIND ==========

    pub fn find_by_genre(&self, genre: &str) -> Result<Vec<Book>> {
        self.find_books(&json!({ "genre": genre }))
    }

    /// Books with `published_year` strictly greater than `year`
    pub fn published_after(&self, year: i64) -> Result<Vec<Book>> {
        self.find_books(&json!({ "published_year": { "$gt": year } }))
    }

    pub fn find_by_author(&self, author: &str) -> Result<Vec<Book>> {
        self.find_books(&json!({ "author": author }))
    }

    pub fn in_stock_published_after(&self, year: i64) -> Result<Vec<Book>> {
        self.find_books(&json!({ "in_stock": true, "published_year": { "$gt": year } }))
    }

    /// Title, author and price of every book, in `_id` order
    pub fn list_summaries(&self) -> Result<Vec<BookSummary>> {
        let options = FindOptions::new().with_projection(Projection::include(["title", "author", "price"]).without_id());
        self.books
            .find_with_options(&json!({}), &options)?
            .into_iter()
            .map(|v| Ok(serde_json::from_value(v)?))
            .collect()
    }

    pub fn sorted_by_price(&self, direction: SortDirection) -> Result<Vec<Book>> {
        let sort = SortSpec::new().then("price", direction);
        self.find_books_with(&json!({}), &FindOptions::new().with_sort(sort))
    }

    /// One page of books in `sort` order. An empty sort is rejected with
    /// `UnsortedPagination`.
    pub fn page(&self, sort: SortSpec, skip: usize, limit: usize) -> Result<Vec<Book>> {
        let options = FindOptions::new().with_sort(sort).with_skip(skip).with_limit(limit);
        self.find_books_with(&json!({}), &options)
    }

    fn find_books(&self, filter: &Value) -> Result<Vec<Book>> {
        self.find_books_with(filter, &FindOptions::default())
    }

    fn find_books_with(&self, filter: &Value, options: &FindOptions) -> Result<Vec<Book>> {
        self.books
            .find_with_options(filter, options)?
            .into_iter()
            .map(Book::from_value)
            .collect()
    }

    // ========== WRITE ==========

    /// Set the price of the lowest-`_id` book with this title. Whole
    /// prices are stored as integers.
    pub fn set_price(&self, title: &str, price: f64) -> Result<UpdateResult> {
        self.books
            .update_one(&json!({ "title": title }), &json!({ "$set": { "price": number(price) } }))
    }

    /// Delete the lowest-`_id` book with this title
    pub fn delete_by_title(&self, title: &str) -> Result<DeleteResult> {
        if title.is_empty() {
            return Err(BookshelfError::InvalidQuery("title cannot be empty".to_string()));
        }
        self.books.delete_one(&json!({ "title": title }))
    }

    // ========== AGGREGATION ==========

    /// Average price per genre, in order of first appearance
    pub fn average_price_by_genre(&self) -> Result<Vec<GenrePrice>> {
        self.aggregate_typed(&json!([
            { "$group": { "_id": "$genre", "avgPrice": { "$avg": "$price" } } }
        ]))
    }

    /// Author with the most books. Ties go to the author seen first.
    pub fn top_author(&self) -> Result<Option<AuthorCount>> {
        let mut top: Vec<AuthorCount> = self.aggregate_typed(&json!([
            { "$group": { "_id": "$author", "count": { "$sum": 1 } } },
            { "$sort": { "count": -1 } },
            { "$limit": 1 }
        ]))?;
        Ok(top.pop())
    }

    /// Book count per publication decade, oldest first
    pub fn count_by_decade(&self) -> Result<Vec<DecadeCount>> {
        self.aggregate_typed(&json!([
            { "$group": { "_id": { "$decade": "$published_year" }, "count": { "$sum": 1 } } },
            { "$sort": { "_id": 1 } }
        ]))
    }

    fn aggregate_typed<T: serde::de::DeserializeOwned>(&self, pipeline: &Value) -> Result<Vec<T>> {
        self.books
            .aggregate(pipeline)?
            .into_iter()
            .map(|v| Ok(serde_json::from_value(v)?))
            .collect()
    }

    // ========== INDEXES ==========

    /// Create `title_1` and `author_1_published_year_-1`, skipping any that
    /// already exist. Returns the names of all catalog indexes.
    pub fn create_default_indexes(&self) -> Result<Vec<String>> {
        let specs = [
            IndexSpec::ascending("title"),
            IndexSpec::ascending("author").then("published_year", SortDirection::Descending),
        ];

        let existing = self.books.list_indexes();
        let mut names = Vec::with_capacity(specs.len());
        for spec in specs {
            let name = spec.clone().into_definition()?.name;
            if !existing.contains(&name) {
                self.books.create_index(spec)?;
            }
            names.push(name);
        }
        Ok(names)
    }

    /// Explain, with execution stats, a lookup by exact title
    pub fn explain_title_lookup(&self, title: &str) -> Result<Value> {
        self.books
            .explain(&json!({ "title": title }), ExplainVerbosity::ExecutionStats)
    }
}
