// src/document.rs
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BookshelfError, Result};
use crate::value_order::whole_number;

/// Name of the identifier field every stored document carries.
pub const ID_FIELD: &str = "_id";

/// Schema-less document: an identifier plus arbitrary named fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: DocumentId,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Document identifier.
///
/// Store-assigned identifiers are always `Int`; `String` is accepted when a
/// caller supplies its own `_id`. Integers order before strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(untagged)]
pub enum DocumentId {
    Int(i64),
    String(String),
}

impl DocumentId {
    /// Next auto-increment id after `last_id`
    pub fn new_auto(last_id: i64) -> Self {
        DocumentId::Int(last_id + 1)
    }

    pub fn to_value(&self) -> Value {
        match self {
            DocumentId::Int(n) => Value::from(*n),
            DocumentId::String(s) => Value::String(s.clone()),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(DocumentId::Int)
                .ok_or_else(|| BookshelfError::InvalidQuery(format!("_id must be an integer, got {}", n))),
            Value::String(s) => Ok(DocumentId::String(s.clone())),
            other => Err(BookshelfError::InvalidQuery(format!(
                "_id must be an integer or string, got {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentId::Int(n) => write!(f, "{}", n),
            DocumentId::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl Document {
    pub fn new(id: DocumentId, fields: Map<String, Value>) -> Self {
        Document { id, fields }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Field lookup; `_id` lives outside `fields` and is not returned here.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: String, value: Value) {
        self.fields.insert(field, value);
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Field lookup that also resolves `_id`.
    pub fn get_with_id(&self, field: &str) -> Option<Value> {
        if field == ID_FIELD {
            Some(self.id.to_value())
        } else {
            self.fields.get(field).cloned()
        }
    }

    /// Dotted-path lookup (`"meta.pages"`) that also resolves `_id`.
    pub fn get_path(&self, path: &str) -> Option<Value> {
        match path.split_once('.') {
            _ if path == ID_FIELD => Some(self.id.to_value()),
            Some((head, rest)) => self
                .fields
                .get(head)
                .and_then(|v| crate::expression::lookup(v, rest))
                .cloned(),
            None => self.fields.get(path).cloned(),
        }
    }

    /// Full JSON view, `_id` included.
    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len() + 1);
        map.insert(ID_FIELD.to_string(), self.id.to_value());
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }
}

impl From<Document> for Value {
    /// Same layout as [`Document::to_value`]: `_id` first.
    fn from(doc: Document) -> Self {
        let mut map = Map::with_capacity(doc.fields.len() + 1);
        map.insert(ID_FIELD.to_string(), doc.id.to_value());
        map.extend(doc.fields);
        Value::Object(map)
    }
}

/// Type-tolerant readers for typed views over schema-less documents.
///
/// A value of the wrong type reads as `None` rather than failing the
/// whole record. Whole-number floats count as integers.
pub mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    use super::whole_number;

    pub fn string(value: &Value) -> Option<String> {
        value.as_str().map(str::to_string)
    }

    pub fn integer(value: &Value) -> Option<i64> {
        value.as_i64().or_else(|| value.as_f64().and_then(whole_number))
    }

    pub fn float(value: &Value) -> Option<f64> {
        value.as_f64()
    }

    pub fn boolean(value: &Value) -> Option<bool> {
        value.as_bool()
    }

    pub fn deserialize_string<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
        Ok(string(&Value::deserialize(de)?))
    }

    pub fn deserialize_integer<'de, D: Deserializer<'de>>(de: D) -> Result<Option<i64>, D::Error> {
        Ok(integer(&Value::deserialize(de)?))
    }

    pub fn deserialize_float<'de, D: Deserializer<'de>>(de: D) -> Result<Option<f64>, D::Error> {
        Ok(float(&Value::deserialize(de)?))
    }
}

/// A book record. Every field is optional because stored documents are
/// schema-less. Fields this type does not know about, and known fields
/// holding a value of the wrong type, are kept verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>")]
pub struct Book {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<DocumentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_year: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_stock: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Book {
    pub fn new(title: &str, author: &str, genre: &str, published_year: i64, price: f64, in_stock: bool) -> Self {
        Book {
            id: None,
            title: Some(title.to_string()),
            author: Some(author.to_string()),
            genre: Some(genre.to_string()),
            published_year: Some(published_year),
            price: Some(price),
            in_stock: Some(in_stock),
            extra: Map::new(),
        }
    }

    /// Field map suitable for `Collection::insert_one` (`_id` kept if set).
    pub fn to_fields(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(BookshelfError::Serialization(format!(
                "book serialized to non-object: {}",
                other
            ))),
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

impl From<Map<String, Value>> for Book {
    fn from(map: Map<String, Value>) -> Self {
        let mut book = Book::default();
        for (key, value) in map {
            let typed = match key.as_str() {
                ID_FIELD => {
                    book.id = DocumentId::from_value(&value).ok();
                    book.id.is_some()
                }
                "title" => {
                    book.title = lenient::string(&value);
                    book.title.is_some()
                }
                "author" => {
                    book.author = lenient::string(&value);
                    book.author.is_some()
                }
                "genre" => {
                    book.genre = lenient::string(&value);
                    book.genre.is_some()
                }
                "published_year" => {
                    book.published_year = lenient::integer(&value);
                    book.published_year.is_some()
                }
                "price" => {
                    book.price = lenient::float(&value);
                    book.price.is_some()
                }
                "in_stock" => {
                    book.in_stock = lenient::boolean(&value);
                    book.in_stock.is_some()
                }
                _ => false,
            };
            if !typed {
                book.extra.insert(key, value);
            }
        }
        book
    }
}

impl TryFrom<&Document> for Book {
    type Error = BookshelfError;

    fn try_from(doc: &Document) -> Result<Self> {
        Book::from_value(doc.to_value())
    }
}
