// src/index.rs
// Secondary indexes over B+ trees

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::btree::BPlusTree;
use crate::document::{Document, DocumentId, ID_FIELD};
use crate::error::{BookshelfError, Result};
use crate::find_options::SortDirection;
use crate::value_order::{cmp_int_float, whole_number};

/// Name of the index every collection keeps on `_id`
pub const ID_INDEX_NAME: &str = "_id_";

/// Index key - one indexed field value.
///
/// Ordering matches `value_order::total_cmp`:
/// null < numbers < strings < booleans < everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKey {
    Null,
    Int(i64),
    /// Never integral within i64 range; those become `Int`
    Float(OrderedFloat),
    String(String),
    Bool(bool),
    /// Objects, as canonical JSON text
    Other(String),
}

/// OrderedFloat wrapper for f64 to enable Ord
#[derive(Debug, Clone, Copy)]
pub struct OrderedFloat(pub f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl IndexKey {
    fn rank(&self) -> u8 {
        match self {
            IndexKey::Null => 0,
            IndexKey::Int(_) | IndexKey::Float(_) => 1,
            IndexKey::String(_) => 2,
            IndexKey::Bool(_) => 3,
            IndexKey::Other(_) => 4,
        }
    }

    /// Key for a scalar value. Arrays should go through [`IndexKey::keys_for`].
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => IndexKey::Int(i),
                None => {
                    let f = n.as_f64().unwrap_or(f64::NAN);
                    match whole_number(f) {
                        Some(i) => IndexKey::Int(i),
                        None => IndexKey::Float(OrderedFloat(f)),
                    }
                }
            },
            Value::String(s) => IndexKey::String(s.clone()),
            other => IndexKey::Other(other.to_string()),
        }
    }

    /// Keys one field contributes: a missing field indexes as null and an
    /// array indexes each distinct element (multikey).
    pub fn keys_for(value: Option<&Value>) -> Vec<IndexKey> {
        match value {
            None => vec![IndexKey::Null],
            Some(Value::Array(items)) if items.is_empty() => vec![IndexKey::Null],
            Some(Value::Array(items)) => {
                let mut keys: Vec<IndexKey> = Vec::with_capacity(items.len());
                for item in items {
                    let key = IndexKey::from_value(item);
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
                keys
            }
            Some(v) => vec![IndexKey::from_value(v)],
        }
    }

    /// Whether a filter target can be looked up in an index
    pub fn is_indexable(value: &Value) -> bool {
        matches!(value, Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_))
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        use IndexKey::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.cmp(b),
            // Float keys are never whole within i64 range, so these never tie
            (Int(a), Float(b)) => cmp_int_float(*a, b.0),
            (Float(a), Int(b)) => cmp_int_float(*b, a.0).reverse(),
            (String(a), String(b)) => a.cmp(b),
            (Bool(a), Bool(b)) => a.cmp(b),
            (Other(a), Other(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Null => write!(f, "null"),
            IndexKey::Int(i) => write!(f, "{}", i),
            IndexKey::Float(x) => write!(f, "{}", x.0),
            IndexKey::String(s) => write!(f, "{:?}", s),
            IndexKey::Bool(b) => write!(f, "{}", b),
            IndexKey::Other(json) => write!(f, "{}", json),
        }
    }
}

/// Interval of keys on one indexed field
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    pub lower: Bound<IndexKey>,
    pub upper: Bound<IndexKey>,
}

impl KeyRange {
    pub fn all() -> Self {
        KeyRange { lower: Bound::Unbounded, upper: Bound::Unbounded }
    }

    pub fn point(key: IndexKey) -> Self {
        KeyRange { lower: Bound::Included(key.clone()), upper: Bound::Included(key) }
    }

    /// Keys above `key` of the same type (`$gt` / `$gte`)
    pub fn above(key: IndexKey, inclusive: bool) -> Self {
        let upper = type_ceiling(&key);
        let lower = if inclusive { Bound::Included(key) } else { Bound::Excluded(key) };
        KeyRange { lower, upper }
    }

    /// Keys below `key` of the same type (`$lt` / `$lte`)
    pub fn below(key: IndexKey, inclusive: bool) -> Self {
        let lower = type_floor(&key);
        let upper = if inclusive { Bound::Included(key) } else { Bound::Excluded(key) };
        KeyRange { lower, upper }
    }

    /// Tightest range covered by both
    pub fn intersect(self, other: KeyRange) -> KeyRange {
        KeyRange {
            lower: tighter(self.lower, other.lower, std::cmp::Ordering::Greater),
            upper: tighter(self.upper, other.upper, std::cmp::Ordering::Less),
        }
    }

    pub fn contains(&self, key: &IndexKey) -> bool {
        let after_lower = match &self.lower {
            Bound::Included(k) => key >= k,
            Bound::Excluded(k) => key > k,
            Bound::Unbounded => true,
        };
        let before_upper = match &self.upper {
            Bound::Included(k) => key <= k,
            Bound::Excluded(k) => key < k,
            Bound::Unbounded => true,
        };
        after_lower && before_upper
    }

    pub fn is_point(&self) -> bool {
        matches!((&self.lower, &self.upper), (Bound::Included(a), Bound::Included(b)) if a == b)
    }
}

impl fmt::Display for KeyRange {
    /// `["Clean Code", "Clean Code"]`, `(2010, inf.0]`; type brackets print
    /// as infinities and unbounded ends as MinKey/MaxKey
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.lower {
            Bound::Included(k) => write!(f, "[{}", k)?,
            Bound::Excluded(IndexKey::Null) => write!(f, "[-inf.0")?,
            Bound::Excluded(k) => write!(f, "({}", k)?,
            Bound::Unbounded => write!(f, "[MinKey")?,
        }
        match &self.upper {
            Bound::Included(k) => write!(f, ", {}]", k),
            Bound::Excluded(IndexKey::String(s)) if s.is_empty() => write!(f, ", inf.0]"),
            Bound::Excluded(k) => write!(f, ", {})", k),
            Bound::Unbounded => write!(f, ", MaxKey]"),
        }
    }
}

fn type_floor(key: &IndexKey) -> Bound<IndexKey> {
    match key {
        IndexKey::Int(_) | IndexKey::Float(_) => Bound::Excluded(IndexKey::Null),
        IndexKey::String(_) => Bound::Included(IndexKey::String(String::new())),
        IndexKey::Bool(_) => Bound::Included(IndexKey::Bool(false)),
        IndexKey::Null | IndexKey::Other(_) => Bound::Unbounded,
    }
}

fn type_ceiling(key: &IndexKey) -> Bound<IndexKey> {
    match key {
        IndexKey::Int(_) | IndexKey::Float(_) => Bound::Excluded(IndexKey::String(String::new())),
        IndexKey::String(_) => Bound::Excluded(IndexKey::Bool(false)),
        IndexKey::Bool(_) => Bound::Included(IndexKey::Bool(true)),
        IndexKey::Null | IndexKey::Other(_) => Bound::Unbounded,
    }
}

/// Pick the tighter of two bounds; `wins` is the ordering the tighter key has
fn tighter(a: Bound<IndexKey>, b: Bound<IndexKey>, wins: std::cmp::Ordering) -> Bound<IndexKey> {
    match (a, b) {
        (Bound::Unbounded, other) | (other, Bound::Unbounded) => other,
        (a, b) => {
            let (ka, kb) = match (&a, &b) {
                (Bound::Included(x) | Bound::Excluded(x), Bound::Included(y) | Bound::Excluded(y)) => (x, y),
                _ => return a,
            };
            match ka.cmp(kb) {
                std::cmp::Ordering::Equal if matches!(a, Bound::Excluded(_)) => a,
                std::cmp::Ordering::Equal => b,
                ord if ord == wins => a,
                _ => b,
            }
        }
    }
}

/// Persistent description of an index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub fields: Vec<(String, SortDirection)>,
    pub unique: bool,
}

impl IndexDefinition {
    /// `{"author": 1, "published_year": -1}`
    pub fn key_pattern(&self) -> Value {
        let mut map = Map::new();
        for (field, direction) in &self.fields {
            map.insert(field.clone(), Value::from(direction.as_i32()));
        }
        Value::Object(map)
    }

    pub fn leading_field(&self) -> &str {
        self.fields.first().map(|(f, _)| f.as_str()).unwrap_or(ID_FIELD)
    }

    /// `field_dir` pairs joined by `_`: `title_1`, `author_1_published_year_-1`
    pub fn default_name(fields: &[(String, SortDirection)]) -> String {
        fields
            .iter()
            .map(|(field, direction)| format!("{}_{}", field, direction.as_i32()))
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Index information as returned by `list_indexes`
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("name".to_string(), Value::String(self.name.clone()));
        map.insert("key".to_string(), self.key_pattern());
        if self.unique {
            map.insert("unique".to_string(), Value::Bool(true));
        }
        Value::Object(map)
    }
}

/// Builder for index declarations
#[derive(Debug, Clone, Default)]
pub struct IndexSpec {
    fields: Vec<(String, SortDirection)>,
    name: Option<String>,
    unique: bool,
}

impl IndexSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ascending(field: impl Into<String>) -> Self {
        Self::new().then(field, SortDirection::Ascending)
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self::new().then(field, SortDirection::Descending)
    }

    pub fn then(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.fields.push((field.into(), direction));
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Parse a key pattern such as `{"title": 1}`
    pub fn from_json(key_pattern: &Value) -> Result<Self> {
        let obj = key_pattern
            .as_object()
            .ok_or_else(|| BookshelfError::IndexError("key pattern must be an object".to_string()))?;

        let mut spec = IndexSpec::new();
        for (field, direction) in obj {
            let direction = SortDirection::from_json(direction)
                .map_err(|_| BookshelfError::IndexError(format!("invalid direction for '{}': {}", field, direction)))?;
            spec = spec.then(field.clone(), direction);
        }
        Ok(spec)
    }

    pub fn into_definition(self) -> Result<IndexDefinition> {
        if self.fields.is_empty() {
            return Err(BookshelfError::IndexError("key pattern cannot be empty".to_string()));
        }
        if self.fields.iter().any(|(f, _)| f.is_empty() || f.starts_with('$')) {
            return Err(BookshelfError::IndexError("invalid field name in key pattern".to_string()));
        }
        let mut seen = BTreeSet::new();
        if !self.fields.iter().all(|(f, _)| seen.insert(f.as_str())) {
            return Err(BookshelfError::IndexError("duplicate field in key pattern".to_string()));
        }

        let name = match self.name {
            Some(name) if name.is_empty() => {
                return Err(BookshelfError::IndexError("index name cannot be empty".to_string()))
            }
            Some(name) => name,
            None => IndexDefinition::default_name(&self.fields),
        };

        Ok(IndexDefinition { name, fields: self.fields, unique: self.unique })
    }
}

/// One posting: the keys of the non-leading fields plus the document id
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub tail: Vec<IndexKey>,
    pub id: DocumentId,
}

/// Bounds for an index scan: a union of ranges per indexed field
#[derive(Debug, Clone, PartialEq)]
pub struct IndexBounds {
    pub fields: Vec<Vec<KeyRange>>,
}

/// Result of an index scan
#[derive(Debug, Clone)]
pub struct IndexScan {
    /// Ascending and free of duplicates
    pub ids: Vec<DocumentId>,
    pub keys_examined: usize,
}

/// Index over one or more fields, keyed on the leading field
#[derive(Debug, Clone)]
pub struct Index {
    definition: IndexDefinition,
    tree: BPlusTree<IndexKey, IndexEntry>,
}

impl Index {
    pub fn new(definition: IndexDefinition) -> Self {
        Index { definition, tree: BPlusTree::new() }
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Number of (key, document) entries
    pub fn size(&self) -> usize {
        self.tree.entries()
    }

    /// Every (leading key, entry) pair a document contributes
    fn entries_for(&self, doc: &Document) -> Vec<(IndexKey, IndexEntry)> {
        let mut combos: Vec<Vec<IndexKey>> = vec![Vec::new()];
        for (field, _) in &self.definition.fields {
            let keys = IndexKey::keys_for(doc.get_path(field).as_ref());
            combos = combos
                .into_iter()
                .flat_map(|prefix| {
                    keys.iter().map(move |k| {
                        let mut next = prefix.clone();
                        next.push(k.clone());
                        next
                    })
                })
                .collect();
        }

        combos
            .into_iter()
            .map(|mut keys| {
                let lead = keys.remove(0);
                (lead, IndexEntry { tail: keys, id: doc.id.clone() })
            })
            .collect()
    }

    /// Fails with `DuplicateKey` if a unique index already holds one of the
    /// document's keys under another id
    pub fn check_unique(&self, doc: &Document) -> Result<()> {
        if !self.definition.unique {
            return Ok(());
        }
        for (lead, entry) in self.entries_for(doc) {
            let clash = self
                .tree
                .get(&lead)
                .map_or(false, |posting| posting.iter().any(|e| e.tail == entry.tail && e.id != entry.id));
            if clash {
                return Err(BookshelfError::DuplicateKey {
                    index: self.definition.name.clone(),
                    key: self.describe_key(&lead, &entry.tail),
                });
            }
        }
        Ok(())
    }

    fn describe_key(&self, lead: &IndexKey, tail: &[IndexKey]) -> String {
        let parts: Vec<String> = self
            .definition
            .fields
            .iter()
            .zip(std::iter::once(lead).chain(tail.iter()))
            .map(|((field, _), key)| format!("{}: {}", field, key))
            .collect();
        format!("{{ {} }}", parts.join(", "))
    }

    pub fn insert(&mut self, doc: &Document) {
        for (lead, entry) in self.entries_for(doc) {
            self.tree.insert(lead, entry);
        }
    }

    pub fn remove(&mut self, doc: &Document) {
        for (lead, entry) in self.entries_for(doc) {
            self.tree.remove(&lead, &entry);
        }
    }

    /// Scan the leading-field ranges, filtering postings on the remaining fields
    pub fn scan(&self, bounds: &IndexBounds) -> IndexScan {
        let mut ids = BTreeSet::new();
        let mut keys_examined = 0;
        let all = [KeyRange::all()];
        let leading: &[KeyRange] = bounds.fields.first().map(|r| r.as_slice()).unwrap_or(&all);
        let tail_bounds = bounds.fields.get(1..).unwrap_or(&[]);

        for range in leading {
            for (_, posting) in self.tree.range(range.lower.as_ref(), range.upper.as_ref()) {
                for entry in posting {
                    keys_examined += 1;
                    let in_bounds = entry
                        .tail
                        .iter()
                        .zip(tail_bounds)
                        .all(|(key, ranges)| ranges.iter().any(|r| r.contains(key)));
                    if in_bounds {
                        ids.insert(entry.id.clone());
                    }
                }
            }
        }

        IndexScan { ids: ids.into_iter().collect(), keys_examined }
    }
}

/// Index Manager - manages all indexes for a collection
#[derive(Debug, Clone)]
pub struct IndexManager {
    /// `_id_` first, then creation order
    indexes: Vec<Index>,
}

impl IndexManager {
    pub fn new() -> Self {
        let id_index = IndexDefinition {
            name: ID_INDEX_NAME.to_string(),
            fields: vec![(ID_FIELD.to_string(), SortDirection::Ascending)],
            unique: true,
        };
        IndexManager { indexes: vec![Index::new(id_index)] }
    }

    /// Create an index and back-fill it. Nothing changes if back-filling
    /// hits a unique violation.
    pub fn create_index<'a>(
        &mut self,
        definition: IndexDefinition,
        documents: impl IntoIterator<Item = &'a Document>,
    ) -> Result<()> {
        if self.get(&definition.name).is_some() {
            return Err(BookshelfError::IndexError(format!("Index already exists: {}", definition.name)));
        }
        if let Some(existing) = self.indexes.iter().find(|i| i.definition.fields == definition.fields) {
            return Err(BookshelfError::IndexError(format!(
                "Index with the same key pattern already exists: {}",
                existing.name()
            )));
        }

        let mut index = Index::new(definition);
        for doc in documents {
            index.check_unique(doc)?;
            index.insert(doc);
        }
        self.indexes.push(index);
        Ok(())
    }

    /// Drop index by name; `_id_` cannot be dropped
    pub fn drop_index(&mut self, name: &str) -> Result<IndexDefinition> {
        if name == ID_INDEX_NAME {
            return Err(BookshelfError::IndexError("cannot drop the _id index".to_string()));
        }
        let pos = self
            .indexes
            .iter()
            .position(|i| i.name() == name)
            .ok_or_else(|| BookshelfError::IndexError(format!("Index not found: {}", name)))?;
        Ok(self.indexes.remove(pos).definition)
    }

    pub fn get(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name() == name)
    }

    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    /// Definitions of every index except `_id_`
    pub fn user_definitions(&self) -> Vec<IndexDefinition> {
        self.indexes.iter().skip(1).map(|i| i.definition.clone()).collect()
    }

    pub fn list_indexes(&self) -> Vec<String> {
        self.indexes.iter().map(|i| i.name().to_string()).collect()
    }

    /// Check every unique index before a document is written
    pub fn check_unique(&self, doc: &Document) -> Result<()> {
        self.indexes.iter().try_for_each(|index| index.check_unique(doc))
    }

    pub fn insert_document(&mut self, doc: &Document) {
        for index in &mut self.indexes {
            index.insert(doc);
        }
    }

    pub fn remove_document(&mut self, doc: &Document) {
        for index in &mut self.indexes {
            index.remove(doc);
        }
    }
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new()
    }
}
