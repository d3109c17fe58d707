// src/collection.rs
// Collection: documents, indexes and every query operation over them

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::aggregation::Pipeline;
use crate::document::{Document, DocumentId, ID_FIELD};
use crate::error::{BookshelfError, Result};
use crate::find_options::{apply_skip_limit, apply_sort, FindOptions};
use crate::index::{IndexDefinition, IndexKey, IndexManager, IndexSpec, ID_INDEX_NAME};
use crate::query::Query;
use crate::query_planner::{ExecutionStats, ExplainVerbosity, QueryPlan, QueryPlanner};
use crate::storage::{Record, StorageEngine};
use crate::value_order::{total_cmp, values_equal};

/// Outcome of an update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
}

/// Outcome of a delete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// Documents and indexes of one collection
#[derive(Debug, Default)]
pub(crate) struct CollectionState {
    /// Keyed by id, so iteration is ascending `_id` order
    documents: BTreeMap<DocumentId, Document>,
    indexes: IndexManager,
    /// Highest integer id ever assigned or seen
    last_id: i64,
}

impl CollectionState {
    fn observe_id(&mut self, id: &DocumentId) {
        if let DocumentId::Int(n) = id {
            self.last_id = self.last_id.max(*n);
        }
    }

    /// Apply an already validated record
    fn apply(&mut self, record: Record) -> Result<()> {
        match record {
            Record::Insert { document, .. } | Record::Replace { document, .. } => {
                self.observe_id(&document.id);
                if let Some(old) = self.documents.remove(&document.id) {
                    self.indexes.remove_document(&old);
                }
                self.indexes.insert_document(&document);
                self.documents.insert(document.id.clone(), document);
            }
            Record::Delete { id, .. } => {
                // Deletes also carry the id counter across compaction
                self.observe_id(&id);
                if let Some(old) = self.documents.remove(&id) {
                    self.indexes.remove_document(&old);
                }
            }
            Record::CreateIndex { definition, .. } => {
                self.indexes.create_index(definition, self.documents.values())?;
            }
            Record::DropIndex { name, .. } => {
                self.indexes.drop_index(&name)?;
            }
        }
        Ok(())
    }

    /// Documents matching `query` in ascending `_id` order, using the
    /// planned index when there is one
    fn matching<'a>(&'a self, query: &Query, plan: &QueryPlan, stats: &mut ExecutionStats) -> Vec<&'a Document> {
        let candidates: Box<dyn Iterator<Item = &'a Document> + 'a> = match plan {
            QueryPlan::CollectionScan => Box::new(self.documents.values()),
            QueryPlan::IndexScan { index_name, bounds } => match self.indexes.get(index_name) {
                Some(index) => {
                    let scan = index.scan(bounds);
                    stats.total_keys_examined += scan.keys_examined;
                    let documents = &self.documents;
                    Box::new(scan.ids.into_iter().filter_map(move |id| documents.get(&id)))
                }
                None => Box::new(self.documents.values()),
            },
        };

        let mut matched = Vec::new();
        for doc in candidates {
            stats.total_docs_examined += 1;
            if query.matches(doc) {
                matched.push(doc);
            }
        }
        matched
    }

    fn find_matching<'a>(&'a self, query: &Query, stats: &mut ExecutionStats) -> Vec<&'a Document> {
        let plan = QueryPlanner::plan(query, &self.indexes);
        self.matching(query, &plan, stats)
    }
}

/// A named set of documents sharing indexes.
///
/// Reads take a shared lock and writes an exclusive one, so every operation
/// is atomic with respect to other callers. When the database is file
/// backed, each change is appended to the record log before it becomes
/// visible.
pub struct Collection {
    name: String,
    state: RwLock<CollectionState>,
    storage: Option<Arc<Mutex<StorageEngine>>>,
}

impl Collection {
    pub(crate) fn new(name: String, storage: Option<Arc<Mutex<StorageEngine>>>) -> Self {
        Collection {
            name,
            state: RwLock::new(CollectionState::default()),
            storage,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rebuild state from a log record while opening the database
    pub(crate) fn replay(&self, record: Record) -> Result<()> {
        self.state
            .write()
            .apply(record)
            .map_err(|e| BookshelfError::Corruption(format!("cannot replay record for '{}': {}", self.name, e)))
    }

    fn snapshot(&self, state: &CollectionState) -> Vec<Record> {
        let mut records: Vec<Record> = state
            .documents
            .values()
            .map(|doc| Record::Insert { collection: self.name.clone(), document: doc.clone() })
            .collect();

        let max_live = state.documents.keys().filter_map(|id| match id {
            DocumentId::Int(n) => Some(*n),
            DocumentId::String(_) => None,
        });
        if state.last_id > max_live.max().unwrap_or(0) {
            records.push(Record::Delete { collection: self.name.clone(), id: DocumentId::Int(state.last_id) });
        }

        records.extend(
            state
                .indexes
                .user_definitions()
                .into_iter()
                .map(|definition| Record::CreateIndex { collection: self.name.clone(), definition }),
        );
        records
    }

    /// Number of live records a compacted log would hold for this collection
    pub(crate) fn live_record_count(&self) -> usize {
        let state = self.state.read();
        self.snapshot(&state).len()
    }

    /// Write-lock the collection and snapshot it. The database holds the
    /// guard until the compacted log is in place.
    pub(crate) fn lock_for_compaction(&self) -> (RwLockWriteGuard<'_, CollectionState>, Vec<Record>) {
        let state = self.state.write();
        let records = self.snapshot(&state);
        (state, records)
    }

    fn persist(&self, records: &[Record]) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.lock().append_all(records)?;
        }
        Ok(())
    }

    // ========== INSERT ==========

    /// Insert one document and return its id.
    ///
    /// Without an `_id` the next integer id is assigned. A caller-supplied
    /// `_id` that is already in use fails with `DuplicateKey`.
    pub fn insert_one(&self, document: Value) -> Result<DocumentId> {
        let mut state = self.state.write();
        self.insert_locked(&mut state, document)
    }

    /// Insert documents in order, stopping at the first failure. Documents
    /// before the failing one stay inserted.
    pub fn insert_many(&self, documents: Vec<Value>) -> Result<Vec<DocumentId>> {
        let mut state = self.state.write();
        documents
            .into_iter()
            .map(|document| self.insert_locked(&mut state, document))
            .collect()
    }

    fn insert_locked(&self, state: &mut CollectionState, document: Value) -> Result<DocumentId> {
        let mut fields = match document {
            Value::Object(map) => map,
            other => {
                return Err(BookshelfError::InvalidQuery(format!("document must be an object, got {}", other)))
            }
        };

        let id = match fields.remove(ID_FIELD) {
            Some(value) => {
                let id = DocumentId::from_value(&value)?;
                if state.documents.contains_key(&id) {
                    return Err(BookshelfError::DuplicateKey {
                        index: ID_INDEX_NAME.to_string(),
                        key: format!("{{ _id: {} }}", IndexKey::from_value(&value)),
                    });
                }
                id
            }
            None => DocumentId::new_auto(state.last_id),
        };

        let document = Document::new(id.clone(), fields);
        state.indexes.check_unique(&document)?;

        let record = Record::Insert { collection: self.name.clone(), document };
        self.persist(std::slice::from_ref(&record))?;
        state.apply(record)?;

        debug!(target: "bookshelf::collection", collection = %self.name, id = %id, "Inserted document");
        Ok(id)
    }

    // ========== READ ==========

    /// All documents matching `filter`, in ascending `_id` order
    pub fn find(&self, filter: &Value) -> Result<Vec<Value>> {
        self.find_with_options(filter, &FindOptions::default())
    }

    /// Find with projection, sort and pagination.
    ///
    /// `skip`/`limit` without a sort fail with `UnsortedPagination`.
    pub fn find_with_options(&self, filter: &Value, options: &FindOptions) -> Result<Vec<Value>> {
        options.validate()?;
        let query = Query::from_json(filter)?;

        let state = self.state.read();
        let mut docs: Vec<Document> = state
            .find_matching(&query, &mut ExecutionStats::default())
            .into_iter()
            .cloned()
            .collect();
        drop(state);

        if let Some(sort) = &options.sort {
            apply_sort(&mut docs, sort);
        }
        let docs = apply_skip_limit(docs, options.skip, options.limit);

        Ok(match &options.projection {
            Some(projection) => docs.iter().map(|d| projection.apply(d)).collect(),
            None => docs.into_iter().map(Value::from).collect(),
        })
    }

    /// Lowest-`_id` document matching `filter`
    pub fn find_one(&self, filter: &Value) -> Result<Option<Value>> {
        let query = Query::from_json(filter)?;
        let state = self.state.read();
        let first = state
            .find_matching(&query, &mut ExecutionStats::default())
            .first()
            .map(|doc| doc.to_value());
        Ok(first)
    }

    pub fn count_documents(&self, filter: &Value) -> Result<u64> {
        let query = Query::from_json(filter)?;
        let state = self.state.read();
        if query.is_empty() {
            return Ok(state.documents.len() as u64);
        }
        Ok(state.find_matching(&query, &mut ExecutionStats::default()).len() as u64)
    }

    /// Distinct values of `field` among matching documents, in value order.
    /// Array values contribute their elements.
    pub fn distinct(&self, field: &str, filter: &Value) -> Result<Vec<Value>> {
        let query = Query::from_json(filter)?;
        let state = self.state.read();

        let mut values: Vec<Value> = Vec::new();
        for doc in state.find_matching(&query, &mut ExecutionStats::default()) {
            match doc.get_path(field) {
                Some(Value::Array(items)) => values.extend(items),
                Some(value) => values.push(value),
                None => {}
            }
        }

        values.sort_by(total_cmp);
        values.dedup_by(|a, b| values_equal(a, b));
        Ok(values)
    }

    /// Total number of documents
    pub fn len(&self) -> usize {
        self.state.read().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========== UPDATE ==========

    /// Apply `$set` / `$unset` / `$inc` to the lowest-`_id` matching
    /// document. No match is not an error.
    pub fn update_one(&self, filter: &Value, update: &Value) -> Result<UpdateResult> {
        self.update(filter, update, false)
    }

    /// Apply the update to every matching document
    pub fn update_many(&self, filter: &Value, update: &Value) -> Result<UpdateResult> {
        self.update(filter, update, true)
    }

    fn update(&self, filter: &Value, update: &Value, multi: bool) -> Result<UpdateResult> {
        let query = Query::from_json(filter)?;
        let operators = UpdateOperator::parse(update)?;

        let mut state = self.state.write();
        let mut targets: Vec<Document> = state
            .find_matching(&query, &mut ExecutionStats::default())
            .into_iter()
            .cloned()
            .collect();
        if !multi {
            targets.truncate(1);
        }

        let mut result = UpdateResult { matched_count: targets.len() as u64, modified_count: 0 };
        for original in targets {
            let mut updated = original.clone();
            for operator in &operators {
                operator.apply(&mut updated.fields)?;
            }
            if updated == original {
                continue;
            }

            state.indexes.check_unique(&updated)?;
            let record = Record::Replace { collection: self.name.clone(), document: updated };
            self.persist(std::slice::from_ref(&record))?;
            state.apply(record)?;
            result.modified_count += 1;
        }

        debug!(
            target: "bookshelf::collection",
            collection = %self.name,
            matched = result.matched_count,
            modified = result.modified_count,
            "Updated documents"
        );
        Ok(result)
    }

    // ========== DELETE ==========

    /// Remove the lowest-`_id` matching document, if any
    pub fn delete_one(&self, filter: &Value) -> Result<DeleteResult> {
        self.delete(filter, false)
    }

    /// Remove every matching document
    pub fn delete_many(&self, filter: &Value) -> Result<DeleteResult> {
        self.delete(filter, true)
    }

    fn delete(&self, filter: &Value, multi: bool) -> Result<DeleteResult> {
        let query = Query::from_json(filter)?;

        let mut state = self.state.write();
        let mut ids: Vec<DocumentId> = state
            .find_matching(&query, &mut ExecutionStats::default())
            .into_iter()
            .map(|doc| doc.id.clone())
            .collect();
        if !multi {
            ids.truncate(1);
        }

        let records: Vec<Record> = ids
            .into_iter()
            .map(|id| Record::Delete { collection: self.name.clone(), id })
            .collect();
        self.persist(&records)?;

        let deleted_count = records.len() as u64;
        for record in records {
            state.apply(record)?;
        }

        debug!(target: "bookshelf::collection", collection = %self.name, deleted = deleted_count, "Deleted documents");
        Ok(DeleteResult { deleted_count })
    }

    // ========== AGGREGATION ==========

    /// Run an aggregation pipeline over the collection. A leading `$match`
    /// is used to pick documents through an index when one fits.
    pub fn aggregate(&self, pipeline: &Value) -> Result<Vec<Value>> {
        let pipeline = Pipeline::from_json(pipeline)?;

        let docs: Vec<Value> = {
            let state = self.state.read();
            match pipeline.leading_match() {
                Some(query) => state
                    .find_matching(query, &mut ExecutionStats::default())
                    .into_iter()
                    .map(Document::to_value)
                    .collect(),
                None => state.documents.values().map(Document::to_value).collect(),
            }
        };

        pipeline.execute(docs)
    }

    // ========== INDEX OPERATIONS ==========

    /// Create and back-fill an index, returning its name
    pub fn create_index(&self, spec: IndexSpec) -> Result<String> {
        let definition = spec.into_definition()?;
        let name = definition.name.clone();

        let mut state = self.state.write();
        let CollectionState { documents, indexes, .. } = &mut *state;
        indexes.create_index(definition.clone(), documents.values())?;

        let record = Record::CreateIndex { collection: self.name.clone(), definition };
        if let Err(e) = self.persist(std::slice::from_ref(&record)) {
            indexes.drop_index(&name)?;
            return Err(e);
        }

        info!(
            target: "bookshelf::collection",
            collection = %self.name,
            index = %name,
            entries = indexes.get(&name).map_or(0, |i| i.size()),
            "Created index"
        );
        Ok(name)
    }

    /// Drop an index by name. The `_id_` index cannot be dropped.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        if name == ID_INDEX_NAME {
            return Err(BookshelfError::IndexError("cannot drop the _id index".to_string()));
        }
        if state.indexes.get(name).is_none() {
            return Err(BookshelfError::IndexError(format!("Index not found: {}", name)));
        }

        let record = Record::DropIndex { collection: self.name.clone(), name: name.to_string() };
        self.persist(std::slice::from_ref(&record))?;
        state.apply(record)?;

        info!(target: "bookshelf::collection", collection = %self.name, index = %name, "Dropped index");
        Ok(())
    }

    /// Index names, `_id_` first
    pub fn list_indexes(&self) -> Vec<String> {
        self.state.read().indexes.list_indexes()
    }

    /// Full definitions of every index, `_id_` included
    pub fn index_definitions(&self) -> Vec<IndexDefinition> {
        let state = self.state.read();
        state.indexes.indexes().iter().map(|i| i.definition().clone()).collect()
    }

    // ========== EXPLAIN ==========

    /// Describe how `filter` would be executed. With `ExecutionStats` the
    /// query is also run and its counters reported.
    pub fn explain(&self, filter: &Value, verbosity: ExplainVerbosity) -> Result<Value> {
        let query = Query::from_json(filter)?;
        let state = self.state.read();
        let plan = QueryPlanner::plan(&query, &state.indexes);

        debug!(target: "bookshelf::planner", collection = %self.name, ?plan, "Planned query");

        let stats = match verbosity {
            ExplainVerbosity::QueryPlanner => None,
            ExplainVerbosity::ExecutionStats => {
                let started = Instant::now();
                let mut stats = ExecutionStats::default();
                let returned = state.matching(&query, &plan, &mut stats).len();
                stats.n_returned = returned;
                stats.execution_time_millis = started.elapsed().as_millis() as u64;
                Some(stats)
            }
        };

        let namespace = format!("bookshelf.{}", self.name);
        Ok(QueryPlanner::explain(&namespace, filter, &plan, &state.indexes, stats.as_ref()))
    }
}

/// Parsed update operator
#[derive(Debug, Clone, PartialEq)]
enum UpdateOperator {
    Set(Vec<(String, Value)>),
    Unset(Vec<String>),
    Inc(Vec<(String, Value)>),
}

impl UpdateOperator {
    /// Parse `{"$set": {...}, "$inc": {...}}`. A replacement document, an
    /// unknown operator or a path touching `_id` is `InvalidUpdate`.
    fn parse(update: &Value) -> Result<Vec<UpdateOperator>> {
        let map = match update {
            Value::Object(map) if !map.is_empty() => map,
            _ => return Err(BookshelfError::InvalidUpdate("update must be a non-empty object".to_string())),
        };

        let mut operators = Vec::with_capacity(map.len());
        for (op, fields) in map {
            let fields = match fields {
                Value::Object(fields) => fields,
                _ if !op.starts_with('$') => {
                    return Err(BookshelfError::InvalidUpdate(format!(
                        "update must use operators such as $set, found field '{}'",
                        op
                    )))
                }
                _ => return Err(BookshelfError::InvalidUpdate(format!("{} requires an object", op))),
            };

            if let Some(path) = fields.keys().find(|p| is_id_path(p)) {
                return Err(BookshelfError::InvalidUpdate(format!("cannot modify immutable field '{}'", path)));
            }
            if let Some(path) = fields.keys().find(|p| p.is_empty() || p.split('.').any(str::is_empty)) {
                return Err(BookshelfError::InvalidUpdate(format!("invalid field path '{}'", path)));
            }

            let pairs = || fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<Vec<_>>();
            operators.push(match op.as_str() {
                "$set" => UpdateOperator::Set(pairs()),
                "$unset" => UpdateOperator::Unset(fields.keys().cloned().collect()),
                "$inc" => {
                    if let Some((path, _)) = fields.iter().find(|(_, v)| !v.is_number()) {
                        return Err(BookshelfError::InvalidUpdate(format!("$inc value for '{}' must be a number", path)));
                    }
                    UpdateOperator::Inc(pairs())
                }
                other if other.starts_with('$') => {
                    return Err(BookshelfError::InvalidUpdate(format!("Unsupported update operator: {}", other)))
                }
                other => {
                    return Err(BookshelfError::InvalidUpdate(format!(
                        "update must use operators such as $set, found field '{}'",
                        other
                    )))
                }
            });
        }
        Ok(operators)
    }

    fn apply(&self, fields: &mut Map<String, Value>) -> Result<()> {
        match self {
            UpdateOperator::Set(pairs) => {
                for (path, value) in pairs {
                    set_path(fields, path, value.clone())?;
                }
            }
            UpdateOperator::Unset(paths) => {
                for path in paths {
                    unset_path(fields, path);
                }
            }
            UpdateOperator::Inc(pairs) => {
                for (path, delta) in pairs {
                    let next = match get_path(fields, path) {
                        None | Some(Value::Null) => delta.clone(),
                        Some(current) => add_numbers(current, delta).ok_or_else(|| {
                            BookshelfError::InvalidUpdate(format!("cannot apply $inc to non-numeric field '{}'", path))
                        })?,
                    };
                    set_path(fields, path, next)?;
                }
            }
        }
        Ok(())
    }
}

fn is_id_path(path: &str) -> bool {
    path == ID_FIELD || path.starts_with("_id.")
}

/// Integers stay integers unless the sum overflows
fn add_numbers(current: &Value, delta: &Value) -> Option<Value> {
    if let (Some(a), Some(b)) = (current.as_i64(), delta.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Some(Value::from(sum));
        }
    }
    let sum = current.as_f64()? + delta.as_f64()?;
    serde_json::Number::from_f64(sum).map(Value::Number)
}

fn get_path<'a>(fields: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    match path.split_once('.') {
        Some((head, rest)) => fields.get(head).and_then(|v| crate::expression::lookup(v, rest)),
        None => fields.get(path),
    }
}

/// Set a dotted path, creating intermediate objects
fn set_path(fields: &mut Map<String, Value>, path: &str, value: Value) -> Result<()> {
    match path.split_once('.') {
        None => {
            fields.insert(path.to_string(), value);
            Ok(())
        }
        Some((head, rest)) => {
            let child = fields.entry(head.to_string()).or_insert_with(|| Value::Object(Map::new()));
            match child {
                Value::Object(map) => set_path(map, rest, value),
                _ => Err(BookshelfError::InvalidUpdate(format!(
                    "cannot create field '{}' inside non-object '{}'",
                    rest, head
                ))),
            }
        }
    }
}

fn unset_path(fields: &mut Map<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            fields.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(map)) = fields.get_mut(head) {
                unset_path(map, rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::find_options::{Projection, SortSpec};
    use serde_json::json;

    fn books() -> Collection {
        let collection = Collection::new("books".to_string(), None);
        collection
            .insert_many(vec![
                json!({"title": "Clean Code", "author": "Robert C. Martin", "genre": "Programming", "published_year": 2008, "price": 40, "in_stock": true}),
                json!({"title": "Dune", "author": "Frank Herbert", "genre": "Fiction", "published_year": 1965, "price": 12.5, "in_stock": false}),
                json!({"title": "Refactoring", "author": "Martin Fowler", "genre": "Programming", "published_year": 2018, "price": 45, "in_stock": true}),
                json!({"title": "Dune", "author": "Frank Herbert", "genre": "Fiction", "published_year": 1990, "price": 9, "in_stock": true}),
            ])
            .unwrap();
        collection
    }

    fn titles(docs: &[Value]) -> Vec<&str> {
        docs.iter().map(|d| d["title"].as_str().unwrap_or("")).collect()
    }

    #[test]
    fn test_insert_assigns_increasing_ids() {
        let collection = books();
        let ids: Vec<Value> = collection.find(&json!({})).unwrap().iter().map(|d| d["_id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(4)]);
        assert_eq!(collection.insert_one(json!({"title": "Emma"})).unwrap(), DocumentId::Int(5));
    }

    #[test]
    fn test_insert_with_explicit_id() {
        let collection = books();
        assert_eq!(collection.insert_one(json!({"_id": 10, "title": "X"})).unwrap(), DocumentId::Int(10));
        assert_eq!(collection.insert_one(json!({"title": "Y"})).unwrap(), DocumentId::Int(11));
        assert_eq!(
            collection.insert_one(json!({"_id": "isbn-1", "title": "Z"})).unwrap(),
            DocumentId::String("isbn-1".to_string())
        );

        let err = collection.insert_one(json!({"_id": 10})).unwrap_err();
        assert!(matches!(err, BookshelfError::DuplicateKey { ref index, .. } if index == "_id_"));
        assert!(collection.insert_one(json!(["not", "an", "object"])).is_err());
        assert!(collection.insert_one(json!({"_id": {"nested": 1}})).is_err());
    }

    #[test]
    fn test_find_filters_in_id_order() {
        let collection = books();
        let fiction = collection.find(&json!({"genre": "Fiction"})).unwrap();
        assert_eq!(titles(&fiction), vec!["Dune", "Dune"]);
        assert_eq!(fiction[0]["published_year"], 1965);

        let recent = collection.find(&json!({"in_stock": true, "published_year": {"$gt": 2010}})).unwrap();
        assert_eq!(titles(&recent), vec!["Refactoring"]);
    }

    #[test]
    fn test_find_with_projection_and_sort() {
        let collection = books();
        let options = FindOptions::new()
            .with_projection(Projection::include(["title", "price"]).without_id())
            .with_sort(SortSpec::ascending("price"));

        let docs = collection.find_with_options(&json!({}), &options).unwrap();
        assert_eq!(docs[0], json!({"title": "Dune", "price": 9}));
        assert_eq!(docs[3], json!({"title": "Refactoring", "price": 45}));
    }

    #[test]
    fn test_pagination_requires_sort() {
        let collection = books();
        let err = collection
            .find_with_options(&json!({}), &FindOptions::new().with_limit(2))
            .unwrap_err();
        assert!(matches!(err, BookshelfError::UnsortedPagination));

        let page = collection
            .find_with_options(&json!({}), &FindOptions::new().with_sort(SortSpec::descending("price")).with_skip(1).with_limit(2))
            .unwrap();
        assert_eq!(titles(&page), vec!["Clean Code", "Dune"]);
    }

    #[test]
    fn test_find_one_count_distinct() {
        let collection = books();
        assert_eq!(collection.find_one(&json!({"title": "Dune"})).unwrap().unwrap()["_id"], 2);
        assert!(collection.find_one(&json!({"title": "Missing"})).unwrap().is_none());
        assert_eq!(collection.count_documents(&json!({"genre": "Programming"})).unwrap(), 2);
        assert_eq!(collection.count_documents(&json!({})).unwrap(), 4);
        assert_eq!(
            collection.distinct("genre", &json!({})).unwrap(),
            vec![json!("Fiction"), json!("Programming")]
        );
    }

    #[test]
    fn test_read_paths_share_key_order() {
        let collection = books();
        let filter = json!({"title": "Dune"});

        let from_find = serde_json::to_string(&collection.find(&filter).unwrap()[0]).unwrap();
        let from_find_one = serde_json::to_string(&collection.find_one(&filter).unwrap().unwrap()).unwrap();
        let from_aggregate =
            serde_json::to_string(&collection.aggregate(&json!([{"$match": filter}])).unwrap()[0]).unwrap();

        assert_eq!(from_find, from_find_one);
        assert_eq!(from_find, from_aggregate);
        assert!(from_find.starts_with(r#"{"_id":2,"title":"Dune""#));
    }

    #[test]
    fn test_sort_and_project_nested_fields() {
        let collection = Collection::new("books".to_string(), None);
        collection
            .insert_many(vec![
                json!({"title": "Dune", "meta": {"pages": 412, "lang": "en"}}),
                json!({"title": "Emma", "meta": {"pages": 474, "lang": "en"}}),
                json!({"title": "Candide", "meta": {"pages": 129, "lang": "fr"}}),
            ])
            .unwrap();

        let options = FindOptions::new()
            .with_sort(SortSpec::from_json(&json!({"meta.pages": 1})).unwrap())
            .with_projection(Projection::from_json(&json!({"title": 1, "meta.pages": 1, "_id": 0})).unwrap());
        let docs = collection.find_with_options(&json!({}), &options).unwrap();

        assert_eq!(titles(&docs), vec!["Candide", "Dune", "Emma"]);
        assert_eq!(docs[0], json!({"title": "Candide", "meta": {"pages": 129}}));
    }

    #[test]
    fn test_update_one_targets_lowest_id() {
        let collection = books();
        let result = collection.update_one(&json!({"title": "Dune"}), &json!({"$set": {"price": 15}})).unwrap();
        assert_eq!(result, UpdateResult { matched_count: 1, modified_count: 1 });

        let dunes = collection.find(&json!({"title": "Dune"})).unwrap();
        assert_eq!(dunes[0]["price"], 15);
        assert_eq!(dunes[1]["price"], 9);
    }

    #[test]
    fn test_update_no_match_is_noop() {
        let collection = books();
        let before = collection.find(&json!({})).unwrap();
        let result = collection.update_one(&json!({"title": "Missing"}), &json!({"$set": {"price": 1}})).unwrap();
        assert_eq!(result, UpdateResult::default());
        assert_eq!(collection.find(&json!({})).unwrap(), before);
    }

    #[test]
    fn test_update_operators() {
        let collection = books();
        collection
            .update_one(&json!({"title": "Clean Code"}), &json!({"$inc": {"price": 5, "stock.count": 2}, "$unset": {"in_stock": ""}}))
            .unwrap();
        let doc = collection.find_one(&json!({"title": "Clean Code"})).unwrap().unwrap();
        assert_eq!(doc["price"], 45);
        assert_eq!(doc["stock"], json!({"count": 2}));
        assert!(doc.get("in_stock").is_none());

        // Setting the same value matches but does not modify
        let result = collection.update_one(&json!({"title": "Clean Code"}), &json!({"$set": {"price": 45}})).unwrap();
        assert_eq!(result, UpdateResult { matched_count: 1, modified_count: 0 });
    }

    #[test]
    fn test_update_many() {
        let collection = books();
        let result = collection.update_many(&json!({"genre": "Programming"}), &json!({"$set": {"in_stock": false}})).unwrap();
        assert_eq!(result.modified_count, 2);
        assert_eq!(collection.count_documents(&json!({"in_stock": false})).unwrap(), 3);
    }

    #[test]
    fn test_invalid_updates() {
        let collection = books();
        let filter = json!({"title": "Dune"});

        for update in [
            json!({"price": 10}),
            json!({}),
            json!({"$set": {"_id": 99}}),
            json!({"$rename": {"price": "cost"}}),
            json!({"$inc": {"price": "ten"}}),
            json!({"$inc": {"title": 1}}),
            json!({"$set": {"title.sub": 1}}),
        ] {
            let err = collection.update_one(&filter, &update).unwrap_err();
            assert!(matches!(err, BookshelfError::InvalidUpdate(_)), "{} gave {}", update, err);
        }
        assert_eq!(collection.find_one(&filter).unwrap().unwrap()["price"], 12.5);
    }

    #[test]
    fn test_delete_one_and_many() {
        let collection = books();
        assert_eq!(collection.delete_one(&json!({"title": "Dune"})).unwrap().deleted_count, 1);
        let remaining = collection.find(&json!({"title": "Dune"})).unwrap();
        assert_eq!(remaining[0]["_id"], 4);

        assert_eq!(collection.delete_one(&json!({"title": "Missing"})).unwrap().deleted_count, 0);
        assert_eq!(collection.delete_many(&json!({"genre": "Programming"})).unwrap().deleted_count, 2);
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn test_ids_not_reused_after_delete() {
        let collection = books();
        collection.delete_many(&json!({})).unwrap();
        assert!(collection.is_empty());
        assert_eq!(collection.insert_one(json!({"title": "New"})).unwrap(), DocumentId::Int(5));
    }

    #[test]
    fn test_aggregate() {
        let collection = books();
        let results = collection
            .aggregate(&json!([
                {"$match": {"in_stock": true}},
                {"$group": {"_id": "$genre", "count": {"$sum": 1}}},
                {"$sort": {"count": -1}}
            ]))
            .unwrap();
        assert_eq!(results, vec![json!({"_id": "Programming", "count": 2}), json!({"_id": "Fiction", "count": 1})]);
    }

    #[test]
    fn test_index_lifecycle() {
        let collection = books();
        assert_eq!(collection.create_index(IndexSpec::ascending("title")).unwrap(), "title_1");
        assert_eq!(collection.list_indexes(), vec!["_id_", "title_1"]);
        assert!(collection.create_index(IndexSpec::ascending("title")).is_err());

        // Unique over duplicated titles fails and leaves nothing behind
        let unique = IndexSpec::ascending("author").unique(true);
        assert!(matches!(collection.create_index(unique), Err(BookshelfError::DuplicateKey { .. })));
        assert_eq!(collection.list_indexes().len(), 2);

        collection.drop_index("title_1").unwrap();
        assert!(collection.drop_index("title_1").is_err());
        assert!(collection.drop_index("_id_").is_err());
    }

    #[test]
    fn test_unique_index_blocks_writes() {
        let collection = books();
        collection.delete_many(&json!({"title": "Dune"})).unwrap();
        collection.create_index(IndexSpec::ascending("title").unique(true)).unwrap();

        let err = collection.insert_one(json!({"title": "Clean Code"})).unwrap_err();
        assert!(matches!(err, BookshelfError::DuplicateKey { ref index, .. } if index == "title_1"));

        let err = collection
            .update_one(&json!({"title": "Refactoring"}), &json!({"$set": {"title": "Clean Code"}}))
            .unwrap_err();
        assert!(matches!(err, BookshelfError::DuplicateKey { .. }));
        assert_eq!(collection.count_documents(&json!({"title": "Refactoring"})).unwrap(), 1);
    }

    #[test]
    fn test_index_does_not_change_results() {
        let collection = books();
        let filters = [
            json!({"title": "Dune"}),
            json!({"price": {"$gte": 10, "$lt": 45}}),
            json!({"genre": {"$in": ["Fiction", "Poetry"]}}),
            json!({"title": {"$gt": "D"}}),
        ];
        let before: Vec<Vec<Value>> = filters.iter().map(|f| collection.find(f).unwrap()).collect();

        collection.create_index(IndexSpec::ascending("title")).unwrap();
        collection.create_index(IndexSpec::ascending("price")).unwrap();
        collection.create_index(IndexSpec::ascending("genre")).unwrap();

        let after: Vec<Vec<Value>> = filters.iter().map(|f| collection.find(f).unwrap()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_index_matches_whole_floats_as_integers() {
        let collection = Collection::new("books".to_string(), None);
        collection.insert_one(json!({"price": 9.5e15})).unwrap();
        collection.insert_one(json!({"price": 9_500_000_000_000_000i64})).unwrap();
        collection.insert_one(json!({"price": 2015.0})).unwrap();

        let filters = [
            json!({"price": 9_500_000_000_000_000i64}),
            json!({"price": 9.5e15}),
            json!({"price": {"$gte": 9.5e15}}),
            json!({"price": 2015}),
            json!({"price": {"$in": [2015, 1.0]}}),
        ];
        let before: Vec<Vec<Value>> = filters.iter().map(|f| collection.find(f).unwrap()).collect();
        assert_eq!(before[0].len(), 2);
        assert_eq!(before[3].len(), 1);

        collection.create_index(IndexSpec::ascending("price")).unwrap();
        let after: Vec<Vec<Value>> = filters.iter().map(|f| collection.find(f).unwrap()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_explain_collscan_then_ixscan() {
        let collection = books();
        let filter = json!({"title": "Clean Code"});

        let explain = collection.explain(&filter, ExplainVerbosity::ExecutionStats).unwrap();
        assert_eq!(explain["queryPlanner"]["winningPlan"]["stage"], "COLLSCAN");
        assert_eq!(explain["executionStats"]["totalDocsExamined"], 4);
        assert_eq!(explain["executionStats"]["nReturned"], 1);

        collection.create_index(IndexSpec::ascending("title")).unwrap();
        let explain = collection.explain(&filter, ExplainVerbosity::ExecutionStats).unwrap();
        assert_eq!(explain["queryPlanner"]["winningPlan"]["stage"], "IXSCAN");
        assert_eq!(explain["queryPlanner"]["winningPlan"]["indexName"], "title_1");
        assert_eq!(explain["queryPlanner"]["namespace"], "bookshelf.books");
        assert_eq!(explain["executionStats"]["totalKeysExamined"], 1);
        assert_eq!(explain["executionStats"]["totalDocsExamined"], 1);
        assert_eq!(explain["executionStats"]["nReturned"], 1);

        let planner_only = collection.explain(&filter, ExplainVerbosity::QueryPlanner).unwrap();
        assert!(planner_only.get("executionStats").is_none());
    }

    #[test]
    fn test_live_records_carry_id_counter() {
        let collection = books();
        collection.create_index(IndexSpec::ascending("title")).unwrap();
        collection.delete_one(&json!({"_id": 4})).unwrap();

        let (guard, records) = collection.lock_for_compaction();
        drop(guard);
        assert_eq!(records.len(), 3 + 1 + 1);
        assert_eq!(collection.live_record_count(), 5);

        let rebuilt = Collection::new("books".to_string(), None);
        for record in records {
            rebuilt.replay(record).unwrap();
        }
        assert_eq!(rebuilt.len(), 3);
        assert_eq!(rebuilt.list_indexes(), vec!["_id_", "title_1"]);
        assert_eq!(rebuilt.insert_one(json!({})).unwrap(), DocumentId::Int(5));
    }
}
