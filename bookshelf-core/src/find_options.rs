// src/find_options.rs
// Find query options: projection, sort, skip, limit

use std::cmp::Ordering;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::{Document, ID_FIELD};
use crate::error::{BookshelfError, Result};
use crate::value_order::cmp_optional;

/// Serialized as `1` / `-1`, the same shape sort specs and key patterns use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl From<SortDirection> for i32 {
    fn from(direction: SortDirection) -> i32 {
        direction.as_i32()
    }
}

impl TryFrom<i32> for SortDirection {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(SortDirection::Ascending),
            -1 => Ok(SortDirection::Descending),
            other => Err(format!("sort direction must be 1 or -1, got {}", other)),
        }
    }
}

impl SortDirection {
    /// Parse `1` / `-1`
    pub fn from_json(value: &Value) -> Result<Self> {
        match value.as_i64() {
            Some(1) => Ok(SortDirection::Ascending),
            Some(-1) => Ok(SortDirection::Descending),
            _ => Err(BookshelfError::InvalidQuery(format!(
                "sort direction must be 1 or -1, got {}",
                value
            ))),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }

    pub fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    }
}

/// Ordered list of sort keys. Comparisons always finish with an ascending
/// `_id` tie-break, so every sort is a total order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortSpec {
    keys: Vec<(String, SortDirection)>,
}

impl SortSpec {
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
        self.keys.push((field.into(), direction));
        self
    }

    /// Parse `{field: 1, other: -1}`; key order is significant
    pub fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| BookshelfError::InvalidQuery("sort must be an object".into()))?;
        if obj.is_empty() {
            return Err(BookshelfError::InvalidQuery("sort must name at least one field".into()));
        }

        let mut keys = Vec::with_capacity(obj.len());
        for (field, direction) in obj {
            keys.push((field.clone(), SortDirection::from_json(direction)?));
        }
        Ok(SortSpec { keys })
    }

    pub fn keys(&self) -> &[(String, SortDirection)] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (field, direction) in &self.keys {
            let cmp = if field == ID_FIELD {
                a.id.cmp(&b.id)
            } else {
                cmp_optional(a.get_path(field).as_ref(), b.get_path(field).as_ref())
            };
            let cmp = direction.apply(cmp);
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        a.id.cmp(&b.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ProjectionMode {
    Include(Vec<String>),
    Exclude(Vec<String>),
}

/// Field projection: inclusion or exclusion mode, with `_id` toggled
/// independently.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    mode: ProjectionMode,
    include_id: bool,
}

impl Projection {
    /// Keep only `fields` (plus `_id` unless excluded)
    pub fn include<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Projection {
            mode: ProjectionMode::Include(fields.into_iter().map(Into::into).collect()),
            include_id: true,
        }
    }

    /// Drop `fields`, keep everything else
    pub fn exclude<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Projection {
            mode: ProjectionMode::Exclude(fields.into_iter().map(Into::into).collect()),
            include_id: true,
        }
    }

    pub fn without_id(mut self) -> Self {
        self.include_id = false;
        self
    }

    /// Parse `{title: 1, price: 1, _id: 0}` or `{genre: 0}`
    pub fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| BookshelfError::InvalidProjection("projection must be an object".into()))?;

        let mut include_id = true;
        let mut included = Vec::new();
        let mut excluded = Vec::new();

        for (field, flag) in obj {
            let keep = match flag {
                Value::Bool(b) => *b,
                Value::Number(n) => match n.as_i64() {
                    Some(0) => false,
                    Some(1) => true,
                    _ => {
                        return Err(BookshelfError::InvalidProjection(format!(
                            "projection flag for '{}' must be 0 or 1",
                            field
                        )))
                    }
                },
                _ => {
                    return Err(BookshelfError::InvalidProjection(format!(
                        "projection flag for '{}' must be 0, 1 or a boolean",
                        field
                    )))
                }
            };

            if field == ID_FIELD {
                include_id = keep;
            } else if keep {
                included.push(field.clone());
            } else {
                excluded.push(field.clone());
            }
        }

        if !included.is_empty() && !excluded.is_empty() {
            return Err(BookshelfError::InvalidProjection(
                "cannot mix inclusion and exclusion (except for _id)".into(),
            ));
        }

        let mode = if included.is_empty() {
            ProjectionMode::Exclude(excluded)
        } else {
            ProjectionMode::Include(included)
        };

        Ok(Projection { mode, include_id })
    }

    pub fn apply(&self, doc: &Document) -> Value {
        let mut result = Map::new();

        if self.include_id {
            result.insert(ID_FIELD.to_string(), doc.id.to_value());
        }

        match &self.mode {
            ProjectionMode::Include(fields) => {
                for field in fields {
                    if let Some(value) = doc.get_path(field) {
                        insert_path(&mut result, field, value);
                    }
                }
            }
            ProjectionMode::Exclude(fields) => {
                for (key, value) in &doc.fields {
                    if !fields.iter().any(|f| f == key) {
                        result.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        Value::Object(result)
    }
}

/// Write `value` at a dotted path, creating intermediate objects
fn insert_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = child {
                insert_path(child, rest, value);
            }
        }
    }
}

/// Options for find queries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub projection: Option<Projection>,
    pub sort: Option<SortSpec>,
    /// Documents to skip; requires `sort`
    pub skip: Option<usize>,
    /// Maximum documents to return, `0` meaning no limit; requires `sort`
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reject pagination over an unspecified order
    pub fn validate(&self) -> Result<()> {
        let paginated = self.skip.is_some() || self.limit.is_some();
        let sorted = self.sort.as_ref().map_or(false, |s| !s.is_empty());
        if paginated && !sorted {
            return Err(BookshelfError::UnsortedPagination);
        }
        Ok(())
    }
}

/// Sort documents in place
pub fn apply_sort(docs: &mut [Document], sort: &SortSpec) {
    docs.sort_by(|a, b| sort.compare(a, b));
}

/// Window `[skip, skip + limit)`; a limit of zero is unbounded
pub fn apply_skip_limit<T>(docs: Vec<T>, skip: Option<usize>, limit: Option<usize>) -> Vec<T> {
    let skip = skip.unwrap_or(0);
    let iter = docs.into_iter().skip(skip);
    match limit {
        Some(n) if n > 0 => iter.take(n).collect(),
        _ => iter.collect(),
    }
}
