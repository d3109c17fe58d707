// src/query.rs
// Filter documents: parsing and matching

use std::cmp::Ordering;
use serde_json::{Map, Value};

use crate::document::{Document, ID_FIELD};
use crate::error::{BookshelfError, Result};
use crate::expression::lookup as lookup_path;
use crate::value_order::{comparable_cmp, values_equal};

/// Field-level operators
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOperator {
    Eq(Value),           // $eq, or a bare literal
    Ne(Value),           // $ne
    Gt(Value),           // $gt
    Gte(Value),          // $gte
    Lt(Value),           // $lt
    Lte(Value),          // $lte
    In(Vec<Value>),      // $in
    Nin(Vec<Value>),     // $nin
    Exists(bool),        // $exists
    Not(Vec<QueryOperator>), // $not
}

/// One top-level clause of a filter. Clauses are AND-ed together.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// All operators must hold for `field`
    Field { field: String, operators: Vec<QueryOperator> },
    And(Vec<Query>),
    Or(Vec<Query>),
    Nor(Vec<Query>),
}

/// Parsed filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    clauses: Vec<Clause>,
}

impl Query {
    /// Filter that matches every document
    pub fn new() -> Self {
        Query { clauses: Vec::new() }
    }

    /// Parse a filter object. `null` is accepted as "match all".
    pub fn from_json(json: &Value) -> Result<Self> {
        let map = match json {
            Value::Object(map) => map,
            Value::Null => return Ok(Query::new()),
            other => {
                return Err(BookshelfError::InvalidQuery(format!(
                    "filter must be an object, got {}",
                    other
                )))
            }
        };

        let mut clauses = Vec::with_capacity(map.len());
        for (field, condition) in map {
            if field.starts_with('$') {
                clauses.push(Self::parse_logical(field, condition)?);
            } else {
                clauses.push(Clause::Field {
                    field: field.clone(),
                    operators: Self::parse_operators(condition)?,
                });
            }
        }

        Ok(Query { clauses })
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Operators every match must satisfy on `field`: top-level conditions
    /// and those nested in `$and`. `$or`/`$nor` branches are not included.
    pub fn operators_for(&self, field: &str) -> Vec<&QueryOperator> {
        let mut operators = Vec::new();
        self.collect_operators(field, &mut operators);
        operators
    }

    fn collect_operators<'a>(&'a self, field: &str, out: &mut Vec<&'a QueryOperator>) {
        for clause in &self.clauses {
            match clause {
                Clause::Field { field: f, operators } if f == field => out.extend(operators.iter()),
                Clause::And(queries) => queries.iter().for_each(|q| q.collect_operators(field, out)),
                _ => {}
            }
        }
    }

    fn parse_logical(op: &str, value: &Value) -> Result<Clause> {
        let items = match value {
            Value::Array(items) if !items.is_empty() => items,
            _ => {
                return Err(BookshelfError::InvalidQuery(format!(
                    "{} requires a non-empty array",
                    op
                )))
            }
        };

        let queries = items.iter().map(Self::from_json).collect::<Result<Vec<_>>>()?;

        match op {
            "$and" => Ok(Clause::And(queries)),
            "$or" => Ok(Clause::Or(queries)),
            "$nor" => Ok(Clause::Nor(queries)),
            _ => Err(BookshelfError::InvalidQuery(format!("Unknown logical operator: {}", op))),
        }
    }

    /// Parse the right-hand side of `field: <condition>`
    fn parse_operators(value: &Value) -> Result<Vec<QueryOperator>> {
        let map = match value {
            Value::Object(map) if !map.is_empty() && map.keys().any(|k| k.starts_with('$')) => map,
            // Literal (including embedded documents) means equality
            _ => return Ok(vec![QueryOperator::Eq(value.clone())]),
        };

        if map.keys().any(|k| !k.starts_with('$')) {
            return Err(BookshelfError::InvalidQuery(
                "cannot mix operators and plain fields in one condition".into(),
            ));
        }

        map.iter().map(|(op, val)| Self::parse_operator(op, val)).collect()
    }

    fn parse_operator(op: &str, val: &Value) -> Result<QueryOperator> {
        match op {
            "$eq" => Ok(QueryOperator::Eq(val.clone())),
            "$ne" => Ok(QueryOperator::Ne(val.clone())),
            "$gt" => Ok(QueryOperator::Gt(val.clone())),
            "$gte" => Ok(QueryOperator::Gte(val.clone())),
            "$lt" => Ok(QueryOperator::Lt(val.clone())),
            "$lte" => Ok(QueryOperator::Lte(val.clone())),
            "$in" => match val {
                Value::Array(arr) => Ok(QueryOperator::In(arr.clone())),
                _ => Err(BookshelfError::InvalidQuery("$in requires array".into())),
            },
            "$nin" => match val {
                Value::Array(arr) => Ok(QueryOperator::Nin(arr.clone())),
                _ => Err(BookshelfError::InvalidQuery("$nin requires array".into())),
            },
            "$exists" => match val {
                Value::Bool(b) => Ok(QueryOperator::Exists(*b)),
                _ => Err(BookshelfError::InvalidQuery("$exists requires bool".into())),
            },
            "$not" => match val {
                Value::Object(map) if map.keys().all(|k| k.starts_with('$')) && !map.is_empty() => {
                    Ok(QueryOperator::Not(Self::parse_operators(val)?))
                }
                _ => Err(BookshelfError::InvalidQuery("$not requires an operator object".into())),
            },
            _ => Err(BookshelfError::InvalidQuery(format!("Unknown operator: {}", op))),
        }
    }

    /// Whether `document` satisfies every clause
    pub fn matches(&self, document: &Document) -> bool {
        self.matches_with(&|field| {
            if field == ID_FIELD {
                Some(document.id.to_value())
            } else {
                lookup(&document.fields, field).cloned()
            }
        })
    }

    /// Match a plain JSON object, as produced by aggregation stages
    pub fn matches_value(&self, value: &Value) -> bool {
        self.matches_with(&|field| lookup_path(value, field).cloned())
    }

    fn matches_with(&self, get: &dyn Fn(&str) -> Option<Value>) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Field { field, operators } => {
                let value = get(field);
                operators.iter().all(|op| Self::matches_operator(value.as_ref(), op))
            }
            Clause::And(queries) => queries.iter().all(|q| q.matches_with(get)),
            Clause::Or(queries) => queries.iter().any(|q| q.matches_with(get)),
            Clause::Nor(queries) => !queries.iter().any(|q| q.matches_with(get)),
        })
    }

    fn matches_operator(value: Option<&Value>, operator: &QueryOperator) -> bool {
        match operator {
            QueryOperator::Eq(target) => value.map_or(target.is_null(), |v| Self::equals(v, target)),
            QueryOperator::Ne(target) => !value.map_or(target.is_null(), |v| Self::equals(v, target)),
            QueryOperator::Gt(target) => Self::compare(value, target, |o| o == Ordering::Greater),
            QueryOperator::Gte(target) => Self::compare(value, target, |o| o != Ordering::Less),
            QueryOperator::Lt(target) => Self::compare(value, target, |o| o == Ordering::Less),
            QueryOperator::Lte(target) => Self::compare(value, target, |o| o != Ordering::Greater),
            QueryOperator::In(targets) => {
                targets.iter().any(|t| value.map_or(t.is_null(), |v| Self::equals(v, t)))
            }
            QueryOperator::Nin(targets) => {
                !targets.iter().any(|t| value.map_or(t.is_null(), |v| Self::equals(v, t)))
            }
            QueryOperator::Exists(should_exist) => value.is_some() == *should_exist,
            QueryOperator::Not(inner) => !inner.iter().all(|op| Self::matches_operator(value, op)),
        }
    }

    /// Equality; an array field matches when any element equals the target
    fn equals(value: &Value, target: &Value) -> bool {
        if values_equal(value, target) {
            return true;
        }
        match (value, target) {
            (Value::Array(items), t) if !t.is_array() => items.iter().any(|item| values_equal(item, t)),
            _ => false,
        }
    }

    fn compare(value: Option<&Value>, target: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
        value
            .and_then(|v| comparable_cmp(v, target))
            .map_or(false, accept)
    }
}

/// Dotted-path lookup starting from a document's field map
fn lookup<'a>(fields: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    match path.split_once('.') {
        Some((head, rest)) => fields.get(head).and_then(|v| lookup_path(v, rest)),
        None => fields.get(path),
    }
}
