// src/query_planner.rs
// Query planner - index selection and explain output

use serde_json::{json, Map, Value};

use crate::error::{BookshelfError, Result};
use crate::index::{Index, IndexBounds, IndexKey, IndexManager, KeyRange};
use crate::query::{Query, QueryOperator};

/// Query plan - describes how to execute a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    /// Full collection scan (no index used)
    CollectionScan,

    /// Scan one index, then fetch and re-filter the documents it yields
    IndexScan {
        index_name: String,
        bounds: IndexBounds,
    },
}

/// How much detail `explain` reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExplainVerbosity {
    /// Chosen plan only; the query is not run
    #[default]
    QueryPlanner,
    /// Chosen plan plus counters from running the query
    ExecutionStats,
}

impl ExplainVerbosity {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "queryPlanner" => Ok(ExplainVerbosity::QueryPlanner),
            "executionStats" | "allPlansExecution" => Ok(ExplainVerbosity::ExecutionStats),
            other => Err(BookshelfError::InvalidQuery(format!("unknown explain verbosity: {}", other))),
        }
    }
}

/// Counters gathered while executing a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub n_returned: usize,
    pub total_keys_examined: usize,
    pub total_docs_examined: usize,
    pub execution_time_millis: u64,
}

/// Query planner - analyzes queries and selects an execution plan
pub struct QueryPlanner;

impl QueryPlanner {
    /// Pick the index whose key pattern is best served by the filter.
    ///
    /// An index qualifies when its leading field carries an equality, `$in`
    /// or range predicate. Candidates are ranked by how many leading fields
    /// are pinned to single points, then by how many fields are bounded at
    /// all; ties go to the index created first.
    pub fn plan(query: &Query, indexes: &IndexManager) -> QueryPlan {
        let mut best: Option<(&Index, IndexBounds, (usize, usize))> = None;

        for index in indexes.indexes() {
            let Some(bounds) = Self::bounds_for(query, index) else {
                continue;
            };
            let score = Self::score(&bounds);
            if best.as_ref().map_or(true, |(_, _, s)| score > *s) {
                best = Some((index, bounds, score));
            }
        }

        match best {
            Some((index, bounds, _)) => QueryPlan::IndexScan { index_name: index.name().to_string(), bounds },
            None => QueryPlan::CollectionScan,
        }
    }

    fn bounds_for(query: &Query, index: &Index) -> Option<IndexBounds> {
        let fields = &index.definition().fields;
        let leading = Self::ranges_for(&query.operators_for(&fields[0].0))?;

        let mut bounds = vec![leading];
        for (field, _) in &fields[1..] {
            let ranges = Self::ranges_for(&query.operators_for(field)).unwrap_or_else(|| vec![KeyRange::all()]);
            bounds.push(ranges);
        }
        Some(IndexBounds { fields: bounds })
    }

    fn score(bounds: &IndexBounds) -> (usize, usize) {
        let pinned = bounds
            .fields
            .iter()
            .take_while(|ranges| ranges.iter().all(KeyRange::is_point))
            .count();
        let bounded = bounds
            .fields
            .iter()
            .filter(|ranges| !ranges.iter().any(|r| *r == KeyRange::all()))
            .count();
        (pinned, bounded)
    }

    /// Key ranges implied by the operators on one field, or `None` if
    /// nothing there narrows an index scan
    fn ranges_for(operators: &[&QueryOperator]) -> Option<Vec<KeyRange>> {
        // Equality is the tightest bound
        for op in operators {
            if let QueryOperator::Eq(target) = op {
                if IndexKey::is_indexable(target) {
                    return Some(vec![KeyRange::point(IndexKey::from_value(target))]);
                }
            }
        }

        for op in operators {
            if let QueryOperator::In(targets) = op {
                if !targets.is_empty() && targets.iter().all(IndexKey::is_indexable) {
                    let mut keys: Vec<IndexKey> = targets.iter().map(IndexKey::from_value).collect();
                    keys.sort();
                    keys.dedup();
                    return Some(keys.into_iter().map(KeyRange::point).collect());
                }
            }
        }

        let mut range: Option<KeyRange> = None;
        for op in operators {
            let next = match op {
                QueryOperator::Gt(t) if is_range_target(t) => KeyRange::above(IndexKey::from_value(t), false),
                QueryOperator::Gte(t) if is_range_target(t) => KeyRange::above(IndexKey::from_value(t), true),
                QueryOperator::Lt(t) if is_range_target(t) => KeyRange::below(IndexKey::from_value(t), false),
                QueryOperator::Lte(t) if is_range_target(t) => KeyRange::below(IndexKey::from_value(t), true),
                _ => continue,
            };
            range = Some(match range {
                Some(current) => current.intersect(next),
                None => next,
            });
        }
        range.map(|r| vec![r])
    }

    /// Explain document for a plan. `stats` is present for
    /// `executionStats` verbosity.
    pub fn explain(
        namespace: &str,
        filter: &Value,
        plan: &QueryPlan,
        indexes: &IndexManager,
        stats: Option<&ExecutionStats>,
    ) -> Value {
        let winning_plan = match plan {
            QueryPlan::CollectionScan => json!({
                "stage": "COLLSCAN",
                "filter": filter,
                "direction": "forward",
            }),
            QueryPlan::IndexScan { index_name, bounds } => {
                let mut stage = Map::new();
                stage.insert("stage".to_string(), json!("IXSCAN"));
                stage.insert("indexName".to_string(), json!(index_name));
                if let Some(index) = indexes.get(index_name) {
                    let definition = index.definition();
                    stage.insert("keyPattern".to_string(), definition.key_pattern());
                    stage.insert("isUnique".to_string(), json!(definition.unique));

                    let mut index_bounds = Map::new();
                    for ((field, _), ranges) in definition.fields.iter().zip(&bounds.fields) {
                        let labels: Vec<Value> = ranges.iter().map(|r| Value::String(r.to_string())).collect();
                        index_bounds.insert(field.clone(), Value::Array(labels));
                    }
                    stage.insert("indexBounds".to_string(), Value::Object(index_bounds));
                }
                stage.insert("filter".to_string(), filter.clone());
                Value::Object(stage)
            }
        };

        let available: Vec<Value> = indexes.list_indexes().into_iter().map(Value::String).collect();
        let mut explain = json!({
            "queryPlanner": {
                "namespace": namespace,
                "parsedQuery": filter,
                "indexFilterSet": false,
                "winningPlan": winning_plan,
                "rejectedPlans": [],
                "availableIndexes": available,
            }
        });

        if let (Some(stats), Value::Object(map)) = (stats, &mut explain) {
            map.insert(
                "executionStats".to_string(),
                json!({
                    "executionSuccess": true,
                    "nReturned": stats.n_returned,
                    "executionTimeMillis": stats.execution_time_millis,
                    "totalKeysExamined": stats.total_keys_examined,
                    "totalDocsExamined": stats.total_docs_examined,
                }),
            );
        }

        explain
    }
}

fn is_range_target(value: &Value) -> bool {
    matches!(value, Value::Number(_) | Value::String(_) | Value::Bool(_))
}
