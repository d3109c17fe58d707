// src/aggregation.rs
// Aggregation pipeline implementation

use ahash::AHashMap;
use serde_json::{Map, Value};

use crate::document::ID_FIELD;
use crate::error::{BookshelfError, Result};
use crate::expression::{lookup, number, Expression};
use crate::find_options::SortDirection;
use crate::query::Query;
use crate::value_order::{cmp_optional, total_cmp};

/// Aggregation pipeline
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

/// Pipeline stage
#[derive(Debug, Clone)]
pub enum Stage {
    Match(MatchStage),
    Project(ProjectStage),
    Group(GroupStage),
    Sort(SortStage),
    Limit(LimitStage),
    Skip(SkipStage),
    Count(CountStage),
}

/// $match stage - filter documents
#[derive(Debug, Clone)]
pub struct MatchStage {
    query: Query,
}

/// $project stage - reshape documents
#[derive(Debug, Clone)]
pub struct ProjectStage {
    fields: Vec<(String, ProjectField)>,
    include_id: bool,
}

#[derive(Debug, Clone)]
pub enum ProjectField {
    Include,                    // 1
    Exclude,                    // 0
    Computed(Expression),       // "$field" or an expression
}

/// $group stage - group documents and compute aggregates
#[derive(Debug, Clone)]
pub struct GroupStage {
    /// `Literal(Null)` puts every document in one group
    id: Expression,
    accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum(Expression),            // {"$sum": 1} counts, {"$sum": "$price"} sums
    Avg(Expression),
    Min(Expression),
    Max(Expression),
    First(Expression),
    Last(Expression),
    Push(Expression),
    Count,                      // {"$count": {}}
}

/// $sort stage - stable, so ties keep their input order
#[derive(Debug, Clone)]
pub struct SortStage {
    fields: Vec<(String, SortDirection)>,
}

/// $limit stage - limit number of documents
#[derive(Debug, Clone)]
pub struct LimitStage {
    limit: usize,
}

/// $skip stage - skip documents
#[derive(Debug, Clone)]
pub struct SkipStage {
    skip: usize,
}

/// $count stage - replace the stream with `{<field>: n}`
#[derive(Debug, Clone)]
pub struct CountStage {
    field: String,
}

impl Pipeline {
    /// Create pipeline from JSON array
    pub fn from_json(pipeline_json: &Value) -> Result<Self> {
        match pipeline_json {
            Value::Array(stages_array) if stages_array.is_empty() => {
                Err(BookshelfError::AggregationError("Pipeline cannot be empty".to_string()))
            }
            Value::Array(stages_array) => {
                let stages = stages_array.iter().map(Stage::from_json).collect::<Result<Vec<_>>>()?;
                Ok(Pipeline { stages })
            }
            _ => Err(BookshelfError::AggregationError("Pipeline must be an array".to_string())),
        }
    }

    /// Execute pipeline; each stage consumes the previous stage's output
    pub fn execute(&self, mut docs: Vec<Value>) -> Result<Vec<Value>> {
        for stage in &self.stages {
            docs = stage.execute(docs)?;
        }
        Ok(docs)
    }

    /// Leading `$match` filter, which the collection can push down
    pub fn leading_match(&self) -> Option<&Query> {
        match self.stages.first() {
            Some(Stage::Match(stage)) => Some(&stage.query),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Stage {
    fn from_json(stage_json: &Value) -> Result<Self> {
        let obj = match stage_json {
            Value::Object(obj) if obj.len() == 1 => obj,
            Value::Object(_) => {
                return Err(BookshelfError::AggregationError(
                    "Each stage must have exactly one operator".to_string(),
                ))
            }
            _ => return Err(BookshelfError::AggregationError("Stage must be an object".to_string())),
        };

        let Some((stage_name, spec)) = obj.iter().next() else {
            return Err(BookshelfError::AggregationError("Empty stage".to_string()));
        };

        match stage_name.as_str() {
            "$match" => Ok(Stage::Match(MatchStage { query: Query::from_json(spec)? })),
            "$project" => Ok(Stage::Project(ProjectStage::from_json(spec)?)),
            "$group" => Ok(Stage::Group(GroupStage::from_json(spec)?)),
            "$sort" => Ok(Stage::Sort(SortStage::from_json(spec)?)),
            "$limit" => Ok(Stage::Limit(LimitStage { limit: positive(spec, "$limit")? })),
            "$skip" => Ok(Stage::Skip(SkipStage { skip: non_negative(spec, "$skip")? })),
            "$count" => Ok(Stage::Count(CountStage::from_json(spec)?)),
            _ => Err(BookshelfError::AggregationError(format!("Unknown pipeline stage: {}", stage_name))),
        }
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        match self {
            Stage::Match(stage) => Ok(docs.into_iter().filter(|d| stage.query.matches_value(d)).collect()),
            Stage::Project(stage) => Ok(docs.iter().map(|d| stage.project_document(d)).collect()),
            Stage::Group(stage) => Ok(stage.execute(docs)),
            Stage::Sort(stage) => Ok(stage.execute(docs)),
            Stage::Limit(stage) => Ok(docs.into_iter().take(stage.limit).collect()),
            Stage::Skip(stage) => Ok(docs.into_iter().skip(stage.skip).collect()),
            Stage::Count(stage) => Ok(stage.execute(docs)),
        }
    }
}

fn non_negative(spec: &Value, stage: &str) -> Result<usize> {
    spec.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| BookshelfError::AggregationError(format!("{} must be a non-negative integer", stage)))
}

fn positive(spec: &Value, stage: &str) -> Result<usize> {
    match non_negative(spec, stage)? {
        0 => Err(BookshelfError::AggregationError(format!("{} must be positive", stage))),
        n => Ok(n),
    }
}

impl ProjectStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| BookshelfError::AggregationError("$project must be an object".to_string()))?;

        let mut fields = Vec::new();
        let mut include_id = true;

        for (field, value) in obj {
            let action = match value {
                Value::Bool(b) => if *b { ProjectField::Include } else { ProjectField::Exclude },
                Value::Number(n) if n.as_i64() == Some(1) => ProjectField::Include,
                Value::Number(n) if n.as_i64() == Some(0) => ProjectField::Exclude,
                other => ProjectField::Computed(Expression::from_json(other)?),
            };

            if field == ID_FIELD {
                match action {
                    ProjectField::Exclude => include_id = false,
                    ProjectField::Include => include_id = true,
                    computed => fields.push((field.clone(), computed)),
                }
            } else {
                fields.push((field.clone(), action));
            }
        }

        let has_inclusions = fields.iter().any(|(_, a)| !matches!(a, ProjectField::Exclude));
        let has_exclusions = fields.iter().any(|(_, a)| matches!(a, ProjectField::Exclude));
        if has_inclusions && has_exclusions {
            return Err(BookshelfError::AggregationError(
                "$project cannot mix inclusion and exclusion".to_string(),
            ));
        }

        Ok(ProjectStage { fields, include_id })
    }

    fn project_document(&self, doc: &Value) -> Value {
        let mut result = Map::new();
        let Value::Object(obj) = doc else {
            return doc.clone();
        };

        let exclude_mode = self.fields.iter().all(|(_, a)| matches!(a, ProjectField::Exclude));

        if exclude_mode {
            for (key, value) in obj {
                if key == ID_FIELD && !self.include_id {
                    continue;
                }
                if !self.fields.iter().any(|(f, _)| f == key) {
                    result.insert(key.clone(), value.clone());
                }
            }
            return Value::Object(result);
        }

        if self.include_id {
            if let Some(id) = obj.get(ID_FIELD) {
                result.insert(ID_FIELD.to_string(), id.clone());
            }
        }
        for (field, action) in &self.fields {
            match action {
                ProjectField::Include => {
                    if let Some(value) = lookup(doc, field) {
                        result.insert(field.clone(), value.clone());
                    }
                }
                ProjectField::Computed(expr) => {
                    result.insert(field.clone(), expr.evaluate(doc));
                }
                ProjectField::Exclude => {}
            }
        }

        Value::Object(result)
    }
}

impl GroupStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| BookshelfError::AggregationError("$group must be an object".to_string()))?;

        let id_value = obj
            .get(ID_FIELD)
            .ok_or_else(|| BookshelfError::AggregationError("Group stage must have _id field".to_string()))?;
        let id = Expression::from_json(id_value)?;

        let mut accumulators = Vec::new();
        for (field, value) in obj {
            if field == ID_FIELD {
                continue;
            }
            if field.starts_with('$') || field.contains('.') {
                return Err(BookshelfError::AggregationError(format!(
                    "Invalid accumulator output field: {}",
                    field
                )));
            }
            accumulators.push((field.clone(), Accumulator::from_json(value)?));
        }

        Ok(GroupStage { id, accumulators })
    }

    /// Groups come out in the order their first member was seen
    fn execute(&self, docs: Vec<Value>) -> Vec<Value> {
        let mut slots: AHashMap<String, usize> = AHashMap::new();
        let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();

        for doc in docs {
            let key = normalize(self.id.evaluate(&doc));
            let slot_key = key.to_string();
            match slots.get(&slot_key) {
                Some(&slot) => groups[slot].1.push(doc),
                None => {
                    slots.insert(slot_key, groups.len());
                    groups.push((key, vec![doc]));
                }
            }
        }

        groups
            .into_iter()
            .map(|(key, members)| {
                let mut result = Map::new();
                result.insert(ID_FIELD.to_string(), key);
                for (field, accumulator) in &self.accumulators {
                    result.insert(field.clone(), accumulator.compute(&members));
                }
                Value::Object(result)
            })
            .collect()
    }
}

/// Integral floats become integers so `2015` and `2015.0` share a group
fn normalize(value: Value) -> Value {
    match value {
        Value::Number(n) if !n.is_i64() && !n.is_u64() => n.as_f64().map(number).unwrap_or(Value::Null),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, normalize(v))).collect()),
        other => other,
    }
}

impl Accumulator {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = match spec {
            Value::Object(obj) if obj.len() == 1 => obj,
            _ => {
                return Err(BookshelfError::AggregationError(
                    "Accumulator must be an object with exactly one operator".to_string(),
                ))
            }
        };
        let Some((op, arg)) = obj.iter().next() else {
            return Err(BookshelfError::AggregationError("Empty accumulator".to_string()));
        };

        let expr = || Expression::from_json(arg);
        match op.as_str() {
            "$sum" => Ok(Accumulator::Sum(expr()?)),
            "$avg" => Ok(Accumulator::Avg(expr()?)),
            "$min" => Ok(Accumulator::Min(expr()?)),
            "$max" => Ok(Accumulator::Max(expr()?)),
            "$first" => Ok(Accumulator::First(expr()?)),
            "$last" => Ok(Accumulator::Last(expr()?)),
            "$push" => Ok(Accumulator::Push(expr()?)),
            "$count" => match arg {
                Value::Object(o) if o.is_empty() => Ok(Accumulator::Count),
                _ => Err(BookshelfError::AggregationError("$count takes an empty object".to_string())),
            },
            _ => Err(BookshelfError::AggregationError(format!("Unknown accumulator: {}", op))),
        }
    }

    fn compute(&self, docs: &[Value]) -> Value {
        match self {
            Accumulator::Count => Value::from(docs.len() as i64),

            Accumulator::Sum(expr) => {
                let mut sum_int: i64 = 0;
                let mut sum_float: f64 = 0.0;
                let mut has_float = false;

                for doc in docs {
                    let value = expr.evaluate(doc);
                    if let Some(n) = value.as_i64() {
                        match sum_int.checked_add(n) {
                            Some(s) => sum_int = s,
                            None => {
                                sum_float += n as f64;
                                has_float = true;
                            }
                        }
                    } else if let Some(f) = value.as_f64() {
                        sum_float += f;
                        has_float = true;
                    }
                }

                if has_float {
                    number(sum_float + sum_int as f64)
                } else {
                    Value::from(sum_int)
                }
            }

            Accumulator::Avg(expr) => {
                let values: Vec<f64> = docs.iter().filter_map(|d| expr.evaluate(d).as_f64()).collect();
                if values.is_empty() {
                    Value::Null
                } else {
                    number(values.iter().sum::<f64>() / values.len() as f64)
                }
            }

            Accumulator::Min(expr) => docs
                .iter()
                .map(|d| expr.evaluate(d))
                .filter(|v| !v.is_null())
                .min_by(total_cmp_owned)
                .unwrap_or(Value::Null),

            Accumulator::Max(expr) => docs
                .iter()
                .map(|d| expr.evaluate(d))
                .filter(|v| !v.is_null())
                .max_by(total_cmp_owned)
                .unwrap_or(Value::Null),

            Accumulator::First(expr) => docs.first().map(|d| expr.evaluate(d)).unwrap_or(Value::Null),

            Accumulator::Last(expr) => docs.last().map(|d| expr.evaluate(d)).unwrap_or(Value::Null),

            Accumulator::Push(expr) => Value::Array(docs.iter().map(|d| expr.evaluate(d)).collect()),
        }
    }
}

fn total_cmp_owned(a: &Value, b: &Value) -> std::cmp::Ordering {
    total_cmp(a, b)
}

impl SortStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = match spec {
            Value::Object(obj) if !obj.is_empty() => obj,
            _ => return Err(BookshelfError::AggregationError("$sort must be a non-empty object".to_string())),
        };

        let fields = obj
            .iter()
            .map(|(field, dir)| {
                SortDirection::from_json(dir)
                    .map(|d| (field.clone(), d))
                    .map_err(|_| BookshelfError::AggregationError("Sort direction must be 1 or -1".to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SortStage { fields })
    }

    fn execute(&self, mut docs: Vec<Value>) -> Vec<Value> {
        docs.sort_by(|a, b| {
            for (field, direction) in &self.fields {
                let cmp = direction.apply(cmp_optional(lookup(a, field), lookup(b, field)));
                if cmp != std::cmp::Ordering::Equal {
                    return cmp;
                }
            }
            std::cmp::Ordering::Equal
        });
        docs
    }
}

impl CountStage {
    fn from_json(spec: &Value) -> Result<Self> {
        match spec.as_str() {
            Some(field) if !field.is_empty() && !field.starts_with('$') && !field.contains('.') => {
                Ok(CountStage { field: field.to_string() })
            }
            _ => Err(BookshelfError::AggregationError(
                "$count requires a non-empty field name without '$' or '.'".to_string(),
            )),
        }
    }

    fn execute(&self, docs: Vec<Value>) -> Vec<Value> {
        if docs.is_empty() {
            return Vec::new();
        }
        let mut result = Map::new();
        result.insert(self.field.clone(), Value::from(docs.len() as i64));
        vec![Value::Object(result)]
    }
}
