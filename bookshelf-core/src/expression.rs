// src/expression.rs
// Aggregation expressions: field references, literals, arithmetic

use serde_json::{Map, Value};

use crate::error::{BookshelfError, Result};
use crate::value_order::whole_number;

/// Parsed aggregation expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// `"$field"`
    Field(String),
    Literal(Value),
    /// `{"a": <expr>, "b": <expr>}`, evaluated field by field
    Object(Vec<(String, Expression)>),
    Add(Vec<Expression>),
    Subtract(Box<Expression>, Box<Expression>),
    Multiply(Vec<Expression>),
    Divide(Box<Expression>, Box<Expression>),
    Mod(Box<Expression>, Box<Expression>),
    Floor(Box<Expression>),
    /// Decade bucket of a year, see [`decade_of`]
    Decade(Box<Expression>),
}

/// Decade bucket of a year: `floor(year / 10)`, so 2015 -> 201, 1999 -> 199.
pub fn decade_of(year: i64) -> i64 {
    year.div_euclid(10)
}

impl Expression {
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) if s.starts_with('$') => {
                let field = &s[1..];
                if field.is_empty() {
                    return Err(BookshelfError::AggregationError("empty field reference '$'".into()));
                }
                Ok(Expression::Field(field.to_string()))
            }
            Value::Object(map) if map.len() == 1 && map.keys().all(|k| k.starts_with('$')) => {
                match map.iter().next() {
                    Some((op, args)) => Self::parse_operator(op, args),
                    None => Ok(Expression::Literal(value.clone())),
                }
            }
            Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => Err(
                BookshelfError::AggregationError("expression object must have exactly one operator".into()),
            ),
            Value::Object(map) => {
                let fields = map
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), Self::from_json(v)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expression::Object(fields))
            }
            other => Ok(Expression::Literal(other.clone())),
        }
    }

    fn parse_operator(op: &str, args: &Value) -> Result<Self> {
        match op {
            "$add" => Ok(Expression::Add(Self::parse_args(op, args)?)),
            "$multiply" => Ok(Expression::Multiply(Self::parse_args(op, args)?)),
            "$subtract" => {
                let (a, b) = Self::parse_pair(op, args)?;
                Ok(Expression::Subtract(a, b))
            }
            "$divide" => {
                let (a, b) = Self::parse_pair(op, args)?;
                Ok(Expression::Divide(a, b))
            }
            "$mod" => {
                let (a, b) = Self::parse_pair(op, args)?;
                Ok(Expression::Mod(a, b))
            }
            "$floor" => Ok(Expression::Floor(Box::new(Self::parse_single(args)?))),
            "$decade" => Ok(Expression::Decade(Box::new(Self::parse_single(args)?))),
            "$literal" => Ok(Expression::Literal(args.clone())),
            _ => Err(BookshelfError::AggregationError(format!("Unknown expression operator: {}", op))),
        }
    }

    fn parse_args(op: &str, args: &Value) -> Result<Vec<Expression>> {
        match args {
            Value::Array(items) if !items.is_empty() => items.iter().map(Self::from_json).collect(),
            _ => Err(BookshelfError::AggregationError(format!("{} requires a non-empty array", op))),
        }
    }

    fn parse_pair(op: &str, args: &Value) -> Result<(Box<Expression>, Box<Expression>)> {
        match args {
            Value::Array(items) if items.len() == 2 => Ok((
                Box::new(Self::from_json(&items[0])?),
                Box::new(Self::from_json(&items[1])?),
            )),
            _ => Err(BookshelfError::AggregationError(format!("{} requires exactly two arguments", op))),
        }
    }

    /// Unary operators accept `x` or `[x]`
    fn parse_single(args: &Value) -> Result<Expression> {
        match args {
            Value::Array(items) if items.len() == 1 => Self::from_json(&items[0]),
            other => Self::from_json(other),
        }
    }

    /// Evaluate against one document. Missing fields and non-numeric
    /// arithmetic operands evaluate to null.
    pub fn evaluate(&self, doc: &Value) -> Value {
        match self {
            Expression::Field(field) => lookup(doc, field).cloned().unwrap_or(Value::Null),
            Expression::Literal(v) => v.clone(),
            Expression::Object(fields) => {
                let mut map = Map::with_capacity(fields.len());
                for (k, expr) in fields {
                    map.insert(k.clone(), expr.evaluate(doc));
                }
                Value::Object(map)
            }
            Expression::Add(args) => fold_numbers(args, doc, 0.0, |a, b| a + b),
            Expression::Multiply(args) => fold_numbers(args, doc, 1.0, |a, b| a * b),
            Expression::Subtract(a, b) => binary(a, b, doc, |x, y| Some(x - y)),
            Expression::Divide(a, b) => binary(a, b, doc, |x, y| if y == 0.0 { None } else { Some(x / y) }),
            // Sign follows the dividend, as with `%`
            Expression::Mod(a, b) => binary(a, b, doc, |x, y| if y == 0.0 { None } else { Some(x % y) }),
            Expression::Floor(a) => match as_f64(&a.evaluate(doc)) {
                Some(x) => number(x.floor()),
                None => Value::Null,
            },
            Expression::Decade(a) => match as_f64(&a.evaluate(doc)) {
                Some(year) => Value::from(decade_of(year.floor() as i64)),
                None => Value::Null,
            },
        }
    }
}

/// Dotted-path lookup (`"meta.pages"`)
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, part| current.get(part))
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Integral results become integers so group keys compare cleanly
pub(crate) fn number(x: f64) -> Value {
    match whole_number(x) {
        Some(i) => Value::from(i),
        None => serde_json::Number::from_f64(x).map(Value::Number).unwrap_or(Value::Null),
    }
}

fn binary(a: &Expression, b: &Expression, doc: &Value, op: impl Fn(f64, f64) -> Option<f64>) -> Value {
    match (as_f64(&a.evaluate(doc)), as_f64(&b.evaluate(doc))) {
        (Some(x), Some(y)) => op(x, y).map(number).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn fold_numbers(args: &[Expression], doc: &Value, init: f64, op: impl Fn(f64, f64) -> f64) -> Value {
    let mut acc = init;
    for arg in args {
        match as_f64(&arg.evaluate(doc)) {
            Some(x) => acc = op(acc, x),
            None => return Value::Null,
        }
    }
    number(acc)
}
