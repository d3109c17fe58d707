// src/value_order.rs
// Ordering rules for JSON values, shared by sort, index and aggregation

use std::cmp::Ordering;
use serde_json::Value;

/// Type rank for mixed-type ordering:
/// null < number < string < bool < object < array
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Bool(_) => 3,
        Value::Object(_) => 4,
        Value::Array(_) => 5,
    }
}

/// Total order over JSON values. Numbers compare numerically regardless of
/// integer/float representation.
pub fn total_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(n1), Value::Number(n2)) => {
            let f1 = n1.as_f64().unwrap_or(0.0);
            let f2 = n2.as_f64().unwrap_or(0.0);
            match (n1.as_i64(), n2.as_i64()) {
                (Some(i1), Some(i2)) => i1.cmp(&i2),
                (Some(i1), None) => cmp_int_float(i1, f2),
                (None, Some(i2)) => cmp_int_float(i2, f1).reverse(),
                (None, None) => f1.partial_cmp(&f2).unwrap_or_else(|| f1.total_cmp(&f2)),
            }
        }
        (Value::String(s1), Value::String(s2)) => s1.cmp(s2),
        (Value::Bool(b1), Value::Bool(b2)) => b1.cmp(b2),
        (Value::Array(a1), Value::Array(a2)) => {
            for (x, y) in a1.iter().zip(a2.iter()) {
                let cmp = total_cmp(x, y);
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            a1.len().cmp(&a2.len())
        }
        (Value::Object(o1), Value::Object(o2)) => {
            for ((k1, v1), (k2, v2)) in o1.iter().zip(o2.iter()) {
                let cmp = k1.cmp(k2).then_with(|| total_cmp(v1, v2));
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            o1.len().cmp(&o2.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// 2^63, the first float above every i64
const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;

/// The integer a whole-number float stands for, if it fits in i64
pub fn whole_number(x: f64) -> Option<i64> {
    if x.is_finite() && x.fract() == 0.0 && (-I64_LIMIT..I64_LIMIT).contains(&x) {
        Some(x as i64)
    } else {
        None
    }
}

/// Exact numeric comparison of an integer with a float. Whole floats compare
/// as integers, so `2^53 + 1` and `2^53 as f64` stay distinct.
pub fn cmp_int_float(i: i64, f: f64) -> Ordering {
    match whole_number(f) {
        Some(w) => i.cmp(&w),
        None if f >= I64_LIMIT => Ordering::Less,
        None if f < -I64_LIMIT => Ordering::Greater,
        // Fractional floats lie within +-2^52, where the cast cannot tie
        None => (i as f64).partial_cmp(&f).unwrap_or(Ordering::Less),
    }
}

/// Same as `total_cmp`, with a missing field sorting just before null.
pub fn cmp_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => total_cmp(a, b),
    }
}

/// Comparison used by filter operators: only values of the same kind are
/// comparable (`$gt: 2010` never matches a string).
pub fn comparable_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_))
        | (Value::String(_), Value::String(_))
        | (Value::Bool(_), Value::Bool(_)) => Some(total_cmp(a, b)),
        _ => None,
    }
}

/// Equality with numeric normalization (`50 == 50.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => total_cmp(a, b) == Ordering::Equal,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numbers_compare_across_representations() {
        assert_eq!(total_cmp(&json!(10), &json!(10.0)), Ordering::Equal);
        assert_eq!(total_cmp(&json!(9), &json!(9.5)), Ordering::Less);
        assert_eq!(total_cmp(&json!(-1), &json!(-2.5)), Ordering::Greater);
    }

    #[test]
    fn test_large_numbers_compare_exactly() {
        assert_eq!(total_cmp(&json!(9_500_000_000_000_000i64), &json!(9.5e15)), Ordering::Equal);
        assert_eq!(total_cmp(&json!(9_007_199_254_740_993i64), &json!(9_007_199_254_740_992.0)), Ordering::Greater);
        assert_eq!(total_cmp(&json!(i64::MAX), &json!(1e19)), Ordering::Less);
        assert_eq!(total_cmp(&json!(-0.0), &json!(0)), Ordering::Equal);
        assert_eq!(whole_number(2015.0), Some(2015));
        assert_eq!(whole_number(2015.5), None);
        assert_eq!(whole_number(1e19), None);
    }

    #[test]
    fn test_mixed_types_use_rank() {
        assert_eq!(total_cmp(&json!(null), &json!(0)), Ordering::Less);
        assert_eq!(total_cmp(&json!(100), &json!("a")), Ordering::Less);
        assert_eq!(total_cmp(&json!("z"), &json!(false)), Ordering::Less);
        assert_eq!(total_cmp(&json!(true), &json!({})), Ordering::Less);
        assert_eq!(total_cmp(&json!({}), &json!([])), Ordering::Less);
    }

    #[test]
    fn test_missing_orders_before_everything() {
        assert_eq!(cmp_optional(None, Some(&json!(1))), Ordering::Less);
        assert_eq!(cmp_optional(Some(&json!("a")), None), Ordering::Greater);
        assert_eq!(cmp_optional(None, None), Ordering::Equal);
        assert_eq!(cmp_optional(None, Some(&json!(null))), Ordering::Less);
    }

    #[test]
    fn test_comparable_cmp_rejects_mixed() {
        assert_eq!(comparable_cmp(&json!(2015), &json!(2010)), Some(Ordering::Greater));
        assert_eq!(comparable_cmp(&json!("2015"), &json!(2010)), None);
        assert_eq!(comparable_cmp(&json!(null), &json!(null)), None);
    }

    #[test]
    fn test_values_equal_normalizes_numbers() {
        assert!(values_equal(&json!(50), &json!(50.0)));
        assert!(!values_equal(&json!(50), &json!("50")));
        assert!(values_equal(&json!({"a": 1}), &json!({"a": 1})));
    }
}
