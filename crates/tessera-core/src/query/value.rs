//! Helpers shared by the in-memory evaluators.
//!
//! Decoded objects are plain JSON. Dates and decimals travel as tagged
//! envelopes (`{"$date": "..."}`, `{"$decimal": "..."}`) and references as
//! objects carrying an `_id`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::str::FromStr;

pub const DATE_TAG: &str = "$date";
pub const DECIMAL_TAG: &str = "$decimal";

static NULL: Value = Value::Null;

pub fn date_value(ts: DateTime<Utc>) -> Value {
    let mut map = Map::new();
    map.insert(DATE_TAG.to_string(), Value::String(ts.to_rfc3339()));
    Value::Object(map)
}

pub fn decimal_value(d: Decimal) -> Value {
    let mut map = Map::new();
    map.insert(DECIMAL_TAG.to_string(), Value::String(d.to_string()));
    Value::Object(map)
}

fn single_tag<'a>(v: &'a Value, tag: &str) -> Option<&'a str> {
    let obj = v.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    obj.get(tag)?.as_str()
}

pub fn as_date(v: &Value) -> Option<DateTime<Utc>> {
    let raw = single_tag(v, DATE_TAG)?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

pub fn as_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .ok()
            .or_else(|| n.as_f64().and_then(|f| Decimal::try_from(f).ok())),
        _ => single_tag(v, DECIMAL_TAG).and_then(|s| Decimal::from_str(s).ok()),
    }
}

pub fn is_tagged(v: &Value) -> bool {
    single_tag(v, DATE_TAG).is_some() || single_tag(v, DECIMAL_TAG).is_some()
}

/// Identifier of a referenced object: an object with `_id`, or a bare id string.
pub fn reference_id(v: &Value) -> Option<&str> {
    match v {
        Value::String(s) => Some(s),
        Value::Object(obj) if !is_tagged(v) => obj.get("_id").and_then(Value::as_str),
        _ => None,
    }
}

/// Walks a dotted path through objects and arrays. Missing segments yield null.
pub fn get_path<'a>(value: &'a Value, path: &str) -> &'a Value {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment).unwrap_or(&NULL),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i))
                .unwrap_or(&NULL),
            _ => &NULL,
        };
    }
    current
}

pub fn equals(a: &Value, b: &Value) -> bool {
    if a.is_null() || b.is_null() {
        return a.is_null() && b.is_null();
    }
    if let (Some(x), Some(y)) = (as_date(a), as_date(b)) {
        return x == y;
    }
    if is_numeric(a) && is_numeric(b) {
        return compare(a, b) == Some(Ordering::Equal);
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| equals(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            if let (Some(l), Some(r)) = (reference_id(a), reference_id(b)) {
                return l == r;
            }
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| equals(v, w)).unwrap_or(false))
        }
        (Value::Object(_), Value::String(_)) | (Value::String(_), Value::Object(_)) => {
            matches!((reference_id(a), reference_id(b)), (Some(l), Some(r)) if l == r)
        }
        _ => false,
    }
}

fn is_numeric(v: &Value) -> bool {
    v.is_number() || single_tag(v, DECIMAL_TAG).is_some()
}

/// Ordering between two values of the same logical type; `None` when incomparable.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    if let (Some(x), Some(y)) = (as_date(a), as_date(b)) {
        return Some(x.cmp(&y));
    }
    if is_numeric(a) && is_numeric(b) {
        if let (Value::Number(x), Value::Number(y)) = (a, b) {
            return x.as_f64()?.partial_cmp(&y.as_f64()?);
        }
        return Some(as_decimal(a)?.cmp(&as_decimal(b)?));
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

pub fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        _ => as_decimal(v).and_then(|d| d.to_string().parse().ok()),
    }
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tagged_values_compare_by_meaning() {
        let a = json!({"$date": "2024-01-01T00:00:00Z"});
        let b = json!({"$date": "2024-01-01T01:00:00+01:00"});
        assert!(equals(&a, &b));
        let c = json!({"$decimal": "1.50"});
        assert_eq!(compare(&c, &json!(1.5)), Some(Ordering::Equal));
        assert_eq!(compare(&json!("b"), &json!("a")), Some(Ordering::Greater));
        assert_eq!(compare(&json!("1"), &json!(1)), None);
    }

    #[test]
    fn references_compare_by_id() {
        assert!(equals(&json!({"_id": "x", "name": "a"}), &json!({"_id": "x"})));
        assert!(equals(&json!({"_id": "x"}), &json!("x")));
        assert!(!equals(&json!({"_id": "x"}), &json!({"_id": "y"})));
    }

    #[test]
    fn path_walks_arrays() {
        let v = json!({"tags": [{"name": "a"}, {"name": "b"}]});
        assert_eq!(get_path(&v, "tags.1.name"), &json!("b"));
        assert!(get_path(&v, "tags.5.name").is_null());
        assert!(get_path(&v, "nope.x").is_null());
    }
}
