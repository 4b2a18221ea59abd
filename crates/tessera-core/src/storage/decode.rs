//! Folds flat projection rows back into typed objects.

use crate::error::{Result, TesseraError};
use crate::schema::{DataType, Schema, ID_FIELD};
use crate::sql::Dialect;
use serde_json::{Map, Value};

/// Folds a row keyed by dotted projection aliases into a nested object.
/// Group match aliases (`$rel.name`) are kept verbatim at the top level.
pub fn decode_row(
    schema: &Schema,
    dialect: &dyn Dialect,
    class_name: &str,
    row: Map<String, Value>,
) -> Result<Value> {
    let mut out = Map::new();
    for (key, value) in row {
        if key.starts_with('$') {
            out.insert(key, value);
            continue;
        }
        let segments: Vec<&str> = key.split('.').collect();
        place(schema, dialect, class_name, &mut out, &segments, value)?;
    }
    clear_missing_pointers(schema, class_name, &mut out)?;
    Ok(Value::Object(out))
}

fn place(
    schema: &Schema,
    dialect: &dyn Dialect,
    class_name: &str,
    out: &mut Map<String, Value>,
    segments: &[&str],
    value: Value,
) -> Result<()> {
    let class = schema.class(class_name)?;
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return Ok(()),
    };
    let ty = class
        .field(head)
        .ok_or_else(|| TesseraError::InvalidPath(format!("{class_name}.{head} in result row")))?;
    place_typed(schema, dialect, ty, out, head, rest, value)
}

fn place_typed(
    schema: &Schema,
    dialect: &dyn Dialect,
    ty: &DataType,
    out: &mut Map<String, Value>,
    head: &str,
    rest: &[&str],
    value: Value,
) -> Result<()> {
    match (ty, rest.is_empty()) {
        (DataType::Shape { fields }, false) => {
            let slot = child_object(out, head)?;
            let sub = rest[0];
            let sub_ty = fields
                .get(sub)
                .ok_or_else(|| TesseraError::InvalidPath(format!("{head}.{sub} in result row")))?;
            place_typed(schema, dialect, sub_ty, slot, sub, &rest[1..], value)
        }
        (DataType::Pointer { target }, false) => {
            let slot = child_object(out, head)?;
            place(schema, dialect, target, slot, rest, value)
        }
        (DataType::Relation { target, .. }, true) => {
            let decoded = match value {
                Value::Array(items) if items.iter().all(Value::is_object) => Value::Array(
                    items
                        .into_iter()
                        .map(|item| match item {
                            Value::Object(member) => decode_row(schema, dialect, target, member),
                            other => Ok(other),
                        })
                        .collect::<Result<_>>()?,
                ),
                other => dialect.decode_value(ty, other)?,
            };
            out.insert(head.to_string(), decoded);
            Ok(())
        }
        (_, true) => {
            out.insert(head.to_string(), dialect.decode_value(ty, value)?);
            Ok(())
        }
        (_, false) => Err(TesseraError::InvalidPath(format!(
            "{head}.{} in result row",
            rest.join(".")
        ))),
    }
}

fn child_object<'m>(out: &'m mut Map<String, Value>, key: &str) -> Result<&'m mut Map<String, Value>> {
    let slot = out
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    slot.as_object_mut()
        .ok_or_else(|| TesseraError::InvalidDataType(format!("{key} is not an object")))
}

/// A LEFT JOIN that found nothing projects a null `_id`; such pointers are null.
fn clear_missing_pointers(schema: &Schema, class_name: &str, out: &mut Map<String, Value>) -> Result<()> {
    let class = schema.class(class_name)?;
    for (field, value) in out.iter_mut() {
        let Some(ty) = class.field(field) else {
            continue;
        };
        clear_in(schema, ty, value)?;
    }
    Ok(())
}

fn clear_in(schema: &Schema, ty: &DataType, value: &mut Value) -> Result<()> {
    match (ty, &mut *value) {
        (DataType::Pointer { target }, Value::Object(obj)) => {
            if obj.get(ID_FIELD).map_or(true, Value::is_null) {
                *value = Value::Null;
            } else {
                clear_missing_pointers(schema, target, obj)?;
            }
        }
        (DataType::Shape { fields }, Value::Object(obj)) => {
            for (sub, sub_value) in obj.iter_mut() {
                if let Some(sub_ty) = fields.get(sub) {
                    clear_in(schema, sub_ty, sub_value)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::sample_schema;
    use crate::sql::PostgresDialect;
    use serde_json::json;

    fn row(raw: Value) -> Map<String, Value> {
        raw.as_object().cloned().unwrap()
    }

    #[test]
    fn dotted_keys_fold_into_objects() {
        let schema = sample_schema();
        let decoded = decode_row(
            &schema,
            &PostgresDialect,
            "Note",
            row(json!({
                "_id": "n1",
                "price": "12.50",
                "_created_at": "2024-01-02T03:04:05+00:00",
                "address.city": "Oslo",
                "address.geo.lat": 59.9,
                "author._id": "u1",
                "author.name": "ann",
                "author.company._id": null,
                "tags": [{"_id": "t1", "name": "a"}],
                "comments": null,
                "$comments.total": 3
            })),
        )
        .unwrap();
        assert_eq!(decoded["address"], json!({"city": "Oslo", "geo": {"lat": 59.9}}));
        assert_eq!(decoded["author"]["name"], json!("ann"));
        assert_eq!(decoded["author"]["company"], Value::Null);
        assert_eq!(decoded["price"], json!({"$decimal": "12.50"}));
        assert!(decoded["_created_at"]["$date"].is_string());
        assert_eq!(decoded["tags"][0]["name"], json!("a"));
        assert_eq!(decoded["comments"], json!([]));
        assert_eq!(decoded["$comments.total"], json!(3));
    }

    #[test]
    fn missing_pointer_target_is_null() {
        let schema = sample_schema();
        let decoded = decode_row(
            &schema,
            &PostgresDialect,
            "Note",
            row(json!({"_id": "n1", "author._id": null, "author.name": null})),
        )
        .unwrap();
        assert_eq!(decoded["author"], Value::Null);
    }

    #[test]
    fn unknown_columns_fail() {
        let schema = sample_schema();
        let err = decode_row(&schema, &PostgresDialect, "Note", row(json!({"nope": 1}))).unwrap_err();
        assert!(matches!(err, TesseraError::InvalidPath(_)));
    }
}
