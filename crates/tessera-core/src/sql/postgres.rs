use super::dialect::{Dialect, Operand, UpdateOp};
use super::fragment::{Sql, SqlValue};
use crate::error::{Result, TesseraError};
use crate::query::value::{
    as_date, as_decimal, as_f64, date_value, decimal_value, reference_id, DATE_TAG, DECIMAL_TAG,
};
use crate::query::{ComparisonOp, DistanceKind, FieldExpr, SortOrder};
use crate::schema::{object_token, split_token, DataType, PrimitiveKind};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

fn coalesce_false(pred: Sql) -> Sql {
    Sql::raw("COALESCE(").push(pred).push_raw(", false)")
}

fn jsonb_typeof(sql: &Sql, ty: &str) -> Sql {
    Sql::raw("jsonb_typeof(")
        .push(sql.clone())
        .push_raw(") = ")
        .push_str(ty)
}

fn json_text(sql: &Sql) -> Sql {
    Sql::raw("(").push(sql.clone()).push_raw(" #>> '{}')")
}

fn json_numeric(sql: &Sql) -> Sql {
    Sql::raw("CASE jsonb_typeof(")
        .push(sql.clone())
        .push_raw(") WHEN 'number' THEN (")
        .push(sql.clone())
        .push_raw(")::numeric WHEN 'object' THEN ((")
        .push(sql.clone())
        .push_raw(") ->> ")
        .push_str(DECIMAL_TAG)
        .push_raw(")::numeric END")
}

fn json_array(sql: &Sql) -> Sql {
    Sql::raw("COALESCE(CASE WHEN ")
        .push(jsonb_typeof(sql, "array"))
        .push_raw(" THEN ")
        .push(sql.clone())
        .push_raw(" END, '[]'::jsonb)")
}

fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    as_date(value).or_else(|| {
        value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
    })
}

fn is_numeric_literal(value: &Value) -> bool {
    value.is_number() || value.get(DECIMAL_TAG).is_some()
}

/// Typed parameter for a scalar literal, `None` when the types cannot match.
fn literal(kind: PrimitiveKind, value: &Value) -> Option<SqlValue> {
    match kind {
        PrimitiveKind::Boolean => value.as_bool().map(SqlValue::Bool),
        PrimitiveKind::Number if is_numeric_literal(value) => as_f64(value).map(SqlValue::Float),
        PrimitiveKind::Decimal if is_numeric_literal(value) => {
            as_decimal(value).map(|d| SqlValue::Decimal(d.to_string()))
        }
        PrimitiveKind::String => value.as_str().map(|s| SqlValue::Text(s.to_string())),
        PrimitiveKind::Date => as_date(value).map(SqlValue::Timestamp),
        _ => None,
    }
}

fn array_param(element: PrimitiveKind, items: Vec<SqlValue>) -> SqlValue {
    match element {
        PrimitiveKind::Number => SqlValue::FloatArray(
            items
                .into_iter()
                .filter_map(|v| match v {
                    SqlValue::Float(f) => Some(f),
                    _ => None,
                })
                .collect(),
        ),
        _ => SqlValue::TextArray(
            items
                .into_iter()
                .filter_map(|v| match v {
                    SqlValue::Text(s) => Some(s),
                    _ => None,
                })
                .collect(),
        ),
    }
}

fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn list_of(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn dedupe(items: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

#[derive(Clone, Copy)]
enum SetOp {
    Subset,
    Superset,
    Intersect,
}

impl PostgresDialect {
    fn null_test(&self, operand: &Operand, is_null: bool) -> Sql {
        let pred = match operand {
            Operand::Json(sql) => Sql::raw("(")
                .push(sql.clone())
                .push_raw(" IS NULL OR ")
                .push(sql.clone())
                .push_raw(" = 'null'::jsonb)"),
            Operand::Tokens { .. } => Sql::raw("false"),
            other => other.sql().clone().parens().push_raw(" IS NULL"),
        };
        if is_null {
            pred
        } else {
            pred.not()
        }
    }

    /// Left-hand SQL and parameter for a JSON value compared to a literal.
    /// The flag tells whether ordering comparisons are meaningful.
    fn json_typed(&self, sql: &Sql, value: &Value) -> Option<(Sql, SqlValue, bool)> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some((
                Sql::raw("CASE WHEN ")
                    .push(jsonb_typeof(sql, "boolean"))
                    .push_raw(" THEN (")
                    .push(sql.clone())
                    .push_raw(")::boolean END"),
                SqlValue::Bool(*b),
                true,
            )),
            Value::String(s) => Some((
                Sql::raw("CASE WHEN ")
                    .push(jsonb_typeof(sql, "string"))
                    .push_raw(" THEN ")
                    .push(json_text(sql))
                    .push_raw(" END"),
                SqlValue::Text(s.clone()),
                true,
            )),
            _ if is_numeric_literal(value) => as_decimal(value)
                .map(|d| (json_numeric(sql), SqlValue::Decimal(d.to_string()), true)),
            _ if as_date(value).is_some() => as_date(value).map(|d| {
                (
                    Sql::raw("CASE WHEN ")
                        .push(jsonb_typeof(sql, "object"))
                        .push_raw(" THEN ((")
                        .push(sql.clone())
                        .push_raw(") ->> ")
                        .push_str(DATE_TAG)
                        .push_raw(")::timestamptz END"),
                    SqlValue::Timestamp(d),
                    true,
                )
            }),
            other => Some((sql.clone(), SqlValue::Json(other.clone()), false)),
        }
    }

    fn comparison(&self, operand: &Operand, op: ComparisonOp, rhs: &Value) -> Sql {
        if rhs.is_null() {
            return match op {
                ComparisonOp::Eq => self.null_test(operand, true),
                ComparisonOp::Ne => self.null_test(operand, false),
                _ => Sql::raw("false"),
            };
        }
        let typed = match operand {
            Operand::Scalar { sql, kind } => literal(*kind, rhs).map(|p| (sql.clone(), p, true)),
            Operand::Json(sql) => self.json_typed(sql, rhs),
            Operand::Array { sql, element } => match rhs {
                Value::Array(items) => items
                    .iter()
                    .map(|i| literal(*element, i))
                    .collect::<Option<Vec<_>>>()
                    .map(|items| (sql.clone(), array_param(*element, items), false)),
                _ => None,
            },
            Operand::Token { sql, target } => reference_id(rhs)
                .map(|id| (sql.clone(), SqlValue::Text(object_token(target, id)), false)),
            Operand::Tokens { sql, target } => match rhs {
                Value::Array(items) => items
                    .iter()
                    .map(|i| reference_id(i).map(|id| object_token(target, id)))
                    .collect::<Option<Vec<_>>>()
                    .map(|tokens| (sql.clone(), SqlValue::TextArray(tokens), false)),
                _ => None,
            },
        };
        let Some((lhs, param, orderable)) = typed else {
            return Sql::raw(if op == ComparisonOp::Ne { "true" } else { "false" });
        };
        let compare = |sql_op: &str| {
            coalesce_false(
                lhs.clone()
                    .push_raw(format!(" {sql_op} "))
                    .push_param(param.clone()),
            )
        };
        match op {
            ComparisonOp::Eq => compare("="),
            ComparisonOp::Ne => compare("=").not(),
            _ if !orderable => Sql::raw("false"),
            other => compare(other.sql_operator()),
        }
    }

    fn string_test(&self, operand: &Operand, build: impl Fn(Sql) -> Sql) -> Sql {
        match operand {
            Operand::Scalar {
                sql,
                kind: PrimitiveKind::String,
            } => coalesce_false(build(sql.clone())),
            Operand::Json(sql) => coalesce_false(
                Sql::raw("CASE WHEN ")
                    .push(jsonb_typeof(sql, "string"))
                    .push_raw(" THEN ")
                    .push(build(json_text(sql)))
                    .push_raw(" END"),
            ),
            _ => Sql::raw("false"),
        }
    }

    fn set_operation(&self, operand: &Operand, op: SetOp, list: &[Value]) -> Sql {
        let operator = match op {
            SetOp::Subset => " <@ ",
            SetOp::Superset => " @> ",
            SetOp::Intersect => " && ",
        };
        let native = |sql: &Sql, encoded: Vec<Option<SqlValue>>, element: PrimitiveKind| {
            if matches!(op, SetOp::Superset) && encoded.iter().any(Option::is_none) {
                return Sql::raw("false");
            }
            let items: Vec<SqlValue> = encoded.into_iter().flatten().collect();
            coalesce_false(
                sql.clone()
                    .push_raw(operator)
                    .push_param(array_param(element, items)),
            )
        };
        match operand {
            Operand::Array { sql, element } => native(
                sql,
                list.iter().map(|v| literal(*element, v)).collect(),
                *element,
            ),
            Operand::Tokens { sql, target } => native(
                sql,
                list.iter()
                    .map(|v| reference_id(v).map(|id| SqlValue::Text(object_token(target, id))))
                    .collect(),
                PrimitiveKind::String,
            ),
            Operand::Json(sql) => {
                let param = SqlValue::Json(Value::Array(list.to_vec()));
                let test = match op {
                    SetOp::Subset => sql.clone().push_raw(" <@ ").push_param(param),
                    SetOp::Superset => sql.clone().push_raw(" @> ").push_param(param),
                    SetOp::Intersect => Sql::raw("EXISTS (SELECT 1 FROM jsonb_array_elements(")
                        .push(sql.clone())
                        .push_raw(") AS \"_x\"(\"value\") WHERE ")
                        .push_param(param)
                        .push_raw(" @> jsonb_build_array(\"_x\".\"value\"))"),
                };
                Sql::raw("CASE WHEN ")
                    .push(jsonb_typeof(sql, "array"))
                    .push_raw(" THEN ")
                    .push(test)
                    .push_raw(" ELSE false END")
            }
            Operand::Scalar { .. } | Operand::Token { .. } => Sql::raw("false"),
        }
    }

    fn size(&self, operand: &Operand, n: u64) -> Sql {
        let n = Sql::int(i64::try_from(n).unwrap_or(i64::MAX));
        match operand {
            Operand::Scalar {
                sql,
                kind: PrimitiveKind::String,
            } => coalesce_false(
                Sql::raw("char_length(")
                    .push(sql.clone())
                    .push_raw(") = ")
                    .push(n),
            ),
            Operand::Array { sql, .. } => coalesce_false(
                Sql::raw("cardinality(")
                    .push(sql.clone())
                    .push_raw(") = ")
                    .push(n),
            ),
            Operand::Tokens { sql, .. } => Sql::raw("COALESCE(cardinality(")
                .push(sql.clone())
                .push_raw("), 0) = ")
                .push(n),
            Operand::Json(sql) => coalesce_false(
                Sql::raw("CASE jsonb_typeof(")
                    .push(sql.clone())
                    .push_raw(") WHEN 'array' THEN jsonb_array_length(")
                    .push(sql.clone())
                    .push_raw(") = ")
                    .push(n.clone())
                    .push_raw(" WHEN 'string' THEN char_length(")
                    .push(json_text(sql))
                    .push_raw(") = ")
                    .push(n)
                    .push_raw(" END"),
            ),
            Operand::Scalar { .. } | Operand::Token { .. } => Sql::raw("false"),
        }
    }

    fn empty(&self, operand: &Operand) -> Sql {
        match operand {
            Operand::Scalar {
                sql,
                kind: PrimitiveKind::String,
            } => Sql::raw("(")
                .push(sql.clone())
                .push_raw(" IS NULL OR ")
                .push(sql.clone())
                .push_raw(" = '')"),
            Operand::Scalar { sql, .. } | Operand::Token { sql, .. } => {
                sql.clone().parens().push_raw(" IS NULL")
            }
            Operand::Array { sql, .. } | Operand::Tokens { sql, .. } => {
                Sql::raw("COALESCE(cardinality(")
                    .push(sql.clone())
                    .push_raw("), 0) = 0")
            }
            Operand::Json(sql) => Sql::raw("(")
                .push(sql.clone())
                .push_raw(" IS NULL OR ")
                .push(sql.clone())
                .push_raw(" IN ('null'::jsonb, '\"\"'::jsonb, '[]'::jsonb, '{}'::jsonb))"),
        }
    }

    fn json_update(&self, current: Sql, op: UpdateOp, value: &Value) -> Result<Sql> {
        let numeric = || {
            as_decimal(value)
                .filter(|_| is_numeric_literal(value))
                .map(|d| SqlValue::Decimal(d.to_string()))
                .ok_or_else(|| {
                    TesseraError::InvalidExpression(format!("numeric operand expected, got {value}"))
                })
        };
        let number_of = |cur: &Sql| {
            Sql::raw("CASE WHEN ")
                .push(jsonb_typeof(cur, "number"))
                .push_raw(" THEN (")
                .push(cur.clone())
                .push_raw(")::numeric END")
        };
        let arithmetic = |sql_op: &str| -> Result<Sql> {
            Ok(Sql::raw("to_jsonb(COALESCE(")
                .push(number_of(&current))
                .push_raw(format!(", 0) {sql_op} "))
                .push_param(numeric()?)
                .push_raw(")"))
        };
        let array = json_array(&current);
        Ok(match op {
            UpdateOp::Set => Sql::param(SqlValue::Json(value.clone())),
            UpdateOp::Inc => arithmetic("+")?,
            UpdateOp::Dec => arithmetic("-")?,
            UpdateOp::Mul => arithmetic("*")?,
            UpdateOp::Div => {
                if as_f64(value) == Some(0.0) {
                    return Err(TesseraError::InvalidExpression("division by zero".into()));
                }
                arithmetic("/")?
            }
            UpdateOp::Max | UpdateOp::Min => Sql::raw(if op == UpdateOp::Max {
                "to_jsonb(GREATEST("
            } else {
                "to_jsonb(LEAST("
            })
            .push(number_of(&current))
            .push_raw(", ")
            .push_param(numeric()?)
            .push_raw("))"),
            UpdateOp::Push => Sql::raw("(")
                .push(array)
                .push_raw(" || ")
                .push_param(SqlValue::Json(Value::Array(list_of(value))))
                .push_raw(")"),
            UpdateOp::AddToSet => Sql::raw("(")
                .push(array.clone())
                .push_raw(" || COALESCE((SELECT jsonb_agg(\"_a\".\"value\") FROM jsonb_array_elements(")
                .push_param(SqlValue::Json(Value::Array(dedupe(list_of(value)))))
                .push_raw(") AS \"_a\"(\"value\") WHERE NOT (")
                .push(array)
                .push_raw(" @> jsonb_build_array(\"_a\".\"value\"))), '[]'::jsonb))"),
            UpdateOp::RemoveAll => Sql::raw(
                "COALESCE((SELECT jsonb_agg(\"_r\".\"value\" ORDER BY \"_r\".\"i\") FROM jsonb_array_elements(",
            )
            .push(array)
            .push_raw(") WITH ORDINALITY AS \"_r\"(\"value\", \"i\") WHERE NOT (")
            .push_param(SqlValue::Json(Value::Array(list_of(value))))
            .push_raw(" @> jsonb_build_array(\"_r\".\"value\"))), '[]'::jsonb)"),
            UpdateOp::PopFirst => Sql::raw("(").push(array).push_raw(" - 0)"),
            UpdateOp::PopLast => Sql::raw("(").push(array).push_raw(" - -1)"),
        })
    }

    fn native_update(&self, current: Sql, ty: &DataType, op: UpdateOp, value: &Value) -> Result<Sql> {
        let unsupported = || {
            TesseraError::InvalidExpression(format!("update operator {op:?} does not apply to this field"))
        };
        let kind = ty.primitive_kind();
        let arithmetic = |sql_op: &str| -> Result<Sql> {
            let (zero, param) = match kind {
                Some(PrimitiveKind::Number) => ("0", literal(PrimitiveKind::Number, value)),
                Some(PrimitiveKind::Decimal) => ("0", literal(PrimitiveKind::Decimal, value)),
                _ => return Err(unsupported()),
            };
            let param = param.ok_or_else(|| {
                TesseraError::InvalidExpression(format!("numeric operand expected, got {value}"))
            })?;
            Ok(Sql::raw("(COALESCE(")
                .push(current.clone())
                .push_raw(format!(", {zero}) {sql_op} "))
                .push_param(param)
                .push_raw(")"))
        };
        let array_expr = || -> Result<Sql> {
            match ty {
                DataType::Primitive {
                    kind: PrimitiveKind::StringArray,
                    ..
                }
                | DataType::Relation {
                    foreign_field: None,
                    ..
                } => Ok(Sql::raw("COALESCE(")
                    .push(current.clone())
                    .push_raw(", '{}'::text[])")),
                _ => Err(unsupported()),
            }
        };
        let token_list = || -> Result<(Sql, SqlValue)> {
            let array = array_expr()?;
            let items = dedupe_if(op == UpdateOp::AddToSet, list_of(value));
            let encoded: Option<Vec<String>> = match ty {
                DataType::Relation { target, .. } => items
                    .iter()
                    .map(|v| reference_id(v).map(|id| object_token(target, id)))
                    .collect(),
                _ => items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect(),
            };
            let encoded = encoded
                .ok_or_else(|| TesseraError::InvalidDataType(format!("invalid array items {value}")))?;
            Ok((array, SqlValue::TextArray(encoded)))
        };
        Ok(match op {
            UpdateOp::Set => Sql::param(self.encode_value(ty, value)?),
            UpdateOp::Inc | UpdateOp::Dec if kind == Some(PrimitiveKind::Date) => {
                let ms = as_f64(value).ok_or_else(|| {
                    TesseraError::InvalidExpression("date increments are milliseconds".into())
                })?;
                Sql::raw("(COALESCE(")
                    .push(current)
                    .push_raw(if op == UpdateOp::Inc { ", NOW()) + (" } else { ", NOW()) - (" })
                    .push_param(SqlValue::Float(ms))
                    .push_raw(" * INTERVAL '1 millisecond'))")
            }
            UpdateOp::Inc => arithmetic("+")?,
            UpdateOp::Dec => arithmetic("-")?,
            UpdateOp::Mul => arithmetic("*")?,
            UpdateOp::Div => {
                if as_f64(value) == Some(0.0) {
                    return Err(TesseraError::InvalidExpression("division by zero".into()));
                }
                arithmetic("/")?
            }
            UpdateOp::Max | UpdateOp::Min => {
                if !matches!(
                    kind,
                    Some(
                        PrimitiveKind::Number
                            | PrimitiveKind::Decimal
                            | PrimitiveKind::Date
                            | PrimitiveKind::String
                    )
                ) {
                    return Err(unsupported());
                }
                Sql::raw(if op == UpdateOp::Max { "GREATEST(" } else { "LEAST(" })
                    .push(current)
                    .push_raw(", ")
                    .push_param(self.encode_value(ty, value)?)
                    .push_raw(")")
            }
            UpdateOp::Push => {
                let (array, param) = token_list()?;
                Sql::raw("(").push(array).push_raw(" || ").push_param(param).push_raw(")")
            }
            UpdateOp::AddToSet => {
                let (array, param) = token_list()?;
                Sql::raw("(")
                    .push(array.clone())
                    .push_raw(" || ARRAY(SELECT \"_a\" FROM unnest(")
                    .push_param(param)
                    .push_raw(") AS \"_a\" WHERE \"_a\" <> ALL(")
                    .push(array)
                    .push_raw(")))")
            }
            UpdateOp::RemoveAll => {
                let (array, param) = token_list()?;
                Sql::raw("ARRAY(SELECT \"_r\".\"v\" FROM unnest(")
                    .push(array)
                    .push_raw(") WITH ORDINALITY AS \"_r\"(\"v\", \"i\") WHERE \"_r\".\"v\" <> ALL(")
                    .push_param(param)
                    .push_raw(") ORDER BY \"_r\".\"i\")")
            }
            UpdateOp::PopFirst | UpdateOp::PopLast => {
                let array = array_expr()?;
                if op == UpdateOp::PopFirst {
                    Sql::raw("(").push(array).push_raw(")[2:]")
                } else {
                    Sql::raw("(")
                        .push(array.clone())
                        .push_raw(")[:cardinality(")
                        .push(array)
                        .push_raw(") - 1]")
                }
            }
        })
    }
}

fn dedupe_if(enabled: bool, items: Vec<Value>) -> Vec<Value> {
    if enabled {
        dedupe(items)
    } else {
        items
    }
}

impl Dialect for PostgresDialect {
    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn quote_string(&self, text: &str) -> String {
        format!("'{}'", text.replace('\'', "''"))
    }

    fn placeholder(&self, index: usize, value: &SqlValue) -> String {
        let cast = match value {
            SqlValue::Null | SqlValue::Bool(_) => "",
            SqlValue::Int(_) => "::bigint",
            SqlValue::Float(_) => "::double precision",
            SqlValue::Text(_) => "::text",
            SqlValue::Json(_) => "::jsonb",
            SqlValue::TextArray(_) => "::text[]",
            SqlValue::FloatArray(_) => "::double precision[]",
            SqlValue::Decimal(_) => "::numeric",
            SqlValue::Timestamp(_) => "::timestamptz",
        };
        format!("${index}{cast}")
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value {
            "true"
        } else {
            "false"
        }
    }

    fn column_type(&self, ty: &DataType) -> Option<String> {
        let name = match ty {
            DataType::Primitive { kind, .. } => match kind {
                PrimitiveKind::Boolean => "BOOLEAN",
                PrimitiveKind::Number => "DOUBLE PRECISION",
                PrimitiveKind::Decimal => "NUMERIC",
                PrimitiveKind::String => "TEXT",
                PrimitiveKind::StringArray => "TEXT[]",
                PrimitiveKind::Date => "TIMESTAMPTZ",
                PrimitiveKind::Object | PrimitiveKind::Array => "JSONB",
            },
            DataType::Vector { .. } => "DOUBLE PRECISION[]",
            DataType::Pointer { .. } => "TEXT",
            DataType::Relation {
                foreign_field: None,
                ..
            } => "TEXT[]",
            DataType::Relation { .. } | DataType::Shape { .. } => return None,
        };
        Some(name.to_string())
    }

    fn encode_value(&self, ty: &DataType, value: &Value) -> Result<SqlValue> {
        if value.is_null() {
            return Ok(SqlValue::Null);
        }
        let mismatch = || TesseraError::InvalidDataType(format!("{value} does not fit {ty:?}"));
        match ty {
            DataType::Primitive { kind, .. } => match kind {
                PrimitiveKind::Object if value.is_object() => Ok(SqlValue::Json(value.clone())),
                PrimitiveKind::Array if value.is_array() => Ok(SqlValue::Json(value.clone())),
                PrimitiveKind::StringArray => value
                    .as_array()
                    .and_then(|items| {
                        items
                            .iter()
                            .map(|i| i.as_str().map(str::to_string))
                            .collect::<Option<Vec<_>>>()
                    })
                    .map(SqlValue::TextArray)
                    .ok_or_else(mismatch),
                PrimitiveKind::Date => parse_date(value)
                    .map(SqlValue::Timestamp)
                    .ok_or_else(mismatch),
                other => literal(*other, value).ok_or_else(mismatch),
            },
            DataType::Vector { dimension, .. } => value
                .as_array()
                .filter(|items| items.len() == *dimension)
                .and_then(|items| items.iter().map(Value::as_f64).collect::<Option<Vec<_>>>())
                .map(SqlValue::FloatArray)
                .ok_or_else(mismatch),
            DataType::Pointer { target } => reference_id(value)
                .map(|id| SqlValue::Text(object_token(target, id)))
                .ok_or_else(mismatch),
            DataType::Relation {
                target,
                foreign_field: None,
            } => value
                .as_array()
                .and_then(|items| {
                    items
                        .iter()
                        .map(|i| reference_id(i).map(|id| object_token(target, id)))
                        .collect::<Option<Vec<_>>>()
                })
                .map(SqlValue::TextArray)
                .ok_or_else(mismatch),
            DataType::Relation { .. } => Err(TesseraError::InvalidDataType(
                "relations backed by a foreign field are read-only".into(),
            )),
            DataType::Shape { .. } => Err(mismatch()),
        }
    }

    fn decode_value(&self, ty: &DataType, value: Value) -> Result<Value> {
        if value.is_null() {
            return Ok(match ty {
                DataType::Relation { .. } => Value::Array(Vec::new()),
                _ => Value::Null,
            });
        }
        let mismatch = |v: &Value| TesseraError::InvalidDataType(format!("cannot decode {v} as {ty:?}"));
        let reference = |v: Value| -> Result<Value> {
            match v {
                Value::String(token) => {
                    let id = split_token(&token).map(|(_, id)| id).unwrap_or(&token);
                    let mut obj = Map::new();
                    obj.insert("_id".into(), Value::String(id.to_string()));
                    Ok(Value::Object(obj))
                }
                Value::Object(_) => Ok(v),
                other => Err(mismatch(&other)),
            }
        };
        match ty {
            DataType::Primitive {
                kind: PrimitiveKind::Date,
                ..
            } => parse_date(&value)
                .map(date_value)
                .ok_or_else(|| mismatch(&value)),
            DataType::Primitive {
                kind: PrimitiveKind::Decimal,
                ..
            } => {
                let parsed = match &value {
                    Value::String(s) => s.parse().ok(),
                    other => as_decimal(other),
                };
                parsed.map(decimal_value).ok_or_else(|| mismatch(&value))
            }
            DataType::Pointer { .. } => reference(value),
            DataType::Relation { .. } => match value {
                Value::Array(items) => Ok(Value::Array(
                    items.into_iter().map(reference).collect::<Result<_>>()?,
                )),
                other => Err(mismatch(&other)),
            },
            _ => Ok(value),
        }
    }

    fn project(&self, column: Sql, ty: &DataType) -> Sql {
        match ty.primitive_kind() {
            Some(PrimitiveKind::Decimal) => Sql::raw("to_jsonb((").push(column).push_raw(")::text)"),
            _ => Sql::raw("to_jsonb(").push(column).push_raw(")"),
        }
    }

    fn update_expression(
        &self,
        current: Sql,
        ty: &DataType,
        json_path: &[String],
        op: UpdateOp,
        value: &Value,
    ) -> Result<Sql> {
        let is_json = ty.primitive_kind().is_some_and(PrimitiveKind::is_json);
        if json_path.is_empty() {
            return if is_json {
                self.json_update(current, op, value)
            } else {
                self.native_update(current, ty, op, value)
            };
        }
        if !is_json {
            return Err(TesseraError::InvalidPath("sub-paths need a JSON field".into()));
        }
        let path = Sql::raw("ARRAY[")
            .push(Sql::join(
                json_path.iter().map(|p| Sql::new().push_str(p.clone())).collect(),
                ", ",
            ))
            .push_raw("]::text[]");
        let base = Sql::raw("COALESCE(").push(current).push_raw(", '{}'::jsonb)");
        let inner = Sql::raw("(")
            .push(base.clone())
            .push_raw(" #> ")
            .push(path.clone())
            .push_raw(")");
        Ok(Sql::raw("jsonb_set(")
            .push(base)
            .push_raw(", ")
            .push(path)
            .push_raw(", COALESCE(")
            .push(self.json_update(inner, op, value)?)
            .push_raw(", 'null'::jsonb), true)"))
    }

    fn field_expression(&self, operand: &Operand, expr: &FieldExpr) -> Result<Sql> {
        Ok(match expr {
            FieldExpr::Comparison(op, rhs) => self.comparison(operand, *op, rhs),
            FieldExpr::In(list) => Sql::or(
                list.iter()
                    .map(|v| self.comparison(operand, ComparisonOp::Eq, v))
                    .collect(),
            ),
            FieldExpr::Nin(list) => Sql::or(
                list.iter()
                    .map(|v| self.comparison(operand, ComparisonOp::Eq, v))
                    .collect(),
            )
            .not(),
            FieldExpr::Subset(list) => self.set_operation(operand, SetOp::Subset, list),
            FieldExpr::Superset(list) => self.set_operation(operand, SetOp::Superset, list),
            FieldExpr::Intersect(list) => self.set_operation(operand, SetOp::Intersect, list),
            FieldExpr::Not(inner) => self.field_expression(operand, inner)?.not(),
            FieldExpr::Pattern {
                source,
                case_insensitive,
            } => {
                let op = if *case_insensitive { " ~* " } else { " ~ " };
                self.string_test(operand, |s| {
                    s.push_raw(op).push_param(SqlValue::Text(source.clone()))
                })
            }
            FieldExpr::Starts(prefix) => self.string_test(operand, |s| {
                s.push_raw(" LIKE ")
                    .push_param(SqlValue::Text(format!("{}%", escape_like(prefix))))
            }),
            FieldExpr::Ends(suffix) => self.string_test(operand, |s| {
                s.push_raw(" LIKE ")
                    .push_param(SqlValue::Text(format!("%{}", escape_like(suffix))))
            }),
            FieldExpr::Size(n) => self.size(operand, *n),
            FieldExpr::Empty(expected) => {
                let pred = self.empty(operand);
                if *expected {
                    pred
                } else {
                    pred.not()
                }
            }
            FieldExpr::Every(_) | FieldExpr::Some(_) => {
                return Err(TesseraError::InvalidExpression(
                    "element selectors need an element scope".into(),
                ))
            }
        })
    }

    fn compare_operands(&self, op: ComparisonOp, left: &Operand, right: &Operand) -> Sql {
        let numeric = |k: PrimitiveKind| matches!(k, PrimitiveKind::Number | PrimitiveKind::Decimal);
        let (l, r, orderable) = match (left, right) {
            (Operand::Scalar { sql: l, kind: a }, Operand::Scalar { sql: r, kind: b }) if a == b => {
                (l.clone(), r.clone(), true)
            }
            (Operand::Scalar { sql: l, kind: a }, Operand::Scalar { sql: r, kind: b })
                if numeric(*a) && numeric(*b) =>
            {
                (
                    l.clone().parens().push_raw("::numeric"),
                    r.clone().parens().push_raw("::numeric"),
                    true,
                )
            }
            (Operand::Json(l), Operand::Json(r)) => (l.clone(), r.clone(), true),
            (Operand::Token { sql: l, .. }, Operand::Token { sql: r, .. })
            | (Operand::Tokens { sql: l, .. }, Operand::Tokens { sql: r, .. }) => {
                (l.clone(), r.clone(), false)
            }
            (Operand::Array { sql: l, element: a }, Operand::Array { sql: r, element: b })
                if a == b =>
            {
                (l.clone(), r.clone(), false)
            }
            (l, r) => (
                Sql::raw("to_jsonb(").push(l.sql().clone()).push_raw(")"),
                Sql::raw("to_jsonb(").push(r.sql().clone()).push_raw(")"),
                false,
            ),
        };
        match op {
            ComparisonOp::Eq => Sql::raw("(")
                .push(l)
                .push_raw(" IS NOT DISTINCT FROM ")
                .push(r)
                .push_raw(")"),
            ComparisonOp::Ne => Sql::raw("(")
                .push(l)
                .push_raw(" IS DISTINCT FROM ")
                .push(r)
                .push_raw(")"),
            _ if !orderable => Sql::raw("false"),
            other => coalesce_false(
                l.push_raw(format!(" {} ", other.sql_operator()))
                    .push(r),
            ),
        }
    }

    fn truthy(&self, operand: &Operand) -> Sql {
        match operand {
            Operand::Scalar {
                sql,
                kind: PrimitiveKind::Boolean,
            } => coalesce_false(sql.clone()),
            Operand::Json(sql) => coalesce_false(
                sql.clone()
                    .parens()
                    .push_raw(" NOT IN ('null'::jsonb, 'false'::jsonb)"),
            ),
            Operand::Tokens { .. } => Sql::raw("true"),
            other => other.sql().clone().parens().push_raw(" IS NOT NULL"),
        }
    }

    fn distance(&self, kind: DistanceKind, left: Sql, right: Sql) -> Sql {
        let (op, negate) = match kind {
            DistanceKind::Distance => (" <-> ", false),
            DistanceKind::InnerProduct => (" <#> ", true),
            DistanceKind::NegInnerProduct => (" <#> ", false),
            DistanceKind::CosineDistance => (" <=> ", false),
            DistanceKind::RectilinearDistance => (" <+> ", false),
        };
        let expr = Sql::raw("(").push(left).push_raw(op).push(right).push_raw(")");
        if negate {
            Sql::raw("(-").push(expr).push_raw(")")
        } else {
            expr
        }
    }

    fn sort_key(&self, key: Sql, order: SortOrder) -> Sql {
        key.push_raw(" ").push_raw(order.sql())
    }

    fn random_order(&self, weight: Option<Sql>) -> Sql {
        match weight {
            Some(w) => Sql::raw("(-ln(1.0 - random()) / NULLIF(")
                .push(w)
                .push_raw(", 0))"),
            None => Sql::raw("random()"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(sql: Sql) -> String {
        sql.compile(&PostgresDialect).text
    }

    fn title() -> Operand {
        Operand::Scalar {
            sql: Sql::column("Note", "title"),
            kind: PrimitiveKind::String,
        }
    }

    #[test]
    fn null_comparisons_use_is_null() {
        let d = PostgresDialect;
        let eq = d.field_expression(&title(), &FieldExpr::Comparison(ComparisonOp::Eq, Value::Null)).unwrap();
        assert_eq!(text(eq), "(\"Note\".\"title\") IS NULL");
        let ne = d.field_expression(&title(), &FieldExpr::Comparison(ComparisonOp::Ne, Value::Null)).unwrap();
        assert_eq!(text(ne), "NOT ((\"Note\".\"title\") IS NULL)");
    }

    #[test]
    fn in_with_null_matches_null_rows() {
        let d = PostgresDialect;
        let sql = d
            .field_expression(&title(), &FieldExpr::In(vec![Value::Null, json!("a")]))
            .unwrap();
        let compiled = sql.compile(&d);
        assert_eq!(
            compiled.text,
            "(((\"Note\".\"title\") IS NULL) OR (COALESCE(\"Note\".\"title\" = $1::text, false)))"
        );
        assert_eq!(compiled.params, vec![SqlValue::Text("a".into())]);
    }

    #[test]
    fn mismatched_literals_never_bind() {
        let d = PostgresDialect;
        let sql = d
            .field_expression(&title(), &FieldExpr::Comparison(ComparisonOp::Gt, json!(3)))
            .unwrap();
        assert_eq!(text(sql), "false");
        let sql = d
            .field_expression(&title(), &FieldExpr::Comparison(ComparisonOp::Ne, json!(3)))
            .unwrap();
        assert_eq!(text(sql), "true");
    }

    #[test]
    fn starts_escapes_like_wildcards() {
        let d = PostgresDialect;
        let compiled = d
            .field_expression(&title(), &FieldExpr::Starts("50%_off".into()))
            .unwrap()
            .compile(&d);
        assert_eq!(compiled.text, "COALESCE(\"Note\".\"title\" LIKE $1::text, false)");
        assert_eq!(compiled.params, vec![SqlValue::Text("50\\%\\_off%".into())]);
    }

    #[test]
    fn relation_set_operations_bind_tokens() {
        let d = PostgresDialect;
        let tags = Operand::Tokens {
            sql: Sql::column("Note", "tags"),
            target: "Tag".into(),
        };
        let compiled = d
            .field_expression(&tags, &FieldExpr::Superset(vec![json!({"_id": "t1"}), json!("t2")]))
            .unwrap()
            .compile(&d);
        assert_eq!(compiled.text, "COALESCE(\"Note\".\"tags\" @> $1::text[], false)");
        assert_eq!(
            compiled.params,
            vec![SqlValue::TextArray(vec!["Tag$t1".into(), "Tag$t2".into()])]
        );
    }

    #[test]
    fn encode_and_decode_round_trip() {
        let d = PostgresDialect;
        let date = DataType::primitive(PrimitiveKind::Date);
        let v = json!({"$date": "2024-03-01T10:00:00+00:00"});
        match d.encode_value(&date, &v).unwrap() {
            SqlValue::Timestamp(ts) => {
                let back = d.decode_value(&date, json!(ts.to_rfc3339())).unwrap();
                assert_eq!(back, v);
            }
            other => panic!("unexpected {other:?}"),
        }
        let decimal = DataType::primitive(PrimitiveKind::Decimal);
        assert_eq!(
            d.encode_value(&decimal, &json!({"$decimal": "1.25"})).unwrap(),
            SqlValue::Decimal("1.25".into())
        );
        assert_eq!(
            d.decode_value(&decimal, json!("1.25")).unwrap(),
            json!({"$decimal": "1.25"})
        );
        let pointer = DataType::Pointer { target: "User".into() };
        assert_eq!(
            d.encode_value(&pointer, &json!({"_id": "u1"})).unwrap(),
            SqlValue::Text("User$u1".into())
        );
        assert_eq!(d.decode_value(&pointer, json!("User$u1")).unwrap(), json!({"_id": "u1"}));
        let vector = DataType::Vector { dimension: 2, default: None };
        assert!(d.encode_value(&vector, &json!([1.0])).is_err());
        assert!(d
            .encode_value(&DataType::primitive(PrimitiveKind::Number), &json!("x"))
            .is_err());
    }

    #[test]
    fn update_operators_compose() {
        let d = PostgresDialect;
        let num = DataType::primitive(PrimitiveKind::Number);
        let inc = d
            .update_expression(Sql::column("Note", "n"), &num, &[], UpdateOp::Inc, &json!(2))
            .unwrap();
        assert_eq!(text(inc), "(COALESCE(\"Note\".\"n\", 0) + $1::double precision)");
        let labels = DataType::primitive(PrimitiveKind::StringArray);
        let pop = d
            .update_expression(Sql::column("Note", "labels"), &labels, &[], UpdateOp::PopFirst, &json!(1))
            .unwrap();
        assert_eq!(text(pop), "(COALESCE(\"Note\".\"labels\", '{}'::text[]))[2:]");
        let meta = DataType::primitive(PrimitiveKind::Object);
        let nested = d
            .update_expression(Sql::column("Note", "meta"), &meta, &["a".into()], UpdateOp::Set, &json!(1))
            .unwrap();
        assert!(text(nested).starts_with("jsonb_set(COALESCE(\"Note\".\"meta\", '{}'::jsonb), ARRAY['a']::text[]"));
        assert!(d
            .update_expression(Sql::column("Note", "n"), &num, &[], UpdateOp::Div, &json!(0))
            .is_err());
        assert!(d
            .update_expression(Sql::column("Note", "n"), &num, &[], UpdateOp::Push, &json!(1))
            .is_err());
    }
}
