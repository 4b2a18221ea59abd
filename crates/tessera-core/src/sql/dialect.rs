use super::fragment::{Sql, SqlValue};
use crate::error::{Result, TesseraError};
use crate::query::{ComparisonOp, DistanceKind, FieldExpr, SortOrder};
use crate::schema::{DataType, PrimitiveKind};
use serde_json::Value;

/// A typed SQL value a field expression can be applied to.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Native scalar column or expression.
    Scalar { sql: Sql, kind: PrimitiveKind },
    /// Untyped JSON value.
    Json(Sql),
    /// Native array: `text[]` for strings, `double precision[]` for vectors.
    Array { sql: Sql, element: PrimitiveKind },
    /// Pointer column holding one `Class$id` token.
    Token { sql: Sql, target: String },
    /// Relation token array, either a column or a synthesized `ARRAY(...)`.
    Tokens { sql: Sql, target: String },
}

impl Operand {
    pub fn sql(&self) -> &Sql {
        match self {
            Operand::Scalar { sql, .. }
            | Operand::Json(sql)
            | Operand::Array { sql, .. }
            | Operand::Token { sql, .. }
            | Operand::Tokens { sql, .. } => sql,
        }
    }

    /// Same operand type over a different SQL expression.
    pub fn with_sql(&self, sql: Sql) -> Operand {
        match self {
            Operand::Scalar { kind, .. } => Operand::Scalar { sql, kind: *kind },
            Operand::Json(_) => Operand::Json(sql),
            Operand::Array { element, .. } => Operand::Array {
                sql,
                element: *element,
            },
            Operand::Token { target, .. } => Operand::Token {
                sql,
                target: target.clone(),
            },
            Operand::Tokens { target, .. } => Operand::Tokens {
                sql,
                target: target.clone(),
            },
        }
    }

    /// Operand for a column of the given type.
    pub fn for_column(sql: Sql, ty: &DataType) -> Result<Operand> {
        Ok(match ty {
            DataType::Primitive { kind, .. } => match kind {
                PrimitiveKind::Object | PrimitiveKind::Array => Operand::Json(sql),
                PrimitiveKind::StringArray => Operand::Array {
                    sql,
                    element: PrimitiveKind::String,
                },
                other => Operand::Scalar { sql, kind: *other },
            },
            DataType::Vector { .. } => Operand::Array {
                sql,
                element: PrimitiveKind::Number,
            },
            DataType::Pointer { target } => Operand::Token {
                sql,
                target: target.clone(),
            },
            DataType::Relation { target, .. } => Operand::Tokens {
                sql,
                target: target.clone(),
            },
            DataType::Shape { .. } => {
                return Err(TesseraError::InvalidPath(
                    "shape fields are addressed through their leaves".into(),
                ))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Set,
    Inc,
    Dec,
    Mul,
    Div,
    Max,
    Min,
    Push,
    AddToSet,
    RemoveAll,
    PopFirst,
    PopLast,
}

impl UpdateOp {
    pub fn from_key(key: &str) -> Option<Self> {
        Some(match key {
            "$set" => Self::Set,
            "$inc" => Self::Inc,
            "$dec" => Self::Dec,
            "$mul" => Self::Mul,
            "$div" => Self::Div,
            "$max" => Self::Max,
            "$min" => Self::Min,
            "$push" => Self::Push,
            "$addToSet" => Self::AddToSet,
            "$removeAll" => Self::RemoveAll,
            "$popFirst" => Self::PopFirst,
            "$popLast" => Self::PopLast,
            _ => return None,
        })
    }

    /// Splits `{"$inc": 1}` into its operator; any other value is a plain `$set`.
    pub fn decode(raw: &Value) -> Result<(UpdateOp, Value)> {
        if let Value::Object(obj) = raw {
            if obj.len() == 1 {
                if let Some((key, arg)) = obj.iter().next() {
                    if key.starts_with('$') && !crate::query::value::is_tagged(raw) {
                        let op = UpdateOp::from_key(key).ok_or_else(|| {
                            TesseraError::InvalidExpression(format!("unknown update operator {key}"))
                        })?;
                        return Ok((op, arg.clone()));
                    }
                }
            }
        }
        Ok((UpdateOp::Set, raw.clone()))
    }
}

/// One SQL flavor. The compiler only talks to the database through this.
pub trait Dialect: Send + Sync {
    fn quote_ident(&self, name: &str) -> String;

    fn quote_string(&self, text: &str) -> String;

    /// Placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize, value: &SqlValue) -> String;

    fn bool_literal(&self, value: bool) -> &'static str;

    /// DDL column type; `None` for types without a column.
    fn column_type(&self, ty: &DataType) -> Option<String>;

    /// Client value to a bound parameter for a column of type `ty`.
    fn encode_value(&self, ty: &DataType, value: &Value) -> Result<SqlValue>;

    /// Projected JSON back to the client representation.
    fn decode_value(&self, ty: &DataType, value: Value) -> Result<Value>;

    /// Wraps a column for the JSON projection.
    fn project(&self, column: Sql, ty: &DataType) -> Sql;

    /// New value of a column (or JSON sub-path of it) after one update operator.
    fn update_expression(
        &self,
        current: Sql,
        ty: &DataType,
        json_path: &[String],
        op: UpdateOp,
        value: &Value,
    ) -> Result<Sql>;

    /// Predicate for every field operator except the element-scoped ones,
    /// which need the compiler's scope handling.
    fn field_expression(&self, operand: &Operand, expr: &FieldExpr) -> Result<Sql>;

    /// Null-safe comparison of two operands of a boolean expression.
    fn compare_operands(&self, op: ComparisonOp, left: &Operand, right: &Operand) -> Sql;

    fn truthy(&self, operand: &Operand) -> Sql;

    fn distance(&self, kind: DistanceKind, left: Sql, right: Sql) -> Sql;

    fn sort_key(&self, key: Sql, order: SortOrder) -> Sql;

    fn random_order(&self, weight: Option<Sql>) -> Sql;
}
