use super::expression::Expression;
use super::value::{compare, get_path};
use crate::error::{Result, TesseraError};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn decode(raw: &Value) -> Result<Self> {
        match raw.as_i64() {
            Some(1) => Ok(SortOrder::Asc),
            Some(-1) => Ok(SortOrder::Desc),
            _ => Err(TesseraError::InvalidExpression(format!(
                "sort order must be 1 or -1, got {raw}"
            ))),
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortExpression {
    pub expr: Expression,
    pub order: SortOrder,
}

/// Either a legacy `{path: 1|-1}` map or an ordered list of `{expr, order}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Sort {
    Map(Vec<(String, SortOrder)>),
    Expressions(Vec<SortExpression>),
}

impl Sort {
    pub fn decode(raw: &Value) -> Result<Self> {
        match raw {
            Value::Object(obj) => Ok(Sort::Map(
                obj.iter()
                    .map(|(k, v)| Ok((k.clone(), SortOrder::decode(v)?)))
                    .collect::<Result<_>>()?,
            )),
            Value::Array(items) => Ok(Sort::Expressions(
                items
                    .iter()
                    .map(|item| {
                        let expr = item.get("expr").ok_or_else(|| {
                            TesseraError::InvalidExpression("sort entry missing expr".into())
                        })?;
                        let order = item.get("order").unwrap_or(&Value::Null);
                        Ok(SortExpression {
                            expr: Expression::decode(expr)?,
                            order: if order.is_null() {
                                SortOrder::Asc
                            } else {
                                SortOrder::decode(order)?
                            },
                        })
                    })
                    .collect::<Result<_>>()?,
            )),
            _ => Err(TesseraError::InvalidExpression(
                "sort must be an object or a list".into(),
            )),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Sort::Map(items) => items.is_empty(),
            Sort::Expressions(items) => items.is_empty(),
        }
    }

    pub fn key_paths(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let keys: Vec<String> = match self {
            Sort::Map(items) => items.iter().map(|(k, _)| k.clone()).collect(),
            Sort::Expressions(items) => items.iter().flat_map(|s| s.expr.key_paths()).collect(),
        };
        for k in keys {
            if !out.contains(&k) {
                out.push(k);
            }
        }
        out
    }

    pub fn map_key(&self, f: &dyn Fn(&str) -> String) -> Sort {
        match self {
            Sort::Map(items) => Sort::Map(items.iter().map(|(k, o)| (f(k), *o)).collect()),
            Sort::Expressions(items) => Sort::Expressions(
                items
                    .iter()
                    .map(|s| SortExpression {
                        expr: s.expr.map_key(f),
                        order: s.order,
                    })
                    .collect(),
            ),
        }
    }

    /// In-memory ordering matching `ORDER BY`: nulls sort last ascending.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let keys: Vec<(Value, Value, SortOrder)> = match self {
            Sort::Map(items) => items
                .iter()
                .map(|(k, o)| (get_path(a, k).clone(), get_path(b, k).clone(), *o))
                .collect(),
            Sort::Expressions(items) => items
                .iter()
                .map(|s| (s.expr.eval(a), s.expr.eval(b), s.order))
                .collect(),
        };
        for (x, y, order) in keys {
            let ord = match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => compare(&x, &y).unwrap_or(Ordering::Equal),
            };
            let ord = match order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}
