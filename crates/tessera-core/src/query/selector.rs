use super::expression::{single_entry, ComparisonOp, ConditionalOp, Expression};
use super::value::{equals, get_path, is_tagged, truthy};
use crate::error::{Result, TesseraError};
use regex::RegexBuilder;
use serde_json::Value;

/// Synthetic key addressing the current element inside `$every`/`$some`.
pub const SELF_KEY: &str = "$";

#[derive(Debug, Clone, PartialEq)]
pub enum FieldExpr {
    Comparison(ComparisonOp, Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Subset(Vec<Value>),
    Superset(Vec<Value>),
    Intersect(Vec<Value>),
    Not(Box<FieldExpr>),
    Pattern {
        source: String,
        case_insensitive: bool,
    },
    Starts(String),
    Ends(String),
    Size(u64),
    Empty(bool),
    Every(Box<Selector>),
    Some(Box<Selector>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    Conditional(ConditionalOp, Vec<Selector>),
    Field(String, FieldExpr),
    Expression(Expression),
}

fn invalid(key: &str, reason: &str) -> TesseraError {
    TesseraError::InvalidExpression(format!("{key}: {reason}"))
}

fn list_arg(key: &str, arg: &Value) -> Result<Vec<Value>> {
    arg.as_array()
        .cloned()
        .ok_or_else(|| invalid(key, "expects an array"))
}

fn string_arg(key: &str, arg: &Value) -> Result<String> {
    arg.as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(key, "expects a string"))
}

impl FieldExpr {
    pub fn decode(raw: &Value) -> Result<Self> {
        let is_operator = match raw.as_object() {
            Some(obj) => !is_tagged(raw) && obj.keys().any(|k| k.starts_with('$')),
            None => false,
        };
        if !is_operator {
            return Ok(FieldExpr::Comparison(ComparisonOp::Eq, raw.clone()));
        }
        let (key, arg) = single_entry(raw, "field expression")?;
        if let Some(op) = ComparisonOp::from_key(key) {
            return Ok(FieldExpr::Comparison(op, arg.clone()));
        }
        Ok(match key.as_str() {
            "$in" => FieldExpr::In(list_arg(key, arg)?),
            "$nin" => FieldExpr::Nin(list_arg(key, arg)?),
            "$subset" => FieldExpr::Subset(list_arg(key, arg)?),
            "$superset" => FieldExpr::Superset(list_arg(key, arg)?),
            "$intersect" => FieldExpr::Intersect(list_arg(key, arg)?),
            "$not" => FieldExpr::Not(Box::new(FieldExpr::decode(arg)?)),
            "$pattern" => {
                let (source, case_insensitive) = match arg {
                    Value::String(s) => (s.clone(), false),
                    Value::Object(obj) => {
                        let source = obj
                            .get("source")
                            .and_then(Value::as_str)
                            .ok_or_else(|| invalid(key, "missing source"))?;
                        let flags = obj.get("flags").and_then(Value::as_str).unwrap_or("");
                        if flags.chars().any(|c| c != 'i') {
                            return Err(invalid(key, "unsupported flags"));
                        }
                        (source.to_string(), flags.contains('i'))
                    }
                    _ => return Err(invalid(key, "expects a string or {source, flags}")),
                };
                RegexBuilder::new(&source)
                    .case_insensitive(case_insensitive)
                    .build()
                    .map_err(|e| invalid(key, &e.to_string()))?;
                FieldExpr::Pattern {
                    source,
                    case_insensitive,
                }
            }
            "$starts" => FieldExpr::Starts(string_arg(key, arg)?),
            "$ends" => FieldExpr::Ends(string_arg(key, arg)?),
            "$size" => FieldExpr::Size(
                arg.as_u64()
                    .ok_or_else(|| invalid(key, "expects a non-negative integer"))?,
            ),
            "$empty" => FieldExpr::Empty(
                arg.as_bool()
                    .ok_or_else(|| invalid(key, "expects a boolean"))?,
            ),
            "$every" => FieldExpr::Every(Box::new(Selector::decode(arg, true)?)),
            "$some" => FieldExpr::Some(Box::new(Selector::decode(arg, true)?)),
            _ => return Err(invalid(key, "unknown operator")),
        })
    }

    pub fn simplify(&self) -> FieldExpr {
        match self {
            FieldExpr::Not(inner) => match inner.simplify() {
                FieldExpr::Not(x) => *x,
                other => FieldExpr::Not(Box::new(other)),
            },
            FieldExpr::Every(sel) => FieldExpr::Every(Box::new(sel.simplify())),
            FieldExpr::Some(sel) => FieldExpr::Some(Box::new(sel.simplify())),
            other => other.clone(),
        }
    }

    /// Element-scoped sub-selector of `$every`/`$some`, looking through `$not`.
    pub fn element_selector(&self) -> Option<&Selector> {
        match self {
            FieldExpr::Every(sel) | FieldExpr::Some(sel) => Some(sel),
            FieldExpr::Not(inner) => inner.element_selector(),
            _ => None,
        }
    }

    pub fn eval(&self, value: &Value) -> bool {
        match self {
            FieldExpr::Comparison(op, rhs) => op.eval(value, rhs),
            FieldExpr::In(list) => list.iter().any(|x| equals(value, x)),
            FieldExpr::Nin(list) => !list.iter().any(|x| equals(value, x)),
            FieldExpr::Subset(list) => match value {
                Value::Array(items) => items.iter().all(|i| list.iter().any(|x| equals(i, x))),
                _ => false,
            },
            FieldExpr::Superset(list) => match value {
                Value::Array(items) => list.iter().all(|x| items.iter().any(|i| equals(i, x))),
                _ => false,
            },
            FieldExpr::Intersect(list) => match value {
                Value::Array(items) => items.iter().any(|i| list.iter().any(|x| equals(i, x))),
                _ => false,
            },
            FieldExpr::Not(inner) => !inner.eval(value),
            FieldExpr::Pattern {
                source,
                case_insensitive,
            } => match value.as_str() {
                Some(s) => RegexBuilder::new(source)
                    .case_insensitive(*case_insensitive)
                    .build()
                    .map(|re| re.is_match(s))
                    .unwrap_or(false),
                None => false,
            },
            FieldExpr::Starts(prefix) => value.as_str().is_some_and(|s| s.starts_with(prefix)),
            FieldExpr::Ends(suffix) => value.as_str().is_some_and(|s| s.ends_with(suffix)),
            FieldExpr::Size(n) => match value {
                Value::String(s) => s.chars().count() as u64 == *n,
                Value::Array(items) => items.len() as u64 == *n,
                _ => false,
            },
            FieldExpr::Empty(expected) => {
                let empty = match value {
                    Value::Null => true,
                    Value::String(s) => s.is_empty(),
                    Value::Array(items) => items.is_empty(),
                    Value::Object(obj) => obj.is_empty(),
                    _ => false,
                };
                empty == *expected
            }
            FieldExpr::Every(sel) => match value {
                Value::Null => true,
                Value::Array(items) => items.iter().all(|i| sel.eval(i)),
                _ => false,
            },
            FieldExpr::Some(sel) => match value {
                Value::Array(items) => items.iter().any(|i| sel.eval(i)),
                _ => false,
            },
        }
    }
}

impl Default for Selector {
    fn default() -> Self {
        Selector::truth()
    }
}

impl Selector {
    pub fn truth() -> Self {
        Selector::Conditional(ConditionalOp::And, Vec::new())
    }

    pub fn is_truth(&self) -> bool {
        matches!(self, Selector::Conditional(ConditionalOp::And, items) if items.is_empty())
    }

    pub fn and(items: Vec<Selector>) -> Self {
        Selector::Conditional(ConditionalOp::And, items).simplify()
    }

    /// Decodes a filter. Several field keys in one object form an implicit `$and`,
    /// as does a list of filters. `allow_self_key` admits `$` as a field name.
    pub fn decode(raw: &Value, allow_self_key: bool) -> Result<Self> {
        match raw {
            Value::Array(items) => Ok(Selector::Conditional(
                ConditionalOp::And,
                items
                    .iter()
                    .map(|i| Selector::decode(i, allow_self_key))
                    .collect::<Result<_>>()?,
            )),
            Value::Object(obj) => {
                let mut parts = Vec::with_capacity(obj.len());
                for (key, arg) in obj {
                    parts.push(Self::decode_entry(key, arg, allow_self_key)?);
                }
                if parts.len() == 1 {
                    return Ok(parts.pop().expect("one part"));
                }
                Ok(Selector::Conditional(ConditionalOp::And, parts))
            }
            _ => Err(TesseraError::InvalidExpression(
                "filter must be an object or a list of objects".into(),
            )),
        }
    }

    fn decode_entry(key: &str, arg: &Value, allow_self_key: bool) -> Result<Self> {
        if let Some(op) = ConditionalOp::from_key(key) {
            let items = arg.as_array().ok_or_else(|| invalid(key, "expects an array"))?;
            if items.is_empty() && op != ConditionalOp::And {
                return Err(invalid(key, "expects a non-empty array"));
            }
            return Ok(Selector::Conditional(
                op,
                items
                    .iter()
                    .map(|i| Selector::decode(i, allow_self_key))
                    .collect::<Result<_>>()?,
            ));
        }
        if key == "$expr" {
            let expr = Expression::decode(arg)?;
            if !expr.is_boolean() {
                return Err(invalid(key, "expects a boolean expression"));
            }
            return Ok(Selector::Expression(expr));
        }
        if key == SELF_KEY && allow_self_key {
            return Ok(Selector::Field(key.to_string(), FieldExpr::decode(arg)?));
        }
        if key.is_empty() || key.starts_with('$') {
            return Err(invalid(key, "unknown operator"));
        }
        Ok(Selector::Field(key.to_string(), FieldExpr::decode(arg)?))
    }

    pub fn simplify(&self) -> Selector {
        match self {
            Selector::Conditional(op, items) => {
                let mut out = Vec::new();
                for item in items.iter().map(Selector::simplify) {
                    if *op == ConditionalOp::Or && item.is_truth() {
                        return Selector::truth();
                    }
                    match item {
                        Selector::Conditional(child, nested) if op.flattens(child) => {
                            out.extend(nested)
                        }
                        other => out.push(other),
                    }
                }
                if out.is_empty() {
                    return Selector::truth();
                }
                if out.len() == 1 && *op != ConditionalOp::Nor {
                    return out.pop().expect("one element");
                }
                Selector::Conditional(*op, out)
            }
            Selector::Field(path, expr) => Selector::Field(path.clone(), expr.simplify()),
            Selector::Expression(expr) => Selector::Expression(expr.simplify()),
        }
    }

    /// Every field path the selector reads. Element-scoped paths are prefixed
    /// with their owning field; the self key is never reported.
    pub fn key_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_keys(&mut out);
        out
    }

    fn collect_keys(&self, out: &mut Vec<String>) {
        match self {
            Selector::Conditional(_, items) => items.iter().for_each(|s| s.collect_keys(out)),
            Selector::Expression(expr) => {
                for k in expr.key_paths() {
                    push_key(out, k);
                }
            }
            Selector::Field(path, expr) => {
                push_key(out, path.clone());
                if let Some(sel) = expr.element_selector() {
                    let owner = path.as_str();
                    for k in sel.map_key(&|k| prefixed(owner, k)).key_paths() {
                        push_key(out, k);
                    }
                }
            }
        }
    }

    /// Rewrites every key in this scope. Element-scoped selectors are left untouched.
    pub fn map_key(&self, f: &dyn Fn(&str) -> String) -> Selector {
        match self {
            Selector::Conditional(op, items) => {
                Selector::Conditional(*op, items.iter().map(|s| s.map_key(f)).collect())
            }
            Selector::Field(path, expr) => Selector::Field(f(path), expr.clone()),
            Selector::Expression(expr) => Selector::Expression(expr.map_key(f)),
        }
    }

    pub fn eval(&self, object: &Value) -> bool {
        match self {
            Selector::Conditional(op, items) => match op {
                ConditionalOp::And => items.iter().all(|s| s.eval(object)),
                ConditionalOp::Or => items.iter().any(|s| s.eval(object)),
                ConditionalOp::Nor => !items.iter().any(|s| s.eval(object)),
            },
            Selector::Field(path, expr) => {
                let value = if path == SELF_KEY {
                    object
                } else {
                    get_path(object, path)
                };
                expr.eval(value)
            }
            Selector::Expression(expr) => truthy(&expr.eval(object)),
        }
    }
}

fn push_key(out: &mut Vec<String>, key: String) {
    if key != SELF_KEY && !out.contains(&key) {
        out.push(key);
    }
}

fn prefixed(owner: &str, key: &str) -> String {
    if key == SELF_KEY {
        owner.to_string()
    } else if let Some(rest) = key.strip_prefix("$.") {
        format!("{owner}.{rest}")
    } else {
        format!("{owner}.{key}")
    }
}
