use super::value::{as_f64, compare, equals, get_path, truthy};
use crate::error::{Result, TesseraError};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalOp {
    And,
    Or,
    Nor,
}

impl ConditionalOp {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "$and" => Some(Self::And),
            "$or" => Some(Self::Or),
            "$nor" => Some(Self::Nor),
            _ => None,
        }
    }

    /// Operator whose children are spliced into this one by `simplify`.
    pub(crate) fn flattens(self, child: ConditionalOp) -> bool {
        match self {
            ConditionalOp::And => child == ConditionalOp::And,
            ConditionalOp::Or | ConditionalOp::Nor => child == ConditionalOp::Or,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl ComparisonOp {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "$eq" => Some(Self::Eq),
            "$ne" => Some(Self::Ne),
            "$gt" => Some(Self::Gt),
            "$gte" => Some(Self::Gte),
            "$lt" => Some(Self::Lt),
            "$lte" => Some(Self::Lte),
            _ => None,
        }
    }

    pub fn sql_operator(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }

    /// Null-aware comparison shared by selectors and expressions.
    pub fn eval(self, left: &Value, right: &Value) -> bool {
        match self {
            Self::Eq => equals(left, right),
            Self::Ne => !equals(left, right),
            Self::Gt => compare(left, right) == Some(Ordering::Greater),
            Self::Gte => matches!(compare(left, right), Some(Ordering::Greater | Ordering::Equal)),
            Self::Lt => compare(left, right) == Some(Ordering::Less),
            Self::Lte => matches!(compare(left, right), Some(Ordering::Less | Ordering::Equal)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceKind {
    Distance,
    InnerProduct,
    NegInnerProduct,
    CosineDistance,
    RectilinearDistance,
}

impl DistanceKind {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "$distance" => Some(Self::Distance),
            "$innerProduct" => Some(Self::InnerProduct),
            "$negInnerProduct" => Some(Self::NegInnerProduct),
            "$cosineDistance" => Some(Self::CosineDistance),
            "$rectilinearDistance" => Some(Self::RectilinearDistance),
            _ => None,
        }
    }

    pub fn eval(self, a: &[f64], b: &[f64]) -> Option<f64> {
        if a.len() != b.len() {
            return None;
        }
        let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        Some(match self {
            Self::Distance => a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt(),
            Self::InnerProduct => dot,
            Self::NegInnerProduct => -dot,
            Self::CosineDistance => {
                let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
                let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
                if na == 0.0 || nb == 0.0 {
                    return None;
                }
                1.0 - dot / (na * nb)
            }
            Self::RectilinearDistance => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Key(String),
    Value(Value),
    Array(Vec<Expression>),
    Not(Box<Expression>),
    Conditional(ConditionalOp, Vec<Expression>),
    Comparison(ComparisonOp, Box<Expression>, Box<Expression>),
    Distance(DistanceKind, Vec<Expression>, Vec<Expression>),
}

pub(crate) fn single_entry<'a>(raw: &'a Value, what: &str) -> Result<(&'a String, &'a Value)> {
    let obj = raw
        .as_object()
        .ok_or_else(|| TesseraError::InvalidExpression(format!("{what} must be an object")))?;
    if obj.len() != 1 {
        return Err(TesseraError::InvalidExpression(format!(
            "{what} must have exactly one operator, got {}",
            obj.len()
        )));
    }
    Ok(obj.iter().next().expect("length checked"))
}

impl Expression {
    pub fn truth() -> Self {
        Expression::Conditional(ConditionalOp::And, Vec::new())
    }

    pub fn decode(raw: &Value) -> Result<Self> {
        let (key, arg) = single_entry(raw, "expression")?;
        let invalid = |reason: &str| TesseraError::InvalidExpression(format!("{key}: {reason}"));
        if key == "$key" {
            let path = arg.as_str().ok_or_else(|| invalid("expects a string"))?;
            if path.is_empty() {
                return Err(invalid("empty key"));
            }
            return Ok(Expression::Key(path.to_string()));
        }
        if key == "$value" {
            return Ok(Expression::Value(arg.clone()));
        }
        if key == "$array" {
            let items = arg.as_array().ok_or_else(|| invalid("expects an array"))?;
            return Ok(Expression::Array(
                items.iter().map(Expression::decode).collect::<Result<_>>()?,
            ));
        }
        if key == "$not" {
            return Ok(Expression::Not(Box::new(Expression::decode(arg)?)));
        }
        if let Some(op) = ConditionalOp::from_key(key) {
            let items = arg.as_array().ok_or_else(|| invalid("expects an array"))?;
            if items.is_empty() && op != ConditionalOp::And {
                return Err(invalid("expects a non-empty array"));
            }
            return Ok(Expression::Conditional(
                op,
                items.iter().map(Expression::decode).collect::<Result<_>>()?,
            ));
        }
        if let Some(op) = ComparisonOp::from_key(key) {
            let [left, right] = pair(arg).ok_or_else(|| invalid("expects two operands"))?;
            return Ok(Expression::Comparison(
                op,
                Box::new(Expression::decode(left)?),
                Box::new(Expression::decode(right)?),
            ));
        }
        if let Some(kind) = DistanceKind::from_key(key) {
            let [left, right] = pair(arg).ok_or_else(|| invalid("expects two vectors"))?;
            return Ok(Expression::Distance(
                kind,
                decode_vector(left)?,
                decode_vector(right)?,
            ));
        }
        Err(invalid("unknown operator"))
    }

    pub fn simplify(&self) -> Expression {
        match self {
            Expression::Conditional(op, items) => {
                let mut out = Vec::new();
                for item in items.iter().map(Expression::simplify) {
                    match item {
                        Expression::Conditional(child, nested) if op.flattens(child) => {
                            out.extend(nested)
                        }
                        other => out.push(other),
                    }
                }
                if out.len() == 1 && *op != ConditionalOp::Nor {
                    return out.pop().expect("one element");
                }
                Expression::Conditional(*op, out)
            }
            Expression::Not(inner) => match inner.simplify() {
                Expression::Not(x) => *x,
                other => Expression::Not(Box::new(other)),
            },
            Expression::Array(items) => {
                Expression::Array(items.iter().map(Expression::simplify).collect())
            }
            Expression::Comparison(op, l, r) => {
                Expression::Comparison(*op, Box::new(l.simplify()), Box::new(r.simplify()))
            }
            Expression::Distance(kind, l, r) => Expression::Distance(
                *kind,
                l.iter().map(Expression::simplify).collect(),
                r.iter().map(Expression::simplify).collect(),
            ),
            Expression::Key(_) | Expression::Value(_) => self.clone(),
        }
    }

    pub fn key_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_keys(&mut out);
        out
    }

    fn collect_keys(&self, out: &mut Vec<String>) {
        match self {
            Expression::Key(k) => {
                if !out.contains(k) {
                    out.push(k.clone());
                }
            }
            Expression::Value(_) => {}
            Expression::Not(inner) => inner.collect_keys(out),
            Expression::Array(items) | Expression::Conditional(_, items) => {
                items.iter().for_each(|e| e.collect_keys(out))
            }
            Expression::Comparison(_, l, r) => {
                l.collect_keys(out);
                r.collect_keys(out);
            }
            Expression::Distance(_, l, r) => {
                l.iter().chain(r).for_each(|e| e.collect_keys(out))
            }
        }
    }

    pub fn map_key(&self, f: &dyn Fn(&str) -> String) -> Expression {
        match self {
            Expression::Key(k) => Expression::Key(f(k)),
            Expression::Value(_) => self.clone(),
            Expression::Not(inner) => Expression::Not(Box::new(inner.map_key(f))),
            Expression::Array(items) => {
                Expression::Array(items.iter().map(|e| e.map_key(f)).collect())
            }
            Expression::Conditional(op, items) => {
                Expression::Conditional(*op, items.iter().map(|e| e.map_key(f)).collect())
            }
            Expression::Comparison(op, l, r) => {
                Expression::Comparison(*op, Box::new(l.map_key(f)), Box::new(r.map_key(f)))
            }
            Expression::Distance(kind, l, r) => Expression::Distance(
                *kind,
                l.iter().map(|e| e.map_key(f)).collect(),
                r.iter().map(|e| e.map_key(f)).collect(),
            ),
        }
    }

    /// True for nodes that produce a boolean.
    pub fn is_boolean(&self) -> bool {
        match self {
            Expression::Not(_) | Expression::Conditional(..) | Expression::Comparison(..) => true,
            Expression::Value(v) => v.is_boolean(),
            Expression::Key(_) | Expression::Array(_) | Expression::Distance(..) => false,
        }
    }

    pub fn eval(&self, object: &Value) -> Value {
        match self {
            Expression::Key(k) => get_path(object, k).clone(),
            Expression::Value(v) => v.clone(),
            Expression::Array(items) => Value::Array(items.iter().map(|e| e.eval(object)).collect()),
            Expression::Not(inner) => Value::Bool(!truthy(&inner.eval(object))),
            Expression::Conditional(op, items) => {
                let mut results = items.iter().map(|e| truthy(&e.eval(object)));
                Value::Bool(match op {
                    ConditionalOp::And => results.all(|b| b),
                    ConditionalOp::Or => results.any(|b| b),
                    ConditionalOp::Nor => !results.any(|b| b),
                })
            }
            Expression::Comparison(op, l, r) => Value::Bool(op.eval(&l.eval(object), &r.eval(object))),
            Expression::Distance(kind, l, r) => {
                match (eval_vector(l, object), eval_vector(r, object)) {
                    (Some(a), Some(b)) => kind
                        .eval(&a, &b)
                        .map(Value::from)
                        .unwrap_or(Value::Null),
                    _ => Value::Null,
                }
            }
        }
    }
}

fn pair(arg: &Value) -> Option<[&Value; 2]> {
    match arg.as_array()?.as_slice() {
        [l, r] => Some([l, r]),
        _ => None,
    }
}

fn decode_vector(raw: &Value) -> Result<Vec<Expression>> {
    match raw {
        Value::Array(items) => items.iter().map(Expression::decode).collect(),
        other => Ok(vec![Expression::decode(other)?]),
    }
}

fn eval_vector(items: &[Expression], object: &Value) -> Option<Vec<f64>> {
    if let [single] = items {
        if let Value::Array(values) = single.eval(object) {
            return values.iter().map(as_f64).collect();
        }
    }
    items.iter().map(|e| as_f64(&e.eval(object))).collect()
}
