use super::expression::{single_entry, Expression};
use super::value::{as_f64, compare, equals};
use crate::error::{Result, TesseraError};
use serde_json::{Map, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Max,
    Min,
    Sum,
    Avg,
    StdDevPop,
    StdDevSamp,
    VarPop,
    VarSamp,
    Most,
}

impl UnaryOp {
    pub fn from_key(key: &str) -> Option<Self> {
        Some(match key {
            "$max" => Self::Max,
            "$min" => Self::Min,
            "$sum" => Self::Sum,
            "$avg" => Self::Avg,
            "$stdDevPop" => Self::StdDevPop,
            "$stdDevSamp" => Self::StdDevSamp,
            "$varPop" => Self::VarPop,
            "$varSamp" => Self::VarSamp,
            "$most" => Self::Most,
            _ => return None,
        })
    }

    /// SQL aggregate name. `Most` is an ordered-set aggregate.
    pub fn sql_function(self) -> &'static str {
        match self {
            Self::Max => "MAX",
            Self::Min => "MIN",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::StdDevPop => "STDDEV_POP",
            Self::StdDevSamp => "STDDEV_SAMP",
            Self::VarPop => "VAR_POP",
            Self::VarSamp => "VAR_SAMP",
            Self::Most => "MODE",
        }
    }

    /// Aggregates that only make sense over numbers.
    pub fn is_numeric(self) -> bool {
        !matches!(self, Self::Max | Self::Min | Self::Most)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PercentileMode {
    Discrete,
    Continuous,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Count,
    Unary(UnaryOp, Expression),
    Percentile {
        input: Expression,
        p: f64,
        mode: PercentileMode,
    },
    Group {
        key: Expression,
        value: Box<Accumulator>,
    },
}

impl Accumulator {
    pub fn decode(raw: &Value) -> Result<Self> {
        let (key, arg) = single_entry(raw, "accumulator")?;
        let invalid = |reason: &str| TesseraError::InvalidExpression(format!("{key}: {reason}"));
        if key == "$count" {
            return Ok(Accumulator::Count);
        }
        if let Some(op) = UnaryOp::from_key(key) {
            return Ok(Accumulator::Unary(op, Expression::decode(arg)?));
        }
        let obj = arg.as_object().ok_or_else(|| invalid("expects an object"))?;
        match key.as_str() {
            "$percentile" => {
                let input = obj.get("input").ok_or_else(|| invalid("missing input"))?;
                let p = obj
                    .get("p")
                    .and_then(Value::as_f64)
                    .filter(|p| (0.0..=1.0).contains(p))
                    .ok_or_else(|| invalid("p must be a number between 0 and 1"))?;
                let mode = match obj.get("mode").and_then(Value::as_str) {
                    None | Some("discrete") => PercentileMode::Discrete,
                    Some("continuous") => PercentileMode::Continuous,
                    Some(_) => return Err(invalid("mode must be discrete or continuous")),
                };
                Ok(Accumulator::Percentile {
                    input: Expression::decode(input)?,
                    p,
                    mode,
                })
            }
            "$group" => {
                let group_key = obj.get("key").ok_or_else(|| invalid("missing key"))?;
                let value = obj.get("value").ok_or_else(|| invalid("missing value"))?;
                Ok(Accumulator::Group {
                    key: Expression::decode(group_key)?,
                    value: Box::new(Accumulator::decode(value)?),
                })
            }
            _ => Err(invalid("unknown accumulator")),
        }
    }

    pub fn key_paths(&self) -> Vec<String> {
        match self {
            Accumulator::Count => Vec::new(),
            Accumulator::Unary(_, expr) | Accumulator::Percentile { input: expr, .. } => {
                expr.key_paths()
            }
            Accumulator::Group { key, value } => {
                let mut out = key.key_paths();
                for k in value.key_paths() {
                    if !out.contains(&k) {
                        out.push(k);
                    }
                }
                out
            }
        }
    }

    pub fn map_key(&self, f: &dyn Fn(&str) -> String) -> Accumulator {
        match self {
            Accumulator::Count => Accumulator::Count,
            Accumulator::Unary(op, expr) => Accumulator::Unary(*op, expr.map_key(f)),
            Accumulator::Percentile { input, p, mode } => Accumulator::Percentile {
                input: input.map_key(f),
                p: *p,
                mode: *mode,
            },
            Accumulator::Group { key, value } => Accumulator::Group {
                key: key.map_key(f),
                value: Box::new(value.map_key(f)),
            },
        }
    }

    /// Aggregates in-memory rows with SQL semantics: nulls are skipped and an
    /// empty input yields null (zero for `$count`).
    pub fn eval(&self, rows: &[Value]) -> Value {
        match self {
            Accumulator::Count => Value::from(rows.len() as u64),
            Accumulator::Unary(op, expr) => {
                let values: Vec<Value> = rows
                    .iter()
                    .map(|r| expr.eval(r))
                    .filter(|v| !v.is_null())
                    .collect();
                eval_unary(*op, values)
            }
            Accumulator::Percentile { input, p, mode } => {
                let mut values: Vec<f64> =
                    rows.iter().filter_map(|r| as_f64(&input.eval(r))).collect();
                if values.is_empty() {
                    return Value::Null;
                }
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
                let n = values.len();
                match mode {
                    PercentileMode::Discrete => {
                        let pos = ((p * n as f64).ceil() as usize).clamp(1, n);
                        Value::from(values[pos - 1])
                    }
                    PercentileMode::Continuous => {
                        let rank = p * (n - 1) as f64;
                        let lo = rank.floor() as usize;
                        let hi = rank.ceil() as usize;
                        let frac = rank - lo as f64;
                        Value::from(values[lo] + (values[hi] - values[lo]) * frac)
                    }
                }
            }
            Accumulator::Group { key, value } => {
                let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
                for row in rows {
                    let k = key.eval(row);
                    match groups.iter_mut().find(|(g, _)| equals(g, &k)) {
                        Some((_, members)) => members.push(row.clone()),
                        None => groups.push((k, vec![row.clone()])),
                    }
                }
                Value::Array(
                    groups
                        .into_iter()
                        .map(|(k, members)| {
                            let mut entry = Map::new();
                            entry.insert("key".into(), k);
                            entry.insert("value".into(), value.eval(&members));
                            Value::Object(entry)
                        })
                        .collect(),
                )
            }
        }
    }
}

fn eval_unary(op: UnaryOp, values: Vec<Value>) -> Value {
    if values.is_empty() {
        return Value::Null;
    }
    match op {
        UnaryOp::Max | UnaryOp::Min => {
            let wanted = if op == UnaryOp::Max {
                Ordering::Greater
            } else {
                Ordering::Less
            };
            let mut best = values[0].clone();
            for v in &values[1..] {
                if compare(v, &best) == Some(wanted) {
                    best = v.clone();
                }
            }
            best
        }
        UnaryOp::Most => {
            let mut counts: Vec<(Value, usize)> = Vec::new();
            for v in values {
                match counts.iter_mut().find(|(c, _)| equals(c, &v)) {
                    Some((_, n)) => *n += 1,
                    None => counts.push((v, 1)),
                }
            }
            counts
                .into_iter()
                .reduce(|best, cur| {
                    let more = cur.1 > best.1;
                    let tie_smaller = cur.1 == best.1 && compare(&cur.0, &best.0) == Some(Ordering::Less);
                    if more || tie_smaller {
                        cur
                    } else {
                        best
                    }
                })
                .map(|(v, _)| v)
                .unwrap_or(Value::Null)
        }
        _ => {
            let nums: Vec<f64> = values.iter().filter_map(as_f64).collect();
            if nums.is_empty() {
                return Value::Null;
            }
            let n = nums.len() as f64;
            let sum: f64 = nums.iter().sum();
            let mean = sum / n;
            let squares: f64 = nums.iter().map(|x| (x - mean).powi(2)).sum();
            let result = match op {
                UnaryOp::Sum => sum,
                UnaryOp::Avg => mean,
                UnaryOp::VarPop => squares / n,
                UnaryOp::StdDevPop => (squares / n).sqrt(),
                UnaryOp::VarSamp | UnaryOp::StdDevSamp if nums.len() < 2 => return Value::Null,
                UnaryOp::VarSamp => squares / (n - 1.0),
                UnaryOp::StdDevSamp => (squares / (n - 1.0)).sqrt(),
                UnaryOp::Max | UnaryOp::Min | UnaryOp::Most => return Value::Null,
            };
            Value::from(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Value> {
        ["open", "open", "closed", "closed", "closed"]
            .iter()
            .enumerate()
            .map(|(i, s)| json!({"status": s, "score": i + 1}))
            .collect()
    }

    #[test]
    fn group_counts_by_key() {
        let acc = Accumulator::decode(&json!({"$group": {"key": {"$key": "status"}, "value": {"$count": true}}})).unwrap();
        let out = acc.eval(&rows());
        let mut pairs: Vec<(String, u64)> = out
            .as_array()
            .unwrap()
            .iter()
            .map(|e| (e["key"].as_str().unwrap().to_string(), e["value"].as_u64().unwrap()))
            .collect();
        pairs.sort();
        assert_eq!(pairs, vec![("closed".into(), 3), ("open".into(), 2)]);
        assert_eq!(acc.key_paths(), vec!["status"]);
    }

    #[test]
    fn unary_aggregates() {
        let r = rows();
        let eval = |raw: Value| Accumulator::decode(&raw).unwrap().eval(&r);
        assert_eq!(eval(json!({"$sum": {"$key": "score"}})), json!(15.0));
        assert_eq!(eval(json!({"$avg": {"$key": "score"}})), json!(3.0));
        assert_eq!(eval(json!({"$max": {"$key": "score"}})), json!(5));
        assert_eq!(eval(json!({"$most": {"$key": "status"}})), json!("closed"));
        assert_eq!(eval(json!({"$varPop": {"$key": "score"}})), json!(2.0));
        assert_eq!(Accumulator::Count.eval(&[]), json!(0));
        assert_eq!(
            Accumulator::decode(&json!({"$sum": {"$key": "score"}})).unwrap().eval(&[]),
            Value::Null
        );
    }

    #[test]
    fn percentile_modes() {
        let r = rows();
        let disc = Accumulator::decode(&json!({"$percentile": {"input": {"$key": "score"}, "p": 0.5}})).unwrap();
        assert_eq!(disc.eval(&r), json!(3.0));
        let cont = Accumulator::decode(&json!({"$percentile": {"input": {"$key": "score"}, "p": 0.25, "mode": "continuous"}})).unwrap();
        assert_eq!(cont.eval(&r), json!(2.0));
        assert!(Accumulator::decode(&json!({"$percentile": {"input": {"$key": "score"}, "p": 2}})).is_err());
    }

    #[test]
    fn rejects_unknown_and_multi_key() {
        assert!(Accumulator::decode(&json!({"$median": {"$key": "a"}})).is_err());
        assert!(Accumulator::decode(&json!({"$count": true, "$sum": {"$key": "a"}})).is_err());
    }
}
