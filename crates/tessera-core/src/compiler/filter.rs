use super::{Frame, QueryCompiler, Scope, Target};
use crate::error::{Result, TesseraError};
use crate::query::value::truthy;
use crate::query::{ComparisonOp, ConditionalOp, Expression, FieldExpr, Selector, SELF_KEY};
use crate::schema::{resolve_data_type, ColumnPath, DataType, PrimitiveKind};
use crate::sql::{Operand, Sql, SqlValue};
use serde_json::Value;

/// A compiled expression: typed SQL, or a literal still known at compile time.
pub(crate) enum Compiled {
    Operand(Operand),
    Literal(Value),
}

fn boolean(sql: Sql) -> Compiled {
    Compiled::Operand(Operand::Scalar {
        sql,
        kind: PrimitiveKind::Boolean,
    })
}

fn flip(op: ComparisonOp) -> ComparisonOp {
    match op {
        ComparisonOp::Gt => ComparisonOp::Lt,
        ComparisonOp::Gte => ComparisonOp::Lte,
        ComparisonOp::Lt => ComparisonOp::Gt,
        ComparisonOp::Lte => ComparisonOp::Gte,
        other => other,
    }
}

fn connect(op: ConditionalOp, parts: Vec<Sql>) -> Sql {
    match op {
        ConditionalOp::And => Sql::and(parts),
        ConditionalOp::Or => Sql::or(parts),
        ConditionalOp::Nor => Sql::or(parts).not(),
    }
}

/// `NOT EXISTS (.. AND NOT pred)` for `$every`, `EXISTS (.. AND pred)` for `$some`.
fn quantify(every: bool, from: Sql, mut conds: Vec<Sql>, pred: Sql) -> Sql {
    conds.push(if every { pred.not() } else { pred });
    let exists = Sql::raw("EXISTS (SELECT 1 FROM ")
        .push(from)
        .push_raw(" WHERE ")
        .push(Sql::and(conds))
        .push_raw(")");
    if every {
        Sql::raw("NOT ").push(exists)
    } else {
        exists
    }
}

fn vector_cast(sql: Sql, dimension: Option<usize>) -> Sql {
    let cast = match dimension {
        Some(d) => format!("::vector({d})"),
        None => "::vector".to_string(),
    };
    sql.parens().push_raw(cast)
}

impl<'a> QueryCompiler<'a> {
    /// Null-safe predicate for a selector.
    pub(crate) fn selector_sql(
        &mut self,
        scope: &mut Scope,
        frame: &Frame,
        selector: &Selector,
    ) -> Result<Sql> {
        match selector {
            Selector::Conditional(op, items) => {
                let parts = items
                    .iter()
                    .map(|s| self.selector_sql(scope, frame, s))
                    .collect::<Result<Vec<_>>>()?;
                Ok(connect(*op, parts))
            }
            Selector::Field(path, expr) => self.field_sql(scope, frame, path, expr),
            Selector::Expression(expr) => {
                let compiled = self.expression(scope, frame, expr)?;
                Ok(self.truth(compiled))
            }
        }
    }

    fn field_sql(
        &mut self,
        scope: &mut Scope,
        frame: &Frame,
        path: &str,
        expr: &FieldExpr,
    ) -> Result<Sql> {
        match expr {
            FieldExpr::Not(inner) if inner.element_selector().is_some() => {
                Ok(self.field_sql(scope, frame, path, inner)?.not())
            }
            FieldExpr::Every(selector) => self.element_sql(scope, frame, path, true, selector),
            FieldExpr::Some(selector) => self.element_sql(scope, frame, path, false, selector),
            _ => {
                let operand = self.operand(scope, frame, path)?;
                self.dialect.field_expression(&operand, expr)
            }
        }
    }

    fn element_sql(
        &mut self,
        scope: &mut Scope,
        frame: &Frame,
        path: &str,
        every: bool,
        selector: &Selector,
    ) -> Result<Sql> {
        if let Frame::Table(owner) = frame {
            if path != SELF_KEY {
                let (owner, resolved) = self.locate(scope, owner, path)?;
                if let (ColumnPath::Column, DataType::Relation { target, .. }) =
                    (&resolved.path, &resolved.data_type)
                {
                    let member = Target::new(target.clone(), self.alias());
                    let mut sub = Scope::default();
                    let pred = self.selector_sql(&mut sub, &Frame::Table(member.clone()), selector)?;
                    let conds = self.member_conditions(&mut sub, &owner, &resolved.column, &member)?;
                    return Ok(quantify(every, sub.from(&member), conds, pred));
                }
            }
        }

        let operand = self.operand(scope, frame, path)?;
        let alias = self.alias();
        let value = Sql::column(&alias, "value");
        let (source, element, guard) = match &operand {
            Operand::Array { sql, element } => (
                Sql::raw("unnest(").push(sql.clone()).push_raw(")"),
                Operand::Scalar {
                    sql: value,
                    kind: *element,
                },
                None,
            ),
            Operand::Tokens { sql, target } => (
                Sql::raw("unnest(").push(sql.clone()).push_raw(")"),
                Operand::Token {
                    sql: value,
                    target: target.clone(),
                },
                None,
            ),
            Operand::Json(sql) => (
                Sql::raw("jsonb_array_elements(CASE WHEN jsonb_typeof(")
                    .push(sql.clone())
                    .push_raw(") = 'array' THEN ")
                    .push(sql.clone())
                    .push_raw(" ELSE '[]'::jsonb END)"),
                Operand::Json(value),
                Some(
                    Sql::raw("COALESCE(jsonb_typeof(")
                        .push(sql.clone())
                        .push_raw(") IN ('array', 'null'), true)"),
                ),
            ),
            _ => {
                return Err(TesseraError::InvalidExpression(format!(
                    "'{path}' is not an array"
                )))
            }
        };
        let from = source
            .push_raw(" AS ")
            .push_ident(&alias)
            .push_raw("(")
            .push_ident("value")
            .push_raw(")");
        let mut sub = Scope::default();
        let pred = self.selector_sql(&mut sub, &Frame::Element(element), selector)?;
        let quantified = quantify(every, from, Vec::new(), pred);
        Ok(match guard {
            Some(guard) if every => Sql::and(vec![guard, quantified]),
            _ => quantified,
        })
    }

    pub(crate) fn truth(&self, compiled: Compiled) -> Sql {
        match compiled {
            Compiled::Operand(operand) => self.dialect.truthy(&operand),
            Compiled::Literal(value) => Sql::raw(self.dialect.bool_literal(truthy(&value))),
        }
    }

    /// JSON rendering of a compiled value.
    pub(crate) fn to_json(&self, compiled: Compiled) -> Sql {
        match compiled {
            Compiled::Operand(Operand::Json(sql)) => sql,
            Compiled::Operand(operand) => Sql::raw("to_jsonb(")
                .push(operand.sql().clone())
                .push_raw(")"),
            Compiled::Literal(value) => Sql::param(SqlValue::Json(value)),
        }
    }

    pub(crate) fn expression(
        &mut self,
        scope: &mut Scope,
        frame: &Frame,
        expr: &Expression,
    ) -> Result<Compiled> {
        Ok(match expr {
            Expression::Key(path) => Compiled::Operand(self.operand(scope, frame, path)?),
            Expression::Value(value) => Compiled::Literal(value.clone()),
            Expression::Array(items) => {
                let compiled = items
                    .iter()
                    .map(|e| self.expression(scope, frame, e))
                    .collect::<Result<Vec<_>>>()?;
                if compiled.iter().all(|c| matches!(c, Compiled::Literal(_))) {
                    Compiled::Literal(Value::Array(
                        compiled
                            .into_iter()
                            .filter_map(|c| match c {
                                Compiled::Literal(v) => Some(v),
                                Compiled::Operand(_) => None,
                            })
                            .collect(),
                    ))
                } else {
                    let items = compiled.into_iter().map(|c| self.to_json(c)).collect();
                    Compiled::Operand(Operand::Json(
                        Sql::raw("jsonb_build_array(")
                            .push(Sql::join(items, ", "))
                            .push_raw(")"),
                    ))
                }
            }
            Expression::Not(inner) => {
                let compiled = self.expression(scope, frame, inner)?;
                boolean(self.truth(compiled).not())
            }
            Expression::Conditional(op, items) => {
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    let compiled = self.expression(scope, frame, item)?;
                    parts.push(self.truth(compiled));
                }
                boolean(connect(*op, parts))
            }
            Expression::Comparison(op, left, right) => {
                let left = self.expression(scope, frame, left)?;
                let right = self.expression(scope, frame, right)?;
                let sql = match (left, right) {
                    (Compiled::Operand(l), Compiled::Operand(r)) => {
                        self.dialect.compare_operands(*op, &l, &r)
                    }
                    (Compiled::Operand(l), Compiled::Literal(v)) => self
                        .dialect
                        .field_expression(&l, &FieldExpr::Comparison(*op, v))?,
                    (Compiled::Literal(v), Compiled::Operand(r)) => self
                        .dialect
                        .field_expression(&r, &FieldExpr::Comparison(flip(*op), v))?,
                    (Compiled::Literal(l), Compiled::Literal(r)) => {
                        Sql::raw(self.dialect.bool_literal(op.eval(&l, &r)))
                    }
                };
                boolean(sql)
            }
            Expression::Distance(kind, left, right) => {
                let left = self.vector_side(scope, frame, left)?;
                let right = self.vector_side(scope, frame, right)?;
                Compiled::Operand(Operand::Scalar {
                    sql: self.dialect.distance(*kind, left, right),
                    kind: PrimitiveKind::Number,
                })
            }
        })
    }

    fn key_dimension(&self, frame: &Frame, path: &str) -> Option<usize> {
        let Frame::Table(owner) = frame else {
            return None;
        };
        match resolve_data_type(self.schema, &owner.class, path) {
            Ok(Some(DataType::Vector { dimension, .. })) => Some(dimension),
            _ => None,
        }
    }

    /// One side of a distance operator as a pgvector value.
    fn vector_side(&mut self, scope: &mut Scope, frame: &Frame, items: &[Expression]) -> Result<Sql> {
        let not_vector = || TesseraError::InvalidExpression("distance operands must be vectors".into());
        if let [single] = items {
            let dimension = match single {
                Expression::Key(path) => self.key_dimension(frame, path),
                _ => None,
            };
            match self.expression(scope, frame, single)? {
                Compiled::Operand(Operand::Array {
                    sql,
                    element: PrimitiveKind::Number,
                }) => return Ok(vector_cast(sql, dimension)),
                Compiled::Operand(Operand::Json(sql)) => {
                    let array = Sql::raw("ARRAY(SELECT jsonb_array_elements_text(")
                        .push(sql)
                        .push_raw(")::double precision)");
                    return Ok(vector_cast(array, None));
                }
                Compiled::Literal(Value::Array(values)) => {
                    let floats = values
                        .iter()
                        .map(Value::as_f64)
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(not_vector)?;
                    return Ok(vector_cast(Sql::param(SqlValue::FloatArray(floats)), None));
                }
                Compiled::Literal(Value::Number(n)) => {
                    let x = n.as_f64().ok_or_else(not_vector)?;
                    return Ok(vector_cast(Sql::param(SqlValue::FloatArray(vec![x])), None));
                }
                _ => return Err(not_vector()),
            }
        }
        let mut elements = Vec::with_capacity(items.len());
        for item in items {
            let element = match self.expression(scope, frame, item)? {
                Compiled::Literal(value) => {
                    Sql::param(SqlValue::Float(value.as_f64().ok_or_else(not_vector)?))
                }
                Compiled::Operand(Operand::Scalar {
                    sql,
                    kind: PrimitiveKind::Number | PrimitiveKind::Decimal,
                }) => sql.parens().push_raw("::double precision"),
                _ => return Err(not_vector()),
            };
            elements.push(element);
        }
        Ok(vector_cast(
            Sql::raw("ARRAY[").push(Sql::join(elements, ", ")).push_raw("]"),
            None,
        ))
    }
}
