//! Lowers decoded queries to parameterized SQL.
//!
//! A compile pass owns its alias counter. Pointer hops become `LEFT JOIN`s
//! registered on the current [`Scope`]; relations become correlated
//! subqueries with their own scope.

mod ddl;
mod filter;
mod populate;
mod statement;

pub use populate::{Populate, PopulateKind};
pub use statement::RowLock;

use crate::error::{Result, TesseraError};
use crate::query::SELF_KEY;
use crate::schema::{
    parse_path, render_path, resolve_column, ColumnPath, DataType, PrimitiveKind, ResolvedColumn,
    Schema, ID_FIELD,
};
use crate::sql::{Dialect, Operand, Sql};
use crate::validator::ExtraFilter;
use std::collections::BTreeMap;

/// One table reference inside a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub class: String,
    pub alias: String,
}

impl Target {
    pub(crate) fn new(class: impl Into<String>, alias: impl Into<String>) -> Self {
        Target {
            class: class.into(),
            alias: alias.into(),
        }
    }

    pub(crate) fn column(&self, name: &str) -> Sql {
        Sql::column(&self.alias, name)
    }

    /// `('Class$' || alias._id)`, the token other rows store to reference this one.
    pub(crate) fn token(&self) -> Sql {
        Sql::raw("(")
            .push_str(format!("{}$", self.class))
            .push_raw(" || ")
            .push(self.column(ID_FIELD))
            .push_raw(")")
    }
}

/// What unqualified keys of a selector refer to.
pub(crate) enum Frame {
    Table(Target),
    /// One element of an array; `$` names it.
    Element(Operand),
}

/// FROM-clause state of one (sub)query.
#[derive(Debug, Default)]
pub(crate) struct Scope {
    joins: Vec<Sql>,
    keyed: BTreeMap<(String, String), String>,
}

impl Scope {
    pub(crate) fn from(&self, target: &Target) -> Sql {
        let mut sql = Sql::ident(&target.class);
        if target.alias != target.class {
            sql = sql.push_raw(" AS ").push_ident(&target.alias);
        }
        self.with_joins(sql)
    }

    /// FROM a CTE that stands in for the target's table.
    pub(crate) fn from_source(&self, source: &str, target: &Target) -> Sql {
        self.with_joins(
            Sql::ident(source)
                .push_raw(" AS ")
                .push_ident(&target.alias),
        )
    }

    fn with_joins(&self, mut sql: Sql) -> Sql {
        for join in &self.joins {
            sql = sql.push_raw(" ").push(join.clone());
        }
        sql
    }
}

fn json_path(sql: Sql, segments: &[String]) -> Sql {
    Sql::raw("(")
        .push(sql)
        .push_raw(" #> ARRAY[")
        .push(Sql::join(
            segments.iter().map(|s| Sql::new().push_str(s.clone())).collect(),
            ", ",
        ))
        .push_raw("]::text[])")
}

fn coalesce_false(pred: Sql) -> Sql {
    Sql::raw("COALESCE(").push(pred).push_raw(", false)")
}

fn element_operand(element: &Operand, path: &str) -> Result<Operand> {
    if path == SELF_KEY {
        return Ok(element.clone());
    }
    match element {
        Operand::Json(sql) => {
            let segments = parse_path(path)?
                .iter()
                .map(|s| render_path(std::slice::from_ref(s)))
                .collect::<Vec<_>>();
            Ok(Operand::Json(json_path(sql.clone(), &segments)))
        }
        _ => Err(TesseraError::InvalidPath(format!(
            "'{path}' inside a scalar element; use '{SELF_KEY}'"
        ))),
    }
}

pub struct QueryCompiler<'a> {
    schema: &'a Schema,
    dialect: &'a dyn Dialect,
    extra_filter: Option<ExtraFilter>,
    next_alias: usize,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(schema: &'a Schema, dialect: &'a dyn Dialect) -> Self {
        QueryCompiler {
            schema,
            dialect,
            extra_filter: None,
            next_alias: 0,
        }
    }

    pub(crate) fn alias(&mut self) -> String {
        self.next_alias += 1;
        format!("_p{}", self.next_alias)
    }

    /// Extra filter for a joined class, compiled against `target`.
    pub(crate) fn extra_predicate(
        &mut self,
        scope: &mut Scope,
        target: &Target,
    ) -> Result<Option<Sql>> {
        let Some(filter) = self.extra_filter.clone() else {
            return Ok(None);
        };
        let selector = filter(&target.class).simplify();
        if selector.is_truth() {
            return Ok(None);
        }
        self.selector_sql(scope, &Frame::Table(target.clone()), &selector)
            .map(Some)
    }

    /// `LEFT JOIN` for a pointer column, shared by every path that crosses it.
    pub(crate) fn pointer_join(
        &mut self,
        scope: &mut Scope,
        owner: &Target,
        column: &str,
        target_class: &str,
        preferred: Option<&str>,
    ) -> Result<Target> {
        let key = (owner.alias.clone(), column.to_string());
        if let Some(alias) = scope.keyed.get(&key) {
            return Ok(Target::new(target_class, alias.clone()));
        }
        let alias = match preferred {
            Some(alias) => alias.to_string(),
            None => self.alias(),
        };
        let target = Target::new(target_class, alias.clone());
        let mut inner = Scope::default();
        let table = match self.extra_predicate(&mut inner, &target)? {
            None => Sql::ident(target_class)
                .push_raw(" AS ")
                .push_ident(&alias),
            Some(pred) => Sql::raw("(SELECT ")
                .push_ident(&alias)
                .push_raw(".* FROM ")
                .push(inner.from(&target))
                .push_raw(" WHERE ")
                .push(pred)
                .push_raw(") AS ")
                .push_ident(&alias),
        };
        scope.joins.push(
            Sql::raw("LEFT JOIN ")
                .push(table)
                .push_raw(" ON ")
                .push(owner.column(column))
                .push_raw(" = ")
                .push(target.token()),
        );
        scope.keyed.insert(key, alias);
        Ok(target)
    }

    /// Follows pointer hops, joining as needed, until the path ends on a
    /// column of the returned target.
    pub(crate) fn locate(
        &mut self,
        scope: &mut Scope,
        owner: &Target,
        path: &str,
    ) -> Result<(Target, ResolvedColumn)> {
        let mut owner = owner.clone();
        let mut path = path.to_string();
        loop {
            let resolved = resolve_column(self.schema, &owner.class, &path)?;
            let ColumnPath::Pointer { rest } = &resolved.path else {
                return Ok((owner, resolved));
            };
            let DataType::Pointer { target } = &resolved.data_type else {
                return Err(TesseraError::InvalidPath(path));
            };
            let next = self.pointer_join(scope, &owner, &resolved.column, target, None)?;
            path = render_path(rest);
            owner = next;
        }
    }

    /// Predicate stating that `member` belongs to `owner.field`.
    pub(crate) fn contains_condition(
        &self,
        owner: &Target,
        field: &str,
        member: &Target,
    ) -> Result<Sql> {
        let mut seen = Vec::new();
        self.contains_inner(owner, field, member, &mut seen)
    }

    fn contains_inner(
        &self,
        owner: &Target,
        field: &str,
        member: &Target,
        seen: &mut Vec<(String, String)>,
    ) -> Result<Sql> {
        let key = (owner.class.clone(), field.to_string());
        if seen.contains(&key) {
            return Err(TesseraError::InvalidPath(format!(
                "{}.{field} resolves through a foreign field cycle",
                owner.class
            )));
        }
        seen.push(key);
        let invalid = || TesseraError::InvalidPath(format!("{}.{field} is not a reference", owner.class));
        let ty = self.schema.class(&owner.class)?.field(field).ok_or_else(invalid)?;
        match ty {
            DataType::Pointer { .. } => Ok(coalesce_false(
                owner
                    .column(field)
                    .push_raw(" = ")
                    .push(member.token()),
            )),
            DataType::Relation {
                foreign_field: None,
                ..
            } => Ok(coalesce_false(
                member
                    .token()
                    .push_raw(" = ANY(")
                    .push(owner.column(field))
                    .push_raw(")"),
            )),
            DataType::Relation {
                target,
                foreign_field: Some(foreign),
            } => match self.schema.class(target)?.field(foreign) {
                Some(DataType::Pointer { .. }) => Ok(coalesce_false(
                    member
                        .column(foreign)
                        .push_raw(" = ")
                        .push(owner.token()),
                )),
                Some(DataType::Relation {
                    foreign_field: None,
                    ..
                }) => Ok(coalesce_false(
                    owner
                        .token()
                        .push_raw(" = ANY(")
                        .push(member.column(foreign))
                        .push_raw(")"),
                )),
                Some(DataType::Relation {
                    foreign_field: Some(_),
                    ..
                }) => self.contains_inner(member, foreign, owner, seen),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        }
    }

    /// Default member order: position in a token column, otherwise `_id`.
    pub(crate) fn relation_order(&self, owner: &Target, field: &str, member: &Target) -> Result<Sql> {
        let ty = self.schema.class(&owner.class)?.field(field);
        Ok(match ty {
            Some(DataType::Relation {
                foreign_field: None,
                ..
            }) => Sql::raw("array_position(")
                .push(owner.column(field))
                .push_raw(", ")
                .push(member.token())
                .push_raw(")"),
            _ => member.column(ID_FIELD),
        })
    }

    /// Visible members of a relation, as conditions over a fresh member alias.
    pub(crate) fn member_conditions(
        &mut self,
        scope: &mut Scope,
        owner: &Target,
        field: &str,
        member: &Target,
    ) -> Result<Vec<Sql>> {
        let mut conds = vec![self.contains_condition(owner, field, member)?];
        conds.extend(self.extra_predicate(scope, member)?);
        Ok(conds)
    }

    fn relation_tokens(&mut self, owner: &Target, field: &str, target_class: &str) -> Result<Sql> {
        let member = Target::new(target_class, self.alias());
        let mut sub = Scope::default();
        let conds = self.member_conditions(&mut sub, owner, field, &member)?;
        let order = self.relation_order(owner, field, &member)?;
        Ok(Sql::raw("ARRAY(SELECT ")
            .push(member.token())
            .push_raw(" FROM ")
            .push(sub.from(&member))
            .push_raw(" WHERE ")
            .push(Sql::and(conds))
            .push_raw(" ORDER BY ")
            .push(order)
            .push_raw(")"))
    }

    fn relation_element(
        &mut self,
        owner: &Target,
        resolved: &ResolvedColumn,
        index: usize,
        rest: &[crate::schema::PathSegment],
    ) -> Result<Operand> {
        let target = resolved
            .data_type
            .target()
            .ok_or_else(|| TesseraError::InvalidPath(resolved.column.clone()))?;
        let member = Target::new(target, self.alias());
        let mut sub = Scope::default();
        let inner = self.operand(&mut sub, &Frame::Table(member.clone()), &render_path(rest))?;
        let conds = self.member_conditions(&mut sub, owner, &resolved.column, &member)?;
        let order = self.relation_order(owner, &resolved.column, &member)?;
        let sql = Sql::raw("(SELECT ")
            .push(inner.sql().clone())
            .push_raw(" FROM ")
            .push(sub.from(&member))
            .push_raw(" WHERE ")
            .push(Sql::and(conds))
            .push_raw(" ORDER BY ")
            .push(order)
            .push_raw(format!(" LIMIT 1 OFFSET {index})"));
        Ok(inner.with_sql(sql))
    }

    /// Typed SQL for a key path in the given frame.
    pub(crate) fn operand(&mut self, scope: &mut Scope, frame: &Frame, path: &str) -> Result<Operand> {
        let owner = match frame {
            Frame::Element(element) => return element_operand(element, path),
            Frame::Table(owner) => owner,
        };
        if path == SELF_KEY {
            return Ok(Operand::Token {
                sql: owner.token(),
                target: owner.class.clone(),
            });
        }
        let (owner, resolved) = self.locate(scope, owner, path)?;
        let column = owner.column(&resolved.column);
        match &resolved.path {
            ColumnPath::Column => match &resolved.data_type {
                DataType::Relation {
                    target,
                    foreign_field: Some(_),
                } => Ok(Operand::Tokens {
                    sql: self.relation_tokens(&owner, &resolved.column, target)?,
                    target: target.clone(),
                }),
                ty => Operand::for_column(column, ty),
            },
            ColumnPath::Json(segments) => Ok(Operand::Json(json_path(column, segments))),
            ColumnPath::VectorElement(index) => Ok(Operand::Scalar {
                sql: column.parens().push_raw(format!("[{}]", index + 1)),
                kind: PrimitiveKind::Number,
            }),
            ColumnPath::RelationElement { index, rest } => {
                self.relation_element(&owner, &resolved, *index, rest)
            }
            ColumnPath::Pointer { .. } => Err(TesseraError::InvalidPath(path.to_string())),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::schema::sample_schema;
    use crate::sql::{CompiledSql, PostgresDialect};

    pub(crate) fn compile(sql: &Sql) -> CompiledSql {
        sql.compile(&PostgresDialect)
    }

    #[test]
    fn pointer_joins_are_shared() {
        let schema = sample_schema();
        let mut compiler = QueryCompiler::new(&schema, &PostgresDialect);
        let mut scope = Scope::default();
        let root = Target::new("Note", "Note");
        let frame = Frame::Table(root.clone());
        let a = compiler.operand(&mut scope, &frame, "author.name").unwrap();
        let b = compiler
            .operand(&mut scope, &frame, "author.company.name")
            .unwrap();
        assert_eq!(scope.joins.len(), 2);
        assert_eq!(compile(a.sql()).text, "\"_p1\".\"name\"");
        assert_eq!(compile(b.sql()).text, "\"_p2\".\"name\"");
        let from = compile(&scope.from(&root)).text;
        assert_eq!(
            from,
            "\"Note\" LEFT JOIN \"User\" AS \"_p1\" ON \"Note\".\"author\" = ('User$' || \"_p1\".\"_id\") \
             LEFT JOIN \"Company\" AS \"_p2\" ON \"_p1\".\"company\" = ('Company$' || \"_p2\".\"_id\")"
        );
    }

    #[test]
    fn contains_follows_foreign_fields() {
        let schema = sample_schema();
        let compiler = QueryCompiler::new(&schema, &PostgresDialect);
        let note = Target::new("Note", "Note");
        let tag = Target::new("Tag", "_p1");
        let comment = Target::new("Comment", "_p2");
        let tags = compile(&compiler.contains_condition(&note, "tags", &tag).unwrap()).text;
        assert_eq!(
            tags,
            "COALESCE(('Tag$' || \"_p1\".\"_id\") = ANY(\"Note\".\"tags\"), false)"
        );
        let comments =
            compile(&compiler.contains_condition(&note, "comments", &comment).unwrap()).text;
        assert_eq!(
            comments,
            "COALESCE(\"_p2\".\"note\" = ('Note$' || \"Note\".\"_id\"), false)"
        );
    }

    #[test]
    fn foreign_field_cycles_are_rejected() {
        let schema = Schema::from_json(serde_json::json!({
            "A": { "fields": { "bs": {"type": "relation", "target": "B", "foreignField": "as"} } },
            "B": { "fields": { "as": {"type": "relation", "target": "A", "foreignField": "bs"} } }
        }))
        .unwrap();
        let compiler = QueryCompiler::new(&schema, &PostgresDialect);
        let err = compiler
            .contains_condition(&Target::new("A", "A"), "bs", &Target::new("B", "_p1"))
            .unwrap_err();
        assert!(matches!(err, TesseraError::InvalidPath(_)));
    }

    #[test]
    fn relation_index_becomes_scalar_subquery() {
        let schema = sample_schema();
        let mut compiler = QueryCompiler::new(&schema, &PostgresDialect);
        let mut scope = Scope::default();
        let frame = Frame::Table(Target::new("Note", "Note"));
        let op = compiler.operand(&mut scope, &frame, "tags.1.name").unwrap();
        let text = compile(op.sql()).text;
        assert!(text.starts_with("(SELECT \"_p1\".\"name\" FROM \"Tag\" AS \"_p1\" WHERE"));
        assert!(text.ends_with("ORDER BY array_position(\"Note\".\"tags\", ('Tag$' || \"_p1\".\"_id\")) LIMIT 1 OFFSET 1)"));
    }

    #[test]
    fn vector_elements_are_one_based() {
        let schema = sample_schema();
        let mut compiler = QueryCompiler::new(&schema, &PostgresDialect);
        let mut scope = Scope::default();
        let frame = Frame::Table(Target::new("Note", "Note"));
        let op = compiler.operand(&mut scope, &frame, "embedding[0]").unwrap();
        assert_eq!(compile(op.sql()).text, "(\"Note\".\"embedding\")[1]");
        let op = compiler.operand(&mut scope, &frame, "meta.a.0").unwrap();
        assert_eq!(
            compile(op.sql()).text,
            "(\"Note\".\"meta\" #> ARRAY['a', '0']::text[])"
        );
    }
}
