use super::filter::Compiled;
use super::{Frame, QueryCompiler, Scope, Target};
use crate::error::{Result, TesseraError};
use crate::query::value::as_f64;
use crate::query::{Accumulator, Expression, PercentileMode, Sort, UnaryOp};
use crate::schema::{resolve_column, ColumnPath, DataType, PrimitiveKind};
use crate::sql::{Operand, Sql, SqlValue};
use crate::validator::DecodedBaseQuery;

/// `jsonb_build_object` caps its argument count, so pairs are built in chunks.
const OBJECT_CHUNK: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateKind {
    Root,
    Pointer,
    Relation,
}

/// Projection plan mirroring the include tree.
#[derive(Debug, Clone)]
pub struct Populate {
    pub alias: String,
    pub class_name: String,
    pub kind: PopulateKind,
    /// Field on the parent this node was reached through.
    pub field: Option<String>,
    pub foreign_field: Option<String>,
    /// Local columns, shape leaves by their dotted name.
    pub columns: Vec<(String, DataType)>,
    pub children: Vec<Populate>,
    /// Nested filter, sort, pagination and group matches.
    pub query: DecodedBaseQuery,
}

/// Matches below a pointer, re-keyed relative to the pointer's target.
fn pointer_query(query: &DecodedBaseQuery, field: &str) -> DecodedBaseQuery {
    let prefix = format!("{field}.");
    DecodedBaseQuery {
        matches: query
            .matches
            .iter()
            .filter_map(|(path, q)| path.strip_prefix(&prefix).map(|rest| (rest.to_string(), q.clone())))
            .collect(),
        ..DecodedBaseQuery::default()
    }
}

fn json_object(pairs: Vec<(String, Sql)>) -> Sql {
    if pairs.is_empty() {
        return Sql::raw("'{}'::jsonb");
    }
    let mut chunks = Vec::new();
    let mut pairs = pairs.into_iter().peekable();
    while pairs.peek().is_some() {
        let chunk: Vec<Sql> = pairs
            .by_ref()
            .take(OBJECT_CHUNK)
            .map(|(key, value)| Sql::new().push_str(key).push_raw(", ").push(value))
            .collect();
        chunks.push(
            Sql::raw("jsonb_build_object(")
                .push(Sql::join(chunk, ", "))
                .push_raw(")"),
        );
    }
    Sql::join(chunks, " || ")
}

pub(crate) fn pagination(limit: Option<u64>, skip: Option<u64>) -> Sql {
    let mut sql = Sql::new();
    if let Some(limit) = limit {
        sql = sql.push_raw(format!(" LIMIT {limit}"));
    }
    if let Some(skip) = skip.filter(|s| *s > 0) {
        sql = sql.push_raw(format!(" OFFSET {skip}"));
    }
    sql
}

impl<'a> QueryCompiler<'a> {
    /// Builds the populate tree for flat include paths.
    pub fn build_populate(
        &mut self,
        class_name: &str,
        alias: &str,
        includes: &[String],
        query: &DecodedBaseQuery,
    ) -> Result<Populate> {
        self.populate_node(
            class_name,
            alias.to_string(),
            PopulateKind::Root,
            None,
            includes,
            query.clone(),
        )
    }

    fn populate_node(
        &mut self,
        class_name: &str,
        alias: String,
        kind: PopulateKind,
        field: Option<(String, Option<String>)>,
        includes: &[String],
        query: DecodedBaseQuery,
    ) -> Result<Populate> {
        let class = self.schema.class(class_name)?;
        let mut columns = Vec::new();
        let mut nested: Vec<(String, Vec<String>)> = Vec::new();
        for path in includes {
            let (head, rest) = match path.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (path.as_str(), None),
            };
            let ty = class.field(head).ok_or_else(|| {
                TesseraError::InvalidPath(format!("{class_name}.{head} does not exist"))
            })?;
            if ty.is_reference() {
                let rest = rest.unwrap_or(crate::schema::ID_FIELD).to_string();
                match nested.iter_mut().find(|(f, _)| f == head) {
                    Some((_, paths)) => paths.push(rest),
                    None => nested.push((head.to_string(), vec![rest])),
                }
                continue;
            }
            let resolved = resolve_column(self.schema, class_name, path)?;
            if resolved.path != ColumnPath::Column || resolved.data_type.is_shape() {
                return Err(TesseraError::InvalidPath(format!(
                    "{class_name}.{path} is not a projectable column"
                )));
            }
            if !columns.iter().any(|(c, _)| *c == resolved.column) {
                columns.push((resolved.column, resolved.data_type));
            }
        }

        let mut children = Vec::with_capacity(nested.len());
        for (name, paths) in nested {
            let (child_kind, target, foreign_field) = match class.field(&name) {
                Some(DataType::Pointer { target }) => (PopulateKind::Pointer, target.clone(), None),
                Some(DataType::Relation {
                    target,
                    foreign_field,
                }) => (PopulateKind::Relation, target.clone(), foreign_field.clone()),
                _ => return Err(TesseraError::InvalidPath(format!("{class_name}.{name}"))),
            };
            let child_query = match child_kind {
                PopulateKind::Relation => query.matches.get(&name).cloned().unwrap_or_default(),
                _ => pointer_query(&query, &name),
            };
            let child_alias = self.alias();
            children.push(self.populate_node(
                &target,
                child_alias,
                child_kind,
                Some((name, foreign_field)),
                &paths,
                child_query,
            )?);
        }

        let (field, foreign_field) = match field {
            Some((f, ff)) => (Some(f), ff),
            None => (None, None),
        };
        Ok(Populate {
            alias,
            class_name: class_name.to_string(),
            kind,
            field,
            foreign_field,
            columns,
            children,
            query,
        })
    }

    /// Flat `(output key, jsonb value)` pairs for a node and its children.
    pub(crate) fn projection(
        &mut self,
        scope: &mut Scope,
        owner: &Target,
        node: &Populate,
        prefix: &str,
        out: &mut Vec<(String, Sql)>,
    ) -> Result<()> {
        for (column, ty) in &node.columns {
            out.push((
                format!("{prefix}{column}"),
                self.dialect.project(owner.column(column), ty),
            ));
        }
        for child in &node.children {
            let Some(field) = child.field.as_deref() else {
                continue;
            };
            match child.kind {
                PopulateKind::Pointer => {
                    let target =
                        self.pointer_join(scope, owner, field, &child.class_name, Some(&child.alias))?;
                    self.projection(scope, &target, child, &format!("{prefix}{field}."), out)?;
                }
                PopulateKind::Relation => {
                    let array = self.relation_array(owner, field, child)?;
                    out.push((format!("{prefix}{field}"), array));
                }
                PopulateKind::Root => {}
            }
        }
        for (relation, accumulators) in &node.query.group_matches {
            for (name, accumulator) in accumulators {
                let value = self.group_match(scope, owner, relation, accumulator, &node.query)?;
                let value = match accumulator {
                    Accumulator::Group { .. } => value,
                    _ => Sql::raw("to_jsonb(").push(value).push_raw(")"),
                };
                out.push((format!("${prefix}{relation}.{name}"), value));
            }
        }
        Ok(())
    }

    /// Relation members as a JSON array of flat objects.
    fn relation_array(&mut self, owner: &Target, field: &str, node: &Populate) -> Result<Sql> {
        let member = Target::new(&node.class_name, &node.alias);
        let mut sub = Scope::default();
        let mut pairs = Vec::new();
        self.projection(&mut sub, &member, node, "", &mut pairs)?;
        let mut conds = self.member_conditions(&mut sub, owner, field, &member)?;
        if !node.query.filter.is_truth() {
            conds.push(self.selector_sql(&mut sub, &Frame::Table(member.clone()), &node.query.filter)?);
        }
        let order = match &node.query.sort {
            Some(sort) if !sort.is_empty() => self.sort_sql(&mut sub, &member, sort, &node.query)?,
            _ => self.relation_order(owner, field, &member)?,
        };
        Ok(Sql::raw("to_jsonb(ARRAY(SELECT ")
            .push(json_object(pairs))
            .push_raw(" FROM ")
            .push(sub.from(&member))
            .push_raw(" WHERE ")
            .push(Sql::and(conds))
            .push_raw(" ORDER BY ")
            .push(order)
            .push(pagination(node.query.limit, node.query.skip))
            .push_raw("))"))
    }

    /// Scalar subquery aggregating the members of `relation`; `$group`
    /// yields a JSON array of `{key, value}`.
    pub(crate) fn group_match(
        &mut self,
        scope: &mut Scope,
        owner: &Target,
        relation: &str,
        accumulator: &Accumulator,
        query: &DecodedBaseQuery,
    ) -> Result<Sql> {
        let (owner, resolved) = self.locate(scope, owner, relation)?;
        let target = match (&resolved.path, &resolved.data_type) {
            (ColumnPath::Column, DataType::Relation { target, .. }) => target.clone(),
            _ => {
                return Err(TesseraError::InvalidPath(format!(
                    "{relation} is not a relation"
                )))
            }
        };
        let member = Target::new(target, self.alias());
        let frame = Frame::Table(member.clone());
        let mut sub = Scope::default();
        let mut conds = self.member_conditions(&mut sub, &owner, &resolved.column, &member)?;
        if let Some(matched) = query.matches.get(relation) {
            if !matched.filter.is_truth() {
                conds.push(self.selector_sql(&mut sub, &frame, &matched.filter)?);
            }
        }
        match accumulator {
            Accumulator::Group { key, value } => {
                let key = self.expression(&mut sub, &frame, key)?;
                let key = self.to_json(key);
                let value = self.aggregate(&mut sub, &frame, value)?;
                let grouped = self.alias();
                Ok(Sql::raw("(SELECT COALESCE(jsonb_agg(jsonb_build_object('key', ")
                    .push(Sql::column(&grouped, "key"))
                    .push_raw(", 'value', ")
                    .push(Sql::column(&grouped, "value"))
                    .push_raw(")), '[]'::jsonb) FROM (SELECT ")
                    .push(key)
                    .push_raw(" AS ")
                    .push_ident("key")
                    .push_raw(", to_jsonb(")
                    .push(value)
                    .push_raw(") AS ")
                    .push_ident("value")
                    .push_raw(" FROM ")
                    .push(sub.from(&member))
                    .push_raw(" WHERE ")
                    .push(Sql::and(conds))
                    .push_raw(" GROUP BY 1) AS ")
                    .push_ident(&grouped)
                    .push_raw(")"))
            }
            other => {
                let value = self.aggregate(&mut sub, &frame, other)?;
                Ok(Sql::raw("(SELECT ")
                    .push(value)
                    .push_raw(" FROM ")
                    .push(sub.from(&member))
                    .push_raw(" WHERE ")
                    .push(Sql::and(conds))
                    .push_raw(")"))
            }
        }
    }

    fn aggregate(&mut self, scope: &mut Scope, frame: &Frame, accumulator: &Accumulator) -> Result<Sql> {
        match accumulator {
            Accumulator::Count => Ok(Sql::raw("COUNT(*)")),
            Accumulator::Unary(UnaryOp::Most, input) => {
                let value = self.aggregate_input(scope, frame, input, false)?;
                Ok(Sql::raw("MODE() WITHIN GROUP (ORDER BY ")
                    .push(value)
                    .push_raw(")"))
            }
            Accumulator::Unary(op, input) => {
                let value = self.aggregate_input(scope, frame, input, op.is_numeric())?;
                Ok(Sql::raw(format!("{}(", op.sql_function()))
                    .push(value)
                    .push_raw(")"))
            }
            Accumulator::Percentile { input, p, mode } => {
                let value = self.aggregate_input(scope, frame, input, true)?;
                let function = match mode {
                    PercentileMode::Discrete => "PERCENTILE_DISC(",
                    PercentileMode::Continuous => "PERCENTILE_CONT(",
                };
                Ok(Sql::raw(function)
                    .push_param(SqlValue::Float(*p))
                    .push_raw(") WITHIN GROUP (ORDER BY ")
                    .push(value)
                    .push_raw(")"))
            }
            Accumulator::Group { .. } => Err(TesseraError::InvalidExpression(
                "$group cannot be nested".into(),
            )),
        }
    }

    fn aggregate_input(
        &mut self,
        scope: &mut Scope,
        frame: &Frame,
        input: &Expression,
        numeric: bool,
    ) -> Result<Sql> {
        let not_numeric = || TesseraError::InvalidExpression("accumulator needs a numeric input".into());
        Ok(match self.expression(scope, frame, input)? {
            Compiled::Literal(value) if numeric => {
                Sql::param(SqlValue::Float(as_f64(&value).ok_or_else(not_numeric)?))
            }
            Compiled::Literal(value) => Sql::param(SqlValue::Json(value)),
            Compiled::Operand(Operand::Scalar {
                sql,
                kind: PrimitiveKind::Number | PrimitiveKind::Decimal,
            }) => sql,
            Compiled::Operand(Operand::Json(sql)) if numeric => Sql::raw("CASE WHEN jsonb_typeof(")
                .push(sql.clone())
                .push_raw(") = 'number' THEN (")
                .push(sql)
                .push_raw(")::numeric END"),
            Compiled::Operand(Operand::Json(sql)) => Sql::raw("(").push(sql).push_raw(" #>> '{}')"),
            Compiled::Operand(_) if numeric => return Err(not_numeric()),
            Compiled::Operand(operand) => operand.sql().clone(),
        })
    }

    /// ORDER BY list; `$rel.name` keys sort by a group match.
    pub(crate) fn sort_sql(
        &mut self,
        scope: &mut Scope,
        owner: &Target,
        sort: &Sort,
        query: &DecodedBaseQuery,
    ) -> Result<Sql> {
        let frame = Frame::Table(owner.clone());
        let mut keys = Vec::new();
        match sort {
            Sort::Map(items) => {
                for (path, order) in items {
                    let key = match path.strip_prefix('$') {
                        Some(alias) => self.group_sort_key(scope, owner, alias, query)?,
                        None => self.operand(scope, &frame, path)?.sql().clone(),
                    };
                    keys.push(self.dialect.sort_key(key, *order));
                }
            }
            Sort::Expressions(items) => {
                for item in items {
                    let key = match &item.expr {
                        Expression::Key(path) if path.starts_with('$') => {
                            self.group_sort_key(scope, owner, &path[1..], query)?
                        }
                        expr => match self.expression(scope, &frame, expr)? {
                            Compiled::Operand(operand) => operand.sql().clone(),
                            Compiled::Literal(value) => Sql::param(SqlValue::Json(value)),
                        },
                    };
                    keys.push(self.dialect.sort_key(key, item.order));
                }
            }
        }
        Ok(Sql::join(keys, ", "))
    }

    fn group_sort_key(
        &mut self,
        scope: &mut Scope,
        owner: &Target,
        alias: &str,
        query: &DecodedBaseQuery,
    ) -> Result<Sql> {
        let found: Option<(String, Accumulator)> = query.group_matches.iter().find_map(|(rel, accs)| {
            accs.iter()
                .find(|(name, _)| format!("{rel}.{name}") == alias)
                .map(|(_, acc)| (rel.clone(), acc.clone()))
        });
        let (relation, accumulator) = found.ok_or_else(|| {
            TesseraError::InvalidPath(format!("unknown group match '{alias}'"))
        })?;
        self.group_match(scope, owner, &relation, &accumulator, query)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::compile;
    use super::*;
    use crate::schema::sample_schema;
    use crate::sql::PostgresDialect;
    use crate::validator::{Auth, FindOptions, QueryAction, QueryValidator};
    use serde_json::json;

    fn decoded(raw: serde_json::Value) -> crate::validator::DecodedQuery {
        let schema = sample_schema();
        let options: FindOptions = serde_json::from_value(raw).unwrap();
        QueryValidator::new(&schema, &Auth::master())
            .decode_query("Note", &options, QueryAction::Find)
            .unwrap()
    }

    #[test]
    fn populate_mirrors_includes() {
        let schema = sample_schema();
        let query = decoded(json!({"includes": ["title", "author.company", "tags"]}));
        let mut compiler = QueryCompiler::new(&schema, &PostgresDialect);
        let root = compiler
            .build_populate("Note", "Note", &query.includes, &query.base)
            .unwrap();
        assert_eq!(root.kind, PopulateKind::Root);
        assert!(root.columns.iter().any(|(c, _)| c == "title"));
        let author = root.children.iter().find(|c| c.field.as_deref() == Some("author")).unwrap();
        assert_eq!(author.kind, PopulateKind::Pointer);
        let company = &author.children[0];
        assert_eq!(company.class_name, "Company");
        assert!(company.columns.iter().any(|(c, _)| c == "name"));
        let tags = root.children.iter().find(|c| c.field.as_deref() == Some("tags")).unwrap();
        assert_eq!(tags.kind, PopulateKind::Relation);
        assert_ne!(tags.alias, author.alias);
    }

    #[test]
    fn relation_projection_builds_json_arrays() {
        let schema = sample_schema();
        let query = decoded(json!({
            "includes": ["tags"],
            "matches": {"tags": {"filter": {"status": "open"}, "limit": 3}}
        }));
        let mut compiler = QueryCompiler::new(&schema, &PostgresDialect);
        let root = compiler
            .build_populate("Note", "Note", &query.includes, &query.base)
            .unwrap();
        let mut scope = Scope::default();
        let mut pairs = Vec::new();
        compiler
            .projection(&mut scope, &Target::new("Note", "Note"), &root, "", &mut pairs)
            .unwrap();
        let (_, tags) = pairs.iter().find(|(k, _)| k == "tags").unwrap();
        let text = compile(tags).text;
        assert!(text.starts_with("to_jsonb(ARRAY(SELECT jsonb_build_object('_id', "));
        assert!(text.contains("\"_p1\".\"status\" = $1::text"));
        assert!(text.ends_with(" LIMIT 3))"));
    }

    #[test]
    fn group_matches_are_aliased_by_relation() {
        let schema = sample_schema();
        let query = decoded(json!({
            "groupMatches": {"comments": {
                "total": {"$count": true},
                "byBody": {"$group": {"key": {"$key": "body"}, "value": {"$count": true}}}
            }}
        }));
        let mut compiler = QueryCompiler::new(&schema, &PostgresDialect);
        let root = compiler
            .build_populate("Note", "Note", &query.includes, &query.base)
            .unwrap();
        let mut scope = Scope::default();
        let mut pairs = Vec::new();
        compiler
            .projection(&mut scope, &Target::new("Note", "Note"), &root, "", &mut pairs)
            .unwrap();
        let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"$comments.total"));
        assert!(keys.contains(&"$comments.byBody"));
        let (_, total) = pairs.iter().find(|(k, _)| k == "$comments.total").unwrap();
        assert!(compile(total).text.starts_with("to_jsonb((SELECT COUNT(*) FROM \"Comment\""));
        let (_, grouped) = pairs.iter().find(|(k, _)| k == "$comments.byBody").unwrap();
        assert!(compile(grouped).text.contains("GROUP BY 1"));
    }

    #[test]
    fn nested_group_is_rejected() {
        let schema = sample_schema();
        let query = decoded(json!({
            "groupMatches": {"tags": {"g": {"$group": {
                "key": {"$key": "status"},
                "value": {"$group": {"key": {"$key": "name"}, "value": {"$count": true}}}
            }}}}
        }));
        let mut compiler = QueryCompiler::new(&schema, &PostgresDialect);
        let root = compiler
            .build_populate("Note", "Note", &query.includes, &query.base)
            .unwrap();
        let mut pairs = Vec::new();
        let err = compiler
            .projection(&mut Scope::default(), &Target::new("Note", "Note"), &root, "", &mut pairs)
            .unwrap_err();
        assert!(matches!(err, TesseraError::InvalidExpression(_)));
    }

    #[test]
    fn object_pairs_are_chunked() {
        let pairs: Vec<(String, Sql)> = (0..120).map(|i| (format!("k{i}"), Sql::int(i))).collect();
        let text = compile(&json_object(pairs)).text;
        assert_eq!(text.matches("jsonb_build_object(").count(), 3);
        assert_eq!(text.matches(" || ").count(), 2);
    }
}
