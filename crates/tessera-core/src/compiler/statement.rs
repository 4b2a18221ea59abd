use super::populate::pagination;
use super::{Frame, QueryCompiler, Scope, Target};
use crate::error::{Result, TesseraError};
use crate::query::value::get_path;
use crate::schema::{
    resolve_column, shape_paths, ColumnPath, DataType, CREATED_AT_FIELD, ID_FIELD, RPERM_FIELD,
    UPDATED_AT_FIELD, VERSION_FIELD, WPERM_FIELD,
};
use crate::sql::{Sql, SqlValue, UpdateOp};
use crate::validator::DecodedQuery;
use serde_json::{json, Map, Value};

const CANDIDATES: &str = "_candidates";
const UPDATED: &str = "_updated";
const INSERTED: &str = "_inserted";
const DELETED: &str = "_deleted";

/// Row lock taken on the root table; contention fails immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLock {
    Update,
    Share,
}

impl RowLock {
    fn sql(self, root: &Target) -> Sql {
        let mode = match self {
            RowLock::Update => " FOR UPDATE OF ",
            RowLock::Share => " FOR SHARE OF ",
        };
        Sql::raw(mode).push_ident(&root.alias).push_raw(" NOWAIT")
    }
}

/// Projection and FROM state shared by a read and its refetch.
struct Projection {
    scope: Scope,
    columns: Vec<(String, Sql)>,
}

impl Projection {
    fn select_list(&self) -> Sql {
        Sql::join(
            self.columns
                .iter()
                .map(|(key, value)| value.clone().push_raw(" AS ").push_ident(key.clone()))
                .collect(),
            ", ",
        )
    }
}

fn is_foreign(ty: &DataType) -> bool {
    matches!(
        ty,
        DataType::Relation {
            foreign_field: Some(_),
            ..
        }
    )
}

impl<'a> QueryCompiler<'a> {
    fn begin(&mut self, query: &DecodedQuery) -> Target {
        self.extra_filter = query.extra_filter.clone();
        Target::new(&query.class_name, &query.class_name)
    }

    fn read_projection(&mut self, query: &DecodedQuery, root: &Target) -> Result<Projection> {
        let node = self.build_populate(&root.class, &root.alias, &query.includes, &query.base)?;
        let mut scope = Scope::default();
        let mut columns = Vec::new();
        self.projection(&mut scope, root, &node, "", &mut columns)?;
        Ok(Projection { scope, columns })
    }

    /// Merged filter plus the `related_by` restriction.
    fn where_sql(&mut self, scope: &mut Scope, query: &DecodedQuery, root: &Target) -> Result<Sql> {
        let mut conds = vec![self.selector_sql(scope, &Frame::Table(root.clone()), &query.base.filter)?];
        if let Some(related) = &query.related_by {
            let parent = Target::new(&related.class_name, self.alias());
            let mut inner = Scope::default();
            let mut parent_conds = vec![
                parent
                    .column(ID_FIELD)
                    .push_raw(" = ")
                    .push_param(SqlValue::Text(related.object_id.clone())),
                self.contains_condition(&parent, &related.key, root)?,
            ];
            // the parent must itself be readable by the caller
            if let Some(pred) = self.extra_predicate(&mut inner, &parent)? {
                parent_conds.push(pred);
            }
            conds.push(
                Sql::raw("EXISTS (SELECT 1 FROM ")
                    .push(inner.from(&parent))
                    .push_raw(" WHERE ")
                    .push(Sql::and(parent_conds))
                    .push_raw(")"),
            );
        }
        Ok(Sql::and(conds))
    }

    fn order_sql(&mut self, scope: &mut Scope, query: &DecodedQuery, root: &Target) -> Result<Sql> {
        match &query.base.sort {
            Some(sort) if !sort.is_empty() => Ok(Sql::raw(" ORDER BY ")
                .push(self.sort_sql(scope, root, sort, &query.base)?)),
            _ => Ok(Sql::new()),
        }
    }

    /// `SELECT` with the full projection, filter, order and pagination.
    pub fn find(&mut self, query: &DecodedQuery, lock: Option<RowLock>) -> Result<Sql> {
        let root = self.begin(query);
        let mut projection = self.read_projection(query, &root)?;
        let filter = self.where_sql(&mut projection.scope, query, &root)?;
        let order = self.order_sql(&mut projection.scope, query, &root)?;
        let mut sql = Sql::raw("SELECT ")
            .push(projection.select_list())
            .push_raw(" FROM ")
            .push(projection.scope.from(&root))
            .push_raw(" WHERE ")
            .push(filter)
            .push(order)
            .push(pagination(query.base.limit, query.base.skip));
        if let Some(lock) = lock {
            sql = sql.push(lock.sql(&root));
        }
        Ok(sql)
    }

    pub fn count(&mut self, query: &DecodedQuery) -> Result<Sql> {
        let root = self.begin(query);
        let mut scope = Scope::default();
        let filter = self.where_sql(&mut scope, query, &root)?;
        Ok(Sql::raw("SELECT COUNT(*) AS ")
            .push_ident("count")
            .push_raw(" FROM ")
            .push(scope.from(&root))
            .push_raw(" WHERE ")
            .push(filter))
    }

    /// Random sample; with a weight path rows are drawn proportionally to it.
    pub fn random(&mut self, query: &DecodedQuery, weight: Option<&str>) -> Result<Sql> {
        let root = self.begin(query);
        let mut projection = self.read_projection(query, &root)?;
        let filter = self.where_sql(&mut projection.scope, query, &root)?;
        let weight = match weight {
            Some(path) => Some(
                self.operand(&mut projection.scope, &Frame::Table(root.clone()), path)?
                    .sql()
                    .clone(),
            ),
            None => None,
        };
        Ok(Sql::raw("SELECT ")
            .push(projection.select_list())
            .push_raw(" FROM ")
            .push(projection.scope.from(&root))
            .push_raw(" WHERE ")
            .push(filter)
            .push_raw(" ORDER BY ")
            .push(self.dialect.random_order(weight))
            .push(pagination(query.base.limit, query.base.skip)))
    }

    pub fn explain(&mut self, query: &DecodedQuery) -> Result<Sql> {
        Ok(Sql::raw("EXPLAIN (FORMAT JSON) ").push(self.find(query, None)?))
    }

    /// Column list and value row for one new object.
    fn insert_row(&self, class_name: &str, attrs: &Map<String, Value>) -> Result<(Vec<String>, Vec<Sql>)> {
        let class = self.schema.class(class_name)?;
        let payload = Value::Object(attrs.clone());
        for key in attrs.keys() {
            let head = key.split('.').next().unwrap_or(key);
            match class.field(head) {
                None => {
                    return Err(TesseraError::InvalidPath(format!(
                        "{class_name}.{head} does not exist"
                    )))
                }
                Some(ty) if is_foreign(ty) => {
                    return Err(TesseraError::InvalidDataType(format!(
                        "{class_name}.{head} is derived from its foreign field"
                    )))
                }
                Some(_) if key != head => {
                    resolve_column(self.schema, class_name, key)?;
                }
                Some(_) => {}
            }
        }
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for (field, ty) in &class.fields {
            for (leaf, leaf_ty) in shape_paths(field, ty) {
                if self.dialect.column_type(&leaf_ty).is_none() {
                    continue;
                }
                let value = match leaf.as_str() {
                    VERSION_FIELD => Sql::int(0),
                    CREATED_AT_FIELD | UPDATED_AT_FIELD => Sql::raw("NOW()"),
                    _ => {
                        let raw = attrs.get(&leaf).unwrap_or_else(|| get_path(&payload, &leaf));
                        let raw = match (raw, leaf.as_str()) {
                            (Value::Null, ID_FIELD) => {
                                return Err(TesseraError::InvalidDataType(format!(
                                    "{class_name} objects need an _id"
                                )))
                            }
                            (Value::Null, RPERM_FIELD | WPERM_FIELD) => json!(["*"]),
                            (Value::Null, _) => leaf_ty.default_value().unwrap_or(Value::Null),
                            (other, _) => other.clone(),
                        };
                        Sql::param(self.dialect.encode_value(&leaf_ty, &raw)?)
                    }
                };
                columns.push(leaf);
                values.push(value);
            }
        }
        Ok((columns, values))
    }

    fn column_list(columns: &[String]) -> Sql {
        Sql::raw("(")
            .push(Sql::join(columns.iter().map(|c| Sql::ident(c.clone())).collect(), ", "))
            .push_raw(")")
    }

    /// Inserts objects and returns them with the read projection.
    pub fn insert(&mut self, query: &DecodedQuery, objects: &[Map<String, Value>]) -> Result<Sql> {
        let root = self.begin(query);
        let mut columns = Vec::new();
        let mut rows = Vec::with_capacity(objects.len());
        for attrs in objects {
            let (cols, values) = self.insert_row(&root.class, attrs)?;
            columns = cols;
            rows.push(Sql::raw("(").push(Sql::join(values, ", ")).push_raw(")"));
        }
        if rows.is_empty() {
            return Err(TesseraError::InvalidDataType("nothing to insert".into()));
        }
        let projection = self.read_projection(query, &root)?;
        Ok(Sql::raw("WITH ")
            .push_ident(INSERTED)
            .push_raw(" AS (INSERT INTO ")
            .push_ident(&root.class)
            .push_raw(" ")
            .push(Self::column_list(&columns))
            .push_raw(" VALUES ")
            .push(Sql::join(rows, ", "))
            .push_raw(" RETURNING *) SELECT ")
            .push(projection.select_list())
            .push_raw(" FROM ")
            .push(projection.scope.from_source(INSERTED, &root)))
    }

    /// `SET` assignments, one folded expression per physical column.
    fn assignments(&self, root: &Target, update: &Map<String, Value>) -> Result<Vec<(String, Sql)>> {
        let mut out: Vec<(String, Sql)> = Vec::new();
        for (key, raw) in update {
            let head = key.split(['.', '[']).next().unwrap_or(key);
            if matches!(head, ID_FIELD | VERSION_FIELD | CREATED_AT_FIELD | UPDATED_AT_FIELD) {
                return Err(TesseraError::InvalidPath(format!("{head} is read-only")));
            }
            let (op, value) = UpdateOp::decode(raw)?;
            let resolved = resolve_column(self.schema, &root.class, key)?;
            if is_foreign(&resolved.data_type) {
                return Err(TesseraError::InvalidDataType(format!(
                    "{}.{key} is derived from its foreign field",
                    root.class
                )));
            }
            match &resolved.path {
                ColumnPath::Column if resolved.data_type.is_shape() => {
                    if op != UpdateOp::Set {
                        return Err(TesseraError::InvalidExpression(format!(
                            "shape {key} only supports $set"
                        )));
                    }
                    for (leaf, ty) in shape_paths(&resolved.column, &resolved.data_type) {
                        let relative = &leaf[resolved.column.len() + 1..];
                        let leaf_value = get_path(&value, relative).clone();
                        self.assign(&mut out, root, &leaf, &ty, &[], UpdateOp::Set, &leaf_value)?;
                    }
                }
                ColumnPath::Column => {
                    self.assign(&mut out, root, &resolved.column, &resolved.data_type, &[], op, &value)?
                }
                ColumnPath::Json(path) => {
                    self.assign(&mut out, root, &resolved.column, &resolved.data_type, path, op, &value)?
                }
                _ => {
                    return Err(TesseraError::InvalidPath(format!(
                        "{}.{key} cannot be updated in place",
                        root.class
                    )))
                }
            }
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn assign(
        &self,
        out: &mut Vec<(String, Sql)>,
        root: &Target,
        column: &str,
        ty: &DataType,
        json_path: &[String],
        op: UpdateOp,
        value: &Value,
    ) -> Result<()> {
        match out.iter_mut().find(|(c, _)| c == column) {
            Some((_, current)) => {
                *current = self
                    .dialect
                    .update_expression(current.clone(), ty, json_path, op, value)?;
            }
            None => {
                let expr = self
                    .dialect
                    .update_expression(root.column(column), ty, json_path, op, value)?;
                out.push((column.to_string(), expr));
            }
        }
        Ok(())
    }

    /// `"_candidates" AS (SELECT _id ... FOR UPDATE OF root NOWAIT)`.
    fn candidates(&mut self, query: &DecodedQuery, root: &Target) -> Result<Sql> {
        let mut scope = Scope::default();
        let filter = self.where_sql(&mut scope, query, root)?;
        let order = self.order_sql(&mut scope, query, root)?;
        Ok(Sql::ident(CANDIDATES)
            .push_raw(" AS (SELECT ")
            .push(root.column(ID_FIELD))
            .push_raw(" FROM ")
            .push(scope.from(root))
            .push_raw(" WHERE ")
            .push(filter)
            .push(order)
            .push(pagination(query.base.limit, query.base.skip))
            .push(RowLock::Update.sql(root))
            .push_raw(")"))
    }

    fn matches_candidate(root: &Target) -> Sql {
        root.column(ID_FIELD)
            .push_raw(" = ")
            .push(Sql::column(CANDIDATES, ID_FIELD))
    }

    fn updated_cte(&self, root: &Target, update: &Map<String, Value>) -> Result<Sql> {
        let mut sets = vec![
            Sql::ident(VERSION_FIELD)
                .push_raw(" = ")
                .push(root.column(VERSION_FIELD))
                .push_raw(" + 1"),
            Sql::ident(UPDATED_AT_FIELD).push_raw(" = NOW()"),
        ];
        for (column, expr) in self.assignments(root, update)? {
            sets.push(Sql::ident(column).push_raw(" = ").push(expr));
        }
        Ok(Sql::ident(UPDATED)
            .push_raw(" AS (UPDATE ")
            .push_ident(&root.class)
            .push_raw(" SET ")
            .push(Sql::join(sets, ", "))
            .push_raw(" FROM ")
            .push_ident(CANDIDATES)
            .push_raw(" WHERE ")
            .push(Self::matches_candidate(root))
            .push_raw(" RETURNING ")
            .push_ident(&root.class)
            .push_raw(".*)"))
    }

    /// Locks, updates and refetches every matching object. The version
    /// counter and update timestamp always move.
    pub fn update(&mut self, query: &DecodedQuery, update: &Map<String, Value>) -> Result<Sql> {
        let root = self.begin(query);
        let candidates = self.candidates(query, &root)?;
        let updated = self.updated_cte(&root, update)?;
        let projection = self.read_projection(query, &root)?;
        Ok(Sql::raw("WITH ")
            .push(candidates)
            .push_raw(", ")
            .push(updated)
            .push_raw(" SELECT ")
            .push(projection.select_list())
            .push_raw(" FROM ")
            .push(projection.scope.from_source(UPDATED, &root)))
    }

    /// Update, or insert `insert` when no row was updated. Exactly one branch
    /// produces rows.
    pub fn upsert(
        &mut self,
        query: &DecodedQuery,
        update: &Map<String, Value>,
        insert: &Map<String, Value>,
    ) -> Result<Sql> {
        let root = self.begin(query);
        let candidates = self.candidates(query, &root)?;
        let updated = self.updated_cte(&root, update)?;
        let (columns, values) = self.insert_row(&root.class, insert)?;
        let projection = self.read_projection(query, &root)?;
        let inserted = Sql::ident(INSERTED)
            .push_raw(" AS (INSERT INTO ")
            .push_ident(&root.class)
            .push_raw(" ")
            .push(Self::column_list(&columns))
            .push_raw(" SELECT ")
            .push(Sql::join(values, ", "))
            .push_raw(" WHERE NOT EXISTS (SELECT 1 FROM ")
            .push_ident(UPDATED)
            .push_raw(") RETURNING *)");
        let branch = |source: &str| {
            Sql::raw("(SELECT ")
                .push(projection.select_list())
                .push_raw(" FROM ")
                .push(projection.scope.from_source(source, &root))
                .push_raw(")")
        };
        Ok(Sql::raw("WITH ")
            .push(candidates)
            .push_raw(", ")
            .push(updated)
            .push_raw(", ")
            .push(inserted)
            .push_raw(" ")
            .push(branch(UPDATED))
            .push_raw(" UNION ALL ")
            .push(branch(INSERTED)))
    }

    /// Deletes every matching object, returning it as last seen.
    pub fn delete(&mut self, query: &DecodedQuery) -> Result<Sql> {
        let root = self.begin(query);
        let candidates = self.candidates(query, &root)?;
        let projection = self.read_projection(query, &root)?;
        Ok(Sql::raw("WITH ")
            .push(candidates)
            .push_raw(", ")
            .push_ident(DELETED)
            .push_raw(" AS (DELETE FROM ")
            .push_ident(&root.class)
            .push_raw(" USING ")
            .push_ident(CANDIDATES)
            .push_raw(" WHERE ")
            .push(Self::matches_candidate(&root))
            .push_raw(" RETURNING ")
            .push_ident(&root.class)
            .push_raw(".*) SELECT ")
            .push(projection.select_list())
            .push_raw(" FROM ")
            .push(projection.scope.from_source(DELETED, &root)))
    }

    /// Every `(class, field)` whose column stores tokens of `target`.
    fn referencing_fields(&self, target: &str) -> Vec<(String, String, DataType)> {
        let mut out = Vec::new();
        for (class_name, class) in self.schema.classes() {
            for (field, ty) in &class.fields {
                for (leaf, leaf_ty) in shape_paths(field, ty) {
                    let stored = match &leaf_ty {
                        DataType::Pointer { target: t } => t == target,
                        DataType::Relation {
                            target: t,
                            foreign_field: None,
                        } => t == target,
                        _ => false,
                    };
                    if stored {
                        out.push((class_name.clone(), leaf, leaf_ty));
                    }
                }
            }
        }
        out
    }

    fn references(column: Sql, ty: &DataType, token: Sql) -> Sql {
        match ty {
            DataType::Pointer { .. } => Sql::raw("COALESCE(")
                .push(column)
                .push_raw(" = ")
                .push(token)
                .push_raw(", false)"),
            _ => Sql::raw("COALESCE(")
                .push(token)
                .push_raw(" = ANY(")
                .push(column)
                .push_raw("), false)"),
        }
    }

    /// `(class, field, _id)` of every object referencing one of `ids`.
    pub fn refs(&mut self, class_name: &str, ids: &[String]) -> Result<Sql> {
        self.schema.class(class_name)?;
        let tokens: Vec<String> = ids
            .iter()
            .map(|id| crate::schema::object_token(class_name, id))
            .collect();
        let mut branches = Vec::new();
        for (owner, field, ty) in self.referencing_fields(class_name) {
            let source = Target::new(&owner, &owner);
            let pred = match ty {
                DataType::Pointer { .. } => source
                    .column(&field)
                    .push_raw(" = ANY(")
                    .push_param(SqlValue::TextArray(tokens.clone()))
                    .push_raw(")"),
                _ => source
                    .column(&field)
                    .push_raw(" && ")
                    .push_param(SqlValue::TextArray(tokens.clone())),
            };
            branches.push(
                Sql::raw("(SELECT ")
                    .push_str(owner.clone())
                    .push_raw("::text AS ")
                    .push_ident("class")
                    .push_raw(", ")
                    .push_str(field)
                    .push_raw("::text AS ")
                    .push_ident("field")
                    .push_raw(", ")
                    .push(source.column(ID_FIELD))
                    .push_raw(" AS ")
                    .push_ident(ID_FIELD)
                    .push_raw(" FROM ")
                    .push_ident(&owner)
                    .push_raw(" WHERE ")
                    .push(pred)
                    .push_raw(")"),
            );
        }
        if branches.is_empty() {
            return Ok(Sql::raw("SELECT NULL::text AS ")
                .push_ident("class")
                .push_raw(", NULL::text AS ")
                .push_ident("field")
                .push_raw(", NULL::text AS ")
                .push_ident(ID_FIELD)
                .push_raw(" WHERE false"));
        }
        Ok(Sql::join(branches, " UNION ALL "))
    }

    /// Matching objects that nothing references.
    pub fn nonrefs(&mut self, query: &DecodedQuery) -> Result<Sql> {
        let root = self.begin(query);
        let mut projection = self.read_projection(query, &root)?;
        let mut conds = vec![self.where_sql(&mut projection.scope, query, &root)?];
        for (owner, field, ty) in self.referencing_fields(&root.class) {
            let source = Target::new(&owner, self.alias());
            let pred = Self::references(source.column(&field), &ty, root.token());
            conds.push(
                Sql::raw("NOT EXISTS (SELECT 1 FROM ")
                    .push(Scope::default().from(&source))
                    .push_raw(" WHERE ")
                    .push(pred)
                    .push_raw(")"),
            );
        }
        let order = self.order_sql(&mut projection.scope, query, &root)?;
        Ok(Sql::raw("SELECT ")
            .push(projection.select_list())
            .push_raw(" FROM ")
            .push(projection.scope.from(&root))
            .push_raw(" WHERE ")
            .push(Sql::and(conds))
            .push(order)
            .push(pagination(query.base.limit, query.base.skip)))
    }
}
