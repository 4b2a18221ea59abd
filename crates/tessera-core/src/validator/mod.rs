//! Lowers raw client requests into security-checked `DecodedQuery` values.

mod auth;

pub use auth::Auth;

use crate::error::{Result, TesseraError};
use crate::query::value::date_value;
use crate::query::{Accumulator, ComparisonOp, ConditionalOp, FieldExpr, Selector, Sort};
use crate::schema::{
    parse_path, render_path, resolve_column, resolve_data_type, shape_paths, ClassAction, ClassSchema,
    DataType, FieldAction, PathSegment, Schema, CREATED_AT_FIELD, DEFAULT_FIELDS,
    EXPIRED_AT_FIELD, ID_FIELD, RPERM_FIELD, UPDATED_AT_FIELD, VERSION_FIELD, WPERM_FIELD,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Extra per-class predicate applied at every join depth.
pub type ExtraFilter = Arc<dyn Fn(&str) -> Selector + Send + Sync>;

/// Raw find request as sent by a client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FindOptions {
    pub filter: Option<Value>,
    pub sort: Option<Value>,
    pub includes: Vec<String>,
    /// Nested options per populated relation path.
    pub matches: BTreeMap<String, FindOptions>,
    /// Relation path -> output name -> accumulator.
    pub group_matches: BTreeMap<String, BTreeMap<String, Value>>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    pub related_by: Option<RelatedBy>,
}

/// Restricts results to the members of one object's relation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedBy {
    pub class_name: String,
    pub object_id: String,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryAction {
    Find,
    Count,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Default)]
pub struct DecodedBaseQuery {
    pub filter: Selector,
    pub sort: Option<Sort>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub matches: BTreeMap<String, DecodedBaseQuery>,
    pub group_matches: BTreeMap<String, BTreeMap<String, Accumulator>>,
}

#[derive(Clone)]
pub struct DecodedQuery {
    pub class_name: String,
    pub base: DecodedBaseQuery,
    pub includes: Vec<String>,
    pub extra_filter: Option<ExtraFilter>,
    pub related_by: Option<RelatedBy>,
}

impl fmt::Debug for DecodedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedQuery")
            .field("class_name", &self.class_name)
            .field("base", &self.base)
            .field("includes", &self.includes)
            .field("extra_filter", &self.extra_filter.is_some())
            .field("related_by", &self.related_by)
            .finish()
    }
}

impl DecodedQuery {
    /// Unfiltered query over every default field, for internal lookups.
    pub fn all(class_name: impl Into<String>) -> Self {
        DecodedQuery {
            class_name: class_name.into(),
            base: DecodedBaseQuery::default(),
            includes: DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect(),
            extra_filter: None,
            related_by: None,
        }
    }
}

/// `_expired_at is null OR _expired_at > now`.
pub fn expiry_guard(now: DateTime<Utc>) -> Selector {
    Selector::Conditional(
        ConditionalOp::Or,
        vec![
            Selector::Field(
                EXPIRED_AT_FIELD.into(),
                FieldExpr::Comparison(ComparisonOp::Eq, Value::Null),
            ),
            Selector::Field(
                EXPIRED_AT_FIELD.into(),
                FieldExpr::Comparison(ComparisonOp::Gt, date_value(now)),
            ),
        ],
    )
}

fn acl_selector(field: &str, tokens: &[String]) -> Selector {
    Selector::Field(
        field.into(),
        FieldExpr::Intersect(tokens.iter().cloned().map(Value::String).collect()),
    )
}

fn id_literal(expr: &FieldExpr) -> Option<&str> {
    match expr {
        FieldExpr::Comparison(ComparisonOp::Eq, Value::String(id)) => Some(id),
        FieldExpr::In(values) => {
            let first = values.first()?.as_str()?;
            values
                .iter()
                .all(|v| v.as_str() == Some(first))
                .then_some(first)
        }
        _ => None,
    }
}

/// Identifier targeted by a filter that is exclusively an `_id` equality.
pub fn get_method_id(filter: &Selector) -> Option<&str> {
    match filter {
        Selector::Field(key, expr) if key == ID_FIELD => id_literal(expr),
        Selector::Conditional(ConditionalOp::And, items) if !items.is_empty() => {
            let mut ids = items.iter().map(get_method_id);
            let first = ids.next()??;
            ids.all(|id| id == Some(first)).then_some(first)
        }
        _ => None,
    }
}

pub fn is_get_method(filter: &Selector) -> bool {
    get_method_id(filter).is_some()
}

/// Rejects values nested deeper than `max_depth`.
pub fn check_recursive(value: &Value, max_depth: usize) -> Result<()> {
    let mut stack = vec![(value, 0usize)];
    while let Some((value, depth)) = stack.pop() {
        if depth > max_depth {
            return Err(TesseraError::RecursiveDataDetected);
        }
        match value {
            Value::Array(items) => stack.extend(items.iter().map(|v| (v, depth + 1))),
            Value::Object(obj) => stack.extend(obj.values().map(|v| (v, depth + 1))),
            _ => {}
        }
    }
    Ok(())
}

fn push_unique(out: &mut Vec<String>, path: String) {
    if !out.contains(&path) {
        out.push(path);
    }
}

pub struct QueryValidator<'a> {
    schema: &'a Schema,
    auth: &'a Auth,
    max_depth: usize,
    extra_filter: Option<ExtraFilter>,
    now: DateTime<Utc>,
}

impl<'a> QueryValidator<'a> {
    pub fn new(schema: &'a Schema, auth: &'a Auth) -> Self {
        QueryValidator {
            schema,
            auth,
            max_depth: DEFAULT_MAX_DEPTH,
            extra_filter: None,
            now: Utc::now(),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_extra_filter(mut self, filter: ExtraFilter) -> Self {
        self.extra_filter = Some(filter);
        self
    }

    pub fn decode_query(
        &self,
        class_name: &str,
        options: &FindOptions,
        action: QueryAction,
    ) -> Result<DecodedQuery> {
        let class = self.schema.class(class_name)?;
        let filter = self.decode_filter(options.filter.as_ref())?;
        let class_action = match action {
            QueryAction::Find if is_get_method(&filter) => ClassAction::Get,
            QueryAction::Find => ClassAction::Find,
            QueryAction::Count => ClassAction::Count,
            QueryAction::Create => ClassAction::Create,
            QueryAction::Update => ClassAction::Update,
            QueryAction::Delete => ClassAction::Delete,
        };
        self.authorize_class(class_name, class, class_action)?;

        let mut base = self.decode_base(class_name, options)?;
        let includes = self.expand_includes(class_name, &options.includes)?;
        for path in &includes {
            self.authorize_path(class_name, path)?;
        }
        let related_by = options
            .related_by
            .as_ref()
            .map(|r| self.check_related_by(class_name, r))
            .transpose()?;

        let mut parts = vec![std::mem::take(&mut base.filter)];
        if let Some(extra) = &self.extra_filter {
            parts.push(extra(class_name));
        }
        if let Some(acl) = self.object_acl(class, action) {
            parts.push(acl);
        }
        parts.push(expiry_guard(self.now));
        base.filter = Selector::and(parts).simplify();

        Ok(DecodedQuery {
            class_name: class_name.to_string(),
            base,
            includes,
            extra_filter: Some(self.nested_filter()),
            related_by,
        })
    }

    fn decode_filter(&self, raw: Option<&Value>) -> Result<Selector> {
        match raw {
            Some(raw) => {
                check_recursive(raw, self.max_depth)?;
                Ok(Selector::decode(raw, false)?.simplify())
            }
            None => Ok(Selector::truth()),
        }
    }

    fn decode_base(&self, class_name: &str, options: &FindOptions) -> Result<DecodedBaseQuery> {
        let filter = self.decode_filter(options.filter.as_ref())?;
        for path in filter.key_paths() {
            self.authorize_path(class_name, &path)?;
        }

        let mut group_matches = BTreeMap::new();
        for (relation, accumulators) in &options.group_matches {
            let target = self.relation_target(class_name, relation)?;
            let mut decoded = BTreeMap::new();
            for (name, raw) in accumulators {
                if name.is_empty() || name.contains('.') || name.starts_with('$') {
                    return Err(TesseraError::InvalidPath(format!(
                        "invalid group match name '{name}'"
                    )));
                }
                check_recursive(raw, self.max_depth)?;
                let accumulator = Accumulator::decode(raw)?;
                for path in accumulator.key_paths() {
                    self.authorize_path(&target, &path)?;
                }
                decoded.insert(name.clone(), accumulator);
            }
            group_matches.insert(relation.clone(), decoded);
        }

        let sort = match &options.sort {
            Some(raw) => {
                check_recursive(raw, self.max_depth)?;
                Some(Sort::decode(raw)?)
            }
            None => None,
        };
        if let Some(sort) = &sort {
            for path in sort.key_paths() {
                match path.strip_prefix('$') {
                    Some(alias) => {
                        let known = group_matches.iter().any(|(rel, accs)| {
                            accs.keys().any(|name| format!("{rel}.{name}") == alias)
                        });
                        if !known {
                            return Err(TesseraError::InvalidPath(format!(
                                "unknown group match '{alias}'"
                            )));
                        }
                    }
                    None => self.authorize_path(class_name, &path)?,
                }
            }
        }

        let mut matches = BTreeMap::new();
        for (relation, nested) in &options.matches {
            let target = self.relation_target(class_name, relation)?;
            matches.insert(relation.clone(), self.decode_base(&target, nested)?);
        }

        Ok(DecodedBaseQuery {
            filter,
            sort,
            skip: options.skip,
            limit: options.limit,
            matches,
            group_matches,
        })
    }

    /// Target class of a relation path, checking access along the way.
    fn relation_target(&self, class_name: &str, path: &str) -> Result<String> {
        self.authorize_path(class_name, path)?;
        match resolve_data_type(self.schema, class_name, path)? {
            Some(DataType::Relation { target, .. }) => {
                let target_class = self.schema.class(&target)?;
                self.authorize_class(&target, target_class, ClassAction::Find)?;
                Ok(target)
            }
            _ => Err(TesseraError::InvalidPath(format!(
                "{class_name}.{path} is not a relation"
            ))),
        }
    }

    fn authorize_class(&self, name: &str, class: &ClassSchema, action: ClassAction) -> Result<()> {
        if self.auth.allows(&class.class_acl(action)) {
            Ok(())
        } else {
            Err(TesseraError::NoPermission(format!("{action:?} on {name}")))
        }
    }

    fn authorize_field(
        &self,
        class_name: &str,
        class: &ClassSchema,
        field: &str,
        action: FieldAction,
    ) -> Result<()> {
        if class.is_secure(field) && !self.auth.master {
            return Err(TesseraError::NoPermission(format!(
                "{class_name}.{field} is secure"
            )));
        }
        match class.field_acl(field, action) {
            Some(acl) if !self.auth.allows(acl) => Err(TesseraError::NoPermission(format!(
                "{action:?} on {class_name}.{field}"
            ))),
            _ => Ok(()),
        }
    }

    fn readable(&self, class: &ClassSchema, field: &str) -> bool {
        if class.is_secure(field) && !self.auth.master {
            return false;
        }
        class
            .field_acl(field, FieldAction::Read)
            .map_or(true, |acl| self.auth.allows(acl))
    }

    /// Checks read access for every field a path crosses, and `find` on
    /// every class it reaches through a pointer or relation.
    pub fn authorize_path(&self, class_name: &str, path: &str) -> Result<()> {
        let segments = parse_path(path)?;
        let mut class_name = class_name.to_string();
        let mut i = 0;
        while i < segments.len() {
            let PathSegment::Field(field) = &segments[i] else {
                return Err(TesseraError::InvalidPath(path.to_string()));
            };
            let class = self.schema.class(&class_name)?;
            let ty = class.field(field).ok_or_else(|| {
                TesseraError::InvalidPath(format!("{class_name}.{field} does not exist"))
            })?;
            self.authorize_field(&class_name, class, field, FieldAction::Read)?;
            let (target, skip) = match ty {
                DataType::Pointer { target } => (target, 1),
                DataType::Relation { target, .. } => match segments.get(i + 1) {
                    Some(PathSegment::Index(_)) => (target, 2),
                    _ => (target, 1),
                },
                _ => break,
            };
            if i + skip >= segments.len() {
                break;
            }
            let target_class = self.schema.class(target)?;
            self.authorize_class(target, target_class, ClassAction::Find)?;
            class_name = target.clone();
            i += skip;
        }
        resolve_data_type(self.schema, &class_name, &render_path(&segments[i..]))?;
        Ok(())
    }

    /// Per-object ACL predicate, or `None` when the caller bypasses it.
    fn object_acl(&self, class: &ClassSchema, action: QueryAction) -> Option<Selector> {
        if self.auth.master {
            return None;
        }
        let aop = &class.additional_object_permissions;
        let (field, bypass) = match action {
            QueryAction::Update | QueryAction::Delete => (WPERM_FIELD, aop.update.as_ref()),
            _ => (RPERM_FIELD, aop.read.as_ref()),
        };
        if bypass.is_some_and(|acl| self.auth.allows(acl)) {
            return None;
        }
        Some(acl_selector(field, &self.auth.tokens()))
    }

    /// Filter the compiler applies to every joined class.
    fn nested_filter(&self) -> ExtraFilter {
        let master = self.auth.master;
        let tokens = self.auth.tokens();
        let bypass: BTreeMap<String, bool> = self
            .schema
            .classes()
            .map(|(name, class)| {
                let read = class.additional_object_permissions.read.as_ref();
                (name.clone(), read.is_some_and(|acl| self.auth.allows(acl)))
            })
            .collect();
        let caller = self.extra_filter.clone();
        let now = self.now;
        Arc::new(move |class_name: &str| {
            let mut parts = Vec::new();
            if let Some(caller) = &caller {
                parts.push(caller(class_name));
            }
            if !master && !bypass.get(class_name).copied().unwrap_or(false) {
                parts.push(acl_selector(RPERM_FIELD, &tokens));
            }
            parts.push(expiry_guard(now));
            Selector::and(parts)
        })
    }

    fn check_related_by(&self, class_name: &str, related: &RelatedBy) -> Result<RelatedBy> {
        let parent = self.schema.class(&related.class_name)?;
        self.authorize_class(&related.class_name, parent, ClassAction::Get)?;
        match parent.field(&related.key) {
            Some(DataType::Relation { target, .. }) if target == class_name => {}
            _ => {
                return Err(TesseraError::InvalidPath(format!(
                    "{}.{} is not a relation to {class_name}",
                    related.class_name, related.key
                )))
            }
        }
        self.authorize_field(&related.class_name, parent, &related.key, FieldAction::Read)?;
        Ok(related.clone())
    }

    /// Flat list of projected leaf paths. Default fields are always present
    /// at the root and at every populated prefix.
    pub fn expand_includes(&self, class_name: &str, includes: &[String]) -> Result<Vec<String>> {
        let mut out: Vec<String> = DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect();
        if includes.is_empty() {
            self.expand_include(class_name, "", "*", &mut out)?;
        }
        for path in includes {
            self.expand_include(class_name, "", path, &mut out)?;
        }
        Ok(out)
    }

    fn expand_include(
        &self,
        class_name: &str,
        prefix: &str,
        path: &str,
        out: &mut Vec<String>,
    ) -> Result<()> {
        let class = self.schema.class(class_name)?;
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        if head == "*" {
            if rest.is_some() {
                return Err(TesseraError::InvalidPath(format!("{prefix}{path}")));
            }
            for (name, ty) in &class.fields {
                if ty.is_reference() || DEFAULT_FIELDS.contains(&name.as_str()) {
                    continue;
                }
                if !self.readable(class, name) {
                    continue;
                }
                for (leaf, _) in shape_paths(name, ty) {
                    push_unique(out, format!("{prefix}{leaf}"));
                }
            }
            return Ok(());
        }

        let ty = class.field(head).ok_or_else(|| {
            TesseraError::InvalidPath(format!("{class_name}.{head} does not exist"))
        })?;
        self.authorize_field(class_name, class, head, FieldAction::Read)?;
        match ty {
            DataType::Pointer { target } | DataType::Relation { target, .. } => {
                let target_class = self.schema.class(target)?;
                self.authorize_class(target, target_class, ClassAction::Find)?;
                let nested = format!("{prefix}{head}.");
                for field in DEFAULT_FIELDS {
                    push_unique(out, format!("{nested}{field}"));
                }
                self.expand_include(target, &nested, rest.unwrap_or("*"), out)
            }
            DataType::Shape { .. } => {
                let full = match rest {
                    Some(rest) => format!("{head}.{rest}"),
                    None => head.to_string(),
                };
                let leaf_ty = match rest {
                    Some(_) => resolve_column(self.schema, class_name, &full)?.data_type,
                    None => ty.clone(),
                };
                for (leaf, _) in shape_paths(&full, &leaf_ty) {
                    push_unique(out, format!("{prefix}{leaf}"));
                }
                Ok(())
            }
            _ => match rest {
                Some(rest) => Err(TesseraError::InvalidPath(format!(
                    "{class_name}.{head}.{rest} is not a projectable column"
                ))),
                None => {
                    push_unique(out, format!("{prefix}{head}"));
                    Ok(())
                }
            },
        }
    }

    /// Validates a mutation payload against the schema and field permissions.
    pub fn validate_attributes(
        &self,
        class_name: &str,
        attrs: &Map<String, Value>,
        action: FieldAction,
    ) -> Result<()> {
        let class = self.schema.class(class_name)?;
        for (key, value) in attrs {
            check_recursive(value, self.max_depth)?;
            let head = key.split(['.', '[']).next().unwrap_or(key);
            let ty = class.field(head).ok_or_else(|| {
                TesseraError::InvalidPath(format!("{class_name}.{head} does not exist"))
            })?;
            match head {
                VERSION_FIELD | CREATED_AT_FIELD | UPDATED_AT_FIELD => {
                    return Err(TesseraError::InvalidPath(format!("{head} is read-only")))
                }
                ID_FIELD if action != FieldAction::Create => {
                    return Err(TesseraError::InvalidPath("_id is immutable".into()))
                }
                _ => {}
            }
            if let DataType::Relation {
                foreign_field: Some(_),
                ..
            } = ty
            {
                return Err(TesseraError::InvalidDataType(format!(
                    "{class_name}.{head} is derived from its foreign field"
                )));
            }
            self.authorize_field(class_name, class, head, action)?;
            if key != head {
                resolve_column(self.schema, class_name, key)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::sample_schema;
    use serde_json::json;

    fn options(raw: Value) -> FindOptions {
        serde_json::from_value(raw).unwrap()
    }

    fn restricted_schema() -> Schema {
        Schema::from_json(json!({
            "Doc": {
                "fields": { "title": "string", "secret": "string", "owner": "string" },
                "classLevelPermissions": { "find": ["role:reader"], "get": ["*"] },
                "additionalObjectPermissions": { "read": ["role:auditor"] },
                "fieldLevelPermissions": { "secret": { "read": ["role:admin"] } }
            }
        }))
        .unwrap()
    }

    #[test]
    fn get_method_detection() {
        let sel = |raw: Value| Selector::decode(&raw, false).unwrap().simplify();
        assert!(is_get_method(&sel(json!({"_id": "a"}))));
        assert!(is_get_method(&sel(json!({"_id": {"$in": ["a", "a"]}}))));
        assert!(is_get_method(&sel(json!([{"_id": "a"}, {"_id": {"$eq": "a"}}]))));
        assert!(!is_get_method(&sel(json!({"_id": {"$in": ["a", "b"]}}))));
        assert!(!is_get_method(&sel(json!({"_id": "a", "title": "x"}))));
        assert!(!is_get_method(&sel(json!({"$or": [{"_id": "a"}, {"_id": "b"}]}))));
    }

    #[test]
    fn find_requires_find_clp_but_get_does_not() {
        let schema = restricted_schema();
        let auth = Auth::user("u1", vec![]);
        let v = QueryValidator::new(&schema, &auth);
        let err = v
            .decode_query("Doc", &options(json!({"filter": {"title": "x"}})), QueryAction::Find)
            .unwrap_err();
        assert!(matches!(err, TesseraError::NoPermission(_)));
        assert!(v
            .decode_query("Doc", &options(json!({"filter": {"_id": "d1"}})), QueryAction::Find)
            .is_ok());
    }

    #[test]
    fn star_skips_unreadable_fields_but_explicit_paths_fail() {
        let schema = restricted_schema();
        let auth = Auth::user("u1", vec!["reader".into()]);
        let v = QueryValidator::new(&schema, &auth);
        let q = v.decode_query("Doc", &FindOptions::default(), QueryAction::Find).unwrap();
        assert!(q.includes.contains(&"title".to_string()));
        assert!(!q.includes.contains(&"secret".to_string()));
        for raw in [
            json!({"filter": {"secret": "x"}}),
            json!({"sort": {"secret": 1}}),
            json!({"includes": ["secret"]}),
        ] {
            let err = v.decode_query("Doc", &options(raw), QueryAction::Find).unwrap_err();
            assert!(matches!(err, TesseraError::NoPermission(_)));
        }
    }

    #[test]
    fn acl_and_expiry_are_merged() {
        let schema = restricted_schema();
        let auth = Auth::user("u1", vec!["reader".into()]);
        let q = QueryValidator::new(&schema, &auth)
            .decode_query("Doc", &options(json!({"filter": {"title": "x"}})), QueryAction::Find)
            .unwrap();
        let keys = q.base.filter.key_paths();
        assert!(keys.contains(&"_rperm".to_string()));
        assert!(keys.contains(&"_expired_at".to_string()));

        let auditor = Auth::user("u2", vec!["reader".into(), "auditor".into()]);
        let q = QueryValidator::new(&schema, &auditor)
            .decode_query("Doc", &FindOptions::default(), QueryAction::Find)
            .unwrap();
        assert!(!q.base.filter.key_paths().contains(&"_rperm".to_string()));

        let master = Auth::master();
        let q = QueryValidator::new(&schema, &master)
            .decode_query("Doc", &FindOptions::default(), QueryAction::Update)
            .unwrap();
        let keys = q.base.filter.key_paths();
        assert!(!keys.contains(&"_wperm".to_string()));
        assert!(keys.contains(&"_expired_at".to_string()));
    }

    #[test]
    fn acl_filter_evaluates_against_rows() {
        let schema = restricted_schema();
        let auth = Auth::user("u1", vec!["reader".into()]);
        let q = QueryValidator::new(&schema, &auth)
            .decode_query("Doc", &FindOptions::default(), QueryAction::Find)
            .unwrap();
        assert!(q.base.filter.eval(&json!({"_rperm": ["u1"], "_expired_at": null})));
        assert!(!q.base.filter.eval(&json!({"_rperm": ["u9"], "_expired_at": null})));
        assert!(!q.base.filter.eval(&json!({
            "_rperm": ["*"],
            "_expired_at": {"$date": "2000-01-01T00:00:00Z"}
        })));
    }

    #[test]
    fn includes_expand_wildcards_and_references() {
        let schema = sample_schema();
        let auth = Auth::master();
        let v = QueryValidator::new(&schema, &auth);
        let inc = v
            .expand_includes("Note", &["author".into(), "tags.name".into(), "address".into()])
            .unwrap();
        assert!(inc.contains(&"author.name".to_string()));
        assert!(inc.contains(&"author._id".to_string()));
        assert!(!inc.contains(&"author.company".to_string()));
        assert!(inc.contains(&"tags.name".to_string()));
        assert!(!inc.contains(&"tags.score".to_string()));
        assert!(inc.contains(&"address.geo.lat".to_string()));
        assert!(inc.contains(&"_id".to_string()));

        let star = v.expand_includes("Note", &[]).unwrap();
        assert!(star.contains(&"embedding".to_string()));
        assert!(star.contains(&"address.city".to_string()));
        assert!(!star.iter().any(|p| p.starts_with("author")));
        assert!(!star.iter().any(|p| p.starts_with("comments")));
    }

    #[test]
    fn secure_fields_are_master_only() {
        let schema = sample_schema();
        let anon = Auth::anonymous();
        let v = QueryValidator::new(&schema, &anon);
        let star = v.expand_includes("Note", &[]).unwrap();
        assert!(!star.contains(&"meta".to_string()));
        let err = v
            .decode_query("Note", &options(json!({"filter": {"meta.a": 1}})), QueryAction::Find)
            .unwrap_err();
        assert!(matches!(err, TesseraError::NoPermission(_)));
        let master = Auth::master();
        assert!(QueryValidator::new(&schema, &master)
            .expand_includes("Note", &[])
            .unwrap()
            .contains(&"meta".to_string()));
    }

    #[test]
    fn nested_matches_are_decoded() {
        let schema = sample_schema();
        let auth = Auth::anonymous();
        let q = QueryValidator::new(&schema, &auth)
            .decode_query(
                "Note",
                &options(json!({
                    "includes": ["tags"],
                    "matches": {"tags": {"filter": {"name": {"$ne": "draft"}}, "limit": 2}},
                    "groupMatches": {"comments": {"total": {"$count": true}}},
                    "sort": {"$comments.total": -1}
                })),
                QueryAction::Find,
            )
            .unwrap();
        let tags = &q.base.matches["tags"];
        assert_eq!(tags.limit, Some(2));
        assert_eq!(tags.filter.key_paths(), vec!["name".to_string()]);
        assert!(q.base.group_matches["comments"].contains_key("total"));

        let err = QueryValidator::new(&schema, &auth)
            .decode_query(
                "Note",
                &options(json!({"matches": {"author": {}}})),
                QueryAction::Find,
            )
            .unwrap_err();
        assert!(matches!(err, TesseraError::InvalidPath(_)));
    }

    #[test]
    fn nested_filter_applies_acl_per_class() {
        let schema = sample_schema();
        let auth = Auth::user("u1", vec![]);
        let q = QueryValidator::new(&schema, &auth)
            .decode_query("Note", &FindOptions::default(), QueryAction::Find)
            .unwrap();
        let extra = q.extra_filter.unwrap();
        let nested = extra("Tag");
        assert!(nested.key_paths().contains(&"_rperm".to_string()));
        assert!(nested.eval(&json!({"_rperm": ["u1"]})));
    }

    #[test]
    fn unknown_paths_fail() {
        let schema = sample_schema();
        let auth = Auth::master();
        let v = QueryValidator::new(&schema, &auth);
        for raw in [
            json!({"filter": {"nope": 1}}),
            json!({"filter": {"author.nope": 1}}),
            json!({"sort": {"$tags.missing": 1}}),
            json!({"includes": ["title.x"]}),
        ] {
            let err = v.decode_query("Note", &options(raw), QueryAction::Find).unwrap_err();
            assert!(matches!(err, TesseraError::InvalidPath(_)), "{err}");
        }
    }

    #[test]
    fn attribute_validation() {
        let schema = sample_schema();
        let auth = Auth::anonymous();
        let v = QueryValidator::new(&schema, &auth);
        let attrs = |raw: Value| raw.as_object().unwrap().clone();
        assert!(v
            .validate_attributes("Note", &attrs(json!({"title": "x", "_id": "n1"})), FieldAction::Create)
            .is_ok());
        assert!(v
            .validate_attributes("Note", &attrs(json!({"_id": "n2"})), FieldAction::Update)
            .is_err());
        assert!(v
            .validate_attributes("Note", &attrs(json!({"__v": 3})), FieldAction::Update)
            .is_err());
        assert!(matches!(
            v.validate_attributes("Note", &attrs(json!({"comments": []})), FieldAction::Update),
            Err(TesseraError::InvalidDataType(_))
        ));
        assert!(matches!(
            v.validate_attributes("Note", &attrs(json!({"meta": {}})), FieldAction::Update),
            Err(TesseraError::NoPermission(_))
        ));
    }

    #[test]
    fn deep_input_is_rejected() {
        let mut value = json!(1);
        for _ in 0..10 {
            value = json!([value]);
        }
        assert!(check_recursive(&value, 10).is_ok());
        assert!(matches!(
            check_recursive(&json!([value]), 10),
            Err(TesseraError::RecursiveDataDetected)
        ));
    }
}
