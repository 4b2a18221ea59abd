mod resolve;

pub use resolve::{
    parse_path, render_path, resolve_column, resolve_data_type, ColumnPath, PathSegment,
    ResolvedColumn,
};

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const ID_FIELD: &str = "_id";
pub const VERSION_FIELD: &str = "__v";
pub const CREATED_AT_FIELD: &str = "_created_at";
pub const UPDATED_AT_FIELD: &str = "_updated_at";
pub const EXPIRED_AT_FIELD: &str = "_expired_at";
pub const RPERM_FIELD: &str = "_rperm";
pub const WPERM_FIELD: &str = "_wperm";

/// Fields every class carries, always projected.
pub const DEFAULT_FIELDS: [&str; 7] = [
    ID_FIELD,
    VERSION_FIELD,
    CREATED_AT_FIELD,
    UPDATED_AT_FIELD,
    EXPIRED_AT_FIELD,
    RPERM_FIELD,
    WPERM_FIELD,
];

pub type Acl = Vec<String>;

/// True when any caller token is granted by the ACL. `*` grants everyone.
pub fn acl_allows(acl: &[String], tokens: &[String]) -> bool {
    acl.iter().any(|entry| entry == "*" || tokens.iter().any(|t| t == entry))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveKind {
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "decimal")]
    Decimal,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "string[]")]
    StringArray,
    #[serde(rename = "date")]
    Date,
    #[serde(rename = "object")]
    Object,
    #[serde(rename = "array")]
    Array,
}

impl PrimitiveKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "boolean" => Self::Boolean,
            "number" => Self::Number,
            "decimal" => Self::Decimal,
            "string" => Self::String,
            "string[]" => Self::StringArray,
            "date" => Self::Date,
            "object" => Self::Object,
            "array" => Self::Array,
            _ => return None,
        })
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::Decimal => "decimal",
            Self::String => "string",
            Self::StringArray => "string[]",
            Self::Date => "date",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    /// Untyped JSON columns that accept sub-paths.
    pub fn is_json(self) -> bool {
        matches!(self, Self::Object | Self::Array)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Primitive(PrimitiveKind),
    Vector,
    Shape,
    Pointer,
    Relation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDataType", into = "RawDataType")]
pub enum DataType {
    Primitive {
        kind: PrimitiveKind,
        default: Option<Value>,
    },
    Vector {
        dimension: usize,
        default: Option<Vec<f64>>,
    },
    Shape {
        fields: BTreeMap<String, DataType>,
    },
    Pointer {
        target: String,
    },
    Relation {
        target: String,
        foreign_field: Option<String>,
    },
}

impl DataType {
    pub fn primitive(kind: PrimitiveKind) -> Self {
        DataType::Primitive {
            kind,
            default: None,
        }
    }

    pub fn kind(&self) -> DataKind {
        match self {
            DataType::Primitive { kind, .. } => DataKind::Primitive(*kind),
            DataType::Vector { .. } => DataKind::Vector,
            DataType::Shape { .. } => DataKind::Shape,
            DataType::Pointer { .. } => DataKind::Pointer,
            DataType::Relation { .. } => DataKind::Relation,
        }
    }

    pub fn primitive_kind(&self) -> Option<PrimitiveKind> {
        match self {
            DataType::Primitive { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            DataType::Pointer { target } | DataType::Relation { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self, DataType::Primitive { .. })
    }

    pub fn is_shape(&self) -> bool {
        matches!(self, DataType::Shape { .. })
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, DataType::Vector { .. })
    }

    /// Pointer or relation: needs a join to materialize.
    pub fn is_reference(&self) -> bool {
        matches!(self, DataType::Pointer { .. } | DataType::Relation { .. })
    }

    pub fn default_value(&self) -> Option<Value> {
        match self {
            DataType::Primitive { default, .. } => default.clone(),
            DataType::Vector { default, .. } => default
                .as_ref()
                .map(|v| Value::Array(v.iter().map(|x| Value::from(*x)).collect())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawDataType {
    Tag(String),
    Record(RawDataRecord),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDataRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dimension: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shape: Option<BTreeMap<String, DataType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    foreign_field: Option<String>,
}

impl TryFrom<RawDataType> for DataType {
    type Error = String;

    fn try_from(raw: RawDataType) -> std::result::Result<Self, Self::Error> {
        let record = match raw {
            RawDataType::Tag(tag) => RawDataRecord {
                kind: tag,
                ..Default::default()
            },
            RawDataType::Record(record) => record,
        };
        if let Some(kind) = PrimitiveKind::from_tag(&record.kind) {
            return Ok(DataType::Primitive {
                kind,
                default: record.default,
            });
        }
        match record.kind.as_str() {
            "vector" => {
                let dimension = record
                    .dimension
                    .ok_or_else(|| "vector type requires a dimension".to_string())?;
                let default = match record.default {
                    Some(v) => Some(
                        serde_json::from_value::<Vec<f64>>(v)
                            .map_err(|e| format!("invalid vector default: {e}"))?,
                    ),
                    None => None,
                };
                Ok(DataType::Vector { dimension, default })
            }
            "shape" => Ok(DataType::Shape {
                fields: record
                    .shape
                    .ok_or_else(|| "shape type requires fields".to_string())?,
            }),
            "pointer" => Ok(DataType::Pointer {
                target: record
                    .target
                    .ok_or_else(|| "pointer type requires a target".to_string())?,
            }),
            "relation" => Ok(DataType::Relation {
                target: record
                    .target
                    .ok_or_else(|| "relation type requires a target".to_string())?,
                foreign_field: record.foreign_field,
            }),
            other => Err(format!("unknown data type '{other}'")),
        }
    }
}

impl From<DataType> for RawDataType {
    fn from(value: DataType) -> Self {
        match value {
            DataType::Primitive {
                kind,
                default: None,
            } => RawDataType::Tag(kind.tag().to_string()),
            DataType::Primitive { kind, default } => RawDataType::Record(RawDataRecord {
                kind: kind.tag().to_string(),
                default,
                ..Default::default()
            }),
            DataType::Vector { dimension, default } => RawDataType::Record(RawDataRecord {
                kind: "vector".into(),
                dimension: Some(dimension),
                default: default.map(|v| Value::Array(v.into_iter().map(Value::from).collect())),
                ..Default::default()
            }),
            DataType::Shape { fields } => RawDataType::Record(RawDataRecord {
                kind: "shape".into(),
                shape: Some(fields),
                ..Default::default()
            }),
            DataType::Pointer { target } => RawDataType::Record(RawDataRecord {
                kind: "pointer".into(),
                target: Some(target),
                ..Default::default()
            }),
            DataType::Relation {
                target,
                foreign_field,
            } => RawDataType::Record(RawDataRecord {
                kind: "relation".into(),
                target: Some(target),
                foreign_field,
                ..Default::default()
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassAction {
    Get,
    Find,
    Count,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAction {
    Read,
    Create,
    Update,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassLevelPermissions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<Acl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub find: Option<Acl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<Acl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<Acl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Acl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<Acl>,
}

impl ClassLevelPermissions {
    pub fn acl(&self, action: ClassAction) -> Option<&Acl> {
        match action {
            ClassAction::Get => self.get.as_ref(),
            ClassAction::Find => self.find.as_ref(),
            ClassAction::Count => self.count.as_ref(),
            ClassAction::Create => self.create.as_ref(),
            ClassAction::Update => self.update.as_ref(),
            ClassAction::Delete => self.delete.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdditionalObjectPermissions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<Acl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Acl>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldLevelPermissions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<Acl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<Acl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Acl>,
}

impl FieldLevelPermissions {
    pub fn acl(&self, action: FieldAction) -> Option<&Acl> {
        match action {
            FieldAction::Read => self.read.as_ref(),
            FieldAction::Create => self.create.as_ref(),
            FieldAction::Update => self.update.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorMethod {
    Cosine,
    L2,
    Ip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Index {
    Vector {
        vector: String,
        #[serde(default = "default_vector_method")]
        method: VectorMethod,
    },
    Basic {
        keys: serde_json::Map<String, Value>,
        #[serde(default)]
        unique: bool,
    },
}

fn default_vector_method() -> VectorMethod {
    VectorMethod::Cosine
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSchema {
    #[serde(default)]
    pub fields: BTreeMap<String, DataType>,
    #[serde(default)]
    pub class_level_permissions: ClassLevelPermissions,
    #[serde(default)]
    pub additional_object_permissions: AdditionalObjectPermissions,
    #[serde(default)]
    pub field_level_permissions: BTreeMap<String, FieldLevelPermissions>,
    #[serde(default)]
    pub secure_fields: Vec<String>,
    #[serde(default)]
    pub indexes: Vec<Index>,
}

impl ClassSchema {
    pub fn field(&self, name: &str) -> Option<&DataType> {
        self.fields.get(name)
    }

    pub fn is_secure(&self, field: &str) -> bool {
        self.secure_fields.iter().any(|f| f == field)
    }

    /// ACL for a class action; missing entries are public.
    pub fn class_acl(&self, action: ClassAction) -> Acl {
        self.class_level_permissions
            .acl(action)
            .cloned()
            .unwrap_or_else(|| vec!["*".to_string()])
    }

    pub fn field_acl(&self, field: &str, action: FieldAction) -> Option<&Acl> {
        self.field_level_permissions
            .get(field)
            .and_then(|flp| flp.acl(action))
    }
}

fn default_field_types() -> Vec<(&'static str, DataType)> {
    vec![
        (ID_FIELD, DataType::primitive(PrimitiveKind::String)),
        (VERSION_FIELD, DataType::primitive(PrimitiveKind::Number)),
        (CREATED_AT_FIELD, DataType::primitive(PrimitiveKind::Date)),
        (UPDATED_AT_FIELD, DataType::primitive(PrimitiveKind::Date)),
        (EXPIRED_AT_FIELD, DataType::primitive(PrimitiveKind::Date)),
        (RPERM_FIELD, DataType::primitive(PrimitiveKind::StringArray)),
        (WPERM_FIELD, DataType::primitive(PrimitiveKind::StringArray)),
    ]
}

/// Name-keyed class registry. Immutable once built; share it behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    classes: BTreeMap<String, ClassSchema>,
}

impl Schema {
    pub fn new(classes: BTreeMap<String, ClassSchema>) -> Result<Self> {
        let mut classes = classes;
        for (name, class) in classes.iter_mut() {
            if !is_valid_name(name) {
                return Err(TesseraError::InvalidPath(format!(
                    "invalid class name '{name}'"
                )));
            }
            for (field, _) in default_field_types() {
                if class.fields.contains_key(field) {
                    return Err(TesseraError::InvalidPath(format!(
                        "{name}.{field} is a reserved field"
                    )));
                }
            }
            for (field, ty) in default_field_types() {
                class.fields.insert(field.to_string(), ty);
            }
        }
        let schema = Schema { classes };
        schema.validate()?;
        Ok(schema)
    }

    pub fn from_json(value: Value) -> Result<Self> {
        let classes: BTreeMap<String, ClassSchema> = serde_json::from_value(value)?;
        Self::new(classes)
    }

    pub fn class(&self, name: &str) -> Result<&ClassSchema> {
        self.classes
            .get(name)
            .ok_or_else(|| TesseraError::InvalidPath(format!("unknown class '{name}'")))
    }

    pub fn classes(&self) -> impl Iterator<Item = (&String, &ClassSchema)> {
        self.classes.iter()
    }

    pub fn has_vectors(&self) -> bool {
        fn any_vector(fields: &BTreeMap<String, DataType>) -> bool {
            fields.values().any(|ty| match ty {
                DataType::Vector { .. } => true,
                DataType::Shape { fields } => any_vector(fields),
                _ => false,
            })
        }
        self.classes.values().any(|c| any_vector(&c.fields))
    }

    fn validate(&self) -> Result<()> {
        for (name, class) in &self.classes {
            for (field, ty) in &class.fields {
                if !is_valid_name(field) {
                    return Err(TesseraError::InvalidPath(format!(
                        "invalid field name '{name}.{field}'"
                    )));
                }
                self.validate_type(name, field, ty)?;
            }
            for secure in &class.secure_fields {
                if !class.fields.contains_key(secure) {
                    return Err(TesseraError::InvalidPath(format!(
                        "secure field '{name}.{secure}' is not declared"
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_type(&self, class: &str, field: &str, ty: &DataType) -> Result<()> {
        match ty {
            DataType::Primitive { .. } => Ok(()),
            DataType::Vector { dimension, .. } => {
                if *dimension == 0 {
                    return Err(TesseraError::InvalidDataType(format!(
                        "{class}.{field} has zero vector dimension"
                    )));
                }
                Ok(())
            }
            DataType::Shape { fields } => {
                for (sub, sub_ty) in fields {
                    if !is_valid_name(sub) {
                        return Err(TesseraError::InvalidPath(format!(
                            "invalid field name '{class}.{field}.{sub}'"
                        )));
                    }
                    self.validate_type(class, &format!("{field}.{sub}"), sub_ty)?;
                }
                Ok(())
            }
            DataType::Pointer { target } => {
                self.class(target)?;
                Ok(())
            }
            DataType::Relation {
                target,
                foreign_field,
            } => {
                let target_class = self.class(target)?;
                if let Some(foreign) = foreign_field {
                    match target_class.field(foreign) {
                        Some(DataType::Pointer { target: back })
                        | Some(DataType::Relation { target: back, .. })
                            if back == class =>
                        {
                            Ok(())
                        }
                        _ => Err(TesseraError::InvalidPath(format!(
                            "foreign field '{target}.{foreign}' of '{class}.{field}' must reference {class}"
                        ))),
                    }
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Flattened shape leaves of a field as `(dotted path, type)`; non-shapes yield themselves.
pub fn shape_paths(path: &str, ty: &DataType) -> Vec<(String, DataType)> {
    match ty {
        DataType::Shape { fields } => fields
            .iter()
            .flat_map(|(sub, sub_ty)| shape_paths(&format!("{path}.{sub}"), sub_ty))
            .collect(),
        other => vec![(path.to_string(), other.clone())],
    }
}

/// Composite reference token stored in pointer/relation columns.
pub fn object_token(class_name: &str, id: &str) -> String {
    format!("{class_name}${id}")
}

pub fn split_token(token: &str) -> Option<(&str, &str)> {
    token.split_once('$')
}

#[cfg(test)]
pub(crate) fn sample_schema() -> Schema {
    Schema::from_json(serde_json::json!({
        "User": {
            "fields": { "name": "string", "company": {"type": "pointer", "target": "Company"} }
        },
        "Company": { "fields": { "name": "string" } },
        "Tag": { "fields": { "name": "string", "status": "string", "score": "number" } },
        "Note": {
            "fields": {
                "title": "string",
                "pinned": "boolean",
                "price": "decimal",
                "meta": "object",
                "labels": "string[]",
                "embedding": {"type": "vector", "dimension": 3},
                "address": {"type": "shape", "shape": {"city": "string", "geo": {"type": "shape", "shape": {"lat": "number"}}}},
                "author": {"type": "pointer", "target": "User"},
                "tags": {"type": "relation", "target": "Tag"},
                "comments": {"type": "relation", "target": "Comment", "foreignField": "note"}
            },
            "secureFields": ["meta"]
        },
        "Comment": {
            "fields": { "body": "string", "note": {"type": "pointer", "target": "Note"} }
        }
    }))
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_type_accepts_tag_and_record() {
        let tag: DataType = serde_json::from_value(json!("string[]")).unwrap();
        assert_eq!(tag.kind(), DataKind::Primitive(PrimitiveKind::StringArray));
        let rec: DataType =
            serde_json::from_value(json!({"type": "number", "default": 3})).unwrap();
        assert_eq!(rec.default_value(), Some(json!(3)));
        let vector: DataType =
            serde_json::from_value(json!({"type": "vector", "dimension": 2})).unwrap();
        assert_eq!(vector.kind(), DataKind::Vector);
        assert!(serde_json::from_value::<DataType>(json!({"type": "vector"})).is_err());
    }

    #[test]
    fn default_fields_are_injected() {
        let schema = sample_schema();
        let note = schema.class("Note").unwrap();
        for field in DEFAULT_FIELDS {
            assert!(note.field(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn rejects_bad_foreign_field() {
        let err = Schema::from_json(json!({
            "A": { "fields": { "bs": {"type": "relation", "target": "B", "foreignField": "name"} } },
            "B": { "fields": { "name": "string" } }
        }))
        .unwrap_err();
        assert!(matches!(err, TesseraError::InvalidPath(_)));
    }

    #[test]
    fn rejects_reserved_and_unknown_targets() {
        assert!(Schema::from_json(json!({"A": {"fields": {"_id": "string"}}})).is_err());
        assert!(Schema::from_json(
            json!({"A": {"fields": {"b": {"type": "pointer", "target": "Nope"}}}})
        )
        .is_err());
    }

    #[test]
    fn shape_paths_flatten() {
        let schema = sample_schema();
        let note = schema.class("Note").unwrap();
        let paths: Vec<String> = shape_paths("address", note.field("address").unwrap())
            .into_iter()
            .map(|(p, _)| p)
            .collect();
        assert_eq!(paths, vec!["address.city", "address.geo.lat"]);
    }

    #[test]
    fn acl_matching() {
        let tokens = vec!["*".to_string(), "u1".to_string()];
        assert!(acl_allows(&["u1".into()], &tokens));
        assert!(acl_allows(&["*".into()], &[]));
        assert!(!acl_allows(&["role:admin".into()], &tokens));
    }
}
