use super::{DataType, PrimitiveKind, Schema};
use crate::error::{Result, TesseraError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl PathSegment {
    fn as_text(&self) -> String {
        match self {
            PathSegment::Field(f) => f.clone(),
            PathSegment::Index(i) => i.to_string(),
        }
    }
}

/// Splits `a.b[2].c` (or `a.b.2.c`) into segments.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>> {
    let invalid = || TesseraError::InvalidPath(format!("malformed path '{path}'"));
    let mut out = Vec::new();
    for part in path.split('.') {
        let (name, mut brackets) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if name.is_empty() {
            if brackets.is_empty() || out.is_empty() {
                return Err(invalid());
            }
        } else if name.chars().all(|c| c.is_ascii_digit()) {
            out.push(PathSegment::Index(name.parse().map_err(|_| invalid())?));
        } else {
            out.push(PathSegment::Field(name.to_string()));
        }
        while !brackets.is_empty() {
            let close = brackets.find(']').ok_or_else(invalid)?;
            let idx: usize = brackets[1..close].parse().map_err(|_| invalid())?;
            out.push(PathSegment::Index(idx));
            brackets = &brackets[close + 1..];
            if !brackets.is_empty() && !brackets.starts_with('[') {
                return Err(invalid());
            }
        }
    }
    if out.is_empty() {
        return Err(invalid());
    }
    Ok(out)
}

pub fn render_path(segments: &[PathSegment]) -> String {
    segments
        .iter()
        .map(PathSegment::as_text)
        .collect::<Vec<_>>()
        .join(".")
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnPath {
    /// The column itself.
    Column,
    /// Sub-path inside an object/array JSON column.
    Json(Vec<String>),
    /// Zero-based element of a vector column.
    VectorElement(usize),
    /// One element of a relation, then a path on the target class.
    RelationElement {
        index: usize,
        rest: Vec<PathSegment>,
    },
    /// A path continuing on the class a pointer references.
    Pointer { rest: Vec<PathSegment> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedColumn {
    /// Physical column name; shape leaves use their dotted path.
    pub column: String,
    pub data_type: DataType,
    pub path: ColumnPath,
}

pub fn resolve_column(schema: &Schema, class_name: &str, path: &str) -> Result<ResolvedColumn> {
    let segments = parse_path(path)?;
    let class = schema.class(class_name)?;
    let invalid = |reason: &str| TesseraError::InvalidPath(format!("{class_name}.{path}: {reason}"));

    let mut iter = segments.into_iter().peekable();
    let first = match iter.next() {
        Some(PathSegment::Field(f)) => f,
        _ => return Err(invalid("path must start with a field")),
    };
    let mut column = first.clone();
    let mut ty = class
        .field(&first)
        .ok_or_else(|| invalid("unknown field"))?
        .clone();

    loop {
        let Some(segment) = iter.next() else {
            return Ok(ResolvedColumn {
                column,
                data_type: ty,
                path: ColumnPath::Column,
            });
        };
        match (&ty, segment) {
            (DataType::Shape { fields }, PathSegment::Field(sub)) => {
                let next = fields
                    .get(&sub)
                    .ok_or_else(|| invalid("unknown shape field"))?
                    .clone();
                column = format!("{column}.{sub}");
                ty = next;
            }
            (DataType::Primitive { kind, .. }, segment) if kind.is_json() => {
                let mut json = vec![segment.as_text()];
                json.extend(iter.map(|s| s.as_text()));
                return Ok(ResolvedColumn {
                    column,
                    data_type: ty,
                    path: ColumnPath::Json(json),
                });
            }
            (DataType::Vector { dimension, .. }, PathSegment::Index(idx)) => {
                if idx >= *dimension {
                    return Err(invalid("vector index out of range"));
                }
                if iter.peek().is_some() {
                    return Err(invalid("vector element has no sub-fields"));
                }
                return Ok(ResolvedColumn {
                    column,
                    data_type: ty,
                    path: ColumnPath::VectorElement(idx),
                });
            }
            (DataType::Relation { target, .. }, PathSegment::Index(index)) => {
                let rest: Vec<PathSegment> = iter.collect();
                if rest.is_empty() {
                    return Err(invalid("relation element requires a sub-path"));
                }
                resolve_segments(schema, target, &rest)?;
                return Ok(ResolvedColumn {
                    column,
                    data_type: ty,
                    path: ColumnPath::RelationElement { index, rest },
                });
            }
            (DataType::Pointer { target }, segment) => {
                let mut rest = vec![segment];
                rest.extend(iter);
                resolve_segments(schema, target, &rest)?;
                return Ok(ResolvedColumn {
                    column,
                    data_type: ty,
                    path: ColumnPath::Pointer { rest },
                });
            }
            (_, PathSegment::Index(_)) => {
                return Err(invalid("only vectors and relations can be indexed"));
            }
            (_, PathSegment::Field(_)) => return Err(invalid("field has no sub-fields")),
        }
    }
}

/// Logical type at the end of a path, following pointer and relation hops.
/// `None` means the path ends inside an untyped JSON column.
pub fn resolve_data_type(schema: &Schema, class_name: &str, path: &str) -> Result<Option<DataType>> {
    let segments = parse_path(path)?;
    resolve_segments(schema, class_name, &segments)
}

fn resolve_segments(
    schema: &Schema,
    class_name: &str,
    segments: &[PathSegment],
) -> Result<Option<DataType>> {
    let invalid = || {
        TesseraError::InvalidPath(format!("{class_name}.{}", render_path(segments)))
    };
    let class = schema.class(class_name)?;
    let Some(PathSegment::Field(first)) = segments.first() else {
        return Err(invalid());
    };
    let mut ty = class.field(first).ok_or_else(invalid)?.clone();
    let mut i = 1;
    while i < segments.len() {
        let segment = &segments[i];
        ty = match (&ty, segment) {
            (DataType::Shape { fields }, PathSegment::Field(sub)) => {
                fields.get(sub).ok_or_else(invalid)?.clone()
            }
            (DataType::Primitive { kind, .. }, _) if kind.is_json() => return Ok(None),
            (DataType::Vector { dimension, .. }, PathSegment::Index(idx)) => {
                if *idx >= *dimension || i + 1 != segments.len() {
                    return Err(invalid());
                }
                DataType::primitive(PrimitiveKind::Number)
            }
            (DataType::Relation { target, .. }, PathSegment::Index(_)) => {
                return match segments.get(i + 1) {
                    Some(_) => resolve_segments(schema, target, &segments[i + 1..]),
                    None => Err(invalid()),
                };
            }
            (DataType::Pointer { target }, _) | (DataType::Relation { target, .. }, _) => {
                return resolve_segments(schema, target, &segments[i..]);
            }
            _ => return Err(invalid()),
        };
        i += 1;
    }
    Ok(Some(ty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{sample_schema, DataKind};

    #[test]
    fn parses_bracket_and_dot_indexes() {
        assert_eq!(
            parse_path("embedding[2]").unwrap(),
            vec![PathSegment::Field("embedding".into()), PathSegment::Index(2)]
        );
        assert_eq!(
            parse_path("tags.0.name").unwrap(),
            vec![
                PathSegment::Field("tags".into()),
                PathSegment::Index(0),
                PathSegment::Field("name".into())
            ]
        );
        assert!(parse_path("a..b").is_err());
        assert!(parse_path("a[x]").is_err());
    }

    #[test]
    fn shape_leaf_keeps_dotted_column() {
        let schema = sample_schema();
        let col = resolve_column(&schema, "Note", "address.geo.lat").unwrap();
        assert_eq!(col.column, "address.geo.lat");
        assert_eq!(col.path, ColumnPath::Column);
        assert_eq!(col.data_type.kind(), DataKind::Primitive(PrimitiveKind::Number));
    }

    #[test]
    fn vector_index_bounds() {
        let schema = sample_schema();
        let col = resolve_column(&schema, "Note", "embedding[2]").unwrap();
        assert_eq!(col.path, ColumnPath::VectorElement(2));
        assert!(resolve_column(&schema, "Note", "embedding[3]").is_err());
        assert!(resolve_column(&schema, "Note", "title[0]").is_err());
    }

    #[test]
    fn relation_index_needs_subpath() {
        let schema = sample_schema();
        let col = resolve_column(&schema, "Note", "tags.1.name").unwrap();
        assert!(matches!(col.path, ColumnPath::RelationElement { index: 1, .. }));
        assert!(resolve_column(&schema, "Note", "tags.1").is_err());
        assert!(resolve_column(&schema, "Note", "tags.1.nope").is_err());
    }

    #[test]
    fn json_and_pointer_remainders() {
        let schema = sample_schema();
        let col = resolve_column(&schema, "Note", "meta.a.0").unwrap();
        assert_eq!(col.path, ColumnPath::Json(vec!["a".into(), "0".into()]));
        let col = resolve_column(&schema, "Note", "author.company.name").unwrap();
        assert_eq!(col.column, "author");
        assert!(matches!(col.path, ColumnPath::Pointer { .. }));
        assert!(resolve_column(&schema, "Note", "author.nope").is_err());
        assert!(resolve_column(&schema, "Note", "unknown").is_err());
    }

    #[test]
    fn data_type_crosses_references() {
        let schema = sample_schema();
        let ty = resolve_data_type(&schema, "Note", "author.company.name")
            .unwrap()
            .unwrap();
        assert_eq!(ty.kind(), DataKind::Primitive(PrimitiveKind::String));
        let ty = resolve_data_type(&schema, "Note", "comments.body").unwrap().unwrap();
        assert_eq!(ty.kind(), DataKind::Primitive(PrimitiveKind::String));
        assert_eq!(resolve_data_type(&schema, "Note", "meta.x").unwrap(), None);
    }
}
