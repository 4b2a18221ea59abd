use super::QueryCompiler;
use crate::error::{Result, TesseraError};
use crate::schema::{
    resolve_column, shape_paths, ColumnPath, DataType, Index, VectorMethod,
    CREATED_AT_FIELD, EXPIRED_AT_FIELD, ID_FIELD, RPERM_FIELD, UPDATED_AT_FIELD, VERSION_FIELD,
    WPERM_FIELD,
};
use crate::sql::Sql;

fn is_default(field: &str) -> bool {
    matches!(
        field,
        ID_FIELD
            | VERSION_FIELD
            | CREATED_AT_FIELD
            | UPDATED_AT_FIELD
            | EXPIRED_AT_FIELD
            | RPERM_FIELD
            | WPERM_FIELD
    )
}

impl<'a> QueryCompiler<'a> {
    /// Idempotent DDL creating tables, columns and indexes for every class.
    pub fn prepare(&self) -> Result<Vec<Sql>> {
        let mut out = Vec::new();
        if self.schema.has_vectors() {
            out.push(Sql::raw("CREATE EXTENSION IF NOT EXISTS vector"));
        }
        for (name, class) in self.schema.classes() {
            out.push(
                Sql::raw("CREATE TABLE IF NOT EXISTS ")
                    .push_ident(name.clone())
                    .push_raw(" (")
                    .push_ident(ID_FIELD)
                    .push_raw(" TEXT PRIMARY KEY, ")
                    .push_ident(VERSION_FIELD)
                    .push_raw(" DOUBLE PRECISION NOT NULL DEFAULT 0, ")
                    .push_ident(CREATED_AT_FIELD)
                    .push_raw(" TIMESTAMPTZ NOT NULL DEFAULT NOW(), ")
                    .push_ident(UPDATED_AT_FIELD)
                    .push_raw(" TIMESTAMPTZ NOT NULL DEFAULT NOW(), ")
                    .push_ident(EXPIRED_AT_FIELD)
                    .push_raw(" TIMESTAMPTZ, ")
                    .push_ident(RPERM_FIELD)
                    .push_raw(" TEXT[] NOT NULL DEFAULT '{*}', ")
                    .push_ident(WPERM_FIELD)
                    .push_raw(" TEXT[] NOT NULL DEFAULT '{*}')"),
            );
            for (field, ty) in &class.fields {
                if is_default(field) {
                    continue;
                }
                for (leaf, leaf_ty) in shape_paths(field, ty) {
                    let Some(column_type) = self.dialect.column_type(&leaf_ty) else {
                        continue;
                    };
                    out.push(
                        Sql::raw("ALTER TABLE ")
                            .push_ident(name.clone())
                            .push_raw(" ADD COLUMN IF NOT EXISTS ")
                            .push_ident(leaf)
                            .push_raw(format!(" {column_type}")),
                    );
                }
            }
            for index in &class.indexes {
                out.push(self.index(name, index)?);
            }
        }
        Ok(out)
    }

    fn index(&self, class_name: &str, index: &Index) -> Result<Sql> {
        match index {
            Index::Basic { keys, unique } => {
                if keys.is_empty() {
                    return Err(TesseraError::InvalidPath(format!(
                        "{class_name} has an index without keys"
                    )));
                }
                let mut columns = Vec::with_capacity(keys.len());
                let mut names = Vec::with_capacity(keys.len());
                for (key, direction) in keys {
                    let resolved = resolve_column(self.schema, class_name, key)?;
                    if resolved.path != ColumnPath::Column
                        || self.dialect.column_type(&resolved.data_type).is_none()
                    {
                        return Err(TesseraError::InvalidPath(format!(
                            "{class_name}.{key} cannot be indexed"
                        )));
                    }
                    let order = match direction.as_i64() {
                        Some(-1) => " DESC",
                        _ => " ASC",
                    };
                    columns.push(Sql::ident(resolved.column.clone()).push_raw(order));
                    names.push(resolved.column);
                }
                let head = if *unique {
                    "CREATE UNIQUE INDEX IF NOT EXISTS "
                } else {
                    "CREATE INDEX IF NOT EXISTS "
                };
                Ok(Sql::raw(head)
                    .push_ident(format!("{class_name}_{}_idx", names.join("_")))
                    .push_raw(" ON ")
                    .push_ident(class_name)
                    .push_raw(" (")
                    .push(Sql::join(columns, ", "))
                    .push_raw(")"))
            }
            Index::Vector { vector, method } => {
                let dimension = resolve_column(self.schema, class_name, vector)
                    .ok()
                    .and_then(|resolved| match (resolved.path, resolved.data_type) {
                        (ColumnPath::Column, DataType::Vector { dimension, .. }) => Some(dimension),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        TesseraError::InvalidPath(format!(
                            "{class_name}.{vector} is not a vector field"
                        ))
                    })?;
                let ops = match method {
                    VectorMethod::Cosine => "vector_cosine_ops",
                    VectorMethod::L2 => "vector_l2_ops",
                    VectorMethod::Ip => "vector_ip_ops",
                };
                Ok(Sql::raw("CREATE INDEX IF NOT EXISTS ")
                    .push_ident(format!("{class_name}_{vector}_{ops}_idx"))
                    .push_raw(" ON ")
                    .push_ident(class_name)
                    .push_raw(" USING hnsw (((")
                    .push_ident(vector.clone())
                    .push_raw(format!(")::vector({dimension})) {ops})")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::compile;
    use super::*;
    use crate::schema::Schema;
    use crate::sql::PostgresDialect;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::from_json(json!({
            "Doc": {
                "fields": {
                    "title": "string",
                    "embedding": {"type": "vector", "dimension": 4},
                    "place": {"type": "shape", "shape": {"city": "string"}},
                    "owner": {"type": "pointer", "target": "Doc"},
                    "children": {"type": "relation", "target": "Doc", "foreignField": "owner"}
                },
                "indexes": [
                    {"keys": {"title": 1, "place.city": -1}, "unique": true},
                    {"vector": "embedding", "method": "l2"}
                ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn tables_columns_and_indexes() {
        let schema = schema();
        let compiler = QueryCompiler::new(&schema, &PostgresDialect);
        let statements: Vec<String> = compiler
            .prepare()
            .unwrap()
            .iter()
            .map(|s| compile(s).text)
            .collect();
        assert_eq!(statements[0], "CREATE EXTENSION IF NOT EXISTS vector");
        assert!(statements[1].starts_with("CREATE TABLE IF NOT EXISTS \"Doc\" (\"_id\" TEXT PRIMARY KEY"));
        assert!(statements.contains(
            &"ALTER TABLE \"Doc\" ADD COLUMN IF NOT EXISTS \"place.city\" TEXT".to_string()
        ));
        assert!(statements.contains(
            &"ALTER TABLE \"Doc\" ADD COLUMN IF NOT EXISTS \"embedding\" DOUBLE PRECISION[]".to_string()
        ));
        assert!(!statements.iter().any(|s| s.contains("\"children\"")));
        assert!(statements.contains(
            &"CREATE UNIQUE INDEX IF NOT EXISTS \"Doc_title_place.city_idx\" ON \"Doc\" (\"title\" ASC, \"place.city\" DESC)"
                .to_string()
        ));
        assert!(statements.last().unwrap().ends_with(
            "USING hnsw (((\"embedding\")::vector(4)) vector_l2_ops)"
        ));
    }

    #[test]
    fn bad_indexes_are_rejected() {
        let schema = Schema::from_json(json!({
            "Doc": {"fields": {"title": "string"}, "indexes": [{"vector": "title"}]}
        }))
        .unwrap();
        let compiler = QueryCompiler::new(&schema, &PostgresDialect);
        assert!(matches!(compiler.prepare(), Err(TesseraError::InvalidPath(_))));
    }
}
