use super::dialect::Dialect;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// A value bound as a statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(Value),
    TextArray(Vec<String>),
    FloatArray(Vec<f64>),
    /// Exact decimal carried as text and cast server-side.
    Decimal(String),
    Timestamp(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Raw(String),
    Ident(String),
    Str(String),
    Param(SqlValue),
    Nested(Sql),
    Join(Vec<Sql>, String),
}

/// Statement text with typed slots. Identifiers and string constants are
/// escaped by the dialect at compile time; parameters are numbered then.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sql {
    parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSql {
    pub text: String,
    pub params: Vec<SqlValue>,
}

impl Sql {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(text: impl Into<String>) -> Self {
        Self::new().push_raw(text)
    }

    pub fn ident(name: impl Into<String>) -> Self {
        Self::new().push_ident(name)
    }

    pub fn param(value: SqlValue) -> Self {
        Self::new().push_param(value)
    }

    /// Qualified column reference `"alias"."column"`.
    pub fn column(alias: &str, column: &str) -> Self {
        Self::ident(alias).push_raw(".").push_ident(column)
    }

    /// Compiler-controlled integer, inlined.
    pub fn int(n: i64) -> Self {
        Self::raw(n.to_string())
    }

    pub fn join(items: Vec<Sql>, separator: &str) -> Self {
        Sql {
            parts: vec![Part::Join(items, separator.to_string())],
        }
    }

    /// `(a) AND (b) ...`; an empty list is `true`.
    pub fn and(items: Vec<Sql>) -> Self {
        Self::connect(items, " AND ", "true")
    }

    /// `(a) OR (b) ...`; an empty list is `false`.
    pub fn or(items: Vec<Sql>) -> Self {
        Self::connect(items, " OR ", "false")
    }

    fn connect(items: Vec<Sql>, separator: &str, empty: &str) -> Self {
        let items: Vec<Sql> = items.into_iter().filter(|i| !i.is_empty()).collect();
        match items.len() {
            0 => Sql::raw(empty),
            1 => items.into_iter().next().unwrap_or_default(),
            _ => Sql::raw("(")
                .push(Sql::join(items.into_iter().map(Sql::parens).collect(), separator))
                .push_raw(")"),
        }
    }

    pub fn parens(self) -> Self {
        Sql::raw("(").push(self).push_raw(")")
    }

    pub fn not(self) -> Self {
        Sql::raw("NOT (").push(self).push_raw(")")
    }

    pub fn push_raw(mut self, text: impl Into<String>) -> Self {
        self.parts.push(Part::Raw(text.into()));
        self
    }

    pub fn push_ident(mut self, name: impl Into<String>) -> Self {
        self.parts.push(Part::Ident(name.into()));
        self
    }

    pub fn push_str(mut self, text: impl Into<String>) -> Self {
        self.parts.push(Part::Str(text.into()));
        self
    }

    pub fn push_param(mut self, value: SqlValue) -> Self {
        self.parts.push(Part::Param(value));
        self
    }

    pub fn push(mut self, other: Sql) -> Self {
        self.parts.push(Part::Nested(other));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|p| match p {
            Part::Raw(t) => t.is_empty(),
            Part::Nested(n) => n.is_empty(),
            Part::Join(items, _) => items.iter().all(Sql::is_empty),
            _ => false,
        })
    }

    pub fn compile(&self, dialect: &dyn Dialect) -> CompiledSql {
        let mut out = CompiledSql {
            text: String::new(),
            params: Vec::new(),
        };
        self.write(dialect, &mut out);
        out
    }

    fn write(&self, dialect: &dyn Dialect, out: &mut CompiledSql) {
        for part in &self.parts {
            match part {
                Part::Raw(text) => out.text.push_str(text),
                Part::Ident(name) => out.text.push_str(&dialect.quote_ident(name)),
                Part::Str(text) => out.text.push_str(&dialect.quote_string(text)),
                Part::Param(SqlValue::Null) => out.text.push_str("NULL"),
                Part::Param(SqlValue::Bool(b)) => out.text.push_str(dialect.bool_literal(*b)),
                Part::Param(value) => {
                    out.params.push(value.clone());
                    out.text
                        .push_str(&dialect.placeholder(out.params.len(), value));
                }
                Part::Nested(inner) => inner.write(dialect, out),
                Part::Join(items, separator) => {
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            out.text.push_str(separator);
                        }
                        item.write(dialect, out);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::PostgresDialect;

    #[test]
    fn numbering_is_global_across_nesting() {
        let inner = Sql::raw("b = ").push_param(SqlValue::Text("x".into()));
        let sql = Sql::raw("SELECT * FROM ")
            .push_ident("Note")
            .push_raw(" WHERE a = ")
            .push_param(SqlValue::Float(1.0))
            .push_raw(" AND ")
            .push(Sql::join(vec![inner.clone(), inner], " OR "));
        let compiled = sql.compile(&PostgresDialect);
        assert_eq!(
            compiled.text,
            "SELECT * FROM \"Note\" WHERE a = $1::double precision AND b = $2::text OR b = $3::text"
        );
        assert_eq!(
            compiled.params,
            vec![
                SqlValue::Float(1.0),
                SqlValue::Text("x".into()),
                SqlValue::Text("x".into())
            ]
        );
    }

    #[test]
    fn identifiers_and_strings_are_escaped() {
        let sql = Sql::ident("we\"ird").push_raw(" = ").push_str("it's");
        let compiled = sql.compile(&PostgresDialect);
        assert_eq!(compiled.text, "\"we\"\"ird\" = 'it''s'");
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn booleans_and_nulls_are_inlined() {
        let sql = Sql::param(SqlValue::Bool(true))
            .push_raw(", ")
            .push_param(SqlValue::Null)
            .push_raw(", ")
            .push(Sql::int(7));
        let compiled = sql.compile(&PostgresDialect);
        assert_eq!(compiled.text, "true, NULL, 7");
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn connectives_handle_empty_lists() {
        let d = PostgresDialect;
        assert_eq!(Sql::and(vec![]).compile(&d).text, "true");
        assert_eq!(Sql::or(vec![]).compile(&d).text, "false");
        assert_eq!(
            Sql::and(vec![Sql::raw("a"), Sql::raw("b")]).compile(&d).text,
            "((a) AND (b))"
        );
    }
}
