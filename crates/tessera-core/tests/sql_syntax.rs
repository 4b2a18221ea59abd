use serde_json::{json, Value};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use tessera_core::{
    Auth, CompiledSql, FindOptions, PostgresDialect, QueryAction, QueryCompiler, QueryValidator,
    Result, RowLock, Schema,
};

fn schema() -> Schema {
    Schema::from_json(json!({
        "User": { "fields": { "name": "string" } },
        "Tag": { "fields": { "name": "string", "status": "string" } },
        "Note": {
            "fields": {
                "title": "string",
                "pinned": "boolean",
                "score": "number",
                "author": {"type": "pointer", "target": "User"},
                "tags": {"type": "relation", "target": "Tag"},
                "comments": {"type": "relation", "target": "Comment", "foreignField": "note"}
            }
        },
        "Comment": {
            "fields": { "body": "string", "note": {"type": "pointer", "target": "Note"} }
        }
    }))
    .unwrap()
}

fn compile_find(auth: &Auth, raw: Value, lock: Option<RowLock>) -> Result<CompiledSql> {
    let schema = schema();
    let options: FindOptions = serde_json::from_value(raw)?;
    let query = QueryValidator::new(&schema, auth).decode_query("Note", &options, QueryAction::Find)?;
    let sql = QueryCompiler::new(&schema, &PostgresDialect).find(&query, lock)?;
    Ok(sql.compile(&PostgresDialect))
}

fn assert_parses(compiled: &CompiledSql) {
    if let Err(err) = Parser::parse_sql(&PostgreSqlDialect {}, &compiled.text) {
        panic!("{err}\n{}", compiled.text);
    }
}

#[test]
fn filtered_find_with_pointer_include_parses() -> Result<()> {
    let compiled = compile_find(
        &Auth::master(),
        json!({
            "filter": {"title": {"$starts": "Meeting"}, "pinned": {"$eq": true}, "author.name": {"$ne": null}},
            "includes": ["title", "author.name"],
            "sort": {"title": 1, "author.name": -1},
            "limit": 5,
            "skip": 10
        }),
        Some(RowLock::Share),
    )?;
    assert_parses(&compiled);
    assert!(compiled.text.contains(" OFFSET 10"));
    Ok(())
}

#[test]
fn acl_and_relation_predicates_parse() -> Result<()> {
    let compiled = compile_find(
        &Auth::user("u1", vec!["staff".into()]),
        json!({
            "filter": {
                "$or": [
                    {"tags": {"$every": {"name": {"$ne": "draft"}}}},
                    {"tags": {"$some": {"status": {"$in": ["open", null]}}}}
                ],
                "score": {"$not": {"$gt": 3}}
            },
            "includes": ["title", "tags"]
        }),
        None,
    )?;
    assert_parses(&compiled);
    assert!(compiled.text.contains("ARRAY(SELECT"));
    Ok(())
}

#[test]
fn group_matches_parse() -> Result<()> {
    let compiled = compile_find(
        &Auth::master(),
        json!({
            "includes": ["title"],
            "groupMatches": {
                "comments": {
                    "total": {"$count": true},
                    "byBody": {"$group": {"key": {"$key": "body"}, "value": {"$count": true}}}
                }
            },
            "sort": {"$comments.total": -1}
        }),
        None,
    )?;
    assert_parses(&compiled);
    assert!(compiled.text.contains("AS \"$comments.total\""));
    Ok(())
}

#[test]
fn count_parses() -> Result<()> {
    let schema = schema();
    let options: FindOptions = serde_json::from_value(json!({"filter": {"author.name": "ann"}}))?;
    let query = QueryValidator::new(&schema, &Auth::anonymous()).decode_query(
        "Note",
        &options,
        QueryAction::Count,
    )?;
    let compiled = QueryCompiler::new(&schema, &PostgresDialect)
        .count(&query)?
        .compile(&PostgresDialect);
    assert_parses(&compiled);
    assert!(!compiled.params.is_empty());
    Ok(())
}
