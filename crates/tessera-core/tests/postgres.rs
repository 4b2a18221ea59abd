//! Runs against a live database when `TESSERA_TEST_DATABASE_URL` is set.
//! Each test owns its classes so tests can share one database.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tessera_core::{
    Auth, DispatchConfig, Dispatcher, FindOptions, PostgresStorage, QueryAction, QueryValidator,
    Result, RowLock, Schema, StorageAdapter, StorageConfig, TesseraError, TransactionOptions,
};

async fn setup(schema: Value) -> Result<Option<(PostgresStorage, Dispatcher)>> {
    let Ok(url) = std::env::var("TESSERA_TEST_DATABASE_URL") else {
        return Ok(None);
    };
    let schema = Arc::new(Schema::from_json(schema)?);
    let storage = PostgresStorage::connect(StorageConfig::new(url), schema.clone()).await?;
    storage.prepare().await?;
    let dispatcher = Dispatcher::new(Arc::new(storage.clone()), DispatchConfig::default());
    let classes: Vec<String> = schema.classes().map(|(name, _)| name.clone()).collect();
    for class in classes {
        dispatcher
            .delete(&Auth::master(), &class, &FindOptions::default())
            .await?;
    }
    Ok(Some((storage, dispatcher)))
}

fn options(raw: Value) -> FindOptions {
    serde_json::from_value(raw).unwrap()
}

fn objects(raw: Value) -> Vec<Map<String, Value>> {
    raw.as_array()
        .unwrap()
        .iter()
        .map(|o| o.as_object().cloned().unwrap())
        .collect()
}

#[tokio::test]
async fn prefix_and_flag_filter() -> Result<()> {
    let Some((_, dispatcher)) = setup(json!({
        "ScenarioNote": { "fields": { "title": "string", "pinned": "boolean" } }
    }))
    .await?
    else {
        return Ok(());
    };
    let master = Auth::master();
    dispatcher
        .insert(
            &master,
            "ScenarioNote",
            &objects(json!([
                {"title": "Meeting notes", "pinned": true},
                {"title": "Meeting agenda", "pinned": false},
                {"title": "Groceries", "pinned": true}
            ])),
            &[],
        )
        .await?;
    let found = dispatcher
        .find(
            &master,
            "ScenarioNote",
            &options(json!({"filter": {"title": {"$starts": "Meeting"}, "pinned": {"$eq": true}}})),
        )
        .await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["title"], json!("Meeting notes"));
    assert_eq!(found[0]["__v"].as_f64(), Some(0.0));
    Ok(())
}

#[tokio::test]
async fn every_over_relation_members() -> Result<()> {
    let Some((_, dispatcher)) = setup(json!({
        "EveryTag": { "fields": { "name": "string" } },
        "EveryNote": { "fields": {
            "title": "string",
            "tags": {"type": "relation", "target": "EveryTag"}
        } }
    }))
    .await?
    else {
        return Ok(());
    };
    let master = Auth::master();
    dispatcher
        .insert(
            &master,
            "EveryTag",
            &objects(json!([
                {"_id": "a", "name": "a"},
                {"_id": "b", "name": "b"},
                {"_id": "d", "name": "draft"}
            ])),
            &[],
        )
        .await?;
    dispatcher
        .insert(
            &master,
            "EveryNote",
            &objects(json!([
                {"_id": "clean", "tags": ["a", "b"]},
                {"_id": "drafted", "tags": ["d"]},
                {"_id": "untagged", "tags": []}
            ])),
            &[],
        )
        .await?;
    let found = dispatcher
        .find(
            &master,
            "EveryNote",
            &options(json!({
                "filter": {"tags": {"$every": {"name": {"$ne": "draft"}}}},
                "includes": ["tags"],
                "sort": {"_id": 1}
            })),
        )
        .await?;
    let ids: Vec<&str> = found.iter().filter_map(|o| o["_id"].as_str()).collect();
    assert_eq!(ids, vec!["clean", "untagged"]);
    assert_eq!(found[0]["tags"][1]["name"], json!("b"));
    assert_eq!(found[1]["tags"], json!([]));
    Ok(())
}

#[tokio::test]
async fn group_counts_by_key() -> Result<()> {
    let Some((_, dispatcher)) = setup(json!({
        "GroupIssue": { "fields": {
            "status": "string",
            "project": {"type": "pointer", "target": "GroupProject"}
        } },
        "GroupProject": { "fields": {
            "name": "string",
            "issues": {"type": "relation", "target": "GroupIssue", "foreignField": "project"}
        } }
    }))
    .await?
    else {
        return Ok(());
    };
    let master = Auth::master();
    dispatcher
        .insert(&master, "GroupProject", &objects(json!([{"_id": "p", "name": "p"}])), &[])
        .await?;
    let issues: Vec<Value> = ["open", "open", "closed", "closed", "closed"]
        .iter()
        .map(|status| json!({"status": status, "project": "p"}))
        .collect();
    dispatcher
        .insert(&master, "GroupIssue", &objects(Value::Array(issues)), &[])
        .await?;
    let found = dispatcher
        .find(
            &master,
            "GroupProject",
            &options(json!({
                "groupMatches": {"issues": {
                    "byStatus": {"$group": {"key": {"$key": "status"}, "value": {"$count": true}}}
                }}
            })),
        )
        .await?;
    let mut groups: Vec<(String, f64)> = found[0]["$issues.byStatus"]
        .as_array()
        .unwrap()
        .iter()
        .map(|g| (g["key"].as_str().unwrap().to_string(), g["value"].as_f64().unwrap()))
        .collect();
    groups.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(groups, vec![("closed".to_string(), 3.0), ("open".to_string(), 2.0)]);
    Ok(())
}

#[tokio::test]
async fn upsert_inserts_then_updates() -> Result<()> {
    let Some((_, dispatcher)) = setup(json!({
        "UpsertCounter": { "fields": { "name": "string", "hits": "number" } }
    }))
    .await?
    else {
        return Ok(());
    };
    let master = Auth::master();
    let query = options(json!({"filter": {"name": "home"}}));
    let update = objects(json!([{"name": "home", "hits": {"$inc": 1}}])).remove(0);
    let set_on_insert = objects(json!([{"hits": 1}])).remove(0);

    let first = dispatcher
        .upsert(&master, "UpsertCounter", &query, &update, &set_on_insert)
        .await?;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0]["hits"].as_f64(), Some(1.0));
    assert_eq!(first[0]["__v"].as_f64(), Some(0.0));

    let second = dispatcher
        .upsert(&master, "UpsertCounter", &query, &update, &set_on_insert)
        .await?;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0]["_id"], first[0]["_id"]);
    assert_eq!(second[0]["hits"].as_f64(), Some(2.0));
    assert_eq!(second[0]["__v"].as_f64(), Some(1.0));
    assert_eq!(dispatcher.count(&master, "UpsertCounter", &FindOptions::default()).await?, 1);
    Ok(())
}

#[tokio::test]
async fn locked_rows_fail_fast() -> Result<()> {
    let Some((storage, dispatcher)) = setup(json!({
        "LockedNote": { "fields": { "title": "string" } }
    }))
    .await?
    else {
        return Ok(());
    };
    let master = Auth::master();
    dispatcher
        .insert(&master, "LockedNote", &objects(json!([{"_id": "n", "title": "t"}])), &[])
        .await?;
    let options = options(json!({"filter": {"_id": "n"}}));
    let query = QueryValidator::new(storage.schema(), &master).decode_query(
        "LockedNote",
        &options,
        QueryAction::Update,
    )?;
    let dispatcher = Arc::new(dispatcher);
    let contender = dispatcher.clone();
    let outcome = storage
        .with_transaction(&TransactionOptions::default(), move |tx| {
            let query = query.clone();
            let options = options.clone();
            let dispatcher = contender.clone();
            Box::pin(async move {
                let locked = tx.find(&query, Some(RowLock::Update)).await?;
                assert_eq!(locked.len(), 1);
                let update = objects(json!([{"title": "blocked"}])).remove(0);
                let attempt = dispatcher
                    .update(&Auth::master(), "LockedNote", &options, &update)
                    .await;
                Ok::<_, TesseraError>(attempt)
            })
        })
        .await?;
    assert!(matches!(outcome, Err(TesseraError::LockNotAvailable)));

    let found = dispatcher
        .get(&master, "LockedNote", "n", &[])
        .await?
        .unwrap();
    assert_eq!(found["title"], json!("t"));
    Ok(())
}

#[tokio::test]
async fn transaction_rolls_back_on_error() -> Result<()> {
    let Some((storage, dispatcher)) = setup(json!({
        "TxNote": { "fields": { "title": "string" } }
    }))
    .await?
    else {
        return Ok(());
    };
    let master = Auth::master();
    let query = QueryValidator::new(storage.schema(), &master).decode_query(
        "TxNote",
        &FindOptions::default(),
        QueryAction::Create,
    )?;
    let result = storage
        .atomic(&TransactionOptions::default(), move |tx| {
            let query = query.clone();
            Box::pin(async move {
                let row = objects(json!([{"_id": "gone", "title": "t"}])).remove(0);
                tx.insert(&query, &[row]).await?;
                Err::<(), _>(TesseraError::InvalidDataType("abort".into()))
            })
        })
        .await;
    assert!(matches!(result, Err(TesseraError::InvalidDataType(_))));
    assert_eq!(dispatcher.count(&master, "TxNote", &FindOptions::default()).await?, 0);
    Ok(())
}

#[tokio::test]
async fn hidden_objects_stay_hidden_at_every_depth() -> Result<()> {
    let Some((_, dispatcher)) = setup(json!({
        "AclUser": { "fields": { "name": "string" } },
        "AclTag": { "fields": { "name": "string" } },
        "AclNote": { "fields": {
            "title": "string",
            "author": {"type": "pointer", "target": "AclUser"},
            "tags": {"type": "relation", "target": "AclTag"}
        } }
    }))
    .await?
    else {
        return Ok(());
    };
    let master = Auth::master();
    dispatcher
        .insert(
            &master,
            "AclUser",
            &objects(json!([
                {"_id": "hidden", "name": "h", "_rperm": ["bob"]},
                {"_id": "shown", "name": "s"}
            ])),
            &[],
        )
        .await?;
    dispatcher
        .insert(
            &master,
            "AclTag",
            &objects(json!([
                {"_id": "open", "name": "o"},
                {"_id": "secret", "name": "x", "_rperm": ["bob"]}
            ])),
            &[],
        )
        .await?;
    dispatcher
        .insert(
            &master,
            "AclNote",
            &objects(json!([
                {"_id": "public", "author": "hidden", "tags": ["open", "secret"]},
                {"_id": "private", "author": "shown", "tags": ["open"], "_rperm": ["bob"]}
            ])),
            &[],
        )
        .await?;

    let eve = Auth::user("eve", vec![]);
    let bob = Auth::user("bob", vec![]);
    let notes = dispatcher
        .find(
            &eve,
            "AclNote",
            &options(json!({"includes": ["author.name", "tags"], "sort": {"_id": 1}})),
        )
        .await?;
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0]["_id"], json!("public"));
    assert_eq!(notes[0]["author"], Value::Null);
    let tags: Vec<&str> = notes[0]["tags"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["_id"].as_str())
        .collect();
    assert_eq!(tags, vec!["open"]);

    let by_bob = dispatcher
        .find(&bob, "AclNote", &options(json!({"filter": {"_id": "public"}, "includes": ["author.name"]})))
        .await?;
    assert_eq!(by_bob[0]["author"]["name"], json!("h"));

    let members = |object_id: &str| {
        options(json!({
            "relatedBy": {"className": "AclNote", "objectId": object_id, "key": "tags"},
            "sort": {"_id": 1}
        }))
    };
    let ids = |found: &[Value]| -> Vec<String> {
        found
            .iter()
            .filter_map(|o| o["_id"].as_str().map(str::to_string))
            .collect()
    };
    let hidden_parent = dispatcher.find(&eve, "AclTag", &members("private")).await?;
    assert!(hidden_parent.is_empty());
    assert_eq!(dispatcher.count(&eve, "AclTag", &members("private")).await?, 0);
    let visible_parent = dispatcher.find(&bob, "AclTag", &members("private")).await?;
    assert_eq!(ids(&visible_parent), vec!["open"]);
    let filtered = dispatcher.find(&eve, "AclTag", &members("public")).await?;
    assert_eq!(ids(&filtered), vec!["open"]);
    Ok(())
}

#[tokio::test]
async fn expired_parents_hide_their_members() -> Result<()> {
    let Some((_, dispatcher)) = setup(json!({
        "ExpiryTag": { "fields": { "name": "string" } },
        "ExpiryNote": { "fields": { "tags": {"type": "relation", "target": "ExpiryTag"} } }
    }))
    .await?
    else {
        return Ok(());
    };
    let master = Auth::master();
    dispatcher
        .insert(&master, "ExpiryTag", &objects(json!([{"_id": "t", "name": "t"}])), &[])
        .await?;
    dispatcher
        .insert(
            &master,
            "ExpiryNote",
            &objects(json!([{
                "_id": "old",
                "tags": ["t"],
                "_expired_at": {"$date": "2000-01-01T00:00:00Z"}
            }])),
            &[],
        )
        .await?;
    let request = options(json!({
        "relatedBy": {"className": "ExpiryNote", "objectId": "old", "key": "tags"}
    }));
    assert!(dispatcher.find(&master, "ExpiryTag", &request).await?.is_empty());
    Ok(())
}
