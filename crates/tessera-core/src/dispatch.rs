//! Request entry points: validation, identifier generation, duplicate-id
//! retries and live notifications around a [`StorageAdapter`].

use crate::config::DispatchConfig;
use crate::error::Result;
use crate::live::{LiveEvent, LiveHub};
use crate::schema::{FieldAction, Schema, ID_FIELD, VERSION_FIELD};
use crate::sql::UpdateOp;
use crate::storage::{ObjectStream, StorageAdapter};
use crate::validator::{Auth, DecodedQuery, ExtraFilter, FindOptions, QueryAction, QueryValidator};
use futures::TryStreamExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

fn new_object_id(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length.max(1))
        .map(char::from)
        .collect()
}

pub struct Dispatcher {
    storage: Arc<dyn StorageAdapter>,
    config: DispatchConfig,
    live: Arc<LiveHub>,
    extra_filter: Option<ExtraFilter>,
}

impl Dispatcher {
    pub fn new(storage: Arc<dyn StorageAdapter>, config: DispatchConfig) -> Self {
        Dispatcher {
            storage,
            config,
            live: Arc::new(LiveHub::default()),
            extra_filter: None,
        }
    }

    pub fn with_live(mut self, live: Arc<LiveHub>) -> Self {
        self.live = live;
        self
    }

    /// Predicate added to every class at every join depth.
    pub fn with_extra_filter(mut self, filter: ExtraFilter) -> Self {
        self.extra_filter = Some(filter);
        self
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.storage.schema()
    }

    pub fn live(&self) -> &Arc<LiveHub> {
        &self.live
    }

    fn validator<'a>(&'a self, auth: &'a Auth) -> QueryValidator<'a> {
        let validator =
            QueryValidator::new(self.storage.schema(), auth).with_max_depth(self.config.max_depth);
        match &self.extra_filter {
            Some(filter) => validator.with_extra_filter(filter.clone()),
            None => validator,
        }
    }

    fn decode(
        &self,
        auth: &Auth,
        class_name: &str,
        options: &FindOptions,
        action: QueryAction,
    ) -> Result<DecodedQuery> {
        self.validator(auth).decode_query(class_name, options, action)
    }

    pub async fn find_stream(
        &self,
        auth: &Auth,
        class_name: &str,
        options: &FindOptions,
    ) -> Result<ObjectStream> {
        let query = self.decode(auth, class_name, options, QueryAction::Find)?;
        self.storage.find(&query, None).await
    }

    pub async fn find(&self, auth: &Auth, class_name: &str, options: &FindOptions) -> Result<Vec<Value>> {
        self.find_stream(auth, class_name, options)
            .await?
            .try_collect()
            .await
    }

    pub async fn get(
        &self,
        auth: &Auth,
        class_name: &str,
        id: &str,
        includes: &[String],
    ) -> Result<Option<Value>> {
        let options = FindOptions {
            filter: Some(json!({ "_id": id })),
            includes: includes.to_vec(),
            limit: Some(1),
            ..Default::default()
        };
        Ok(self.find(auth, class_name, &options).await?.into_iter().next())
    }

    pub async fn count(&self, auth: &Auth, class_name: &str, options: &FindOptions) -> Result<u64> {
        let query = self.decode(auth, class_name, options, QueryAction::Count)?;
        self.storage.count(&query).await
    }

    pub async fn random(
        &self,
        auth: &Auth,
        class_name: &str,
        options: &FindOptions,
        weight: Option<&str>,
    ) -> Result<Vec<Value>> {
        let query = self.decode(auth, class_name, options, QueryAction::Find)?;
        if let Some(path) = weight {
            self.validator(auth).authorize_path(class_name, path)?;
        }
        self.storage.random(&query, weight).await
    }

    pub async fn explain(&self, auth: &Auth, class_name: &str, options: &FindOptions) -> Result<Value> {
        let query = self.decode(auth, class_name, options, QueryAction::Find)?;
        self.storage.explain(&query).await
    }

    /// Inserts `objects`; a missing `_id` is generated and regenerated when
    /// it collides with an existing row.
    pub async fn insert(
        &self,
        auth: &Auth,
        class_name: &str,
        objects: &[Map<String, Value>],
        includes: &[String],
    ) -> Result<Vec<Value>> {
        let validator = self.validator(auth);
        for attrs in objects {
            validator.validate_attributes(class_name, attrs, FieldAction::Create)?;
        }
        let options = FindOptions {
            includes: includes.to_vec(),
            ..Default::default()
        };
        let query = validator.decode_query(class_name, &options, QueryAction::Create)?;
        let generated = objects.iter().any(|attrs| !attrs.contains_key(ID_FIELD));

        let mut attempt = 0;
        let created = loop {
            let rows: Vec<Map<String, Value>> = objects
                .iter()
                .map(|attrs| self.with_object_id(attrs))
                .collect();
            match self.storage.insert(&query, &rows).await {
                Err(err)
                    if generated
                        && attempt < self.config.insert_retries
                        && self.storage.is_duplicate_id_error(&err) =>
                {
                    attempt += 1;
                    warn!("generated id collided in {class_name}, retrying ({attempt})");
                }
                other => break other?,
            }
        };
        self.notify(LiveEvent::Create, class_name, &created);
        Ok(created)
    }

    pub async fn update(
        &self,
        auth: &Auth,
        class_name: &str,
        options: &FindOptions,
        update: &Map<String, Value>,
    ) -> Result<Vec<Value>> {
        let validator = self.validator(auth);
        validator.validate_attributes(class_name, update, FieldAction::Update)?;
        let query = validator.decode_query(class_name, options, QueryAction::Update)?;
        let updated = self.storage.update(&query, update).await?;
        debug!("updated {} {class_name} objects", updated.len());
        self.notify(LiveEvent::Update, class_name, &updated);
        Ok(updated)
    }

    /// Updates the matching objects, or inserts one built from the plain
    /// `$set` values of `update` overlaid with `set_on_insert`.
    pub async fn upsert(
        &self,
        auth: &Auth,
        class_name: &str,
        options: &FindOptions,
        update: &Map<String, Value>,
        set_on_insert: &Map<String, Value>,
    ) -> Result<Vec<Value>> {
        let validator = self.validator(auth);
        validator.validate_attributes(class_name, update, FieldAction::Update)?;
        validator.validate_attributes(class_name, set_on_insert, FieldAction::Create)?;
        validator.decode_query(class_name, &FindOptions::default(), QueryAction::Create)?;
        let query = validator.decode_query(class_name, options, QueryAction::Update)?;

        let mut insert = Map::new();
        for (key, raw) in update {
            if let (UpdateOp::Set, value) = UpdateOp::decode(raw)? {
                insert.insert(key.clone(), value);
            }
        }
        insert.extend(set_on_insert.iter().map(|(k, v)| (k.clone(), v.clone())));
        let generated = !insert.contains_key(ID_FIELD);

        let mut attempt = 0;
        let objects = loop {
            let row = self.with_object_id(&insert);
            match self.storage.upsert(&query, update, &row).await {
                Err(err)
                    if generated
                        && attempt < self.config.insert_retries
                        && self.storage.is_duplicate_id_error(&err) =>
                {
                    attempt += 1;
                    warn!("generated id collided in {class_name} upsert, retrying ({attempt})");
                }
                other => break other?,
            }
        };
        let (created, updated): (Vec<Value>, Vec<Value>) = objects
            .iter()
            .cloned()
            .partition(|o| o.get(VERSION_FIELD).and_then(Value::as_f64) == Some(0.0));
        self.notify(LiveEvent::Create, class_name, &created);
        self.notify(LiveEvent::Update, class_name, &updated);
        Ok(objects)
    }

    pub async fn delete(&self, auth: &Auth, class_name: &str, options: &FindOptions) -> Result<Vec<Value>> {
        let query = self.decode(auth, class_name, options, QueryAction::Delete)?;
        let deleted = self.storage.delete(&query).await?;
        self.notify(LiveEvent::Delete, class_name, &deleted);
        Ok(deleted)
    }

    fn with_object_id(&self, attrs: &Map<String, Value>) -> Map<String, Value> {
        let mut row = attrs.clone();
        if !row.contains_key(ID_FIELD) {
            row.insert(
                ID_FIELD.to_string(),
                Value::String(new_object_id(self.config.id_length)),
            );
        }
        row
    }

    /// Hands results to the live hub off the request path.
    fn notify(&self, event: LiveEvent, class_name: &str, objects: &[Value]) {
        if objects.is_empty() || self.live.is_empty() {
            return;
        }
        let live = self.live.clone();
        let class_name = class_name.to_string();
        let objects = objects.to_vec();
        tokio::spawn(async move {
            let delivered = live.publish(event, &class_name, &objects);
            debug!("live {event:?} on {class_name} reached {delivered} subscribers");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_alphanumeric() {
        let id = new_object_id(12);
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(new_object_id(12), id);
    }
}
