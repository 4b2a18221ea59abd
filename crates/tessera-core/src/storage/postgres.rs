use super::{decode_row, ObjectStream, Reference, StorageAdapter};
use crate::compiler::{QueryCompiler, RowLock};
use crate::config::StorageConfig;
use crate::error::{Result, TesseraError};
use crate::schema::Schema;
use crate::sql::{CompiledSql, PostgresDialect, Sql, SqlValue};
use crate::validator::DecodedQuery;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Postgres, Row};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

const UNIQUE_VIOLATION: &str = "23505";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const SERIALIZATION_FAILURE: &str = "40001";

static DIALECT: PostgresDialect = PostgresDialect;

/// Maps SQLSTATEs the dispatcher reacts to onto typed errors.
pub(crate) fn classify(err: sqlx::Error) -> TesseraError {
    let typed = err.as_database_error().and_then(|db| match db.code().as_deref() {
        Some(UNIQUE_VIOLATION) if db.constraint().is_some_and(|c| c.ends_with("_pkey")) => {
            Some(TesseraError::DuplicateIdentifier)
        }
        Some(LOCK_NOT_AVAILABLE) => Some(TesseraError::LockNotAvailable),
        _ => None,
    });
    typed.unwrap_or(TesseraError::Database(err))
}

fn is_serialization_failure(err: &TesseraError) -> bool {
    match err {
        TesseraError::Database(e) => e
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| code == SERIALIZATION_FAILURE),
        _ => false,
    }
}

fn bind<'q>(query: Query<'q, Postgres, PgArguments>, value: &SqlValue) -> Query<'q, Postgres, PgArguments> {
    match value.clone() {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(b) => query.bind(b),
        SqlValue::Int(i) => query.bind(i),
        SqlValue::Float(f) => query.bind(f),
        SqlValue::Text(s) | SqlValue::Decimal(s) => query.bind(s),
        SqlValue::Json(v) => query.bind(v),
        SqlValue::TextArray(v) => query.bind(v),
        SqlValue::FloatArray(v) => query.bind(v),
        SqlValue::Timestamp(ts) => query.bind(ts),
    }
}

fn build(compiled: &CompiledSql) -> Query<'_, Postgres, PgArguments> {
    compiled
        .params
        .iter()
        .fold(sqlx::query(&compiled.text), |query, value| bind(query, value))
}

/// Every projected column is JSON; collects them by alias.
fn row_object(row: &PgRow) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for column in row.columns() {
        let value: Option<Value> = row.try_get(column.ordinal())?;
        out.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    /// Retry the callback when the transaction fails to serialize.
    pub retry: bool,
    /// Classes whose tables are locked `IN EXCLUSIVE MODE` before the callback runs.
    pub lock_tables: Vec<String>,
}

#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    schema: Arc<Schema>,
    config: StorageConfig,
}

impl std::fmt::Debug for PostgresStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStorage")
            .field("max_connections", &self.config.max_connections)
            .finish()
    }
}

impl PostgresStorage {
    pub async fn connect(config: StorageConfig, schema: Arc<Schema>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        Ok(PostgresStorage::from_pool(pool, schema, config))
    }

    pub fn from_pool(pool: PgPool, schema: Arc<Schema>, config: StorageConfig) -> Self {
        PostgresStorage {
            pool,
            schema,
            config,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn compile(
        &self,
        statement: impl FnOnce(&mut QueryCompiler<'_>) -> Result<Sql>,
    ) -> Result<CompiledSql> {
        let mut compiler = QueryCompiler::new(&self.schema, &DIALECT);
        let compiled = statement(&mut compiler)?.compile(&DIALECT);
        debug!(sql = %compiled.text, params = compiled.params.len(), "compiled statement");
        Ok(compiled)
    }

    async fn fetch_objects<'c, E>(
        &self,
        executor: E,
        class_name: &str,
        compiled: &CompiledSql,
    ) -> Result<Vec<Value>>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        let rows = build(compiled).fetch_all(executor).await.map_err(classify)?;
        rows.iter()
            .map(|row| decode_row(&self.schema, &DIALECT, class_name, row_object(row)?))
            .collect()
    }

    /// Runs `f` inside one transaction. Everything issued through the
    /// context commits or rolls back together.
    pub async fn with_transaction<T, F>(&self, options: &TransactionOptions, mut f: F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut TxContext) -> BoxFuture<'t, Result<T>> + Send,
    {
        let attempts = if options.retry {
            self.config.tx_retries.max(1)
        } else {
            1
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.run_transaction(options, &mut f).await {
                Err(err) if attempt < attempts && is_serialization_failure(&err) => {
                    warn!(attempt, error = %err, "transaction failed to serialize, retrying");
                }
                other => return other,
            }
        }
    }

    /// Serializable transaction, retried on conflicts.
    pub async fn atomic<T, F>(&self, options: &TransactionOptions, f: F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut TxContext) -> BoxFuture<'t, Result<T>> + Send,
    {
        let options = TransactionOptions {
            isolation: IsolationLevel::Serializable,
            ..options.clone()
        };
        self.with_transaction(&options, f).await
    }

    async fn run_transaction<T, F>(&self, options: &TransactionOptions, f: &mut F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut TxContext) -> BoxFuture<'t, Result<T>> + Send,
    {
        let tx = self.pool.begin().await.map_err(classify)?;
        let mut ctx = TxContext {
            storage: self.clone(),
            tx,
        };
        sqlx::query(&format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            options.isolation.sql()
        ))
        .execute(&mut *ctx.tx)
        .await
        .map_err(classify)?;
        for class_name in &options.lock_tables {
            self.schema.class(class_name)?;
            let lock = Sql::raw("LOCK TABLE ")
                .push_ident(class_name.clone())
                .push_raw(" IN EXCLUSIVE MODE")
                .compile(&DIALECT);
            sqlx::query(&lock.text)
                .execute(&mut *ctx.tx)
                .await
                .map_err(classify)?;
        }
        match f(&mut ctx).await {
            Ok(value) => {
                ctx.tx.commit().await.map_err(classify)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = ctx.tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

/// Statements issued inside [`PostgresStorage::with_transaction`].
pub struct TxContext {
    storage: PostgresStorage,
    tx: sqlx::Transaction<'static, Postgres>,
}

impl TxContext {
    pub async fn find(&mut self, query: &DecodedQuery, lock: Option<RowLock>) -> Result<Vec<Value>> {
        let compiled = self.storage.compile(|c| c.find(query, lock))?;
        self.storage
            .fetch_objects(&mut *self.tx, &query.class_name, &compiled)
            .await
    }

    pub async fn count(&mut self, query: &DecodedQuery) -> Result<u64> {
        let compiled = self.storage.compile(|c| c.count(query))?;
        let row = build(&compiled)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(classify)?;
        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as u64)
    }

    pub async fn insert(&mut self, query: &DecodedQuery, objects: &[Map<String, Value>]) -> Result<Vec<Value>> {
        let compiled = self.storage.compile(|c| c.insert(query, objects))?;
        self.storage
            .fetch_objects(&mut *self.tx, &query.class_name, &compiled)
            .await
    }

    pub async fn update(&mut self, query: &DecodedQuery, update: &Map<String, Value>) -> Result<Vec<Value>> {
        let compiled = self.storage.compile(|c| c.update(query, update))?;
        self.storage
            .fetch_objects(&mut *self.tx, &query.class_name, &compiled)
            .await
    }

    pub async fn upsert(
        &mut self,
        query: &DecodedQuery,
        update: &Map<String, Value>,
        insert: &Map<String, Value>,
    ) -> Result<Vec<Value>> {
        let compiled = self.storage.compile(|c| c.upsert(query, update, insert))?;
        self.storage
            .fetch_objects(&mut *self.tx, &query.class_name, &compiled)
            .await
    }

    pub async fn delete(&mut self, query: &DecodedQuery) -> Result<Vec<Value>> {
        let compiled = self.storage.compile(|c| c.delete(query))?;
        self.storage
            .fetch_objects(&mut *self.tx, &query.class_name, &compiled)
            .await
    }
}

#[async_trait]
impl StorageAdapter for PostgresStorage {
    fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    async fn prepare(&self) -> Result<()> {
        let statements = QueryCompiler::new(&self.schema, &DIALECT).prepare()?;
        for statement in statements {
            let compiled = statement.compile(&DIALECT);
            debug!(sql = %compiled.text, "prepare");
            build(&compiled)
                .execute(&self.pool)
                .await
                .map_err(classify)?;
        }
        Ok(())
    }

    async fn find(&self, query: &DecodedQuery, lock: Option<RowLock>) -> Result<ObjectStream> {
        let compiled = self.compile(|c| c.find(query, lock))?;
        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let pool = self.pool.clone();
        let schema = self.schema.clone();
        let class_name = query.class_name.clone();
        tokio::spawn(async move {
            let mut rows = build(&compiled).fetch(&pool);
            while let Some(row) = rows.next().await {
                let item = row
                    .map_err(classify)
                    .and_then(|row| row_object(&row))
                    .and_then(|object| decode_row(&schema, &DIALECT, &class_name, object));
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn count(&self, query: &DecodedQuery) -> Result<u64> {
        let compiled = self.compile(|c| c.count(query))?;
        let row = build(&compiled)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as u64)
    }

    async fn insert(&self, query: &DecodedQuery, objects: &[Map<String, Value>]) -> Result<Vec<Value>> {
        let compiled = self.compile(|c| c.insert(query, objects))?;
        self.fetch_objects(&self.pool, &query.class_name, &compiled)
            .await
    }

    async fn update(&self, query: &DecodedQuery, update: &Map<String, Value>) -> Result<Vec<Value>> {
        let compiled = self.compile(|c| c.update(query, update))?;
        self.fetch_objects(&self.pool, &query.class_name, &compiled)
            .await
    }

    async fn upsert(
        &self,
        query: &DecodedQuery,
        update: &Map<String, Value>,
        insert: &Map<String, Value>,
    ) -> Result<Vec<Value>> {
        let compiled = self.compile(|c| c.upsert(query, update, insert))?;
        self.fetch_objects(&self.pool, &query.class_name, &compiled)
            .await
    }

    async fn delete(&self, query: &DecodedQuery) -> Result<Vec<Value>> {
        let compiled = self.compile(|c| c.delete(query))?;
        self.fetch_objects(&self.pool, &query.class_name, &compiled)
            .await
    }

    async fn random(&self, query: &DecodedQuery, weight: Option<&str>) -> Result<Vec<Value>> {
        let compiled = self.compile(|c| c.random(query, weight))?;
        self.fetch_objects(&self.pool, &query.class_name, &compiled)
            .await
    }

    async fn explain(&self, query: &DecodedQuery) -> Result<Value> {
        let compiled = self.compile(|c| c.explain(query))?;
        let row = build(&compiled)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        Ok(row.try_get::<Value, _>(0)?)
    }

    async fn refs(&self, class_name: &str, ids: &[String]) -> Result<Vec<Reference>> {
        let compiled = self.compile(|c| c.refs(class_name, ids))?;
        let rows = build(&compiled)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let class: Option<String> = row.try_get("class")?;
            let field: Option<String> = row.try_get("field")?;
            let id: Option<String> = row.try_get("_id")?;
            if let (Some(class_name), Some(field), Some(object_id)) = (class, field, id) {
                out.push(Reference {
                    class_name,
                    field,
                    object_id,
                });
            }
        }
        Ok(out)
    }

    async fn nonrefs(&self, query: &DecodedQuery) -> Result<Vec<Value>> {
        let compiled = self.compile(|c| c.nonrefs(query))?;
        self.fetch_objects(&self.pool, &query.class_name, &compiled)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_stay_generic() {
        let err = classify(sqlx::Error::RowNotFound);
        assert!(matches!(err, TesseraError::Database(_)));
        assert!(!is_serialization_failure(&err));
        assert!(!is_serialization_failure(&TesseraError::LockNotAvailable));
    }

    #[test]
    fn isolation_levels_render() {
        assert_eq!(IsolationLevel::default().sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::Serializable.sql(), "SERIALIZABLE");
    }
}
