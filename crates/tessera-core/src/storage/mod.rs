//! Storage contract and its PostgreSQL implementation.

pub mod decode;
mod postgres;

pub use decode::decode_row;
pub use postgres::{IsolationLevel, PostgresStorage, TransactionOptions, TxContext};

use crate::compiler::RowLock;
use crate::error::{Result, TesseraError};
use crate::schema::Schema;
use crate::validator::DecodedQuery;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Decoded objects of a streamed read.
pub type ObjectStream = BoxStream<'static, Result<Value>>;

/// One object holding a reference found by [`StorageAdapter::refs`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub class_name: String,
    pub field: String,
    pub object_id: String,
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn schema(&self) -> &Arc<Schema>;

    /// Creates tables, columns and indexes for the schema.
    async fn prepare(&self) -> Result<()>;

    async fn find(&self, query: &DecodedQuery, lock: Option<RowLock>) -> Result<ObjectStream>;

    async fn count(&self, query: &DecodedQuery) -> Result<u64>;

    async fn insert(&self, query: &DecodedQuery, objects: &[Map<String, Value>]) -> Result<Vec<Value>>;

    async fn update(&self, query: &DecodedQuery, update: &Map<String, Value>) -> Result<Vec<Value>>;

    async fn upsert(
        &self,
        query: &DecodedQuery,
        update: &Map<String, Value>,
        insert: &Map<String, Value>,
    ) -> Result<Vec<Value>>;

    async fn delete(&self, query: &DecodedQuery) -> Result<Vec<Value>>;

    async fn random(&self, query: &DecodedQuery, weight: Option<&str>) -> Result<Vec<Value>>;

    async fn explain(&self, query: &DecodedQuery) -> Result<Value>;

    async fn refs(&self, class_name: &str, ids: &[String]) -> Result<Vec<Reference>>;

    async fn nonrefs(&self, query: &DecodedQuery) -> Result<Vec<Value>>;

    fn is_duplicate_id_error(&self, err: &TesseraError) -> bool {
        err.is_retryable_duplicate()
    }
}
