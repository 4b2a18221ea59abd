pub mod compiler;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod live;
pub mod query;
pub mod schema;
pub mod sql;
pub mod storage;
pub mod validator;

pub use compiler::{QueryCompiler, RowLock};
pub use config::{DispatchConfig, StorageConfig};
pub use dispatch::Dispatcher;
pub use error::{Result, TesseraError};
pub use live::{LiveEvent, LiveHub, LiveMessage};
pub use schema::{ClassSchema, DataType, Schema};
pub use sql::{CompiledSql, PostgresDialect, Sql, SqlValue};
pub use storage::{PostgresStorage, StorageAdapter, TransactionOptions};
pub use validator::{Auth, DecodedQuery, FindOptions, QueryAction, QueryValidator};
