pub mod dialect;
pub mod fragment;
pub mod postgres;

pub use dialect::{Dialect, Operand, UpdateOp};
pub use fragment::{CompiledSql, Sql, SqlValue};
pub use postgres::PostgresDialect;
