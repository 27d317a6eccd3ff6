//! # Store Capability
//!
//! The relational store as the core sees it: run a query, execute a
//! statement, or execute a batch inside one transaction. Rows travel as JSON
//! objects. Every call made through [`GuardedStore`] is wrapped by the
//! breaker for the statement's operation key (`store:<statement id>`).

pub mod guarded;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod stub;

pub use guarded::{GuardedStore, STORE_PING_OPERATION_KEY, STORE_TRANSACTION_OPERATION_KEY};
#[cfg(feature = "postgres")]
pub use postgres::PgStore;
pub use stub::StubStore;

use crate::error::CoreResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named SQL statement; the id is its breaker and cache identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Statement {
    pub id: String,
    pub sql: String,
}

impl Statement {
    pub fn new(id: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sql: sql.into(),
        }
    }

    pub fn operation_key(&self) -> String {
        format!("store:{}", self.id)
    }
}

/// One statement with its positional parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementCall {
    pub statement: Statement,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl StatementCall {
    pub fn new(statement: Statement, params: Vec<Value>) -> Self {
        Self { statement, params }
    }
}

#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Rows as JSON objects keyed by column name
    async fn query(&self, statement: &Statement, params: &[Value]) -> CoreResult<Vec<Value>>;

    /// Affected row count
    async fn execute(&self, statement: &Statement, params: &[Value]) -> CoreResult<u64>;

    /// Execute every call in one transaction; all or nothing
    async fn transaction(&self, calls: &[StatementCall]) -> CoreResult<Vec<u64>>;

    /// Cheap liveness round trip
    async fn ping(&self) -> CoreResult<()>;

    fn store_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_key_derives_from_statement_id() {
        let statement = Statement::new("todo_by_id", "SELECT * FROM todo WHERE id = $1");
        assert_eq!(statement.operation_key(), "store:todo_by_id");
    }
}
