use async_trait::async_trait;

use crate::db::Database;
use crate::error::StoreError;
use crate::results::{DbRow, RunResult};
use crate::transaction::TxHandle;
use crate::types::RowValues;

/// Statement surface shared by the pooled manager and transaction handles, so the
/// same SQL can run in either context.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn run(&self, sql: &str, params: &[RowValues]) -> Result<RunResult, StoreError>;

    async fn get(&self, sql: &str, params: &[RowValues]) -> Result<Option<DbRow>, StoreError>;

    async fn all(&self, sql: &str, params: &[RowValues]) -> Result<Vec<DbRow>, StoreError>;

    /// Whether statements run inside a transaction (and therefore without retry).
    fn in_transaction(&self) -> bool;
}

#[async_trait]
impl QueryExecutor for Database {
    async fn run(&self, sql: &str, params: &[RowValues]) -> Result<RunResult, StoreError> {
        Database::run(self, sql, params).await
    }

    async fn get(&self, sql: &str, params: &[RowValues]) -> Result<Option<DbRow>, StoreError> {
        Database::get(self, sql, params).await
    }

    async fn all(&self, sql: &str, params: &[RowValues]) -> Result<Vec<DbRow>, StoreError> {
        Database::all(self, sql, params).await
    }

    fn in_transaction(&self) -> bool {
        false
    }
}

#[async_trait]
impl QueryExecutor for TxHandle {
    async fn run(&self, sql: &str, params: &[RowValues]) -> Result<RunResult, StoreError> {
        TxHandle::run(self, sql, params).await
    }

    async fn get(&self, sql: &str, params: &[RowValues]) -> Result<Option<DbRow>, StoreError> {
        TxHandle::get(self, sql, params).await
    }

    async fn all(&self, sql: &str, params: &[RowValues]) -> Result<Vec<DbRow>, StoreError> {
        TxHandle::all(self, sql, params).await
    }

    fn in_transaction(&self) -> bool {
        true
    }
}
