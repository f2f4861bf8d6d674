use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::StoreError;
use crate::metrics::MetricsRegistry;
use crate::results::{DbRow, RunResult};
use crate::sqlite::{Params, SqliteConnection};
use crate::timeout::with_timeout;
use crate::types::RowValues;

/// Statement entry points bound to one transaction's connection.
///
/// Cheap to clone. Statements run in submission order, under the timeout guard, and
/// are never retried. Once the transaction finishes every call fails with
/// `NoActiveTransaction`.
#[derive(Debug, Clone)]
pub struct TxHandle {
    conn: Arc<SqliteConnection>,
    tx_id: Arc<str>,
    timeout: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl TxHandle {
    pub(crate) fn new(
        conn: Arc<SqliteConnection>,
        tx_id: Arc<str>,
        timeout: Duration,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            conn,
            tx_id,
            timeout,
            metrics,
        }
    }

    #[must_use]
    pub fn tx_id(&self) -> &str {
        &self.tx_id
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<SqliteConnection> {
        &self.conn
    }

    /// # Errors
    /// Returns `StoreError` if the statement fails or times out.
    pub async fn run(&self, sql: &str, params: &[RowValues]) -> Result<RunResult, StoreError> {
        let started = Instant::now();
        let result = with_timeout(
            self.conn.execute_dml_in_tx(sql, Params::convert(params)),
            self.timeout,
        )
        .await;
        self.metrics.record_query(started.elapsed(), result.is_ok());
        result
    }

    /// # Errors
    /// Returns `StoreError` if the query fails or times out.
    pub async fn all(&self, sql: &str, params: &[RowValues]) -> Result<Vec<DbRow>, StoreError> {
        let started = Instant::now();
        let result = with_timeout(
            self.conn.execute_select_in_tx(sql, Params::convert(params)),
            self.timeout,
        )
        .await;
        self.metrics.record_query(started.elapsed(), result.is_ok());
        Ok(result?.into_rows())
    }

    /// First row of the query, if any.
    ///
    /// # Errors
    /// Returns `StoreError` if the query fails or times out.
    pub async fn get(&self, sql: &str, params: &[RowValues]) -> Result<Option<DbRow>, StoreError> {
        Ok(self.all(sql, params).await?.into_iter().next())
    }

    /// # Errors
    /// Returns `StoreError` if the batch fails or times out.
    pub async fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        let started = Instant::now();
        let result = with_timeout(self.conn.execute_batch_in_tx(sql), self.timeout).await;
        self.metrics.record_query(started.elapsed(), result.is_ok());
        result
    }
}
