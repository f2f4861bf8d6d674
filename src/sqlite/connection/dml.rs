use crate::error::{StoreError, classify};
use crate::results::RunResult;
use crate::sqlite::params::Params;

use super::{SqliteConnection, run_blocking};

impl SqliteConnection {
    /// Execute a batch of statements; wraps in a transaction when not already inside one.
    ///
    /// # Errors
    /// Returns `StoreError` if a transaction is active or the batch fails.
    pub async fn execute_batch(&self, query: &str) -> Result<(), StoreError> {
        self.ensure_not_in_tx("execute batch")?;
        let sql_owned = query.to_owned();
        run_blocking(self.conn_handle(), move |guard| {
            if guard.is_autocommit() {
                let tx = guard.transaction().map_err(classify)?;
                tx.execute_batch(&sql_owned).map_err(classify)?;
                tx.commit().map_err(classify)
            } else {
                guard.execute_batch(&sql_owned).map_err(classify)
            }
        })
        .await
    }

    /// Execute a DML statement and return rows changed plus the last inserted rowid.
    ///
    /// # Errors
    /// Returns `StoreError` if a transaction is active or the statement fails.
    pub async fn execute_dml(&self, query: &str, params: Params) -> Result<RunResult, StoreError> {
        self.ensure_not_in_tx("execute dml")?;
        dml_blocking(self, query, params).await
    }

    /// Execute a DML statement inside the open transaction.
    ///
    /// # Errors
    /// Returns `StoreError::NoActiveTransaction` if no transaction is active.
    pub async fn execute_dml_in_tx(&self, query: &str, params: Params) -> Result<RunResult, StoreError> {
        self.ensure_in_tx()?;
        dml_blocking(self, query, params).await
    }

    /// Execute a batch inside the open transaction without implicit commit.
    ///
    /// # Errors
    /// Returns `StoreError::NoActiveTransaction` if no transaction is active.
    pub async fn execute_batch_in_tx(&self, sql: &str) -> Result<(), StoreError> {
        self.ensure_in_tx()?;
        let sql_owned = sql.to_owned();
        run_blocking(self.conn_handle(), move |guard| {
            guard.execute_batch(&sql_owned).map_err(classify)
        })
        .await
    }
}

async fn dml_blocking(
    conn: &SqliteConnection,
    query: &str,
    params: Params,
) -> Result<RunResult, StoreError> {
    let sql_owned = query.to_owned();
    run_blocking(conn.conn_handle(), move |guard| {
        let changes = {
            let mut stmt = guard.prepare_cached(&sql_owned).map_err(classify)?;
            stmt.execute(&params.as_refs()[..]).map_err(classify)?
        };
        Ok(RunResult {
            changes,
            last_insert_id: guard.last_insert_rowid(),
        })
    })
    .await
}
