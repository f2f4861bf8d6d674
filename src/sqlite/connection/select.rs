use crate::error::{StoreError, classify};
use crate::results::ResultSet;
use crate::sqlite::params::Params;
use crate::sqlite::query::build_result_set;

use super::{SqliteConnection, run_blocking};

impl SqliteConnection {
    /// Execute a SELECT and materialize into a `ResultSet`.
    ///
    /// # Errors
    /// Returns `StoreError` if a transaction is active or preparing/executing the query fails.
    pub async fn execute_select(&self, query: &str, params: Params) -> Result<ResultSet, StoreError> {
        self.ensure_not_in_tx("execute select")?;
        select_blocking(self, query, params).await
    }

    /// Execute a query inside the open transaction and build a `ResultSet`.
    ///
    /// `INSERT/UPDATE ... RETURNING` statements go through here as well.
    ///
    /// # Errors
    /// Returns `StoreError::NoActiveTransaction` if no transaction is active, or any
    /// preparation/execution failure.
    pub async fn execute_select_in_tx(
        &self,
        query: &str,
        params: Params,
    ) -> Result<ResultSet, StoreError> {
        self.ensure_in_tx()?;
        select_blocking(self, query, params).await
    }
}

async fn select_blocking(
    conn: &SqliteConnection,
    query: &str,
    params: Params,
) -> Result<ResultSet, StoreError> {
    let sql_owned = query.to_owned();
    run_blocking(conn.conn_handle(), move |guard| {
        let mut stmt = guard.prepare_cached(&sql_owned).map_err(classify)?;
        build_result_set(&mut stmt, params.as_values())
    })
    .await
}
