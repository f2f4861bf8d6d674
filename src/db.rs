use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::error::StoreError;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::pool::ConnectionPool;
use crate::results::{DbRow, RunResult};
use crate::retry::RetryPolicy;
use crate::sqlite::{Params, QueryOptions, SqliteConnection, StoreOptions};
use crate::timeout::with_timeout;
use crate::transaction::{Transaction, TxHandle, run_in_transaction};
use crate::types::RowValues;

/// Entry point for repositories: options, a shared pool, a shared metrics registry and
/// the retry policy.
///
/// Cloning is cheap and clones share the pool. Several managers (for example a
/// read-only one and a writer) can share one pool via [`Database::with_shared`].
///
/// ```rust,no_run
/// use storefront_db::prelude::*;
///
/// # async fn demo() -> Result<(), StoreError> {
/// let db = Database::open(StoreOptions::new("shop.db")).await?;
/// db.execute_batch("CREATE TABLE IF NOT EXISTS brand (id INTEGER PRIMARY KEY, name TEXT)").await?;
/// let id = db
///     .transaction(|tx| async move {
///         let res = tx.run("INSERT INTO brand (name) VALUES (?1)", &["acme".into()]).await?;
///         Ok(res.last_insert_id)
///     })
///     .await?;
/// let row = db.get("SELECT name FROM brand WHERE id = ?1", &[id.into()]).await?;
/// # let _ = row;
/// # Ok(()) }
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    options: Arc<StoreOptions>,
    pool: Arc<ConnectionPool>,
    metrics: Arc<MetricsRegistry>,
    retry: RetryPolicy,
}

impl Database {
    /// Build a manager with its own pool and metrics registry, and check that the
    /// store opens.
    ///
    /// # Errors
    /// Returns `StoreError::ConfigError` for invalid options or
    /// `StoreError::ConnectionFailed` if the first connection cannot be opened.
    pub async fn open(options: StoreOptions) -> Result<Self, StoreError> {
        let metrics = Arc::new(MetricsRegistry::new());
        let pool = Arc::new(ConnectionPool::from_options(&options, Arc::clone(&metrics)));
        let db = Self::with_shared(options, pool, metrics)?;
        db.connection().await?;
        info!(url = %db.options.url, read_only = db.options.read_only, "store opened");
        Ok(db)
    }

    /// Build a manager over an existing pool and registry. Nothing is opened yet.
    ///
    /// # Errors
    /// Returns `StoreError::ConfigError` for invalid options.
    pub fn with_shared(
        options: StoreOptions,
        pool: Arc<ConnectionPool>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, StoreError> {
        options.validate()?;
        let retry = RetryPolicy::new(options.max_retries);
        Ok(Self {
            options: Arc::new(options),
            pool,
            metrics,
            retry,
        })
    }

    /// Replace the retry policy (for example to shorten backoff in tests).
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// The pooled connection this manager runs non-transactional statements on.
    ///
    /// # Errors
    /// Returns `StoreError` if a connection cannot be acquired.
    pub async fn connection(&self) -> Result<Arc<SqliteConnection>, StoreError> {
        self.pool
            .acquire(&self.options.connection_name, &self.options)
            .await
    }

    /// # Errors
    /// Returns `StoreError` once the retry policy gives up.
    pub async fn run(&self, sql: &str, params: &[RowValues]) -> Result<RunResult, StoreError> {
        self.run_with_options(sql, params, QueryOptions::default()).await
    }

    /// # Errors
    /// Returns `StoreError` once the retry policy gives up.
    pub async fn run_with_options(
        &self,
        sql: &str,
        params: &[RowValues],
        opts: QueryOptions,
    ) -> Result<RunResult, StoreError> {
        let sql = sql.to_owned();
        let params = Params::convert(params);
        self.execute(opts, move |conn| {
            let sql = sql.clone();
            let params = params.clone();
            async move { conn.execute_dml(&sql, params).await }
        })
        .await
    }

    /// First row of the query, if any.
    ///
    /// # Errors
    /// Returns `StoreError` once the retry policy gives up.
    pub async fn get(&self, sql: &str, params: &[RowValues]) -> Result<Option<DbRow>, StoreError> {
        self.get_with_options(sql, params, QueryOptions::default()).await
    }

    /// # Errors
    /// Returns `StoreError` once the retry policy gives up.
    pub async fn get_with_options(
        &self,
        sql: &str,
        params: &[RowValues],
        opts: QueryOptions,
    ) -> Result<Option<DbRow>, StoreError> {
        Ok(self
            .all_with_options(sql, params, opts)
            .await?
            .into_iter()
            .next())
    }

    /// # Errors
    /// Returns `StoreError` once the retry policy gives up.
    pub async fn all(&self, sql: &str, params: &[RowValues]) -> Result<Vec<DbRow>, StoreError> {
        self.all_with_options(sql, params, QueryOptions::default()).await
    }

    /// # Errors
    /// Returns `StoreError` once the retry policy gives up.
    pub async fn all_with_options(
        &self,
        sql: &str,
        params: &[RowValues],
        opts: QueryOptions,
    ) -> Result<Vec<DbRow>, StoreError> {
        let sql = sql.to_owned();
        let params = Params::convert(params);
        let rs = self
            .execute(opts, move |conn| {
                let sql = sql.clone();
                let params = params.clone();
                async move { conn.execute_select(&sql, params).await }
            })
            .await?;
        Ok(rs.into_rows())
    }

    /// Run a multi-statement script (schema setup, migrations) in one implicit
    /// transaction. Not retried.
    ///
    /// # Errors
    /// Returns `StoreError` if any statement fails or the timeout passes.
    pub async fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        let started = Instant::now();
        let result = async {
            let conn = self.connection().await?;
            with_timeout(conn.execute_batch(sql), self.options.timeout()).await
        }
        .await;
        self.metrics.record_query(started.elapsed(), result.is_ok());
        result
    }

    /// Begin a transaction on a dedicated connection. Commit or roll back through the
    /// returned handle; either closes the connection.
    ///
    /// # Errors
    /// See [`Transaction::begin`].
    pub async fn begin_transaction(&self) -> Result<Transaction, StoreError> {
        Transaction::begin(Arc::clone(&self.pool), &self.options).await
    }

    /// Scoped transaction: commit on `Ok`, roll back on `Err`.
    ///
    /// The callback must issue its statements through the [`TxHandle`] it receives;
    /// statements sent through `self` run on other connections and would wait on the
    /// transaction's write lock.
    ///
    /// # Errors
    /// See [`run_in_transaction`].
    pub async fn transaction<F, Fut, T>(&self, callback: F) -> Result<T, StoreError>
    where
        F: FnOnce(TxHandle) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        run_in_transaction(&self.pool, &self.options, callback).await
    }

    /// Close this manager's pooled connections.
    ///
    /// # Errors
    /// Returns `StoreError::ConnectionCloseFailed` if a handle refuses to close.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.pool.close_named(&self.options.connection_name).await
    }

    /// Close every connection in the shared pool. Failures are logged only.
    pub async fn close_all(&self) -> usize {
        self.pool.close_all().await
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.pool.size())
    }

    #[must_use]
    pub fn metrics_registry(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// acquire -> timeout guard -> retry policy -> metrics
    async fn execute<T, F, Fut>(&self, opts: QueryOptions, op: F) -> Result<T, StoreError>
    where
        F: Fn(Arc<SqliteConnection>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let timeout = opts.timeout.unwrap_or_else(|| self.options.timeout());
        let policy = match opts.max_retries {
            Some(n) => self.retry.with_max_retries(n),
            None => self.retry,
        };
        let op = &op;
        let started = Instant::now();
        let result = policy
            .run(false, move || async move {
                let conn = self.connection().await?;
                with_timeout(op(conn), timeout).await
            })
            .await;
        self.metrics.record_query(started.elapsed(), result.is_ok());
        result
    }
}
