mod handle;

pub use handle::TxHandle;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::metrics::MetricsRegistry;
use crate::pool::ConnectionPool;
use crate::sqlite::{SqliteConnection, StoreOptions};
use crate::timeout::with_timeout;

/// Pool name under which transaction connections are registered.
pub const TRANSACTION_CONNECTION_NAME: &str = "tx";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

/// One begin/commit/rollback cycle on a dedicated connection.
///
/// Finishing the transaction (either way) closes the connection and removes it from
/// the pool. Dropping an active transaction spawns a best-effort rollback and close on
/// the current tokio runtime.
#[derive(Debug)]
pub struct Transaction {
    id: Arc<str>,
    conn: Arc<SqliteConnection>,
    pool: Arc<ConnectionPool>,
    metrics: Arc<MetricsRegistry>,
    timeout: Duration,
    state: TxState,
    released: bool,
}

impl Transaction {
    /// Open a dedicated connection, begin on it, then register it with the pool.
    ///
    /// # Errors
    /// Returns `StoreError::ConnectionFailed` if the connection cannot be opened,
    /// `StoreError::TransactionStartFailed` (or `QueryTimeout`) if `BEGIN` fails, or
    /// `StoreError::ConnectionPoolExhausted` if the pool has no room left.
    pub async fn begin(pool: Arc<ConnectionPool>, options: &StoreOptions) -> Result<Self, StoreError> {
        let metrics = Arc::clone(pool.metrics());
        let timeout = options.timeout();
        let conn = pool.open_dedicated(options).await?;

        if let Err(err) = with_timeout(conn.begin(), timeout).await {
            metrics.record_transaction_error();
            conn.clear_transaction_flag();
            if let Err(close_err) = conn.close().await {
                error!(conn_id = %conn.id(), error = %close_err, "failed to close connection after BEGIN failed");
            }
            metrics.record_connection_closed();
            return Err(err);
        }
        metrics.record_transaction();

        // registration closes the connection itself when the pool is exhausted
        if let Err(err) = pool.register(TRANSACTION_CONNECTION_NAME, Arc::clone(&conn)).await {
            metrics.record_transaction_error();
            conn.clear_transaction_flag();
            return Err(err);
        }

        let id: Arc<str> = Arc::from(Uuid::new_v4().to_string());
        debug!(tx_id = %id, conn_id = %conn.id(), "transaction active");
        Ok(Self {
            id,
            conn,
            pool,
            metrics,
            timeout,
            state: TxState::Active,
            released: false,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> TxState {
        self.state
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<SqliteConnection> {
        &self.conn
    }

    /// Statement handle bound to this transaction.
    #[must_use]
    pub fn handle(&self) -> TxHandle {
        TxHandle::new(
            Arc::clone(&self.conn),
            Arc::clone(&self.id),
            self.timeout,
            Arc::clone(&self.metrics),
        )
    }

    /// Commit and release the connection.
    ///
    /// # Errors
    /// Returns `StoreError::NoActiveTransaction` if the transaction already finished, or
    /// `StoreError::CommitFailed` if the commit fails or times out. The connection is
    /// released and the transaction is no longer active in both cases.
    pub async fn commit(&mut self) -> Result<(), StoreError> {
        if self.state != TxState::Active {
            return Err(StoreError::NoActiveTransaction(self.conn.id().to_owned()));
        }
        let result = with_timeout(self.conn.commit(), self.timeout).await;
        self.conn.clear_transaction_flag();
        let result = match result {
            Ok(()) => {
                self.state = TxState::Committed;
                debug!(tx_id = %self.id, "transaction committed");
                Ok(())
            }
            Err(err) => {
                self.state = TxState::RolledBack;
                self.metrics.record_transaction_error();
                error!(tx_id = %self.id, error = %err, "commit failed");
                Err(match err {
                    StoreError::CommitFailed(_) => err,
                    other => StoreError::CommitFailed(other.to_string()),
                })
            }
        };
        self.release().await;
        result
    }

    /// Roll back and release the connection. A no-op (with a warning) once the
    /// transaction has finished.
    ///
    /// # Errors
    /// Returns `StoreError::RollbackFailed` if SQLite could not roll back; the connection
    /// is released and the transaction marked rolled back regardless.
    pub async fn rollback(&mut self) -> Result<(), StoreError> {
        if self.state != TxState::Active {
            warn!(tx_id = %self.id, state = ?self.state, "rollback requested on finished transaction");
            return Ok(());
        }
        let result = with_timeout(self.conn.rollback(), self.timeout).await;
        self.conn.clear_transaction_flag();
        self.state = TxState::RolledBack;
        let result = result.map_err(|err| {
            self.metrics.record_transaction_error();
            error!(
                tx_id = %self.id,
                conn_id = %self.conn.id(),
                severity = "critical",
                error = %err,
                "rollback failed; store may hold partial writes until the connection closes"
            );
            match err {
                StoreError::RollbackFailed(_) => err,
                other => StoreError::RollbackFailed(other.to_string()),
            }
        });
        self.release().await;
        result
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.pool.close(self.conn.id()).await {
            error!(tx_id = %self.id, conn_id = %self.conn.id(), error = %err, "failed to close transaction connection");
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let active = self.state == TxState::Active;
        let conn = Arc::clone(&self.conn);
        let pool = Arc::clone(&self.pool);
        let tx_id = Arc::clone(&self.id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if active {
                    warn!(tx_id = %tx_id, "transaction dropped while active; rolling back");
                    if let Err(err) = conn.rollback().await {
                        error!(tx_id = %tx_id, severity = "critical", error = %err, "rollback on drop failed");
                    }
                }
                if let Err(err) = pool.close(conn.id()).await {
                    error!(tx_id = %tx_id, error = %err, "failed to close dropped transaction connection");
                }
            });
        } else {
            // no runtime: dropping the last handle closes SQLite's side, which rolls back
            warn!(tx_id = %self.id, "transaction dropped outside a tokio runtime");
        }
    }
}

/// Run `callback` inside a transaction on a fresh dedicated connection.
///
/// Commits when the callback succeeds. When it fails the transaction is rolled back
/// and the callback's error is returned wrapped in `StoreError::TransactionFailed`,
/// together with the rollback error if the rollback failed too. The dedicated
/// connection is closed on every path.
///
/// # Errors
/// Returns the begin failure, `StoreError::TransactionFailed` for callback failures, or
/// `StoreError::CommitFailed`.
pub async fn run_in_transaction<F, Fut, T>(
    pool: &Arc<ConnectionPool>,
    options: &StoreOptions,
    callback: F,
) -> Result<T, StoreError>
where
    F: FnOnce(TxHandle) -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut tx = Transaction::begin(Arc::clone(pool), options).await?;
    match callback(tx.handle()).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            warn!(tx_id = %tx.id(), error = %err, "transaction callback failed; rolling back");
            let rollback_error = tx.rollback().await.err();
            // a failed rollback has already counted this transaction
            if rollback_error.is_none() {
                tx.metrics.record_transaction_error();
            }
            Err(StoreError::transaction_failed(err, rollback_error))
        }
    }
}
