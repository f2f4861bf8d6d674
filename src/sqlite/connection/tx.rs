use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{StoreError, is_busy};

use super::{SqliteConnection, run_blocking};

const ROLLBACK_BUSY_RETRIES: &[Duration] = &[
    Duration::from_millis(10),
    Duration::from_millis(25),
    Duration::from_millis(50),
];

/// Issue `ROLLBACK`, retrying briefly while SQLite reports the database busy.
/// Runs on a blocking thread.
fn rollback_with_busy_retries(guard: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
    // the engine may already have rolled back on its own (e.g. after SQLITE_FULL)
    if guard.is_autocommit() {
        return Ok(());
    }
    let mut last = None;
    for delay in ROLLBACK_BUSY_RETRIES.iter().copied() {
        match guard.execute_batch("ROLLBACK") {
            Ok(()) => return Ok(()),
            Err(err) if is_busy(&err) => {
                thread::sleep(delay);
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    match last {
        Some(err) => Err(err),
        None => guard.execute_batch("ROLLBACK"),
    }
}

fn forced_busy() -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error {
            code: rusqlite::ErrorCode::DatabaseBusy,
            extended_code: rusqlite::ffi::SQLITE_BUSY,
        },
        Some("database is locked".into()),
    )
}

impl SqliteConnection {
    /// Begin a transaction, transitioning this connection into transactional mode.
    ///
    /// Writable connections take the write lock up front (`BEGIN IMMEDIATE`) so a
    /// transaction never has to upgrade a stale read snapshot later.
    ///
    /// # Errors
    /// Returns `StoreError::AlreadyInTransaction` if a transaction is already active, or
    /// `StoreError::TransactionStartFailed` if SQLite refuses to begin.
    pub async fn begin(&self) -> Result<(), StoreError> {
        if self
            .in_transaction
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StoreError::AlreadyInTransaction(self.id().to_owned()));
        }
        let sql = if self.is_read_only() {
            "BEGIN"
        } else {
            "BEGIN IMMEDIATE"
        };
        let result = run_blocking(self.conn_handle(), move |guard| {
            guard
                .execute_batch(sql)
                .map_err(|e| StoreError::TransactionStartFailed(e.to_string()))
        })
        .await;
        if let Err(err) = result {
            self.in_transaction.store(false, Ordering::SeqCst);
            return Err(match err {
                StoreError::TransactionStartFailed(_) => err,
                other => StoreError::TransactionStartFailed(other.to_string()),
            });
        }
        debug!(conn_id = %self.id(), "transaction started");
        Ok(())
    }

    /// Commit the open transaction.
    ///
    /// The in-transaction flag is cleared whether or not the commit succeeds; on failure
    /// a best-effort `ROLLBACK` puts the engine back in autocommit mode so the flag and
    /// the engine agree.
    ///
    /// # Errors
    /// Returns `StoreError::NoActiveTransaction` if no transaction is active, or
    /// `StoreError::CommitFailed` if SQLite rejects the commit.
    pub async fn commit(&self) -> Result<(), StoreError> {
        self.ensure_in_tx()?;
        let conn_id = self.id().to_owned();
        let result = run_blocking(self.conn_handle(), move |guard| {
            match guard.execute_batch("COMMIT") {
                Ok(()) => Ok(()),
                Err(err) => {
                    if let Err(rb) = rollback_with_busy_retries(guard) {
                        warn!(conn_id = %conn_id, error = %rb, "rollback after failed commit also failed");
                    }
                    Err(StoreError::CommitFailed(err.to_string()))
                }
            }
        })
        .await;
        self.in_transaction.store(false, Ordering::SeqCst);
        result.map_err(|err| match err {
            StoreError::CommitFailed(_) => err,
            other => StoreError::CommitFailed(other.to_string()),
        })
    }

    /// Roll back the open transaction.
    ///
    /// Without an active transaction this logs a warning and succeeds, so cleanup paths
    /// can call it unconditionally. The in-transaction flag is always cleared.
    ///
    /// # Errors
    /// Returns `StoreError::RollbackFailed` if SQLite could not roll back.
    pub async fn rollback(&self) -> Result<(), StoreError> {
        if !self.in_transaction() {
            warn!(conn_id = %self.id(), "rollback requested without an active transaction");
            return Ok(());
        }
        let forced = self.force_rollback_busy_for_tests();
        let result = run_blocking(self.conn_handle(), move |guard| {
            if forced {
                return Err(StoreError::RollbackFailed(forced_busy().to_string()));
            }
            rollback_with_busy_retries(guard).map_err(|e| StoreError::RollbackFailed(e.to_string()))
        })
        .await;
        self.in_transaction.store(false, Ordering::SeqCst);
        result.map_err(|err| match err {
            StoreError::RollbackFailed(_) => err,
            other => StoreError::RollbackFailed(other.to_string()),
        })
    }
}
