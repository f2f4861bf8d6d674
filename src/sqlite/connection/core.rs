use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::sqlite::config::StoreOptions;

/// Physical handle shared between the owning connection and blocking tasks.
/// `None` once the handle has been closed.
pub type SharedSqliteConnection = Arc<Mutex<Option<rusqlite::Connection>>>;

/// One logical connection to the store.
///
/// Statements run on tokio's blocking pool; the inner mutex serializes them, so a
/// connection can be shared by several tasks outside a transaction. While
/// `in_transaction` is set only the transaction-bound entry points are accepted.
pub struct SqliteConnection {
    id: String,
    handle: SharedSqliteConnection,
    pub(crate) in_transaction: AtomicBool,
    created_at: DateTime<Utc>,
    read_only: bool,
    closed: AtomicBool,
    force_rollback_busy: AtomicBool,
}

impl SqliteConnection {
    /// Open a new physical connection and apply the store pragmas.
    ///
    /// # Errors
    /// Returns `StoreError::ConnectionFailed` if the file cannot be opened or a pragma fails.
    pub async fn open(id: impl Into<String>, options: &StoreOptions) -> Result<Self, StoreError> {
        let id = id.into();
        let path = options.database_path().to_owned();
        let flags = options.open_flags();
        let busy_timeout = options.busy_timeout();
        let read_only = options.read_only;

        let conn = tokio::task::spawn_blocking(move || -> Result<rusqlite::Connection, StoreError> {
            let conn = rusqlite::Connection::open_with_flags(&path, flags).map_err(|e| {
                StoreError::ConnectionFailed(format!("failed to open {path}: {e}"))
            })?;
            apply_pragmas(&conn, busy_timeout, read_only)
                .map_err(|e| StoreError::ConnectionFailed(format!("failed to configure {path}: {e}")))?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::ConnectionFailed(format!("sqlite open join error: {e}")))??;

        debug!(conn_id = %id, read_only, "opened sqlite connection");
        Ok(Self {
            id,
            handle: Arc::new(Mutex::new(Some(conn))),
            in_transaction: AtomicBool::new(false),
            created_at: Utc::now(),
            read_only,
            closed: AtomicBool::new(false),
            force_rollback_busy: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the physical handle. Waits for any statement already running on it.
    /// Closing an already-closed connection is a no-op.
    ///
    /// # Errors
    /// Returns `StoreError::ConnectionCloseFailed` if SQLite refuses to close the handle.
    pub async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let handle = Arc::clone(&self.handle);
        let id = self.id.clone();
        tokio::task::spawn_blocking(move || {
            let taken = handle.blocking_lock().take();
            match taken {
                Some(conn) => conn.close().map_err(|(_conn, e)| StoreError::ConnectionCloseFailed {
                    id,
                    message: e.to_string(),
                }),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| StoreError::ConnectionCloseFailed {
            id: self.id.clone(),
            message: format!("join error: {e}"),
        })??;
        debug!(conn_id = %self.id, "closed sqlite connection");
        Ok(())
    }

    /// Force the flag back to idle after a commit or rollback whose future was abandoned.
    pub(crate) fn clear_transaction_flag(&self) {
        self.in_transaction.store(false, Ordering::SeqCst);
    }

    pub(crate) fn conn_handle(&self) -> SharedSqliteConnection {
        Arc::clone(&self.handle)
    }

    pub(crate) fn ensure_not_in_tx(&self, ctx: &str) -> Result<(), StoreError> {
        if self.in_transaction() {
            Err(StoreError::ExecutionError(format!(
                "SQLite transaction in progress on {}; operation not permitted ({ctx})",
                self.id
            )))
        } else {
            Ok(())
        }
    }

    pub(crate) fn ensure_in_tx(&self) -> Result<(), StoreError> {
        if self.in_transaction() {
            Ok(())
        } else {
            Err(StoreError::NoActiveTransaction(self.id.clone()))
        }
    }

    /// Make the next rollbacks on this connection fail as if SQLite stayed busy.
    #[doc(hidden)]
    pub fn set_force_rollback_busy_for_tests(&self, force: bool) {
        self.force_rollback_busy.store(force, Ordering::SeqCst);
    }

    pub(crate) fn force_rollback_busy_for_tests(&self) -> bool {
        self.force_rollback_busy.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("id", &self.id)
            .field("in_transaction", &self.in_transaction())
            .field("read_only", &self.read_only)
            .field("created_at", &self.created_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn apply_pragmas(
    conn: &rusqlite::Connection,
    busy_timeout: std::time::Duration,
    read_only: bool,
) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    if !read_only {
        // journal_mode answers with the mode actually applied ("memory" for in-memory stores)
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "applied journal mode");
    }
    Ok(())
}

pub(crate) async fn run_blocking<F, R>(conn: SharedSqliteConnection, func: F) -> Result<R, StoreError>
where
    F: FnOnce(&mut rusqlite::Connection) -> Result<R, StoreError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.blocking_lock();
        match guard.as_mut() {
            Some(conn) => func(conn),
            None => Err(StoreError::ConnectionFailed("connection is closed".into())),
        }
    })
    .await
    .map_err(|e| StoreError::ExecutionError(format!("sqlite spawn_blocking join error: {e}")))?
}
