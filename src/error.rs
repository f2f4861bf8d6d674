use thiserror::Error;

use rusqlite::ffi;

/// Field-less discriminant of [`StoreError`].
///
/// Repositories match on this to translate core failures into their own domain errors
/// without caring about the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionFailed,
    ConnectionCloseFailed,
    QueryTimeout,
    TransactionStartFailed,
    AlreadyInTransaction,
    NoActiveTransaction,
    CommitFailed,
    RollbackFailed,
    TransactionFailed,
    ConstraintViolation,
    SyntaxError,
    RecordNotFound,
    ConnectionPoolExhausted,
    Sqlite,
    Config,
    Parameter,
    Execution,
    Other,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection error: {0}")]
    ConnectionFailed(String),

    #[error("Failed to close connection {id}: {message}")]
    ConnectionCloseFailed { id: String, message: String },

    #[error("Query timed out after {timeout_ms}ms")]
    QueryTimeout { timeout_ms: u64 },

    #[error("Failed to start transaction: {0}")]
    TransactionStartFailed(String),

    #[error("Connection {0} already has an active transaction")]
    AlreadyInTransaction(String),

    #[error("No active transaction on connection {0}")]
    NoActiveTransaction(String),

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    /// A scoped transaction failed. `source` is the error that triggered the rollback;
    /// `rollback_error` is set when the rollback itself also failed.
    #[error("Transaction failed: {source}")]
    TransactionFailed {
        #[source]
        source: Box<StoreError>,
        rollback_error: Option<Box<StoreError>>,
    },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("SQL syntax error: {0}")]
    SyntaxError(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Connection pool exhausted: {0}")]
    ConnectionPoolExhausted(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Parameter conversion error: {0}")]
    ParameterError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),

    #[error("Other database error: {0}")]
    Other(String),
}

impl StoreError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Sqlite(_) => ErrorKind::Sqlite,
            StoreError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            StoreError::ConnectionCloseFailed { .. } => ErrorKind::ConnectionCloseFailed,
            StoreError::QueryTimeout { .. } => ErrorKind::QueryTimeout,
            StoreError::TransactionStartFailed(_) => ErrorKind::TransactionStartFailed,
            StoreError::AlreadyInTransaction(_) => ErrorKind::AlreadyInTransaction,
            StoreError::NoActiveTransaction(_) => ErrorKind::NoActiveTransaction,
            StoreError::CommitFailed(_) => ErrorKind::CommitFailed,
            StoreError::RollbackFailed(_) => ErrorKind::RollbackFailed,
            StoreError::TransactionFailed { .. } => ErrorKind::TransactionFailed,
            StoreError::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            StoreError::SyntaxError(_) => ErrorKind::SyntaxError,
            StoreError::RecordNotFound(_) => ErrorKind::RecordNotFound,
            StoreError::ConnectionPoolExhausted(_) => ErrorKind::ConnectionPoolExhausted,
            StoreError::ConfigError(_) => ErrorKind::Config,
            StoreError::ParameterError(_) => ErrorKind::Parameter,
            StoreError::ExecutionError(_) => ErrorKind::Execution,
            StoreError::Other(_) => ErrorKind::Other,
        }
    }

    /// Kind of the innermost error, looking through `TransactionFailed` wrappers.
    #[must_use]
    pub fn root_kind(&self) -> ErrorKind {
        match self {
            StoreError::TransactionFailed { source, .. } => source.root_kind(),
            other => other.kind(),
        }
    }

    /// Failures that a retry cannot fix. Timeouts count as terminal too.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConstraintViolation | ErrorKind::SyntaxError | ErrorKind::QueryTimeout
        )
    }

    /// The rollback failure recorded alongside a failed scoped transaction, if any.
    #[must_use]
    pub fn rollback_error(&self) -> Option<&StoreError> {
        match self {
            StoreError::TransactionFailed { rollback_error, .. } => rollback_error.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn transaction_failed(source: StoreError, rollback_error: Option<StoreError>) -> Self {
        StoreError::TransactionFailed {
            source: Box::new(source),
            rollback_error: rollback_error.map(Box::new),
        }
    }

    pub fn other(err: impl std::fmt::Display) -> Self {
        StoreError::Other(err.to_string())
    }
}

/// True when SQLite reported `SQLITE_BUSY` or `SQLITE_LOCKED`.
#[must_use]
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

/// Sort a raw driver error into the taxonomy: constraint failures and statements the
/// engine refuses to compile become permanent kinds, everything else stays `Sqlite`.
#[must_use]
pub fn classify(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(
        ffi::Error {
            code: ffi::ErrorCode::ConstraintViolation,
            ..
        },
        msg,
    ) = &err
    {
        return StoreError::ConstraintViolation(msg.clone().unwrap_or_else(|| err.to_string()));
    }
    let text = err.to_string();
    if is_compile_error(&text) {
        return StoreError::SyntaxError(text);
    }
    StoreError::Sqlite(err)
}

fn is_compile_error(msg: &str) -> bool {
    msg.contains("syntax error")
        || msg.contains("no such table")
        || msg.contains("no such column")
        || msg.contains("incomplete input")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(code: ffi::ErrorCode, extended: i32, msg: &str) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code,
                extended_code: extended,
            },
            Some(msg.to_string()),
        )
    }

    #[test]
    fn constraint_failures_are_permanent() {
        let err = classify(failure(
            ffi::ErrorCode::ConstraintViolation,
            2067,
            "UNIQUE constraint failed: customer.email",
        ));
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert!(err.is_permanent());
    }

    #[test]
    fn parse_failures_become_syntax_errors() {
        let err = classify(failure(ffi::ErrorCode::Unknown, 1, "near \"SELEC\": syntax error"));
        assert_eq!(err.kind(), ErrorKind::SyntaxError);
    }

    #[test]
    fn busy_stays_retryable() {
        let raw = failure(ffi::ErrorCode::DatabaseBusy, 5, "database is locked");
        assert!(is_busy(&raw));
        let err = classify(raw);
        assert_eq!(err.kind(), ErrorKind::Sqlite);
        assert!(!err.is_permanent());
    }

    #[test]
    fn root_kind_looks_through_transaction_wrapper() {
        let err = StoreError::transaction_failed(StoreError::RecordNotFound("customer".into()), None);
        assert_eq!(err.kind(), ErrorKind::TransactionFailed);
        assert_eq!(err.root_kind(), ErrorKind::RecordNotFound);
        assert!(err.rollback_error().is_none());
    }
}
