use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;

/// Race `operation` against a deadline.
///
/// On expiry the caller gets `StoreError::QueryTimeout` carrying the configured
/// duration. The statement itself is not cancelled: SQLite work already handed to a
/// blocking thread runs to completion and its result is dropped.
///
/// # Errors
/// Returns `StoreError::QueryTimeout` if the deadline passes first, otherwise whatever
/// `operation` returns.
pub async fn with_timeout<F, T>(operation: F, timeout: Duration) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_elapsed) => Err(StoreError::QueryTimeout {
            timeout_ms: duration_ms(timeout),
        }),
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
