use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::StoreError;
use crate::sqlite::config::DEFAULT_MAX_RETRIES;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Bounded exponential-backoff retry for non-transactional statements.
///
/// The operation runs at most `max_retries` times (at least once). Before attempt
/// `n + 1` the policy sleeps `base_delay * 2^n`: 200ms, 400ms, 800ms with the default
/// base. Nothing is retried inside a transaction, and permanent failures
/// (constraint, syntax, timeout) are returned on first sight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Sleep taken after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Run `op` under this policy. The last error is returned unchanged once attempts
    /// run out.
    ///
    /// # Errors
    /// Returns the first permanent error, the first error when `in_transaction`, or the
    /// last error after the final attempt.
    pub async fn run<F, Fut, T>(&self, in_transaction: bool, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.max_retries.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if in_transaction || err.is_permanent() || attempt >= attempts => {
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        max_retries = attempts,
                        delay_ms = crate::timeout::duration_ms(delay),
                        error = %err,
                        "statement failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Convenience wrapper over [`RetryPolicy::run`] for callers outside a transaction.
///
/// # Errors
/// See [`RetryPolicy::run`].
pub async fn with_retry<F, Fut, T>(op: F, max_retries: u32) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    RetryPolicy::new(max_retries).run(false, op).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use tokio::time::Instant;

    use super::*;
    use crate::error::ErrorKind;

    fn busy() -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy,
                extended_code: rusqlite::ffi::SQLITE_BUSY,
            },
            Some("database is locked".into()),
        ))
    }

    /// Operation that fails `failures` times before succeeding; records when each attempt ran.
    fn flaky(failures: usize, calls: Arc<Mutex<Vec<Instant>>>) -> impl FnMut() -> std::future::Ready<Result<&'static str, StoreError>> {
        move || {
            let mut calls = calls.lock().unwrap();
            calls.push(Instant::now());
            if calls.len() <= failures {
                std::future::ready(Err(busy()))
            } else {
                std::future::ready(Ok("done"))
            }
        }
    }

    #[test]
    fn backoff_doubles_from_200ms() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(64) >= policy.delay_for(31));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures_with_growing_delays() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let result = RetryPolicy::new(4).run(false, flaky(2, Arc::clone(&calls))).await;
        assert_eq!(result.unwrap(), "done");

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let first_gap = calls[1] - calls[0];
        let second_gap = calls[2] - calls[1];
        assert!(first_gap >= Duration::from_millis(200));
        assert!(second_gap >= Duration::from_millis(400));
        assert!(second_gap > first_gap);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error_unchanged() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let err = with_retry(flaky(3, Arc::clone(&calls)), 3).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Sqlite);
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_retried_inside_a_transaction() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let err = RetryPolicy::new(5)
            .run(true, flaky(10, Arc::clone(&calls)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Sqlite);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_short_circuit() {
        let mut attempts = 0;
        let err = RetryPolicy::new(5)
            .run(false, || {
                attempts += 1;
                std::future::ready(Err::<(), _>(StoreError::ConstraintViolation(
                    "UNIQUE constraint failed: customer.email".into(),
                )))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_still_runs_once() {
        let mut attempts = 0;
        let value = RetryPolicy::new(0)
            .run(false, || {
                attempts += 1;
                std::future::ready(Ok::<_, StoreError>(attempts))
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
    }
}
