use crate::errors::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep for up to `duration`, unblocking promptly if the token is cancelled.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Whether a database error is a concurrency conflict that is expected to
/// clear on retry (serialization failure or deadlock).
pub(crate) fn is_serialization_failure(error: &sqlx::Error) -> bool {
    matches!(
        error.as_database_error().and_then(|e| e.code()).as_deref(),
        Some("40001" | "40P01")
    )
}

/// Bounded retry for transient store conflicts.
///
/// The classification predicate is a parameter so the policy stays decoupled
/// from any particular store's error codes. Non-transient errors are returned
/// immediately; a transient error on the final attempt is returned as-is.
pub(crate) struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    pub(crate) fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    pub(crate) async fn run<T, F, Fut>(
        &self,
        is_transient: fn(&sqlx::Error) -> bool,
        mut attempt: F,
    ) -> sqlx::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = sqlx::Result<T>>,
    {
        let mut attempts = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(error) if is_transient(&error) && attempts + 1 < self.max_attempts => {
                    attempts += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
