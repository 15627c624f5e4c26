//! The distributed mutual-exclusion lock.

use crate::config::StorageOptions;
use crate::errors::{Error, Result};
use crate::util;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

/// Cap on the sleep between acquisition attempts.
const MAX_ATTEMPT_DELAY: Duration = Duration::from_secs(1);

/// A held cross-process lock over a named resource, backed by a unique-key
/// row in the `lock` table.
///
/// This is a pure row-presence mutex: there is no owner token and no expiry.
/// A holder that crashes without releasing leaves the resource locked until
/// the row is removed manually. Acquisition order under contention is not
/// fair, only exclusive.
pub struct DistributedLock {
    pool: PgPool,
    options: Arc<StorageOptions>,
    resource: String,
    released: bool,
}

impl DistributedLock {
    /// Block until the lock on `resource` is acquired, the `timeout` budget
    /// is exhausted, or the token is cancelled.
    ///
    /// Each attempt is a conditional insert; a no-op insert (the row already
    /// exists) or a failed attempt is followed by a sleep of at most one
    /// second, never exceeding the remaining budget.
    pub async fn acquire(
        pool: PgPool,
        options: Arc<StorageOptions>,
        resource: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        if resource.is_empty() {
            return Err(Error::InvalidArgument("resource name must not be empty"));
        }

        let sql = format!(
            "INSERT INTO {} (resource) VALUES ($1) ON CONFLICT DO NOTHING",
            options.table("lock")
        );
        let started = Instant::now();

        loop {
            match sqlx::query(&sql).bind(resource).execute(&pool).await {
                Ok(result) if result.rows_affected() > 0 => {
                    return Ok(Self {
                        pool,
                        options,
                        resource: resource.to_owned(),
                        released: false,
                    });
                }
                Ok(_) => {
                    trace!(resource, "Lock is held elsewhere, retrying…");
                }
                Err(error) => {
                    trace!(resource, %error, "Lock acquisition attempt failed, retrying…");
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(Error::LockTimeout {
                    resource: resource.to_owned(),
                });
            }

            let delay = MAX_ATTEMPT_DELAY.min(timeout - elapsed);
            util::sleep_or_cancel(delay, cancel).await?;
        }
    }

    /// The locked resource name.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Release the lock by deleting its row.
    ///
    /// If no row was deleted the lock was already gone, which indicates a
    /// programming error or external tampering; this is surfaced as
    /// [`Error::LockInconsistency`], never swallowed.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;

        let result = sqlx::query(&release_sql(&self.options))
            .bind(&self.resource)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::LockInconsistency {
                resource: self.resource.clone(),
            });
        }

        Ok(())
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("resource", &self.resource)
            .finish()
    }
}

fn release_sql(options: &StorageOptions) -> String {
    format!(
        "DELETE FROM {} WHERE resource = $1",
        options.table("lock")
    )
}

impl Drop for DistributedLock {
    /// Best-effort release for handles dropped without calling
    /// [`release`](Self::release). Errors cannot propagate from here, so an
    /// inconsistency is logged instead; prefer the explicit call.
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let sql = release_sql(&self.options);
        let pool = self.pool.clone();
        let resource = self.resource.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match sqlx::query(&sql).bind(&resource).execute(&pool).await {
                        Ok(result) if result.rows_affected() == 0 => {
                            error!(resource, "Lock row was already gone on release");
                        }
                        Ok(_) => {}
                        Err(error) => {
                            warn!(resource, %error, "Failed to release a dropped lock");
                        }
                    }
                });
            }
            Err(_) => {
                error!(
                    resource,
                    "Lock dropped outside a runtime; the resource stays locked until manual cleanup"
                );
            }
        }
    }
}
