//! The time-based garbage collector.

use crate::config::StorageOptions;
use crate::errors::{Error, Result};
use crate::util;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Tables swept for expired rows, in order.
const SWEPT_TABLES: &[&str] = &["counter", "job", "list", "set", "hash"];

/// Maximum rows removed per batch.
const RECORDS_PER_PASS: i64 = 1000;

/// Pause between non-empty batches.
const DELAY_BETWEEN_PASSES: Duration = Duration::from_secs(1);

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// A recurring pass that deletes rows whose `expireat` is in the past, in
/// bounded batches, across all swept tables.
///
/// The sweeper does not schedule itself; an external periodic-task runner
/// invokes [`execute`](Self::execute) repeatedly. Rows with no expiration
/// timestamp are never removed.
pub struct ExpirationSweeper {
    pool: PgPool,
    options: Arc<StorageOptions>,
    check_interval: Duration,
}

impl ExpirationSweeper {
    /// Create a sweeper with a one hour check interval.
    pub fn new(pool: PgPool, options: Arc<StorageOptions>) -> Self {
        Self::with_check_interval(pool, options, DEFAULT_CHECK_INTERVAL)
    }

    /// Create a sweeper that sleeps for `check_interval` at the end of each
    /// [`execute`](Self::execute) call.
    pub fn with_check_interval(
        pool: PgPool,
        options: Arc<StorageOptions>,
        check_interval: Duration,
    ) -> Self {
        Self {
            pool,
            options,
            check_interval,
        }
    }

    /// Run one full sweep over all tables, then sleep for the check interval.
    ///
    /// Each batch commits separately, with a short pause after every
    /// non-empty batch; a table is done once a batch removes zero rows.
    /// Cancellation is honored between batches and between tables and
    /// surfaces as [`Error::Cancelled`].
    pub async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
        for table in SWEPT_TABLES {
            debug!("Removing outdated records from table `{table}`…");

            loop {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let removed = self.sweep_batch(table).await?;
                if removed == 0 {
                    break;
                }

                info!("Removed {removed} outdated record(s) from the `{table}` table.");
                util::sleep_or_cancel(DELAY_BETWEEN_PASSES, cancel).await?;
            }
        }

        util::sleep_or_cancel(self.check_interval, cancel).await
    }

    /// Delete up to one batch of expired rows from `table`, as a single
    /// self-committing statement.
    async fn sweep_batch(&self, table: &str) -> Result<u64> {
        let table = self.options.table(table);
        let result = sqlx::query(&format!(
            "DELETE FROM {table}
             WHERE ctid IN (
                 SELECT ctid FROM {table}
                 WHERE expireat < $1
                 LIMIT {RECORDS_PER_PASS}
             )"
        ))
        .bind(self.options.now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

impl std::fmt::Debug for ExpirationSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationSweeper")
            .field("check_interval", &self.check_interval)
            .finish()
    }
}
