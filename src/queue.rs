//! The persistent job queue.
//!
//! Delivery is at-least-once: a claimed entry is only removed on explicit
//! acknowledgement, so a worker that crashes after claiming leaves the entry
//! to become visible again once the invisibility timeout elapses. Duplicate
//! delivery after a crash is an accepted cost, not a correctness gap.

use crate::config::StorageOptions;
use crate::errors::{Error, Result};
use crate::registry::QueueProvider;
use crate::util::{self, RetryPolicy};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// How many times a single claim attempt is retried after a serialization
/// failure before the error is surfaced to the caller.
const CLAIM_ATTEMPTS: u32 = 3;

/// Durable enqueue/dequeue of job identifiers over the `jobqueue` table.
pub struct JobQueue {
    pool: PgPool,
    options: Arc<StorageOptions>,
}

/// The two visibility predicates tried in round-robin by [`JobQueue::dequeue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visibility {
    /// `fetchedat IS NULL`: never claimed, or explicitly requeued.
    Unclaimed,
    /// `fetchedat` older than the invisibility timeout: claimed by a worker
    /// that never acknowledged, eligible for reclaiming.
    Reclaimable,
}

impl Visibility {
    fn next(self) -> Self {
        match self {
            Self::Unclaimed => Self::Reclaimable,
            Self::Reclaimable => Self::Unclaimed,
        }
    }

    /// Whether this is the last predicate of the round; only then does an
    /// empty result warrant a poll-interval sleep.
    fn is_last(self) -> bool {
        self == Self::Reclaimable
    }
}

impl JobQueue {
    /// Create a queue over the given pool.
    pub fn new(pool: PgPool, options: Arc<StorageOptions>) -> Self {
        Self { pool, options }
    }

    /// Insert a queue entry as part of the caller's open transaction.
    ///
    /// This never commits; atomicity is owned by the caller, typically a
    /// [`WriteBatch`](crate::WriteBatch).
    pub async fn enqueue(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        queue: &str,
        job_id: i64,
    ) -> Result<()> {
        if queue.is_empty() {
            return Err(Error::InvalidArgument("queue name must not be empty"));
        }

        sqlx::query(&format!(
            "INSERT INTO {} (jobid, queue) VALUES ($1, $2)",
            self.options.table("jobqueue")
        ))
        .bind(job_id)
        .bind(queue)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Block until an entry from one of `queues` is claimed, or the token is
    /// cancelled.
    ///
    /// Callers never see a "no job" result: the call loops, alternating
    /// between unclaimed and reclaimable entries and sleeping up to the
    /// configured poll interval when a full round came up empty. Competing
    /// dequeuers are serialized by the store; a serialization conflict is
    /// retried a bounded number of times before the error escalates.
    pub async fn dequeue(
        &self,
        queues: &[&str],
        cancel: &CancellationToken,
    ) -> Result<FetchedJob> {
        if queues.is_empty() {
            return Err(Error::InvalidArgument("queue list must not be empty"));
        }

        let queue_names: Vec<String> = queues.iter().map(|q| (*q).to_owned()).collect();
        let retry = RetryPolicy::new(CLAIM_ATTEMPTS);
        let mut visibility = Visibility::Unclaimed;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let claimed = retry
                .run(util::is_serialization_failure, || {
                    self.try_claim(&queue_names, visibility)
                })
                .await?;

            if let Some(entry) = claimed {
                return Ok(FetchedJob {
                    pool: self.pool.clone(),
                    options: self.options.clone(),
                    id: entry.0,
                    job_id: entry.1,
                    queue: entry.2,
                    finalized: false,
                });
            }

            if visibility.is_last() {
                trace!("No fetchable job entry found, polling again shortly…");
                util::sleep_or_cancel(self.options.poll_interval(), cancel).await?;
            }

            visibility = visibility.next();
        }
    }

    /// Claim at most one visible entry: select and mark it fetched in a
    /// single statement, inside a REPEATABLE READ transaction.
    async fn try_claim(
        &self,
        queues: &[String],
        visibility: Visibility,
    ) -> sqlx::Result<Option<(i64, i64, String)>> {
        let jobqueue = self.options.table("jobqueue");
        let condition = match visibility {
            Visibility::Unclaimed => "fetchedat IS NULL",
            Visibility::Reclaimable => "fetchedat < $3",
        };

        // Ordering by fetchedat then jobid gives FIFO-ish, starvation
        // resistant selection across the requested queues.
        let sql = format!(
            "UPDATE {jobqueue}
             SET fetchedat = $2
             WHERE id = (
                 SELECT id
                 FROM {jobqueue}
                 WHERE queue = ANY($1) AND {condition}
                 ORDER BY fetchedat, jobid
                 LIMIT 1
             )
             RETURNING id, jobid, queue"
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let mut query = sqlx::query_as::<_, (i64, i64, String)>(&sql)
            .bind(queues)
            .bind(self.options.now());
        if visibility == Visibility::Reclaimable {
            query = query.bind(self.options.invisibility_threshold());
        }

        let entry = query.fetch_optional(&mut *tx).await?;
        tx.commit().await?;

        Ok(entry)
    }
}

impl QueueProvider for JobQueue {
    fn enqueue<'a>(
        &'a self,
        tx: &'a mut Transaction<'_, Postgres>,
        queue: &'a str,
        job_id: i64,
    ) -> BoxFuture<'a, Result<()>> {
        JobQueue::enqueue(self, tx, queue, job_id).boxed()
    }
}

/// A claimed queue entry.
///
/// The entry stays invisible to other dequeuers until it is either
/// [`complete`](Self::complete)d, [`requeue`](Self::requeue)d, dropped (which
/// requeues it), or the invisibility timeout elapses.
pub struct FetchedJob {
    pool: PgPool,
    options: Arc<StorageOptions>,
    id: i64,
    job_id: i64,
    queue: String,
    finalized: bool,
}

impl FetchedJob {
    /// Identity of the claimed queue entry.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Identifier of the claimed job.
    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    /// Name of the queue the entry was claimed from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Acknowledge completion: delete the queue entry.
    ///
    /// Consuming the handle makes a second finalization impossible. If the
    /// delete itself fails, the drop path requeues the entry so it is not
    /// silently lost.
    pub async fn complete(mut self) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE id = $1",
            self.options.table("jobqueue")
        ))
        .bind(self.id)
        .execute(&self.pool)
        .await?;

        self.finalized = true;
        Ok(())
    }

    /// Negative acknowledgement: make the entry immediately visible again,
    /// bypassing the invisibility-timeout wait.
    pub async fn requeue(mut self) -> Result<()> {
        sqlx::query(&requeue_sql(&self.options))
            .bind(self.id)
            .execute(&self.pool)
            .await?;

        self.finalized = true;
        Ok(())
    }
}

impl std::fmt::Debug for FetchedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedJob")
            .field("id", &self.id)
            .field("job_id", &self.job_id)
            .field("queue", &self.queue)
            .finish()
    }
}

fn requeue_sql(options: &StorageOptions) -> String {
    format!(
        "UPDATE {} SET fetchedat = NULL WHERE id = $1",
        options.table("jobqueue")
    )
}

impl Drop for FetchedJob {
    /// Safety net: a handle released without `complete` or `requeue` behaves
    /// as a requeue, so a worker crash between claim and acknowledgement
    /// never loses the job.
    fn drop(&mut self) {
        if self.finalized {
            return;
        }

        let sql = requeue_sql(&self.options);
        let pool = self.pool.clone();
        let id = self.id;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = sqlx::query(&sql).bind(id).execute(&pool).await {
                        warn!(%error, entry.id = id, "Failed to requeue an abandoned queue entry");
                    }
                });
            }
            Err(_) => {
                warn!(
                    entry.id = id,
                    "Queue entry dropped outside a runtime; it becomes visible again after the invisibility timeout"
                );
            }
        }
    }
}
