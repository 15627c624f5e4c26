#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use claims::assert_err;
use jobstore::schema::QueueEntry;
use jobstore::{Error, Storage, StorageOptions, setup_database};
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio_util::sync::CancellationToken;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the pool and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let container = Postgres::default().start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        Ok((pool, container))
    }

    /// Options with a poll interval short enough for tests
    pub(super) fn test_options() -> StorageOptions {
        StorageOptions::new().queue_poll_interval(Duration::from_millis(50))
    }

    pub(super) async fn setup_storage(
        options: StorageOptions,
    ) -> anyhow::Result<(Storage, PgPool, ContainerAsync<Postgres>)> {
        let (pool, container) = setup_test_db().await?;
        setup_database(&pool, &options).await?;
        Ok((Storage::new(pool.clone(), options), pool, container))
    }
}

async fn enqueue(storage: &Storage, queue: &str, job_id: i64) -> anyhow::Result<()> {
    let mut batch = storage.write_batch();
    batch.add_to_queue(queue, job_id)?;
    batch.commit().await?;
    Ok(())
}

async fn queue_entries(pool: &PgPool) -> anyhow::Result<Vec<QueueEntry>> {
    let entries = sqlx::query_as::<_, QueueEntry>(
        r#"SELECT id, jobid, queue, fetchedat FROM "jobstore"."jobqueue" ORDER BY id"#,
    )
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

#[tokio::test]
async fn dequeued_entry_is_claimed_and_complete_removes_it() -> anyhow::Result<()> {
    let (storage, pool, _container) = test_utils::setup_storage(test_utils::test_options()).await?;

    let job_id = storage.create_job("{}", "[]", None).await?;
    enqueue(&storage, "default", job_id).await?;

    let cancel = CancellationToken::new();
    let fetched = storage.queue().dequeue(&["default"], &cancel).await?;
    assert_eq!(fetched.job_id(), job_id);
    assert_eq!(fetched.queue(), "default");

    // The claim must be visible in the store before acknowledgement.
    let entries = queue_entries(&pool).await?;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].fetchedat.is_some());

    fetched.complete().await?;
    assert_eq!(queue_entries(&pool).await?.len(), 0);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn every_entry_is_delivered_to_exactly_one_dequeuer() -> anyhow::Result<()> {
    const JOBS: usize = 4;

    let (storage, _pool, _container) =
        test_utils::setup_storage(test_utils::test_options()).await?;
    let storage = Arc::new(storage);

    let mut expected = HashSet::new();
    for _ in 0..JOBS {
        let job_id = storage.create_job("{}", "[]", None).await?;
        enqueue(&storage, "default", job_id).await?;
        expected.insert(job_id);
    }

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();
    for _ in 0..JOBS {
        let storage = storage.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let fetched = storage.queue().dequeue(&["default"], &cancel).await?;
            let job_id = fetched.job_id();
            fetched.complete().await?;
            Ok::<_, Error>(job_id)
        }));
    }

    let mut delivered = HashSet::new();
    for handle in handles {
        delivered.insert(handle.await??);
    }

    // No duplicate delivery within a single live-claim window, no entry left
    // unclaimed.
    assert_eq!(delivered, expected);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_handle_requeues_the_entry() -> anyhow::Result<()> {
    let (storage, pool, _container) = test_utils::setup_storage(test_utils::test_options()).await?;

    let job_id = storage.create_job("{}", "[]", None).await?;
    enqueue(&storage, "default", job_id).await?;

    let cancel = CancellationToken::new();
    let fetched = storage.queue().dequeue(&["default"], &cancel).await?;
    drop(fetched);

    // The requeue runs on a spawned task; give it a moment.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let entries = queue_entries(&pool).await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].fetchedat, None);

    Ok(())
}

#[tokio::test]
async fn requeue_makes_the_entry_immediately_visible() -> anyhow::Result<()> {
    let (storage, _pool, _container) =
        test_utils::setup_storage(test_utils::test_options()).await?;

    let job_id = storage.create_job("{}", "[]", None).await?;
    enqueue(&storage, "default", job_id).await?;

    let cancel = CancellationToken::new();
    let fetched = storage.queue().dequeue(&["default"], &cancel).await?;
    fetched.requeue().await?;

    // No invisibility-timeout wait: the next dequeue gets the entry at once.
    let fetched = storage.queue().dequeue(&["default"], &cancel).await?;
    assert_eq!(fetched.job_id(), job_id);
    fetched.complete().await?;

    Ok(())
}

#[tokio::test]
async fn timed_out_claim_is_reclaimable() -> anyhow::Result<()> {
    let options = test_utils::test_options().invisibility_timeout(Duration::from_secs(60))?;
    let (storage, pool, _container) = test_utils::setup_storage(options).await?;

    let job_id = storage.create_job("{}", "[]", None).await?;
    enqueue(&storage, "default", job_id).await?;

    // Simulate a worker that claimed the entry and crashed long ago. The
    // original claim row is untouched in the store.
    sqlx::query(
        r#"UPDATE "jobstore"."jobqueue" SET fetchedat = now() - interval '1 hour' WHERE jobid = $1"#,
    )
    .bind(job_id)
    .execute(&pool)
    .await?;

    let cancel = CancellationToken::new();
    let fetched = storage.queue().dequeue(&["default"], &cancel).await?;
    assert_eq!(fetched.job_id(), job_id);
    fetched.complete().await?;

    Ok(())
}

#[tokio::test]
async fn fresh_claim_stays_invisible() -> anyhow::Result<()> {
    let options = test_utils::test_options().invisibility_timeout(Duration::from_secs(3600))?;
    let (storage, _pool, _container) = test_utils::setup_storage(options).await?;
    let storage = Arc::new(storage);

    let job_id = storage.create_job("{}", "[]", None).await?;
    enqueue(&storage, "default", job_id).await?;

    let cancel = CancellationToken::new();
    let fetched = storage.queue().dequeue(&["default"], &cancel).await?;

    // A second dequeuer must not see the freshly claimed entry; it blocks
    // until cancelled.
    let second = {
        let storage = storage.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { storage.queue().dequeue(&["default"], &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    let result = second.await?;
    assert!(matches!(result, Err(Error::Cancelled)));

    fetched.complete().await?;
    Ok(())
}

#[tokio::test]
async fn cancellation_unblocks_dequeue_promptly() -> anyhow::Result<()> {
    let (storage, _pool, _container) =
        test_utils::setup_storage(test_utils::test_options()).await?;

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let started = std::time::Instant::now();
    let result = storage.queue().dequeue(&["empty"], &cancel).await;
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));

    Ok(())
}

#[tokio::test]
async fn empty_arguments_are_rejected_before_store_access() -> anyhow::Result<()> {
    let (storage, _pool, _container) =
        test_utils::setup_storage(test_utils::test_options()).await?;

    let cancel = CancellationToken::new();
    let result = storage.queue().dequeue(&[], &cancel).await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));

    let mut batch = storage.write_batch();
    let result = batch.add_to_queue("", 1);
    assert_err!(result);

    Ok(())
}
