//! The storage entry point.
//!
//! [`Storage`] owns the connection pool, the options and the queue registry,
//! and hands out the coordination primitives plus the handful of direct
//! operations the host framework needs around them (job creation, job
//! parameters, server registration).

use crate::batch::{JobState, WriteBatch};
use crate::config::StorageOptions;
use crate::errors::{Error, Result};
use crate::lock::DistributedLock;
use crate::queue::JobQueue;
use crate::registry::QueueRegistry;
use crate::schema::{Job, ServerRecord};
use crate::sweeper::ExpirationSweeper;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Entry point over a shared PostgreSQL store.
///
/// Cheap to share; all state lives in the database. Run
/// [`setup_database`](crate::setup_database) once before constructing this.
pub struct Storage {
    pool: PgPool,
    options: Arc<StorageOptions>,
    queue: Arc<JobQueue>,
    registry: Arc<QueueRegistry>,
}

impl Storage {
    /// Create a storage whose queue registry resolves every queue name to the
    /// built-in relational [`JobQueue`].
    pub fn new(pool: PgPool, options: StorageOptions) -> Self {
        let options = Arc::new(options);
        let queue = Arc::new(JobQueue::new(pool.clone(), options.clone()));
        let registry = Arc::new(QueueRegistry::new(queue.clone()));

        Self {
            pool,
            options,
            queue,
            registry,
        }
    }

    /// Create a storage and bind additional queue providers.
    ///
    /// The closure receives a registry whose default provider is the built-in
    /// [`JobQueue`]; ambiguous bindings are rejected here, at construction.
    pub fn with_registry(
        pool: PgPool,
        options: StorageOptions,
        configure: impl FnOnce(&mut QueueRegistry) -> Result<()>,
    ) -> Result<Self> {
        let options = Arc::new(options);
        let queue = Arc::new(JobQueue::new(pool.clone(), options.clone()));
        let mut registry = QueueRegistry::new(queue.clone());
        configure(&mut registry)?;

        Ok(Self {
            pool,
            options,
            queue,
            registry: Arc::new(registry),
        })
    }

    /// The configured options.
    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// The built-in relational job queue.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Start an empty write batch.
    pub fn write_batch(&self) -> WriteBatch {
        WriteBatch::new(self.pool.clone(), self.options.clone(), self.registry.clone())
    }

    /// Acquire the cross-process lock on `resource`.
    ///
    /// See [`DistributedLock::acquire`].
    pub async fn acquire_lock(
        &self,
        resource: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DistributedLock> {
        DistributedLock::acquire(
            self.pool.clone(),
            self.options.clone(),
            resource,
            timeout,
            cancel,
        )
        .await
    }

    /// Create an expiration sweeper with the given check interval.
    pub fn expiration_sweeper(&self, check_interval: Duration) -> ExpirationSweeper {
        ExpirationSweeper::with_check_interval(
            self.pool.clone(),
            self.options.clone(),
            check_interval,
        )
    }

    /// Insert a new job row, optionally already scheduled for expiration,
    /// returning its id.
    pub async fn create_job(
        &self,
        invocation_data: &str,
        arguments: &str,
        expire_in: Option<Duration>,
    ) -> Result<i64> {
        let expireat = expire_in
            .map(|d| {
                chrono::TimeDelta::from_std(d)
                    .map(|delta| self.options.now() + delta)
                    .map_err(|_| Error::InvalidArgument("expiry duration is out of range"))
            })
            .transpose()?;

        let id = sqlx::query_scalar::<_, i64>(&format!(
            "INSERT INTO {} (invocationdata, arguments, createdat, expireat)
             VALUES ($1, $2, $3, $4)
             RETURNING id",
            self.options.table("job")
        ))
        .bind(invocation_data)
        .bind(arguments)
        .bind(self.options.now())
        .bind(expireat)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Load a job row by id.
    pub async fn job_data(&self, job_id: i64) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT id, stateid, statename, invocationdata, arguments, createdat, expireat
             FROM {} WHERE id = $1",
            self.options.table("job")
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Read the job's current state, if one was ever set.
    ///
    /// The returned payload is the one recorded when the state was set; a
    /// record written without a payload surfaces as [`serde_json::Value::Null`].
    pub async fn state_data(&self, job_id: i64) -> Result<Option<JobState>> {
        let row = sqlx::query_as::<_, (String, Option<String>, Option<String>)>(&format!(
            "SELECT s.name, s.reason, s.data
             FROM {job} AS j
             JOIN {state} AS s ON s.id = j.stateid
             WHERE j.id = $1",
            job = self.options.table("job"),
            state = self.options.table("state"),
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(name, reason, data)| {
            let data = match data {
                Some(raw) => serde_json::from_str(&raw)?,
                None => serde_json::Value::Null,
            };
            Ok(JobState { name, reason, data })
        })
        .transpose()
    }

    /// All values of a set, ordered by ascending score.
    pub async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("set key must not be empty"));
        }

        let values = sqlx::query_scalar::<_, String>(&format!(
            "SELECT value FROM {} WHERE key = $1 ORDER BY score, id",
            self.options.table("set")
        ))
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        Ok(values)
    }

    /// The set value with the lowest score inside the inclusive `[from, to]`
    /// score window, if any.
    ///
    /// This is the lookup a delayed-job scheduler runs to find the next due
    /// entry, with the score carrying the due timestamp.
    pub async fn first_from_set_by_lowest_score(
        &self,
        key: &str,
        from: f64,
        to: f64,
    ) -> Result<Option<String>> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("set key must not be empty"));
        }
        if to < from {
            return Err(Error::InvalidArgument(
                "the `to` score must not be lower than the `from` score",
            ));
        }

        let value = sqlx::query_scalar::<_, String>(&format!(
            "SELECT value FROM {} WHERE key = $1 AND score BETWEEN $2 AND $3
             ORDER BY score LIMIT 1",
            self.options.table("set")
        ))
        .bind(key)
        .bind(from)
        .bind(to)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    /// All fields of a hash, keyed by field name.
    pub async fn hash_entries(&self, key: &str) -> Result<HashMap<String, Option<String>>> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("hash key must not be empty"));
        }

        let rows = sqlx::query_as::<_, (String, Option<String>)>(&format!(
            "SELECT field, value FROM {} WHERE key = $1",
            self.options.table("hash")
        ))
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    /// Upsert one named parameter of a job.
    pub async fn set_job_parameter(&self, job_id: i64, name: &str, value: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("parameter name must not be empty"));
        }

        sqlx::query(&format!(
            "INSERT INTO {} (jobid, name, value) VALUES ($1, $2, $3)
             ON CONFLICT (jobid, name) DO UPDATE SET value = EXCLUDED.value",
            self.options.table("jobparameter")
        ))
        .bind(job_id)
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Read one named parameter of a job.
    pub async fn job_parameter(&self, job_id: i64, name: &str) -> Result<Option<String>> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("parameter name must not be empty"));
        }

        // The value column is nullable, so a parameter written as NULL by
        // another client reads back as absent rather than a decode error.
        let value = sqlx::query_scalar::<_, Option<String>>(&format!(
            "SELECT value FROM {} WHERE jobid = $1 AND name = $2",
            self.options.table("jobparameter")
        ))
        .bind(job_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value.flatten())
    }

    /// Register a server, or refresh its payload and heartbeat if it already
    /// exists.
    pub async fn announce_server(&self, server_id: &str, data: &str) -> Result<()> {
        if server_id.is_empty() {
            return Err(Error::InvalidArgument("server id must not be empty"));
        }

        sqlx::query(&format!(
            "INSERT INTO {} (id, data, lastheartbeat) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, lastheartbeat = EXCLUDED.lastheartbeat",
            self.options.table("server")
        ))
        .bind(server_id)
        .bind(data)
        .bind(self.options.now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Refresh a server's heartbeat timestamp.
    pub async fn heartbeat(&self, server_id: &str) -> Result<()> {
        if server_id.is_empty() {
            return Err(Error::InvalidArgument("server id must not be empty"));
        }

        sqlx::query(&format!(
            "UPDATE {} SET lastheartbeat = $1 WHERE id = $2",
            self.options.table("server")
        ))
        .bind(self.options.now())
        .bind(server_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All registered servers, ordered by id.
    pub async fn servers(&self) -> Result<Vec<ServerRecord>> {
        let servers = sqlx::query_as::<_, ServerRecord>(&format!(
            "SELECT id, data, lastheartbeat FROM {} ORDER BY id",
            self.options.table("server")
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(servers)
    }

    /// Remove a server registration.
    pub async fn remove_server(&self, server_id: &str) -> Result<()> {
        if server_id.is_empty() {
            return Err(Error::InvalidArgument("server id must not be empty"));
        }

        sqlx::query(&format!(
            "DELETE FROM {} WHERE id = $1",
            self.options.table("server")
        ))
        .bind(server_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete every server whose last heartbeat is older than `timeout`,
    /// returning how many were removed.
    pub async fn remove_timed_out_servers(&self, timeout: Duration) -> Result<u64> {
        let timeout = chrono::TimeDelta::from_std(timeout)
            .map_err(|_| Error::InvalidArgument("server timeout is out of range"))?;

        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE lastheartbeat < $1",
            self.options.table("server")
        ))
        .bind(self.options.now() - timeout)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("options", &self.options)
            .field("registry", &self.registry)
            .finish()
    }
}
