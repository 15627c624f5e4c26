//! The all-or-nothing write batch.
//!
//! Mutation methods only record deferred operations; nothing touches the
//! store until [`WriteBatch::commit`], which replays every operation in
//! recorded order inside a single transaction.

use crate::config::StorageOptions;
use crate::errors::{Error, Result};
use crate::registry::QueueRegistry;
use chrono::TimeDelta;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;

/// A job state to append to the history.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JobState {
    /// State name (e.g. `Enqueued`, `Processing`, `Succeeded`).
    pub name: String,
    /// Human-readable reason for the transition.
    pub reason: Option<String>,
    /// Serialized state data.
    pub data: serde_json::Value,
}

#[derive(Debug, Clone)]
enum BatchOp {
    ExpireJob { job_id: i64, expire_in: TimeDelta },
    PersistJob { job_id: i64 },
    SetJobState { job_id: i64, state: JobState },
    AddJobState { job_id: i64, state: JobState },
    Enqueue { queue: String, job_id: i64 },
    IncrementCounter { key: String, expire_in: Option<TimeDelta> },
    DecrementCounter { key: String, expire_in: Option<TimeDelta> },
    AddToSet { key: String, value: String, score: f64 },
    RemoveFromSet { key: String, value: String },
    InsertToList { key: String, value: String },
    RemoveFromList { key: String, value: String },
    TrimList { key: String, keep_start: i64, keep_end: i64 },
    SetHashField { key: String, field: String, value: String },
    RemoveHash { key: String },
}

/// An ordered, atomic unit of deferred store mutations.
///
/// Obtained from [`Storage::write_batch`](crate::Storage::write_batch).
/// Either every recorded operation applies or none does.
pub struct WriteBatch {
    pool: PgPool,
    options: Arc<StorageOptions>,
    registry: Arc<QueueRegistry>,
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub(crate) fn new(
        pool: PgPool,
        options: Arc<StorageOptions>,
        registry: Arc<QueueRegistry>,
    ) -> Self {
        Self {
            pool,
            options,
            registry,
            ops: Vec::new(),
        }
    }

    /// Schedule the job for deletion by the sweeper after `expire_in`.
    pub fn expire_job(&mut self, job_id: i64, expire_in: Duration) -> Result<()> {
        let expire_in = to_delta(expire_in)?;
        self.ops.push(BatchOp::ExpireJob { job_id, expire_in });
        Ok(())
    }

    /// Clear the job's expiration so the sweeper never removes it.
    pub fn persist_job(&mut self, job_id: i64) {
        self.ops.push(BatchOp::PersistJob { job_id });
    }

    /// Append a state record and repoint the job's current state to it.
    pub fn set_job_state(&mut self, job_id: i64, state: JobState) {
        self.ops.push(BatchOp::SetJobState { job_id, state });
    }

    /// Append a state record without changing the job's current state.
    pub fn add_job_state(&mut self, job_id: i64, state: JobState) {
        self.ops.push(BatchOp::AddJobState { job_id, state });
    }

    /// Enqueue the job; the owning queue implementation is resolved through
    /// the registry at commit time.
    pub fn add_to_queue(&mut self, queue: &str, job_id: i64) -> Result<()> {
        let queue = required(queue, "queue name must not be empty")?;
        self.ops.push(BatchOp::Enqueue { queue, job_id });
        Ok(())
    }

    /// Record a `+1` counter row, optionally expiring.
    pub fn increment_counter(&mut self, key: &str, expire_in: Option<Duration>) -> Result<()> {
        let key = required(key, "counter key must not be empty")?;
        let expire_in = expire_in.map(to_delta).transpose()?;
        self.ops.push(BatchOp::IncrementCounter { key, expire_in });
        Ok(())
    }

    /// Record a `-1` counter row, optionally expiring.
    pub fn decrement_counter(&mut self, key: &str, expire_in: Option<Duration>) -> Result<()> {
        let key = required(key, "counter key must not be empty")?;
        let expire_in = expire_in.map(to_delta).transpose()?;
        self.ops.push(BatchOp::DecrementCounter { key, expire_in });
        Ok(())
    }

    /// Add `value` to the sorted set under `key`, or update its score if the
    /// member already exists.
    pub fn add_to_set(&mut self, key: &str, value: &str, score: f64) -> Result<()> {
        let key = required(key, "set key must not be empty")?;
        self.ops.push(BatchOp::AddToSet {
            key,
            value: value.to_owned(),
            score,
        });
        Ok(())
    }

    /// Remove `value` from the set under `key`.
    pub fn remove_from_set(&mut self, key: &str, value: &str) -> Result<()> {
        let key = required(key, "set key must not be empty")?;
        self.ops.push(BatchOp::RemoveFromSet {
            key,
            value: value.to_owned(),
        });
        Ok(())
    }

    /// Append `value` to the list under `key`.
    pub fn insert_to_list(&mut self, key: &str, value: &str) -> Result<()> {
        let key = required(key, "list key must not be empty")?;
        self.ops.push(BatchOp::InsertToList {
            key,
            value: value.to_owned(),
        });
        Ok(())
    }

    /// Remove every list entry under `key` whose value equals `value`.
    pub fn remove_from_list(&mut self, key: &str, value: &str) -> Result<()> {
        let key = required(key, "list key must not be empty")?;
        self.ops.push(BatchOp::RemoveFromList {
            key,
            value: value.to_owned(),
        });
        Ok(())
    }

    /// Keep only the list entries whose rank (by insertion order, 0-based)
    /// falls inside the inclusive `[keep_start, keep_end]` range.
    ///
    /// When `keep_start > keep_end`, or `keep_start` is at or past the end of
    /// the list, every entry under the key is removed.
    pub fn trim_list(&mut self, key: &str, keep_start: i64, keep_end: i64) -> Result<()> {
        let key = required(key, "list key must not be empty")?;
        if keep_start < 0 {
            return Err(Error::InvalidArgument("trim range must not be negative"));
        }
        self.ops.push(BatchOp::TrimList {
            key,
            keep_start,
            keep_end,
        });
        Ok(())
    }

    /// Merge the given field/value pairs into the hash under `key`.
    pub fn set_range_in_hash<I, F, V>(&mut self, key: &str, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (F, V)>,
        F: Into<String>,
        V: Into<String>,
    {
        let key = required(key, "hash key must not be empty")?;
        for (field, value) in pairs {
            self.ops.push(BatchOp::SetHashField {
                key: key.clone(),
                field: field.into(),
                value: value.into(),
            });
        }
        Ok(())
    }

    /// Remove the entire hash under `key`.
    pub fn remove_hash(&mut self, key: &str) -> Result<()> {
        let key = required(key, "hash key must not be empty")?;
        self.ops.push(BatchOp::RemoveHash { key });
        Ok(())
    }

    /// Number of operations recorded so far.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch holds no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Open one transaction, execute every recorded operation in order, and
    /// commit.
    ///
    /// If any operation fails the transaction is abandoned and the error
    /// propagates; none of the recorded mutations become visible.
    pub async fn commit(self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for op in &self.ops {
            self.apply(&mut tx, op).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn apply(&self, tx: &mut Transaction<'_, Postgres>, op: &BatchOp) -> Result<()> {
        match op {
            BatchOp::ExpireJob { job_id, expire_in } => {
                sqlx::query(&format!(
                    "UPDATE {} SET expireat = $1 WHERE id = $2",
                    self.options.table("job")
                ))
                .bind(self.options.now() + *expire_in)
                .bind(job_id)
                .execute(&mut **tx)
                .await?;
            }
            BatchOp::PersistJob { job_id } => {
                sqlx::query(&format!(
                    "UPDATE {} SET expireat = NULL WHERE id = $1",
                    self.options.table("job")
                ))
                .bind(job_id)
                .execute(&mut **tx)
                .await?;
            }
            BatchOp::SetJobState { job_id, state } => {
                // Insert and repoint in one statement so no interleaving can
                // observe a state record that exists but is not linked.
                sqlx::query(&format!(
                    "WITH inserted AS (
                         INSERT INTO {state} (jobid, name, reason, createdat, data)
                         VALUES ($1, $2, $3, $4, $5)
                         RETURNING id, name
                     )
                     UPDATE {job} AS j
                     SET stateid = inserted.id, statename = inserted.name
                     FROM inserted
                     WHERE j.id = $1",
                    state = self.options.table("state"),
                    job = self.options.table("job"),
                ))
                .bind(job_id)
                .bind(&state.name)
                .bind(&state.reason)
                .bind(self.options.now())
                .bind(state.data.to_string())
                .execute(&mut **tx)
                .await?;
            }
            BatchOp::AddJobState { job_id, state } => {
                sqlx::query(&format!(
                    "INSERT INTO {} (jobid, name, reason, createdat, data)
                     VALUES ($1, $2, $3, $4, $5)",
                    self.options.table("state")
                ))
                .bind(job_id)
                .bind(&state.name)
                .bind(&state.reason)
                .bind(self.options.now())
                .bind(state.data.to_string())
                .execute(&mut **tx)
                .await?;
            }
            BatchOp::Enqueue { queue, job_id } => {
                let provider = self.registry.resolve(queue);
                provider.enqueue(tx, queue, *job_id).await?;
            }
            BatchOp::IncrementCounter { key, expire_in } => {
                self.insert_counter(tx, key, 1, *expire_in).await?;
            }
            BatchOp::DecrementCounter { key, expire_in } => {
                self.insert_counter(tx, key, -1, *expire_in).await?;
            }
            BatchOp::AddToSet { key, value, score } => {
                sqlx::query(&format!(
                    "INSERT INTO {} (key, value, score) VALUES ($1, $2, $3)
                     ON CONFLICT (key, value) DO UPDATE SET score = EXCLUDED.score",
                    self.options.table("set")
                ))
                .bind(key)
                .bind(value)
                .bind(score)
                .execute(&mut **tx)
                .await?;
            }
            BatchOp::RemoveFromSet { key, value } => {
                sqlx::query(&format!(
                    "DELETE FROM {} WHERE key = $1 AND value = $2",
                    self.options.table("set")
                ))
                .bind(key)
                .bind(value)
                .execute(&mut **tx)
                .await?;
            }
            BatchOp::InsertToList { key, value } => {
                sqlx::query(&format!(
                    "INSERT INTO {} (key, value) VALUES ($1, $2)",
                    self.options.table("list")
                ))
                .bind(key)
                .bind(value)
                .execute(&mut **tx)
                .await?;
            }
            BatchOp::RemoveFromList { key, value } => {
                sqlx::query(&format!(
                    "DELETE FROM {} WHERE key = $1 AND value = $2",
                    self.options.table("list")
                ))
                .bind(key)
                .bind(value)
                .execute(&mut **tx)
                .await?;
            }
            BatchOp::TrimList {
                key,
                keep_start,
                keep_end,
            } => {
                let list = self.options.table("list");
                match trim_window(*keep_start, *keep_end) {
                    Some((offset, limit)) => {
                        sqlx::query(&format!(
                            "DELETE FROM {list}
                             WHERE key = $1 AND id NOT IN (
                                 SELECT id FROM {list}
                                 WHERE key = $1
                                 ORDER BY id
                                 OFFSET $2 LIMIT $3
                             )"
                        ))
                        .bind(key)
                        .bind(offset)
                        .bind(limit)
                        .execute(&mut **tx)
                        .await?;
                    }
                    None => {
                        sqlx::query(&format!("DELETE FROM {list} WHERE key = $1"))
                            .bind(key)
                            .execute(&mut **tx)
                            .await?;
                    }
                }
            }
            BatchOp::SetHashField { key, field, value } => {
                sqlx::query(&format!(
                    "INSERT INTO {} (key, field, value) VALUES ($1, $2, $3)
                     ON CONFLICT (key, field) DO UPDATE SET value = EXCLUDED.value",
                    self.options.table("hash")
                ))
                .bind(key)
                .bind(field)
                .bind(value)
                .execute(&mut **tx)
                .await?;
            }
            BatchOp::RemoveHash { key } => {
                sqlx::query(&format!(
                    "DELETE FROM {} WHERE key = $1",
                    self.options.table("hash")
                ))
                .bind(key)
                .execute(&mut **tx)
                .await?;
            }
        }

        Ok(())
    }

    async fn insert_counter(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
        value: i64,
        expire_in: Option<TimeDelta>,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (key, value, expireat) VALUES ($1, $2, $3)",
            self.options.table("counter")
        ))
        .bind(key)
        .bind(value)
        .bind(expire_in.map(|delta| self.options.now() + delta))
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

impl std::fmt::Debug for WriteBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBatch")
            .field("ops", &self.ops.len())
            .finish()
    }
}

fn required(value: &str, message: &'static str) -> Result<String> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(message));
    }
    Ok(value.to_owned())
}

fn to_delta(duration: Duration) -> Result<TimeDelta> {
    TimeDelta::from_std(duration).map_err(|_| Error::InvalidArgument("duration is out of range"))
}

/// The OFFSET/LIMIT window of rows to keep, or `None` when the whole key
/// should be emptied.
fn trim_window(keep_start: i64, keep_end: i64) -> Option<(i64, i64)> {
    if keep_start > keep_end {
        return None;
    }
    Some((keep_start, keep_end - keep_start + 1))
}
