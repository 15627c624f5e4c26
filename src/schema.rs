//! Database schema definitions and the one-time installer.
//!
//! All tables live inside the schema namespace configured on
//! [`StorageOptions`]; identifiers are always quoted when interpolated into
//! SQL. [`setup_database`] is an explicit bootstrap step the caller runs once
//! before constructing any other component.

use crate::config::StorageOptions;
use crate::errors::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};

/// A background job row.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier for the job.
    pub id: i64,
    /// Reference to the current state record, if a state was ever set.
    pub stateid: Option<i64>,
    /// Name of the current state, if a state was ever set.
    pub statename: Option<String>,
    /// Serialized invocation descriptor.
    pub invocationdata: String,
    /// Serialized invocation arguments.
    pub arguments: String,
    /// Timestamp when the job was submitted.
    pub createdat: DateTime<Utc>,
    /// Timestamp after which the sweeper may delete the job.
    pub expireat: Option<DateTime<Utc>>,
}

/// One entry in the append-only job state history.
#[derive(Debug, Clone, FromRow)]
pub struct StateRecord {
    /// Unique identifier for the record.
    pub id: i64,
    /// The job this record belongs to.
    pub jobid: i64,
    /// State name.
    pub name: String,
    /// Human-readable reason for the transition.
    pub reason: Option<String>,
    /// Timestamp when the record was appended.
    pub createdat: DateTime<Utc>,
    /// Serialized state data.
    pub data: Option<String>,
}

/// A persistent queue row.
///
/// A NULL `fetchedat` means the entry is visible to any dequeuer; a non-NULL
/// value older than the invisibility timeout means it is reclaimable.
#[derive(Debug, Clone, FromRow)]
pub struct QueueEntry {
    /// Unique identifier for the entry.
    pub id: i64,
    /// The queued job.
    pub jobid: i64,
    /// Queue name.
    pub queue: String,
    /// When the entry was last claimed, if ever.
    pub fetchedat: Option<DateTime<Utc>>,
}

/// A registered worker server.
#[derive(Debug, Clone, FromRow)]
pub struct ServerRecord {
    /// Server identity.
    pub id: String,
    /// Serialized descriptive payload.
    pub data: Option<String>,
    /// Last heartbeat timestamp.
    pub lastheartbeat: Option<DateTime<Utc>>,
}

/// Versioned DDL scripts; `{schema}` is replaced with the configured
/// namespace before execution.
const INSTALL_SCRIPTS: &[(i32, &str)] = &[(1, INSTALL_V1)];

const INSTALL_V1: &str = r#"
CREATE TABLE "{schema}"."job" (
    id bigserial PRIMARY KEY,
    stateid bigint,
    statename text,
    invocationdata text NOT NULL,
    arguments text NOT NULL,
    createdat timestamptz NOT NULL,
    expireat timestamptz
);
CREATE INDEX "ix_job_expireat" ON "{schema}"."job" (expireat);

CREATE TABLE "{schema}"."state" (
    id bigserial PRIMARY KEY,
    jobid bigint NOT NULL REFERENCES "{schema}"."job" (id) ON DELETE CASCADE,
    name text NOT NULL,
    reason text,
    createdat timestamptz NOT NULL,
    data text
);
CREATE INDEX "ix_state_jobid" ON "{schema}"."state" (jobid);

CREATE TABLE "{schema}"."jobparameter" (
    id bigserial PRIMARY KEY,
    jobid bigint NOT NULL REFERENCES "{schema}"."job" (id) ON DELETE CASCADE,
    name text NOT NULL,
    value text,
    UNIQUE (jobid, name)
);

CREATE TABLE "{schema}"."jobqueue" (
    id bigserial PRIMARY KEY,
    jobid bigint NOT NULL,
    queue text NOT NULL,
    fetchedat timestamptz
);
CREATE INDEX "ix_jobqueue_queue_fetchedat" ON "{schema}"."jobqueue" (queue, fetchedat);

CREATE TABLE "{schema}"."counter" (
    id bigserial PRIMARY KEY,
    key text NOT NULL,
    value bigint NOT NULL,
    expireat timestamptz
);
CREATE INDEX "ix_counter_key" ON "{schema}"."counter" (key);

CREATE TABLE "{schema}"."set" (
    id bigserial PRIMARY KEY,
    key text NOT NULL,
    value text NOT NULL,
    score float8 NOT NULL DEFAULT 0,
    expireat timestamptz,
    UNIQUE (key, value)
);

CREATE TABLE "{schema}"."list" (
    id bigserial PRIMARY KEY,
    key text NOT NULL,
    value text NOT NULL,
    expireat timestamptz
);
CREATE INDEX "ix_list_key" ON "{schema}"."list" (key);

CREATE TABLE "{schema}"."hash" (
    id bigserial PRIMARY KEY,
    key text NOT NULL,
    field text NOT NULL,
    value text,
    expireat timestamptz,
    UNIQUE (key, field)
);

CREATE TABLE "{schema}"."server" (
    id text PRIMARY KEY,
    data text,
    lastheartbeat timestamptz
);

CREATE TABLE "{schema}"."lock" (
    resource text NOT NULL,
    UNIQUE (resource)
);
"#;

/// Install the SQL objects, applying any DDL versions not applied yet.
///
/// Applied versions are recorded in the `schema` marker table, so running
/// this on an already-installed database is a no-op. Call it once before
/// constructing [`Storage`](crate::Storage).
pub async fn setup_database(pool: &PgPool, options: &StorageOptions) -> Result<()> {
    info!("Installing jobstore SQL objects…");

    sqlx::query(&format!(
        r#"CREATE SCHEMA IF NOT EXISTS "{}""#,
        options.schema_name()
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (version int NOT NULL PRIMARY KEY)",
        options.table("schema")
    ))
    .execute(pool)
    .await?;

    for (version, script) in INSTALL_SCRIPTS {
        if version_already_applied(pool, options, *version).await? {
            debug!("Schema version {version} is already applied");
            continue;
        }

        let ddl = script.replace("{schema}", options.schema_name());
        sqlx::raw_sql(&ddl).execute(pool).await?;

        sqlx::query(&format!(
            "INSERT INTO {} (version) VALUES ($1)",
            options.table("schema")
        ))
        .bind(version)
        .execute(pool)
        .await?;
    }

    info!("jobstore SQL objects installed.");
    Ok(())
}

async fn version_already_applied(
    pool: &PgPool,
    options: &StorageOptions,
    version: i32,
) -> Result<bool> {
    let applied = sqlx::query_scalar::<_, bool>(&format!(
        "SELECT EXISTS (SELECT 1 FROM {} WHERE version = $1)",
        options.table("schema")
    ))
    .bind(version)
    .fetch_one(pool)
    .await?;

    Ok(applied)
}
