use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AvesError;
use crate::job::{Job, JobId, JobKey, JobStatus, Worker};
use crate::lease::{expiry, not_held, LeaseId, LeaseState, LeaseStore};
use crate::store::{AggregateGuard, AggregateLocker, HeldLock, JobStore};

/// Schema for the tables used by this module.
pub const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const UNIQUE_VIOLATION: &str = "23505";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().map(|c| c.to_string()).as_deref() == Some(UNIQUE_VIOLATION)
        }
        _ => false,
    }
}

/// Apply [`SCHEMA`]; every statement is idempotent.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// PostgreSQL-backed job and worker records.
///
/// Job specs and workers are stored as JSONB documents next to the columns
/// used for lookups, so schema changes to the documents need no migration.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn job_from_row(row: &PgRow) -> anyhow::Result<Job> {
        let status: String = row.try_get("status")?;
        Ok(Job {
            id: JobId(row.try_get("id")?),
            spec: serde_json::from_value(row.try_get("spec")?)?,
            status: status.parse()?,
            message: row.try_get("message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert_job(&self, job: Job) -> anyhow::Result<Job> {
        let key = job.key();
        let result = sqlx::query(
            r#"
            INSERT INTO aves_jobs (
                id, username, namespace, job_name, status, message, spec, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id.0)
        .bind(&key.username)
        .bind(&key.namespace)
        .bind(&key.job_id)
        .bind(job.status.as_str())
        .bind(&job.message)
        .bind(serde_json::to_value(&job.spec)?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(job),
            Err(err) if is_unique_violation(&err) => {
                Err(AvesError::validation(format!("job {key} already exists")).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_job(&self, id: JobId) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT id, status, message, spec, created_at, updated_at
            FROM aves_jobs
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn find_job(&self, key: &JobKey) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT id, status, message, spec, created_at, updated_at
            FROM aves_jobs
            WHERE username = $1 AND namespace = $2 AND job_name = $3
            "#,
        )
        .bind(&key.username)
        .bind(&key.namespace)
        .bind(&key.job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn find_job_for_object(&self, object_name: &str) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT id, status, message, spec, created_at, updated_at
            FROM aves_jobs
            WHERE $1 = username || '-' || namespace || '-' || job_name
               OR starts_with($1, username || '-' || namespace || '-' || job_name || '-')
            ORDER BY length(username) + length(namespace) + length(job_name) DESC
            LIMIT 1
            "#,
        )
        .bind(object_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        message: &str,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE aves_jobs
            SET status = $2,
                message = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(status.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AvesError::NotFound(format!("job {id}")).into());
        }
        Ok(())
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, message, spec, created_at, updated_at
            FROM aves_jobs
            WHERE status = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::job_from_row).collect()
    }

    async fn insert_workers(&self, job_id: JobId, workers: Vec<Worker>) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        // Row lock on the job serializes concurrent materialization.
        let job = sqlx::query(
            r#"
            SELECT username, namespace, job_name
            FROM aves_jobs
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(job_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AvesError::NotFound(format!("job {job_id}")))?;
        let merged_id = JobKey::new(
            job.try_get::<String, _>("username")?,
            job.try_get::<String, _>("namespace")?,
            job.try_get::<String, _>("job_name")?,
        )
        .merged_id();

        let existing: i64 = sqlx::query("SELECT COUNT(*) AS n FROM aves_workers WHERE job_id = $1")
            .bind(job_id.0)
            .fetch_one(&mut *tx)
            .await?
            .try_get("n")?;
        if existing > 0 {
            return Err(AvesError::DuplicateMaterialization(merged_id).into());
        }

        for worker in &workers {
            let result = sqlx::query(
                r#"
                INSERT INTO aves_workers (
                    id, job_id, role, role_index, name, status, message, body, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
                "#,
            )
            .bind(worker.id.0)
            .bind(job_id.0)
            .bind(&worker.role)
            .bind(i32::try_from(worker.role_index)?)
            .bind(&worker.name)
            .bind(worker.status.as_str())
            .bind(&worker.message)
            .bind(serde_json::to_value(worker)?)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {}
                Err(err) if is_unique_violation(&err) => {
                    return Err(AvesError::InvalidState(format!(
                        "duplicate worker slot {}-{} for job {merged_id}",
                        worker.role, worker.role_index
                    ))
                    .into());
                }
                Err(err) => return Err(err.into()),
            }
        }

        tx.commit().await?;
        debug!("Materialized {} workers for job {}", workers.len(), merged_id);
        Ok(())
    }

    async fn list_workers(&self, job_id: JobId) -> anyhow::Result<Vec<Worker>> {
        let rows = sqlx::query(
            r#"
            SELECT body
            FROM aves_workers
            WHERE job_id = $1
            ORDER BY role ASC, role_index ASC
            "#,
        )
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok(serde_json::from_value(row.try_get("body")?)?))
            .collect()
    }

    async fn update_worker(&self, worker: &Worker) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE aves_workers
            SET status = $2,
                message = $3,
                body = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(worker.id.0)
        .bind(worker.status.as_str())
        .bind(&worker.message)
        .bind(serde_json::to_value(worker)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AvesError::NotFound(format!("worker {}", worker.name)).into());
        }
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM aves_jobs WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Event deduplication leases shared by every controller process.
#[derive(Debug, Clone)]
pub struct PostgresLeaseStore {
    pool: PgPool,
}

impl PostgresLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn state_str(state: LeaseState) -> &'static str {
        match state {
            LeaseState::Held => "held",
            LeaseState::Completed => "completed",
        }
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<LeaseId>> {
        let lease_id = LeaseId::new();
        let row = sqlx::query(
            r#"
            INSERT INTO aves_event_leases (key, lease_id, state, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE
            SET lease_id = EXCLUDED.lease_id,
                state = EXCLUDED.state,
                expires_at = EXCLUDED.expires_at
            WHERE aves_event_leases.expires_at < NOW()
            RETURNING lease_id
            "#,
        )
        .bind(key)
        .bind(lease_id.0)
        .bind(Self::state_str(LeaseState::Held))
        .bind(expiry(ttl))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(LeaseId(row.try_get::<Uuid, _>("lease_id")?))),
            None => Ok(None),
        }
    }

    async fn complete(&self, key: &str, lease_id: LeaseId, ttl: Duration) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE aves_event_leases
            SET state = $3,
                expires_at = $4
            WHERE key = $1 AND lease_id = $2
            "#,
        )
        .bind(key)
        .bind(lease_id.0)
        .bind(Self::state_str(LeaseState::Completed))
        .bind(expiry(ttl))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_held(key, lease_id));
        }
        Ok(())
    }

    async fn release(&self, key: &str, lease_id: LeaseId) -> anyhow::Result<()> {
        let result = sqlx::query("DELETE FROM aves_event_leases WHERE key = $1 AND lease_id = $2")
            .bind(key)
            .bind(lease_id.0)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(not_held(key, lease_id));
        }
        Ok(())
    }

    async fn purge_expired(&self) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM aves_event_leases WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Per-job locks backed by session-level advisory locks.
///
/// Each guard pins one pooled connection until it is released.
#[derive(Debug, Clone)]
pub struct PostgresAggregateLocker {
    pool: PgPool,
}

impl PostgresAggregateLocker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn advisory_key(job_id: JobId) -> i64 {
    let (hi, lo) = job_id.0.as_u64_pair();
    (hi ^ lo) as i64
}

struct AdvisoryHeld {
    key: i64,
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl HeldLock for AdvisoryHeld {
    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        let AdvisoryHeld { key, mut conn } = *self;
        let released: bool = sqlx::query("SELECT pg_advisory_unlock($1) AS released")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?
            .try_get("released")?;
        if !released {
            // The session no longer held it; closing the connection drops
            // anything left behind.
            warn!("Advisory lock {} was not held at release", key);
            conn.close().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AggregateLocker for PostgresAggregateLocker {
    async fn lock(&self, job_id: JobId) -> anyhow::Result<AggregateGuard> {
        let key = advisory_key(job_id);
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(&mut *conn)
            .await?;
        Ok(AggregateGuard::new(job_id, Box::new(AdvisoryHeld { key, conn })))
    }
}
