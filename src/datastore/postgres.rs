//! PostgreSQL datastore.
//!
//! Runtime `sqlx` queries against a small schema. The advisory lock is
//! a Postgres session lock held on a dedicated connection for the
//! whole process lifetime; if the process crashes, the server releases
//! it when the session dies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Datastore, DatastoreError};
use crate::types::{
    DeletedReason, Job, JobId, JobStatus, Runner, RunnerStatus, RunnerUuid, Scope, Target,
    TargetId, TargetStatus,
};

/// Fixed advisory-lock key: ASCII "treadmil" as a 64-bit integer.
const ADVISORY_LOCK_KEY: i64 = 0x7472_6561_646d_696c;

/// PostgreSQL-backed [`Datastore`].
pub struct PostgresDatastore {
    pool: PgPool,
    /// Connection pinned while we hold the advisory lock.
    lock_conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PostgresDatastore {
    /// Connects and ensures the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, DatastoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        ensure_schema(&pool).await?;
        Ok(PostgresDatastore {
            pool,
            lock_conn: Mutex::new(None),
        })
    }
}

async fn ensure_schema(pool: &PgPool) -> Result<(), DatastoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS targets (
            id UUID PRIMARY KEY,
            scope TEXT NOT NULL UNIQUE,
            resource_type TEXT NOT NULL,
            runner_user TEXT,
            runner_version TEXT,
            github_token TEXT,
            status TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            target_id UUID NOT NULL,
            scope TEXT NOT NULL,
            payload TEXT NOT NULL,
            check_event_id TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runners (
            uuid UUID PRIMARY KEY,
            shoes_type TEXT NOT NULL,
            ip_address TEXT,
            target_id UUID NOT NULL,
            cloud_id TEXT NOT NULL,
            deleted BOOLEAN NOT NULL DEFAULT FALSE,
            status TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ,
            deleted_reason TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS runners_live_cloud_id
        ON runners (cloud_id) WHERE deleted = FALSE
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(sqlx::FromRow)]
struct TargetRow {
    id: Uuid,
    scope: String,
    resource_type: String,
    runner_user: Option<String>,
    runner_version: Option<String>,
    github_token: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TargetRow> for Target {
    type Error = DatastoreError;

    fn try_from(row: TargetRow) -> Result<Self, Self::Error> {
        Ok(Target {
            id: TargetId(row.id),
            scope: Scope::parse(row.scope).map_err(|e| DatastoreError::Query(e.to_string()))?,
            resource_type: row.resource_type,
            runner_user: row.runner_user,
            runner_version: row.runner_version,
            github_token: row.github_token,
            status: row
                .status
                .parse::<TargetStatus>()
                .map_err(DatastoreError::Query)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    target_id: Uuid,
    scope: String,
    payload: String,
    check_event_id: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = DatastoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId(row.id),
            target_id: TargetId(row.target_id),
            scope: row.scope,
            payload: row.payload,
            check_event_id: crate::types::CheckEventId(row.check_event_id),
            status: row
                .status
                .parse::<JobStatus>()
                .map_err(DatastoreError::Query)?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunnerRow {
    uuid: Uuid,
    shoes_type: String,
    ip_address: Option<String>,
    target_id: Uuid,
    cloud_id: String,
    deleted: bool,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    deleted_reason: Option<String>,
}

impl TryFrom<RunnerRow> for Runner {
    type Error = DatastoreError;

    fn try_from(row: RunnerRow) -> Result<Self, Self::Error> {
        let deleted_reason = match row.deleted_reason.as_deref() {
            None => None,
            Some("completed") => Some(DeletedReason::Completed),
            Some("orphaned") => Some(DeletedReason::Orphaned),
            Some(other) => {
                return Err(DatastoreError::Query(format!(
                    "unknown deleted reason: {other}"
                )));
            }
        };
        Ok(Runner {
            uuid: RunnerUuid(row.uuid),
            shoes_type: row.shoes_type,
            ip_address: row.ip_address,
            target_id: TargetId(row.target_id),
            cloud_id: row.cloud_id,
            deleted: row.deleted,
            status: row
                .status
                .parse::<RunnerStatus>()
                .map_err(DatastoreError::Query)?,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            deleted_reason,
        })
    }
}

#[async_trait]
impl Datastore for PostgresDatastore {
    async fn list_targets(&self) -> Result<Vec<Target>, DatastoreError> {
        let rows = sqlx::query_as::<_, TargetRow>(
            "SELECT * FROM targets ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Target::try_from).collect()
    }

    async fn get_target(&self, id: TargetId) -> Result<Target, DatastoreError> {
        let row = sqlx::query_as::<_, TargetRow>("SELECT * FROM targets WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatastoreError::NotFound(format!("target {id}")))?;
        row.try_into()
    }

    async fn get_target_by_scope(&self, scope: &str) -> Result<Option<Target>, DatastoreError> {
        let row = sqlx::query_as::<_, TargetRow>("SELECT * FROM targets WHERE scope = $1")
            .bind(scope)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Target::try_from).transpose()
    }

    async fn create_target(&self, target: &Target) -> Result<(), DatastoreError> {
        sqlx::query(
            r#"
            INSERT INTO targets
                (id, scope, resource_type, runner_user, runner_version,
                 github_token, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(target.id.0)
        .bind(target.scope.as_str())
        .bind(&target.resource_type)
        .bind(&target.runner_user)
        .bind(&target.runner_version)
        .bind(&target.github_token)
        .bind(target.status.to_string())
        .bind(target.created_at)
        .bind(target.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_target_status(
        &self,
        id: TargetId,
        status: TargetStatus,
    ) -> Result<(), DatastoreError> {
        let result =
            sqlx::query("UPDATE targets SET status = $2, updated_at = NOW() WHERE id = $1")
                .bind(id.0)
                .bind(status.to_string())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(DatastoreError::NotFound(format!("target {id}")));
        }
        Ok(())
    }

    async fn delete_target(&self, id: TargetId) -> Result<(), DatastoreError> {
        let result = sqlx::query("DELETE FROM targets WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatastoreError::NotFound(format!("target {id}")));
        }
        Ok(())
    }

    async fn enqueue_job(&self, job: &Job) -> Result<(), DatastoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, target_id, scope, payload, check_event_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(job.id.0)
        .bind(job.target_id.0)
        .bind(&job.scope)
        .bind(&job.payload)
        .bind(job.check_event_id.as_str())
        .bind(job.status.to_string())
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_pending_jobs(&self, limit: usize) -> Result<Vec<Job>, DatastoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE status = 'pending' ORDER BY created_at ASC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn delete_job(&self, id: JobId) -> Result<(), DatastoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatastoreError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    async fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
    ) -> Result<(), DatastoreError> {
        let result = sqlx::query("UPDATE jobs SET status = $2 WHERE id = $1")
            .bind(id.0)
            .bind(status.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatastoreError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    async fn create_runner(&self, runner: &Runner) -> Result<(), DatastoreError> {
        sqlx::query(
            r#"
            INSERT INTO runners
                (uuid, shoes_type, ip_address, target_id, cloud_id, deleted,
                 status, created_at, started_at, finished_at, deleted_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(runner.uuid.0)
        .bind(&runner.shoes_type)
        .bind(&runner.ip_address)
        .bind(runner.target_id.0)
        .bind(&runner.cloud_id)
        .bind(runner.deleted)
        .bind(runner.status.to_string())
        .bind(runner.created_at)
        .bind(runner.started_at)
        .bind(runner.finished_at)
        .bind(runner.deleted_reason.map(|r| r.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_runner(&self, uuid: RunnerUuid) -> Result<Runner, DatastoreError> {
        let row = sqlx::query_as::<_, RunnerRow>("SELECT * FROM runners WHERE uuid = $1")
            .bind(uuid.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatastoreError::NotFound(format!("runner {uuid}")))?;
        row.try_into()
    }

    async fn list_runners(&self, include_deleted: bool) -> Result<Vec<Runner>, DatastoreError> {
        let rows = sqlx::query_as::<_, RunnerRow>(
            "SELECT * FROM runners WHERE ($1 OR deleted = FALSE) ORDER BY created_at ASC",
        )
        .bind(include_deleted)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Runner::try_from).collect()
    }

    async fn list_runners_by_target(
        &self,
        target_id: TargetId,
        include_deleted: bool,
    ) -> Result<Vec<Runner>, DatastoreError> {
        let rows = sqlx::query_as::<_, RunnerRow>(
            r#"
            SELECT * FROM runners
            WHERE target_id = $1 AND ($2 OR deleted = FALSE)
            ORDER BY created_at ASC
            "#,
        )
        .bind(target_id.0)
        .bind(include_deleted)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Runner::try_from).collect()
    }

    async fn update_runner_status(
        &self,
        uuid: RunnerUuid,
        status: RunnerStatus,
    ) -> Result<(), DatastoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runners
            SET status = $2,
                started_at = CASE
                    WHEN $2 = 'running' AND started_at IS NULL THEN NOW()
                    ELSE started_at
                END
            WHERE uuid = $1 AND status <> 'completed'
            "#,
        )
        .bind(uuid.0)
        .bind(status.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            // Either missing or terminal; terminal is a silent no-op.
            self.get_runner(uuid).await?;
        }
        Ok(())
    }

    async fn mark_runner_deleted(
        &self,
        uuid: RunnerUuid,
        finished_at: DateTime<Utc>,
        reason: DeletedReason,
    ) -> Result<(), DatastoreError> {
        let status = match reason {
            DeletedReason::Completed => RunnerStatus::Completed,
            DeletedReason::Orphaned => RunnerStatus::Orphaned,
        };
        let result = sqlx::query(
            r#"
            UPDATE runners
            SET deleted = TRUE,
                finished_at = GREATEST($2, created_at),
                deleted_reason = $3,
                status = $4
            WHERE uuid = $1 AND deleted = FALSE
            "#,
        )
        .bind(uuid.0)
        .bind(finished_at)
        .bind(reason.to_string())
        .bind(status.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            // Already deleted is fine; missing is not.
            self.get_runner(uuid).await?;
        }
        Ok(())
    }

    async fn get_lock(&self) -> Result<(), DatastoreError> {
        let mut guard = self.lock_conn.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(ADVISORY_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            return Err(DatastoreError::Locked);
        }
        *guard = Some(conn);
        Ok(())
    }

    async fn is_locked(&self) -> Result<bool, DatastoreError> {
        if self.lock_conn.lock().await.is_some() {
            return Ok(true);
        }
        // Probe with a fresh session: if we can take the lock, nobody
        // holds it; release the probe immediately.
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(ADVISORY_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?;
        if acquired {
            let _: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
                .bind(ADVISORY_LOCK_KEY)
                .fetch_one(&mut *conn)
                .await?;
        }
        Ok(!acquired)
    }

    async fn release_lock(&self) -> Result<(), DatastoreError> {
        let mut guard = self.lock_conn.lock().await;
        if let Some(mut conn) = guard.take() {
            let _: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
                .bind(ADVISORY_LOCK_KEY)
                .fetch_one(&mut *conn)
                .await?;
        }
        Ok(())
    }
}
