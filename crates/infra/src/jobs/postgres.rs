//! Postgres-backed job descriptor store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) on insert | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed | N/A | `Backend` |
//! | Other | N/A | `Backend` |
//!
//! ## Blocking bridge
//!
//! [`JobDescriptorStore`] is synchronous. Each call is driven to completion on the
//! tokio runtime captured at construction, so the store can be used from worker
//! threads and `spawn_blocking` closures. Calling it from a task on a
//! current-thread runtime panics.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::field::Empty;
use tracing::{instrument, Span};
use uuid::Uuid;

use jobqueue_core::{DescriptorRecord, JobDescriptor, JobId, JobStatus, StoreError};

use super::store::{JobDescriptorStore, JobStats};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS job_descriptors (
        id              UUID PRIMARY KEY,
        kind            TEXT NOT NULL,
        title           TEXT NOT NULL,
        status          TEXT NOT NULL,
        mode            TEXT NOT NULL,
        payload         JSONB NOT NULL DEFAULT 'null'::jsonb,
        scheduled_start TIMESTAMPTZ NULL,
        created_at      TIMESTAMPTZ NOT NULL,
        last_edited     TIMESTAMPTZ NOT NULL,
        messages        JSONB NOT NULL DEFAULT '[]'::jsonb,
        total_steps     INTEGER NOT NULL DEFAULT 0 CHECK (total_steps >= 0),
        current_step    INTEGER NOT NULL DEFAULT 0 CHECK (current_step >= 0)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS job_descriptors_status_idx ON job_descriptors (status, last_edited)",
    "CREATE INDEX IF NOT EXISTS job_descriptors_kind_idx ON job_descriptors (kind, status)",
    r#"
    CREATE INDEX IF NOT EXISTS job_descriptors_due_idx
        ON job_descriptors (COALESCE(scheduled_start, created_at), id)
        WHERE status IN ('New', 'Waiting')
    "#,
];

const COLUMNS: &str = "id, kind, title, status, mode, payload, scheduled_start, \
                       created_at, last_edited, messages, total_steps, current_step";

/// Postgres-backed job descriptor store.
///
/// Status writes are conditional `UPDATE ... WHERE status = $expected`, so the
/// row lock taken by Postgres settles concurrent claims.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresJobStore {
    /// Create a store bound to the current tokio runtime.
    pub fn new(pool: PgPool) -> Result<Self, StoreError> {
        let handle = Handle::try_current().map_err(|_| {
            StoreError::backend(
                "PostgresJobStore requires a tokio runtime; create it from within one or use with_handle",
            )
        })?;
        Ok(Self::with_handle(pool, handle))
    }

    pub fn with_handle(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    #[instrument(
        skip(self, descriptor),
        fields(job_id = %descriptor.id(), kind = %descriptor.kind()),
        err
    )]
    pub async fn insert_descriptor(&self, descriptor: &JobDescriptor) -> Result<(), StoreError> {
        let record = descriptor.to_record();
        sqlx::query(&format!(
            "INSERT INTO job_descriptors ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(record.id.as_uuid())
        .bind(&record.kind)
        .bind(&record.title)
        .bind(record.status.as_str())
        .bind(record.mode.as_str())
        .bind(&record.payload)
        .bind(record.scheduled_start)
        .bind(record.created_at)
        .bind(record.last_edited)
        .bind(Json(&record.messages))
        .bind(to_i32(record.total_steps)?)
        .bind(to_i32(record.current_step)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(record.id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn fetch(&self, id: JobId) -> Result<Option<JobDescriptor>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM job_descriptors WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(descriptor_from_row).transpose()
    }

    #[instrument(
        skip(self, descriptor),
        fields(
            job_id = %descriptor.id(),
            expected = %expected,
            status = %descriptor.status(),
            applied = Empty
        ),
        err
    )]
    pub async fn compare_and_save(
        &self,
        descriptor: &JobDescriptor,
        expected: JobStatus,
    ) -> Result<bool, StoreError> {
        let record = descriptor.to_record();
        let result = sqlx::query(
            r#"
            UPDATE job_descriptors
            SET status = $3,
                payload = $4,
                scheduled_start = $5,
                last_edited = $6,
                messages = $7,
                total_steps = $8,
                current_step = $9
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(expected.as_str())
        .bind(record.status.as_str())
        .bind(&record.payload)
        .bind(record.scheduled_start)
        .bind(record.last_edited)
        .bind(Json(&record.messages))
        .bind(to_i32(record.total_steps)?)
        .bind(to_i32(record.current_step)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_if_status", e))?;

        let applied = result.rows_affected() == 1;
        Span::current().record("applied", applied);
        if applied {
            return Ok(true);
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM job_descriptors WHERE id = $1)")
                .bind(record.id.as_uuid())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("save_if_status", e))?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::NotFound(record.id))
        }
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM job_descriptors
            WHERE status = ANY($1)
              AND (scheduled_start IS NULL OR scheduled_start <= $2)
            ORDER BY COALESCE(scheduled_start, created_at) ASC, id ASC
            LIMIT $3
            "#,
        )
        .bind(status_names(&JobStatus::CLAIMABLE))
        .bind(now)
        .bind(to_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_due", e))?;

        Ok(ids.into_iter().map(JobId::from_uuid).collect())
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_by_kind(
        &self,
        kind: &str,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobDescriptor>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM job_descriptors \
             WHERE kind = $1 AND status = ANY($2) \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(kind)
        .bind(status_names(statuses))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_kind", e))?;

        rows.iter().map(descriptor_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_stale(
        &self,
        statuses: &[JobStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM job_descriptors WHERE status = ANY($1) AND last_edited < $2",
        )
        .bind(status_names(statuses))
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_by_status_and_age", e))?;

        Ok(ids.into_iter().map(JobId::from_uuid).collect())
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_oldest(&self, limit: usize) -> Result<Vec<JobId>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM job_descriptors ORDER BY last_edited ASC, id ASC LIMIT $1",
        )
        .bind(to_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_ordered_by_last_edited", e))?;

        Ok(ids.into_iter().map(JobId::from_uuid).collect())
    }

    #[instrument(skip(self, exclude), fields(excluded = exclude.len()), err)]
    pub async fn fetch_excluding(
        &self,
        statuses: &[JobStatus],
        exclude: &[JobId],
    ) -> Result<Vec<JobId>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM job_descriptors WHERE status = ANY($1) AND NOT (id = ANY($2))",
        )
        .bind(status_names(statuses))
        .bind(uuids(exclude))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_by_status_excluding", e))?;

        Ok(ids.into_iter().map(JobId::from_uuid).collect())
    }

    /// Delete the listed rows whose status is still in `statuses`, in one transaction.
    #[instrument(skip(self, ids), fields(requested = ids.len(), deleted = Empty), err)]
    pub async fn delete_batch(
        &self,
        ids: &[JobId],
        statuses: &[JobStatus],
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("delete_by_ids", e))?;

        let result =
            sqlx::query("DELETE FROM job_descriptors WHERE id = ANY($1) AND status = ANY($2)")
                .bind(uuids(ids))
                .bind(status_names(statuses))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_by_ids", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("delete_by_ids", e))?;

        let deleted = result.rows_affected();
        Span::current().record("deleted", deleted);
        Ok(deleted)
    }

    #[instrument(skip(self), err)]
    pub async fn count_by_status(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM job_descriptors GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(row_error)?;
            let n: i64 = row.try_get("n").map_err(row_error)?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| StoreError::backend(e.to_string()))?;
            stats.add(status, usize::try_from(n).unwrap_or(usize::MAX));
        }
        Ok(stats)
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        tokio::task::block_in_place(|| self.handle.block_on(fut))
    }
}

impl JobDescriptorStore for PostgresJobStore {
    fn insert(&self, descriptor: &JobDescriptor) -> Result<(), StoreError> {
        self.block_on(self.insert_descriptor(descriptor))
    }

    fn get(&self, id: JobId) -> Result<Option<JobDescriptor>, StoreError> {
        self.block_on(self.fetch(id))
    }

    fn save_if_status(
        &self,
        descriptor: &JobDescriptor,
        expected: JobStatus,
    ) -> Result<bool, StoreError> {
        self.block_on(self.compare_and_save(descriptor, expected))
    }

    fn select_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, StoreError> {
        self.block_on(self.fetch_due(now, limit))
    }

    fn list_by_kind(
        &self,
        kind: &str,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobDescriptor>, StoreError> {
        self.block_on(self.fetch_by_kind(kind, statuses))
    }

    fn select_by_status_and_age(
        &self,
        statuses: &[JobStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        self.block_on(self.fetch_stale(statuses, cutoff))
    }

    fn select_ordered_by_last_edited(&self, limit: usize) -> Result<Vec<JobId>, StoreError> {
        self.block_on(self.fetch_oldest(limit))
    }

    fn select_by_status_excluding(
        &self,
        statuses: &[JobStatus],
        exclude: &[JobId],
    ) -> Result<Vec<JobId>, StoreError> {
        self.block_on(self.fetch_excluding(statuses, exclude))
    }

    fn delete_by_ids(&self, ids: &[JobId], statuses: &[JobStatus]) -> Result<u64, StoreError> {
        self.block_on(self.delete_batch(ids, statuses))
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        self.block_on(self.count_by_status())
    }
}

fn descriptor_from_row(row: &PgRow) -> Result<JobDescriptor, StoreError> {
    let status: String = row.try_get("status").map_err(row_error)?;
    let mode: String = row.try_get("mode").map_err(row_error)?;
    let Json(messages): Json<Vec<String>> = row.try_get("messages").map_err(row_error)?;
    let total_steps: i32 = row.try_get("total_steps").map_err(row_error)?;
    let current_step: i32 = row.try_get("current_step").map_err(row_error)?;

    let record = DescriptorRecord {
        id: JobId::from_uuid(row.try_get("id").map_err(row_error)?),
        kind: row.try_get("kind").map_err(row_error)?,
        title: row.try_get("title").map_err(row_error)?,
        status: status
            .parse()
            .map_err(|e: jobqueue_core::QueueError| StoreError::backend(e.to_string()))?,
        mode: mode
            .parse()
            .map_err(|e: jobqueue_core::QueueError| StoreError::backend(e.to_string()))?,
        payload: row.try_get("payload").map_err(row_error)?,
        scheduled_start: row.try_get("scheduled_start").map_err(row_error)?,
        created_at: row.try_get("created_at").map_err(row_error)?,
        last_edited: row.try_get("last_edited").map_err(row_error)?,
        messages,
        total_steps: u32::try_from(total_steps).unwrap_or(0),
        current_step: u32::try_from(current_step).unwrap_or(0),
    };
    Ok(JobDescriptor::from_record(record))
}

fn status_names(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn uuids(ids: &[JobId]) -> Vec<Uuid> {
    ids.iter().map(|id| *id.as_uuid()).collect()
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn to_i32(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::backend(format!("step count {value} out of range")))
}

fn row_error(err: sqlx::Error) -> StoreError {
    StoreError::backend(format!("failed to decode job descriptor row: {err}"))
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::backend(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StoreError::backend(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::backend(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_match_stored_text() {
        assert_eq!(
            status_names(&JobStatus::CLAIMABLE),
            vec!["New".to_string(), "Waiting".to_string()]
        );
    }

    #[test]
    fn limits_saturate() {
        assert_eq!(to_limit(10), 10);
        assert!(to_i32(u32::MAX).is_err());
    }

    #[test]
    fn pool_closed_is_a_backend_error() {
        let err = map_sqlx_error("get", sqlx::Error::PoolClosed);
        assert_eq!(err, StoreError::backend("connection pool closed in get"));
    }
}
