//! Postgres-backed job store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Other | N/A | `Storage` |
//! | Row decoding | N/A | `Serialization` |
//!
//! Guarded updates lock the row (`SELECT ... FOR UPDATE`) inside a transaction,
//! check the expected status and write back the whole mutable state.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;
use uuid::Uuid;

use coursegen_core::{CourseId, UserId};

use super::store::{JobFilter, JobOrder, JobPage, JobStore, JobStoreError, JobUpdate};
use super::types::{Job, JobId, JsonMap, Priority};

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id            UUID PRIMARY KEY,
        user_id       TEXT NOT NULL,
        type          TEXT NOT NULL,
        status        TEXT NOT NULL,
        progress      SMALLINT NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
        priority      SMALLINT NOT NULL DEFAULT 2 CHECK (priority BETWEEN 1 AND 4),
        payload       JSONB NOT NULL DEFAULT '{}'::jsonb,
        result        JSONB,
        error         TEXT,
        course_id     TEXT,
        created_at    TIMESTAMPTZ NOT NULL,
        updated_at    TIMESTAMPTZ NOT NULL,
        started_at    TIMESTAMPTZ,
        completed_at  TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS jobs_status_created_idx ON jobs (status, created_at)",
    "CREATE INDEX IF NOT EXISTS jobs_user_created_idx ON jobs (user_id, created_at)",
    "CREATE INDEX IF NOT EXISTS jobs_course_idx ON jobs (course_id)",
];

const COLUMNS: &str = "id, user_id, type, status, progress, priority, payload, result, error, \
                       course_id, created_at, updated_at, started_at, completed_at";

/// Job store persisting rows in a Postgres `jobs` table.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `jobs` table and its indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        let query = format!(
            "INSERT INTO jobs ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        );
        sqlx::query(&query)
            .bind(job.id.as_uuid())
            .bind(job.user_id.as_str())
            .bind(job.kind.as_str())
            .bind(job.status.as_str())
            .bind(i16::from(job.progress))
            .bind(i16::from(job.priority.level()))
            .bind(Value::Object(job.payload.clone()))
            .bind(job.result.clone().map(Value::Object))
            .bind(job.error.as_deref())
            .bind(job.course_id.as_ref().map(CourseId::as_str))
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| match map_sqlx_error("create", e) {
                JobStoreError::AlreadyExists(_) => JobStoreError::AlreadyExists(job.id),
                other => other,
            })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?
            .ok_or(JobStoreError::NotFound(id))?;
        job_from_row(&row)
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> Result<JobPage, JobStoreError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM jobs");
        push_filter(&mut count, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM jobs"));
        push_filter(&mut select, filter);
        select.push(match filter.order {
            JobOrder::NewestFirst => " ORDER BY created_at DESC, id DESC",
            JobOrder::OldestFirst => " ORDER BY created_at ASC, id ASC",
        });
        select
            .push(" LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .push(" OFFSET ")
            .push_bind(i64::try_from(offset).unwrap_or(i64::MAX));

        let rows = select
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;
        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;

        Ok(JobPage {
            jobs,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }

    #[instrument(skip(self, update), err)]
    async fn update(&self, id: JobId, update: JobUpdate) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("update", e))?;

        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update", e))?
            .ok_or(JobStoreError::NotFound(id))?;
        let mut job = job_from_row(&row)?;

        update.check(&job)?;
        update.apply_to(&mut job, Utc::now());

        sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2,
                progress = $3,
                result = $4,
                error = $5,
                course_id = $6,
                started_at = $7,
                completed_at = $8,
                updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(job.status.as_str())
        .bind(i16::from(job.progress))
        .bind(job.result.clone().map(Value::Object))
        .bind(job.error.as_deref())
        .bind(job.course_id.as_ref().map(CourseId::as_str))
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("update", e))?;
        Ok(job)
    }
}

fn push_filter<'a>(qb: &mut QueryBuilder<'a, Postgres>, filter: &'a JobFilter) {
    qb.push(" WHERE TRUE");
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(user_id) = &filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id.as_str());
    }
    if let Some(course_id) = &filter.course_id {
        qb.push(" AND course_id = ").push_bind(course_id.as_str());
    }
    if let Some(kind) = &filter.kind {
        qb.push(" AND type = ").push_bind(kind.as_str());
    }
    if let Some((created_at, id)) = filter.after {
        qb.push(" AND (created_at, id) > (")
            .push_bind(created_at)
            .push(", ")
            .push_bind(*id.as_uuid())
            .push(")");
    }
}

/// Raw `jobs` row before domain validation.
#[derive(Debug, Clone)]
struct JobRow {
    id: Uuid,
    user_id: String,
    kind: String,
    status: String,
    progress: i16,
    priority: i16,
    payload: Value,
    result: Option<Value>,
    error: Option<String>,
    course_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            kind: row.try_get("type")?,
            status: row.try_get("status")?,
            progress: row.try_get("progress")?,
            priority: row.try_get("priority")?,
            payload: row.try_get("payload")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            course_id: row.try_get("course_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let row = <JobRow as sqlx::FromRow<_>>::from_row(row)
        .map_err(|e| JobStoreError::Serialization(format!("failed to decode job row: {e}")))?;
    Job::try_from(row)
}

fn json_object(value: Value, column: &str) -> Result<JsonMap, JobStoreError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(JobStoreError::Serialization(format!(
            "{column} must be a JSON object, got {other}"
        ))),
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let invalid = |e: coursegen_core::DomainError| JobStoreError::Serialization(e.to_string());

        Ok(Job {
            id: JobId::from_uuid(row.id),
            user_id: UserId::new(row.user_id).map_err(invalid)?,
            kind: row.kind.parse().map_err(invalid)?,
            status: row.status.parse().map_err(invalid)?,
            progress: u8::try_from(row.progress)
                .ok()
                .filter(|p| *p <= 100)
                .ok_or_else(|| {
                    JobStoreError::Serialization(format!("progress out of range: {}", row.progress))
                })?,
            priority: Priority::from_level(i64::from(row.priority)).map_err(invalid)?,
            payload: json_object(row.payload, "payload")?,
            result: row.result.map(|v| json_object(v, "result")).transpose()?,
            error: row.error,
            course_id: row.course_id.map(CourseId::new).transpose().map_err(invalid)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// Map SQLx errors to `JobStoreError`.
///
/// The `AlreadyExists` id is filled in by the caller, which knows it.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some("23505") {
                JobStoreError::AlreadyExists(JobId::from_uuid(Uuid::nil()))
            } else {
                JobStoreError::Storage(format!(
                    "database error in {operation}: {}",
                    db_err.message()
                ))
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            JobStoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobKind, JobStatus};
    use serde_json::json;

    fn row() -> JobRow {
        let now = Utc::now();
        JobRow {
            id: Uuid::now_v7(),
            user_id: "user-1".into(),
            kind: "audio_generation".into(),
            status: "running".into(),
            progress: 40,
            priority: 3,
            payload: json!({"text": "hi"}),
            result: None,
            error: None,
            course_id: Some("course-1".into()),
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            completed_at: None,
        }
    }

    #[test]
    fn row_converts_to_job() {
        let job = Job::try_from(row()).unwrap();
        assert_eq!(job.kind, JobKind::AudioGeneration);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.progress, 40);
        assert_eq!(job.payload["text"], "hi");
        assert_eq!(job.course_id.unwrap().as_str(), "course-1");
    }

    #[test]
    fn malformed_rows_are_serialization_errors() {
        let mut bad_status = row();
        bad_status.status = "paused".into();
        assert!(matches!(
            Job::try_from(bad_status),
            Err(JobStoreError::Serialization(_))
        ));

        let mut bad_progress = row();
        bad_progress.progress = 150;
        assert!(matches!(
            Job::try_from(bad_progress),
            Err(JobStoreError::Serialization(_))
        ));

        let mut bad_payload = row();
        bad_payload.payload = json!([1, 2]);
        assert!(matches!(
            Job::try_from(bad_payload),
            Err(JobStoreError::Serialization(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a disposable Postgres database"]
    async fn postgres_guarded_update() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let pool = PgPool::connect(&url).await.unwrap();
        let store = PostgresJobStore::new(pool);
        store.ensure_schema().await.unwrap();

        let job = Job::new(
            JobKind::AudioGeneration,
            UserId::new("pg-user").unwrap(),
            JsonMap::new(),
            Priority::Normal,
        );
        store.create(&job).await.unwrap();
        assert!(matches!(
            store.create(&job).await,
            Err(JobStoreError::AlreadyExists(id)) if id == job.id
        ));

        let err = store
            .update(
                job.id,
                JobUpdate::new()
                    .status(JobStatus::Completed)
                    .expect_status(&[JobStatus::Running]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::StatusMismatch { .. }));

        let claimed = store
            .update(
                job.id,
                JobUpdate::new()
                    .status(JobStatus::Running)
                    .expect_status(&[JobStatus::Pending]),
            )
            .await
            .unwrap();
        assert_eq!(claimed.status, JobStatus::Running);

        let page = store
            .list(&JobFilter::new().with_user(UserId::new("pg-user").unwrap()), 10, 0)
            .await
            .unwrap();
        assert!(page.jobs.iter().any(|j| j.id == job.id));
    }
}
