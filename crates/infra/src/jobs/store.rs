//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use coursegen_core::{CourseId, UserId};

use super::types::{Job, JobId, JobKind, JobStatus, JsonMap};

/// Durable storage for job rows.
///
/// There is no transaction spanning the store and the in-memory dispatch
/// queue; the engine relies on status-guarded updates instead.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a new job. Must succeed before the job counts as admitted.
    async fn create(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Job, JobStoreError>;

    /// List jobs matching `filter`, with the total number of matches.
    async fn list(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> Result<JobPage, JobStoreError>;

    /// Apply a partial update and return the updated job.
    ///
    /// `updated_at` is always stamped. When the update carries a status guard
    /// and the stored status is not one of the expected ones, nothing is
    /// written and `StatusMismatch` is returned.
    async fn update(&self, id: JobId, update: JobUpdate) -> Result<Job, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id} is {actual}")]
    StatusMismatch { id: JobId, actual: JobStatus },
    #[error("job {0} already has a result")]
    ResultAlreadySet(JobId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Listing order by creation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobOrder {
    /// Most recent first (user-facing listings).
    #[default]
    NewestFirst,
    /// Oldest first (recovery replays in arrival order).
    OldestFirst,
}

/// Filter for [`JobStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub user_id: Option<UserId>,
    pub course_id: Option<CourseId>,
    pub kind: Option<JobKind>,
    /// Keyset cursor: only jobs strictly after this `(created_at, id)`.
    pub after: Option<(DateTime<Utc>, JobId)>,
    pub order: JobOrder,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_course(mut self, course_id: CourseId) -> Self {
        self.course_id = Some(course_id);
        self
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Resume an oldest-first scan after the last job already seen.
    pub fn after(mut self, created_at: DateTime<Utc>, id: JobId) -> Self {
        self.after = Some((created_at, id));
        self
    }

    pub fn oldest_first(mut self) -> Self {
        self.order = JobOrder::OldestFirst;
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.user_id.as_ref().is_none_or(|u| &job.user_id == u)
            && self
                .course_id
                .as_ref()
                .is_none_or(|c| job.course_id.as_ref() == Some(c))
            && self.kind.as_ref().is_none_or(|k| &job.kind == k)
            && self.after.is_none_or(|cursor| (job.created_at, job.id) > cursor)
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Number of matching jobs across all pages.
    pub total: u64,
}

/// Partial update of a job row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    /// `Some(None)` clears the stored result.
    pub result: Option<Option<JsonMap>>,
    /// `Some(None)` clears the stored error.
    pub error: Option<Option<String>>,
    pub course_id: Option<CourseId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Only apply when the stored status is one of these.
    pub expected_status: Option<Vec<JobStatus>>,
    /// Only apply when no result is stored yet.
    pub expect_no_result: bool,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn result(mut self, result: JsonMap) -> Self {
        self.result = Some(Some(result));
        self
    }

    pub fn clear_result(mut self) -> Self {
        self.result = Some(None);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn course_id(mut self, course_id: CourseId) -> Self {
        self.course_id = Some(course_id);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn expect_status(mut self, statuses: &[JobStatus]) -> Self {
        self.expected_status = Some(statuses.to_vec());
        self
    }

    pub fn expect_no_result(mut self) -> Self {
        self.expect_no_result = true;
        self
    }

    /// Check the guards against the stored job.
    pub fn check(&self, job: &Job) -> Result<(), JobStoreError> {
        if let Some(expected) = &self.expected_status {
            if !expected.contains(&job.status) {
                return Err(JobStoreError::StatusMismatch {
                    id: job.id,
                    actual: job.status,
                });
            }
        }
        if self.expect_no_result && job.result.is_some() {
            return Err(JobStoreError::ResultAlreadySet(job.id));
        }
        Ok(())
    }

    /// Apply the set fields to `job`, stamping `updated_at` with `now`.
    pub fn apply_to(&self, job: &mut Job, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(progress) = self.progress {
            job.progress = progress;
        }
        if let Some(result) = &self.result {
            job.result = result.clone();
        }
        if let Some(error) = &self.error {
            job.error = error.clone();
        }
        if let Some(course_id) = &self.course_id {
            job.course_id = Some(course_id.clone());
        }
        if let Some(at) = self.started_at {
            job.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            job.completed_at = Some(at);
        }
        job.updated_at = now;
    }
}

/// Sort, count and page an already-filtered set of jobs.
pub(crate) fn paginate(mut jobs: Vec<Job>, order: JobOrder, limit: usize, offset: usize) -> JobPage {
    jobs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
    if order == JobOrder::NewestFirst {
        jobs.reverse();
    }
    let total = jobs.len() as u64;
    let jobs = jobs.into_iter().skip(offset).take(limit).collect();
    JobPage { jobs, total }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(JobStoreError::NotFound(id))
    }

    async fn list(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> Result<JobPage, JobStoreError> {
        let jobs = self.jobs.read().await;
        let matching: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        Ok(paginate(matching, filter.order, limit, offset))
    }

    async fn update(&self, id: JobId, update: JobUpdate) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        update.check(job)?;
        update.apply_to(job, Utc::now());
        Ok(job.clone())
    }
}
