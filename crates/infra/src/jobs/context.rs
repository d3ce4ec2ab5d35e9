//! Per-job execution context handed to handlers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use coursegen_core::{CourseId, UserId};

use super::engine::EngineShared;
use super::error::EngineError;
use super::types::{Job, JobId, JobKind, JsonMap};

/// Returned by handlers that stop early because their job was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("job {0} was cancelled")]
pub struct JobCancelled(pub JobId);

/// What a handler sees of its job and of the engine.
///
/// The job is an immutable snapshot taken when the worker claimed it; writes go
/// back through the engine.
#[derive(Clone)]
pub struct JobContext {
    job: Arc<Job>,
    token: CancellationToken,
    shared: Arc<EngineShared>,
}

impl JobContext {
    pub(crate) fn new(job: Job, token: CancellationToken, shared: Arc<EngineShared>) -> Self {
        Self {
            job: Arc::new(job),
            token,
            shared,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn kind(&self) -> &JobKind {
        &self.job.kind
    }

    pub fn user_id(&self) -> &UserId {
        &self.job.user_id
    }

    pub fn payload(&self) -> &JsonMap {
        &self.job.payload
    }

    /// Fires when the job is cancelled or the engine shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Error out with [`JobCancelled`] if the job has been cancelled.
    pub fn ensure_active(&self) -> Result<(), JobCancelled> {
        if self.token.is_cancelled() {
            Err(JobCancelled(self.job.id))
        } else {
            Ok(())
        }
    }

    /// Persist progress, surfacing validation and store errors.
    pub async fn update_progress(&self, progress: i64) -> Result<(), EngineError> {
        self.shared.update_progress(self.job.id, progress).await?;
        Ok(())
    }

    /// Persist progress; failures are logged and otherwise ignored.
    pub async fn report_progress(&self, progress: u8) {
        if let Err(e) = self.update_progress(i64::from(progress)).await {
            tracing::warn!(job_id = %self.job.id, progress, error = %e, "failed to record job progress");
        }
    }

    /// Store the job's result. Only accepted while the job is running.
    pub async fn report_result(&self, result: JsonMap) -> Result<(), EngineError> {
        self.shared.update_result(self.job.id, result).await?;
        Ok(())
    }

    /// Link the job to the course it works on or produced.
    pub async fn set_course(&self, course_id: CourseId) -> Result<(), EngineError> {
        self.shared.set_course(self.job.id, course_id).await?;
        Ok(())
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("kind", &self.job.kind)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
