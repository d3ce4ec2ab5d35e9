//! Engine error taxonomy.

use coursegen_core::DomainError;

use super::store::JobStoreError;
use super::types::JobId;

/// Errors returned by [`JobEngine`](super::JobEngine) operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid input (progress out of range, blank job type).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown job ID.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The job's current status does not allow the operation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The job was persisted as pending but the dispatch queue was full.
    ///
    /// The job is accepted but not yet scheduled; a recovery pass picks it up.
    #[error("job queue is full; job {job_id} stays pending until the next recovery pass")]
    QueueFull { job_id: JobId },

    #[error("job queue is already running")]
    AlreadyRunning,

    #[error("job queue is not running")]
    NotRunning,

    /// Store failure (infrastructure).
    #[error(transparent)]
    Store(JobStoreError),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

impl From<JobStoreError> for EngineError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => EngineError::NotFound(id),
            JobStoreError::StatusMismatch { id, actual } => {
                EngineError::Conflict(format!("job {id} is {actual}"))
            }
            JobStoreError::ResultAlreadySet(id) => {
                EngineError::Conflict(format!("job {id} already has a result"))
            }
            other => EngineError::Store(other),
        }
    }
}

impl From<DomainError> for EngineError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => EngineError::Validation(msg),
            DomainError::Conflict(msg) => EngineError::Conflict(msg),
            other => EngineError::Validation(other.to_string()),
        }
    }
}

impl From<EngineError> for DomainError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(msg) => DomainError::Validation(msg),
            EngineError::NotFound(id) => DomainError::NotFound(format!("job {id}")),
            EngineError::Conflict(msg) => DomainError::Conflict(msg),
            e @ (EngineError::AlreadyRunning | EngineError::NotRunning) => {
                DomainError::Conflict(e.to_string())
            }
            e @ (EngineError::QueueFull { .. } | EngineError::Store(_)) => {
                DomainError::Unavailable(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobStatus;

    #[test]
    fn store_errors_map_onto_taxonomy() {
        let id = JobId::new();
        assert!(matches!(
            EngineError::from(JobStoreError::NotFound(id)),
            EngineError::NotFound(x) if x == id
        ));
        assert!(matches!(
            EngineError::from(JobStoreError::StatusMismatch { id, actual: JobStatus::Completed }),
            EngineError::Conflict(_)
        ));
        assert!(matches!(
            EngineError::from(JobStoreError::Storage("down".into())),
            EngineError::Store(_)
        ));
    }

    #[test]
    fn engine_errors_map_to_domain_errors() {
        let id = JobId::new();
        assert_eq!(
            DomainError::from(EngineError::NotFound(id)).code(),
            "not_found"
        );
        assert_eq!(
            DomainError::from(EngineError::QueueFull { job_id: id }).code(),
            "unavailable"
        );
        assert_eq!(
            DomainError::from(EngineError::validation("progress")).code(),
            "validation_error"
        );
    }
}
