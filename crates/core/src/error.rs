use crate::job::JobStatus;
use crate::types::JobId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Field already set on job {id}: {field}")]
    AlreadySet { id: JobId, field: &'static str },

    #[error("Validation failed: {0}")]
    Validation(String),
}
