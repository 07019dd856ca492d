use thiserror::Error;

use inferlink_core::{HashError, JobId};

use crate::job::JobStatus;
use crate::store::JobStoreError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LifecycleError {
    /// The job is not in a state this operation may start from.
    #[error("job {job_id}: cannot {operation} from {from}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        operation: &'static str,
    },

    /// The external job id is write-once.
    #[error("job {job_id}: external job id already set to a different value")]
    ExternalIdConflict { job_id: JobId },

    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Timeout requested for a job still inside its age window.
    #[error("job {0} has not exceeded the absolute timeout")]
    NotExpired(JobId),

    #[error("hashing failed: {0}")]
    Hash(#[from] HashError),

    /// Downstream persistence refused the result; nothing was committed.
    #[error("side effect failed: {0}")]
    SideEffect(String),

    /// Event publication failed; nothing was committed.
    #[error("event publish failed: {0}")]
    Publish(String),

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl LifecycleError {
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, LifecycleError::InvalidTransition { .. })
    }
}
