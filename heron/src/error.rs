use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobState};

/// Error codes recorded on jobs and surfaced to API consumers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    DependencyFailed,
    Timeout,
    Cancelled,
    InvalidState,
    ExecutionFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "ValidationError",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::DependencyFailed => "DependencyFailed",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::Cancelled => "Cancelled",
            ErrorCode::InvalidState => "InvalidState",
            ErrorCode::ExecutionFailed => "ExecutionFailed",
        }
    }

    /// Codes that describe a permanent condition; jobs failing with these
    /// are never put back on the queue automatically.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ErrorCode::ValidationError
                | ErrorCode::NotFound
                | ErrorCode::DependencyFailed
                | ErrorCode::Cancelled
        )
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the job store and the runtime API.
#[derive(Debug, thiserror::Error)]
pub enum JobsError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("job {job} depends on job {dependency} which ended {state}")]
    DependencyFailed {
        job: JobId,
        dependency: JobId,
        state: JobState,
    },

    #[error("job {0} exceeded its {1}s timeout")]
    Timeout(JobId, u64),

    #[error("job {0} was cancelled")]
    Cancelled(JobId),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl JobsError {
    pub fn job_not_found(id: JobId) -> Self {
        JobsError::NotFound(format!("job {id}"))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            JobsError::Validation(_) => ErrorCode::ValidationError,
            JobsError::NotFound(_) => ErrorCode::NotFound,
            JobsError::DependencyFailed { .. } => ErrorCode::DependencyFailed,
            JobsError::Timeout(..) => ErrorCode::Timeout,
            JobsError::Cancelled(_) => ErrorCode::Cancelled,
            JobsError::InvalidTransition { .. } => ErrorCode::InvalidState,
            JobsError::Store(_) => ErrorCode::ExecutionFailed,
        }
    }

    /// Recover the typed error from a handler's `anyhow::Error`, if it was one.
    pub fn from_handler_error(err: &anyhow::Error) -> Option<&JobsError> {
        err.downcast_ref::<JobsError>()
    }
}

impl From<serde_json::Error> for JobsError {
    fn from(value: serde_json::Error) -> Self {
        JobsError::Validation(format!("invalid payload: {value}"))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for JobsError {
    fn from(value: sqlx::Error) -> Self {
        JobsError::Store(value.into())
    }
}

pub type JobsResult<T> = std::result::Result<T, JobsError>;

/// Result alias defaulting to [`JobsError`].
pub type Result<T, E = JobsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_map_from_errors() {
        let id = JobId(7);
        assert_eq!(JobsError::Cancelled(id).code(), ErrorCode::Cancelled);
        assert_eq!(JobsError::Timeout(id, 1).code(), ErrorCode::Timeout);
        assert_eq!(
            JobsError::Validation("x".into()).code(),
            ErrorCode::ValidationError
        );
        assert_eq!(
            JobsError::from(anyhow::anyhow!("db down")).code(),
            ErrorCode::ExecutionFailed
        );
    }

    #[test]
    fn test_handler_error_roundtrips_through_anyhow() {
        let err: anyhow::Error = JobsError::Cancelled(JobId(3)).into();
        let typed = JobsError::from_handler_error(&err).unwrap();
        assert!(matches!(typed, JobsError::Cancelled(JobId(3))));

        let plain = anyhow::anyhow!("boom");
        assert!(JobsError::from_handler_error(&plain).is_none());
    }

    #[test]
    fn test_permanent_codes() {
        assert!(ErrorCode::DependencyFailed.is_permanent());
        assert!(ErrorCode::Cancelled.is_permanent());
        assert!(!ErrorCode::Timeout.is_permanent());
        assert!(!ErrorCode::ExecutionFailed.is_permanent());
    }
}
