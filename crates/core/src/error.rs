//! Queue error model.

use thiserror::Error;

use crate::id::JobId;
use crate::status::JobStatus;

/// Result type used across the queue.
pub type QueueResult<T> = Result<T, QueueError>;

/// Failure reported by a job descriptor store.
///
/// Stores translate their backend errors into this shape so callers never see
/// driver types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("storage error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// Queue-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A configuration value was not recognised (e.g. an unknown cleanup method).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The requested status change is not an edge of the lifecycle.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// The descriptor already reached Complete, Broken or Cancelled.
    #[error("job {id} is already terminal ({status})")]
    AlreadyTerminal { id: JobId, status: JobStatus },

    /// Another runner claimed the descriptor first.
    #[error("job {id} is already claimed ({status})")]
    Contention { id: JobId, status: JobStatus },

    #[error("job not found: {0}")]
    NotFound(JobId),

    /// No job logic is registered under this kind.
    #[error("unknown job kind: {0}")]
    UnknownJobKind(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    /// Job logic failed. Contained to the descriptor, which is marked Broken.
    #[error("job execution failed: {0}")]
    JobExecution(String),
}

impl QueueError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn job_execution(msg: impl Into<String>) -> Self {
        Self::JobExecution(msg.into())
    }

    /// True for the errors a worker expects when racing other workers.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention { .. } | Self::AlreadyTerminal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_convert() {
        let err: QueueError = StoreError::backend("connection reset").into();
        assert_eq!(err.to_string(), "storage error: connection reset");
    }

    #[test]
    fn contention_covers_lost_races_only() {
        let id = JobId::new();
        assert!(QueueError::Contention { id, status: JobStatus::Running }.is_contention());
        assert!(QueueError::AlreadyTerminal { id, status: JobStatus::Complete }.is_contention());
        assert!(!QueueError::NotFound(id).is_contention());
    }
}
