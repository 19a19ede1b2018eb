use std::path::PathBuf;

use thiserror::Error;

use crate::models::{JobId, JobStatus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("illegal job transition from {from} to {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl TransitionError {
    pub fn new(from: JobStatus, to: JobStatus) -> Self {
        Self { from, to }
    }
}

/// Errors surfaced synchronously to submitters and status/download callers.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job id {0} has been used before and cannot be reused")]
    DuplicateJobId(JobId),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} is not finished or has no result file")]
    NotReady(JobId),

    #[error("result file {} for job {job_id} not found", .path.display())]
    ResultMissing { job_id: JobId, path: PathBuf },

    #[error("work queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while a worker runs the aggregation pipeline. These never
/// reach a caller directly; their message is recorded on the failed job.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("CSV validation error: missing required columns: {}", .missing.join(", "))]
    SchemaValidation { missing: Vec<String> },

    #[error("CSV validation error: {0}")]
    Unreadable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("processing task aborted: {0}")]
    Aborted(String),

    #[error("{0}")]
    Transient(String),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Validation failures are final; everything else in the convert and
    /// aggregate phase may succeed on another attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            PipelineError::SchemaValidation { .. }
                | PipelineError::Unreadable(_)
                | PipelineError::RetriesExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_error_names_missing_columns() {
        let err = PipelineError::SchemaValidation {
            missing: vec!["Date".into(), "Number of Sales".into()],
        };
        assert_eq!(
            err.to_string(),
            "CSV validation error: missing required columns: Date, Number of Sales"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn test_retries_exhausted_keeps_last_message() {
        let err = PipelineError::RetriesExhausted {
            attempts: 3,
            last: Box::new(PipelineError::Transient("disk full".into())),
        };
        assert_eq!(err.to_string(), "retries exhausted after 3 attempts: disk full");
        assert!(!err.is_transient());
        assert!(PipelineError::Transient("x".into()).is_transient());
    }
}
