use crate::job::JobStage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    Missing,
    TypeError,
    TooOld,
    FutureDated,
    OutOfRange,
    Invalid,
}

impl ValidationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationKind::Missing => "missing",
            ValidationKind::TypeError => "type_error",
            ValidationKind::TooOld => "too_old",
            ValidationKind::FutureDated => "future_dated",
            ValidationKind::OutOfRange => "out_of_range",
            ValidationKind::Invalid => "invalid",
        }
    }
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single record failed normalization. Collected per record, never raised
/// to abort the batch.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("field `{field}` {kind}: {detail}")]
pub struct ValidationError {
    pub field: String,
    pub kind: ValidationKind,
    pub detail: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, kind: ValidationKind, detail: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind,
            detail: detail.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::new(field, ValidationKind::Missing, "required field is absent")
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("result sink unavailable: {0}")]
    Unavailable(String),
    #[error("result sink call timed out after {0:?}")]
    Timeout(Duration),
    #[error("aggregate {metric_name}@{bucket_start} was modified concurrently (expected version {expected})")]
    Conflict {
        metric_name: String,
        bucket_start: DateTime<Utc>,
        expected: u64,
    },
    #[error("result sink error: {0}")]
    Backend(String),
}

impl SinkError {
    /// Transient failures count against the retry budget; everything else is
    /// surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Unavailable(_) | SinkError::Timeout(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            SinkError::Unavailable(_) => "collaborator_unavailable",
            SinkError::Timeout(_) => "collaborator_timeout",
            SinkError::Conflict { .. } => "write_conflict",
            SinkError::Backend(_) => "sink_backend_error",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStage,
        to: JobStage,
    },
    #[error("job {job_id} is already {stage}")]
    Terminal { job_id: String, stage: JobStage },
    #[error("job {0} was cancelled")]
    Cancelled(String),
    #[error("job {0} is already running")]
    Busy(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: JobStage,
        #[source]
        source: SinkError,
    },
    #[error("{stage} worker failed: {message}")]
    Worker { stage: JobStage, message: String },
    #[error("invalid pipeline configuration: {0}")]
    Config(String),
}
