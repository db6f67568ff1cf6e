use thiserror::Error;

use vidforge_core::ServiceError;

/// Failure taxonomy for job execution.
///
/// Every failure a handler or the worker can hit maps to exactly one
/// variant; the retry controller classifies variants as retryable or
/// fatal, and `error_type()` is the stable string persisted on the job
/// record for failed jobs.
#[derive(Debug, Error)]
pub enum JobError {
    /// Malformed submission or parameter payload. Fatal.
    #[error("{0}")]
    Validation(String),

    /// Transient provider/network failure (timeouts, 5xx, 429). Retryable.
    #[error("{0}")]
    ProviderTransient(String),

    /// Permanent provider failure: content-policy rejection, auth failure,
    /// malformed provider response. Fatal.
    #[error("{0}")]
    ProviderFatal(String),

    /// Soft or hard execution time limit exceeded. Fatal.
    #[error("{0}")]
    Timeout(String),

    /// Storage backend failure. Retryable: the write may succeed on the
    /// next attempt.
    #[error("{0}")]
    Storage(String),

    /// Cooperative cancellation observed at a suspension point. Not a
    /// failure; the worker transitions the job to `cancelled`.
    #[error("cancellation requested")]
    Cancelled,

    /// A conditional update lost its race. The current worker must stop
    /// advancing this job; never surfaced as a job failure.
    #[error("{0}")]
    Conflict(String),
}

impl JobError {
    /// Stable string recorded in the job row's `error_type` column.
    pub fn error_type(&self) -> &'static str {
        match self {
            JobError::Validation(_) => "validation_error",
            JobError::ProviderTransient(_) => "provider_transient_error",
            JobError::ProviderFatal(_) => "provider_fatal_error",
            JobError::Timeout(_) => "timeout_error",
            JobError::Storage(_) => "storage_error",
            JobError::Cancelled => "cancelled",
            JobError::Conflict(_) => "conflict",
        }
    }
}

impl From<ServiceError> for JobError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Conflict(msg) => JobError::Conflict(msg),
            // A job row vanishing mid-run means someone else owns its fate.
            ServiceError::NotFound(msg) => JobError::Conflict(msg),
            ServiceError::Validation(msg) => JobError::Validation(msg),
            ServiceError::Storage(msg)
            | ServiceError::Unavailable(msg)
            | ServiceError::Internal(msg) => JobError::Storage(msg),
        }
    }
}
