use crate::job::JobState;
use thiserror::Error;

/// Stable machine-readable error codes carried in API error bodies.
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const SUBMISSION_REJECTED: &str = "submission_rejected";
    pub const ORCHESTRATOR_TIMEOUT: &str = "orchestrator_timeout";
    pub const ORCHESTRATOR_UNAVAILABLE: &str = "orchestrator_unavailable";
    pub const JOB_NOT_FOUND: &str = "job_not_found";
    pub const JOB_NOT_READY: &str = "job_not_ready";
    pub const OUTPUT_MISSING: &str = "output_missing";
    pub const JOB_LOST: &str = "job_lost";
    pub const JOB_TIMEOUT: &str = "job_timeout";
    pub const JOB_FAILED: &str = "job_failed";
    pub const CONFLICT: &str = "conflict";
    pub const INTERNAL: &str = "internal";
}

/// A malformed processing request. Raised before any orchestrator call.
/// Maps to **HTTP 400 Bad Request**.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("input_file is required")]
    MissingInput,

    #[error("input_file '{path}' must resolve inside {root}")]
    OutsideDataRoot { path: String, root: String },

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ValidationError {
    pub fn field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Server configuration that cannot produce a job manifest.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OrchestratorError {
    /// The orchestrator refused to create or modify the job
    /// (admission control, quota exceeded, invalid manifest, forbidden image).
    /// Maps to the orchestrator's status code when it is a 4xx, otherwise **HTTP 502 Bad Gateway**.
    #[error("Orchestrator rejected the request ({code} {reason}): {message}")]
    Rejected {
        code: u16,
        reason: String,
        message: String,
    },

    /// The job does not exist on the orchestrator.
    /// Maps to **HTTP 404 Not Found**.
    #[error("Job {0} not found on the orchestrator")]
    NotFound(String),

    /// The call did not complete within its bounded timeout. Retryable.
    /// Maps to **HTTP 504 Gateway Timeout**.
    #[error("Orchestrator call timed out: {0}")]
    Timeout(String),

    /// Network or control-plane failure. Retryable.
    /// Maps to **HTTP 502 Bad Gateway**.
    #[error("Orchestrator unavailable: {0}")]
    Unavailable(String),

    /// The backend does not support this feature.
    /// Maps to **HTTP 501 Not Implemented**.
    #[error("Feature not supported: {0}")]
    Unsupported(String),
}

impl OrchestratorError {
    /// Timeouts and transport failures may succeed on the next attempt;
    /// definitive answers from the orchestrator will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => codes::SUBMISSION_REJECTED,
            Self::NotFound(_) => codes::JOB_NOT_FOUND,
            Self::Timeout(_) => codes::ORCHESTRATOR_TIMEOUT,
            Self::Unavailable(_) | Self::Unsupported(_) => codes::ORCHESTRATOR_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    /// Maps to **HTTP 400 Bad Request**.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The orchestrator did not accept the job. The record is kept in `SubmitFailed`.
    /// Maps to the status derived from the inner [`OrchestratorError`].
    #[error("Submission of job {job_name} failed: {source}")]
    Submission {
        job_name: String,
        #[source]
        source: OrchestratorError,
    },

    /// Maps to **HTTP 404 Not Found**.
    #[error("Job {0} not found")]
    NotFound(String),

    /// Output requested before the job succeeded.
    /// Maps to **HTTP 409 Conflict**.
    #[error("Job {job_name} is {state}; output is only available once it succeeded")]
    NotReady { job_name: String, state: JobState },

    /// The job succeeded but its output file is absent (volume desync).
    /// Maps to **HTTP 500 Internal Server Error**.
    #[error("Output of job {job_name} is missing: {detail}")]
    OutputMissing { job_name: String, detail: String },

    /// The registry refused a lifecycle transition.
    /// Maps to **HTTP 409 Conflict**.
    #[error("Job {job_name} cannot move from {from} to {to}")]
    InvalidTransition {
        job_name: String,
        from: JobState,
        to: JobState,
    },

    /// Maps to **HTTP 409 Conflict**.
    #[error("Job {0} already exists")]
    AlreadyExists(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// Maps to **HTTP 500 Internal Server Error**.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Maps to **HTTP 500 Internal Server Error**.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => codes::VALIDATION_FAILED,
            Self::Submission { source, .. } => source.code(),
            Self::NotFound(_) => codes::JOB_NOT_FOUND,
            Self::NotReady { .. } => codes::JOB_NOT_READY,
            Self::InvalidTransition { .. } | Self::AlreadyExists(_) => codes::CONFLICT,
            Self::OutputMissing { .. } => codes::OUTPUT_MISSING,
            Self::Orchestrator(err) => err.code(),
            Self::Config(_) | Self::Io(_) => codes::INTERNAL,
        }
    }
}
