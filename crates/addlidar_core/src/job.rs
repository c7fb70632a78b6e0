use crate::error::{JobError, OrchestratorError};
use crate::request::ProcessingRequest;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a job as tracked by this process.
///
/// `Created -> Submitting -> (Running | SubmitFailed) -> (Succeeded | Failed | Lost) -> Reaped`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    Created,
    Submitting,
    Running,
    /// The orchestrator refused the job, it never ran.
    SubmitFailed,
    Succeeded,
    Failed,
    /// The orchestrator no longer knows the job.
    Lost,
    Reaped,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::SubmitFailed | Self::Succeeded | Self::Failed | Self::Lost | Self::Reaped
        )
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Reaped, _) => false,
            (_, Reaped) => true,
            (Created, Submitting) => true,
            (Submitting, Running | SubmitFailed) => true,
            (Running, Running | Succeeded | Failed | Lost) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Coarse phase pushed to subscribers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Lost,
    Unknown,
}

impl Phase {
    /// Progress ordering: `Pending <= Running <= terminal`.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending | Self::Unknown => 0,
            Self::Running => 1,
            Self::Succeeded | Self::Failed | Self::Lost => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The orchestrator's current view of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub phase: Phase,
    pub message: String,
}

impl Condition {
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
        }
    }
}

/// A structured error with a stable code, never interpolated into identifiers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&JobError> for ErrorDetail {
    fn from(err: &JobError) -> Self {
        let message = match err {
            // The orchestrator's own words, verbatim.
            JobError::Submission {
                source: OrchestratorError::Rejected { message, .. },
                ..
            } => message.clone(),
            _ => err.to_string(),
        };
        Self::new(err.code(), message)
    }
}

/// The unit pushed to status subscribers. Redelivering the same snapshot is harmless.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub job_name: String,
    pub phase: Phase,
    pub state: JobState,
    pub message: String,
    /// RFC3339 time of the change this snapshot describes.
    pub timestamp: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Everything this process knows about one submitted job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub job_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub state: JobState,
    /// Last phase observed on the orchestrator.
    pub phase: Phase,
    pub message: String,
    /// Output file name relative to the output root.
    pub output_file: Option<String>,
    /// [`None`] for records rebuilt from the orchestrator on startup.
    pub request: Option<ProcessingRequest>,
    pub arguments: Vec<String>,
    pub error: Option<ErrorDetail>,
}

impl JobRecord {
    pub fn new(
        job_name: impl Into<String>,
        request: Option<ProcessingRequest>,
        arguments: Vec<String>,
        output_file: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_name: job_name.into(),
            created_at: now,
            updated_at: now,
            finished_at: None,
            downloaded_at: None,
            state: JobState::Created,
            phase: Phase::Pending,
            message: "Job created".to_string(),
            output_file,
            request,
            arguments,
            error: None,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            job_name: self.job_name.clone(),
            phase: self.phase,
            state: self.state,
            message: self.message.clone(),
            timestamp: self.updated_at,
        }
    }

    /// Moves the record to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: Transition) -> Result<(), JobError> {
        if !self.state.can_transition_to(next.state) {
            return Err(JobError::InvalidTransition {
                job_name: self.job_name.clone(),
                from: self.state,
                to: next.state,
            });
        }

        let now = Utc::now();
        if next.state.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
        self.state = next.state;
        if let Some(phase) = next.phase {
            self.phase = phase;
        }
        self.message = next.message;
        if next.error.is_some() {
            self.error = next.error;
        }
        self.updated_at = now;
        Ok(())
    }
}

/// A requested change to a [`JobRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: JobState,
    /// [`None`] keeps the current phase.
    pub phase: Option<Phase>,
    pub message: String,
    pub error: Option<ErrorDetail>,
}

impl Transition {
    pub fn new(state: JobState, message: impl Into<String>) -> Self {
        Self {
            state,
            phase: None,
            message: message.into(),
            error: None,
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_error(mut self, error: ErrorDetail) -> Self {
        self.error = Some(error);
        self
    }
}

/// Response of the submit endpoint, for accepted and refused jobs alike.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitResponse {
    /// [`None`] when the request failed validation and no job was named.
    pub job_name: Option<String>,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// A job found on the orchestrator by label.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub job_name: String,
    pub condition: Condition,
    pub created_at: Option<DateTime<Utc>>,
    pub output_file: Option<String>,
    pub arguments: Vec<String>,
}

/// Outcome of an idempotent delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    Deleted,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LogSource {
    Stdout,
    Stderr,
    Console,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogOutput {
    pub source: LogSource,
    /// RFC3339 timestamp string ,e.g., "2026-01-01T01:00:00Z".
    pub timestamp: Option<String>,
    pub message: String,
}

/// `<prefix>-<10 hex chars>`, valid as a DNS-1123 label for short prefixes.
pub fn generate_job_name(prefix: &str) -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &token[..10])
}

pub fn generate_output_file(extension: &str) -> String {
    format!("output_{}.{extension}", Uuid::new_v4().simple())
}
