use crate::error::OrchestratorError;
use crate::job::{Condition, Deletion, JobSummary, LogOutput};
use crate::manifest::JobSpec;

use futures::stream::BoxStream;

pub type LogStream = BoxStream<'static, Result<LogOutput, OrchestratorError>>;

/// A thin adapter over a cluster control plane.
///
/// Implementations translate between [`JobSpec`]/[`Condition`] and the
/// orchestrator's wire types and nothing else. Callers bound every call with
/// their own timeout and treat [`OrchestratorError::Timeout`] as retryable.
pub trait Orchestrator: Send + Sync + 'static + Clone {
    /// Checks that the control plane is reachable.
    fn init(&self) -> impl Future<Output = Result<(), OrchestratorError>> + Send {
        async { Ok(()) }
    }

    /// Creates the job and returns its name on the orchestrator.
    fn submit(&self, spec: &JobSpec)
    -> impl Future<Output = Result<String, OrchestratorError>> + Send;

    /// Returns the current condition, or [`OrchestratorError::NotFound`].
    fn get_status(
        &self,
        job_name: &str,
    ) -> impl Future<Output = Result<Condition, OrchestratorError>> + Send;

    /// Returns the container output of the job.
    fn get_logs(
        &self,
        job_name: &str,
    ) -> impl Future<Output = Result<LogStream, OrchestratorError>> + Send;

    /// Deletes the job and its pods. Deleting an absent job is not an error.
    fn delete(
        &self,
        job_name: &str,
    ) -> impl Future<Output = Result<Deletion, OrchestratorError>> + Send;

    /// Lists every job carrying the managed-by label.
    fn list(&self) -> impl Future<Output = Result<Vec<JobSummary>, OrchestratorError>> + Send {
        async {
            Err(OrchestratorError::Unsupported(
                "Listing jobs is not supported by this orchestrator".into(),
            ))
        }
    }
}
