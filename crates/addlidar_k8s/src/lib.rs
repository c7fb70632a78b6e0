//! # addlidar Kubernetes Orchestrator
//!
//! Runs jobs as `batch/v1` Jobs in a single namespace.
//!
//! Input and output data live on persistent volume claims mounted into every
//! pod. Finished Jobs are garbage collected by `ttlSecondsAfterFinished` even
//! if the server never reaps them.
//!
//! ## Usage
//!
//! ```no_run
//! # use addlidar_k8s::KubernetesOrchestrator;
//! # async fn run() -> Result<(), addlidar_core::error::OrchestratorError> {
//! let orchestrator = KubernetesOrchestrator::connect("lidar").await?;
//! # Ok(())
//! # }
//! ```

pub mod convert;

use addlidar_core::prelude::*;
use futures::{StreamExt, stream};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::Client;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct KubernetesOrchestrator {
    client: Client,
    namespace: String,
}

impl KubernetesOrchestrator {
    /// Uses the in-cluster service account, or the local kubeconfig.
    pub async fn connect(namespace: impl Into<String>) -> Result<Self, OrchestratorError> {
        let client = Client::try_default()
            .await
            .map_err(|e| OrchestratorError::Unavailable(format!("Failed to load Kubernetes config: {e}")))?;
        Ok(Self::new(client, namespace))
    }

    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn job_pods(&self, job_name: &str) -> Result<Vec<Pod>, OrchestratorError> {
        let params = ListParams::default().labels(&format!("job-name={job_name}"));
        let pods = self.pods().list(&params).await.map_err(map_error)?;
        Ok(pods.items)
    }
}

/// Maps API errors onto [`OrchestratorError`]. 4xx answers are rejections.
fn map_error(err: kube::Error) -> OrchestratorError {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => OrchestratorError::NotFound(response.message),
            408 | 504 => OrchestratorError::Timeout(response.message),
            400..=499 => OrchestratorError::Rejected {
                code: response.code,
                reason: response.reason,
                message: response.message,
            },
            _ => OrchestratorError::Unavailable(format!(
                "{} {}: {}",
                response.code, response.reason, response.message
            )),
        },
        other => OrchestratorError::Unavailable(other.to_string()),
    }
}

/// Maps errors of the create call. A 404 there means a missing namespace,
/// not a missing job, so it is a rejection like any other 4xx.
fn map_submit_error(err: kube::Error) -> OrchestratorError {
    match err {
        kube::Error::Api(response) if response.code == 404 => OrchestratorError::Rejected {
            code: response.code,
            reason: response.reason,
            message: response.message,
        },
        other => map_error(other),
    }
}

impl Orchestrator for KubernetesOrchestrator {
    async fn init(&self) -> Result<(), OrchestratorError> {
        let info = self.client.apiserver_version().await.map_err(map_error)?;
        debug!(version = %info.git_version, namespace = %self.namespace, "Connected to Kubernetes");
        Ok(())
    }

    async fn submit(&self, spec: &JobSpec) -> Result<String, OrchestratorError> {
        if spec.namespace != self.namespace {
            return Err(OrchestratorError::Rejected {
                code: 400,
                reason: "BadRequest".into(),
                message: format!(
                    "job namespace {} differs from orchestrator namespace {}",
                    spec.namespace, self.namespace
                ),
            });
        }

        let job = convert::to_job(spec);
        let created = self
            .jobs()
            .create(&PostParams::default(), &job)
            .await
            .map_err(map_submit_error)?;
        Ok(created.metadata.name.unwrap_or_else(|| spec.job_name.clone()))
    }

    async fn get_status(&self, job_name: &str) -> Result<Condition, OrchestratorError> {
        let job = self.jobs().get(job_name).await.map_err(|e| match map_error(e) {
            OrchestratorError::NotFound(_) => OrchestratorError::NotFound(job_name.to_string()),
            other => other,
        })?;

        // Pods only refine the Job's own status.
        let pods = match self.job_pods(job_name).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(job_name, "Failed to list pods: {e}");
                Vec::new()
            }
        };
        Ok(convert::condition_from(&job, &pods))
    }

    async fn get_logs(&self, job_name: &str) -> Result<LogStream, OrchestratorError> {
        let pods = self.job_pods(job_name).await?;
        let Some(pod_name) = pods.iter().find_map(|p| p.metadata.name.clone()) else {
            return Err(OrchestratorError::NotFound(format!("pods of {job_name}")));
        };

        let params = LogParams {
            container: Some(convert::CONTAINER_NAME.to_string()),
            ..Default::default()
        };
        let logs = self
            .pods()
            .logs(&pod_name, &params)
            .await
            .map_err(map_error)?;

        let lines: Vec<String> = logs.lines().map(|line| format!("{line}\n")).collect();
        let stream = stream::iter(lines).map(|message| {
            Ok(LogOutput {
                source: LogSource::Stdout,
                timestamp: None,
                message,
            })
        });
        Ok(stream.boxed())
    }

    async fn delete(&self, job_name: &str) -> Result<Deletion, OrchestratorError> {
        match self
            .jobs()
            .delete(job_name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(Deletion::Deleted),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(Deletion::NotFound),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn list(&self) -> Result<Vec<JobSummary>, OrchestratorError> {
        let params = ListParams::default().labels(labels::MANAGED_BY_SELECTOR);
        let jobs = self.jobs().list(&params).await.map_err(map_error)?;
        Ok(jobs.items.iter().filter_map(convert::summary_from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} message"),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn api_errors_are_classified() {
        assert!(matches!(
            map_error(api_error(404, "NotFound")),
            OrchestratorError::NotFound(_)
        ));
        assert!(matches!(
            map_error(api_error(403, "Forbidden")),
            OrchestratorError::Rejected { code: 403, .. }
        ));
        assert!(matches!(
            map_error(api_error(422, "Invalid")),
            OrchestratorError::Rejected { code: 422, .. }
        ));
        assert!(matches!(
            map_error(api_error(504, "Timeout")),
            OrchestratorError::Timeout(_)
        ));

        let unavailable = map_error(api_error(500, "InternalError"));
        assert!(unavailable.is_retryable());
    }

    #[test]
    fn missing_namespace_on_create_is_a_rejection() {
        let err = map_submit_error(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "namespaces \"lidar\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        }));
        assert!(matches!(
            &err,
            OrchestratorError::Rejected { code: 404, message, .. } if message.contains("namespaces")
        ));

        let detail = ErrorDetail::from(&JobError::Submission {
            job_name: "lidar-job-0123456789".into(),
            source: err,
        });
        assert_eq!(detail.code, codes::SUBMISSION_REJECTED);
        assert_eq!(detail.message, "namespaces \"lidar\" not found");

        assert!(matches!(
            map_submit_error(api_error(403, "Forbidden")),
            OrchestratorError::Rejected { code: 403, .. }
        ));
    }
}
