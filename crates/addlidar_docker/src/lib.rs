//! # addlidar Docker Orchestrator
//!
//! Runs each job as a plain container on the local Docker daemon. Useful for
//! development machines and single-host deployments without a cluster.
//!
//! Volumes map to bind mounts: [`VolumeSource::Claim`] names a Docker volume,
//! [`VolumeSource::HostPath`] a host directory. Docker has no annotations, so
//! they are stored as container labels too.
//!
//! Docker enforces neither `active_deadline_seconds` nor
//! `ttl_seconds_after_finished`; the server's watcher timeout and reaper cover both.

use addlidar_core::prelude::*;
use bollard::Docker;
use bollard::config::ContainerCreateBody;
use bollard::container::LogOutput as DockerLogOutput;
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::BoxStream};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct DockerOrchestrator {
    client: Docker,
}

impl DockerOrchestrator {
    /// Connects to the local Docker socket (defaults to /var/run/docker.sock on Linux)
    pub fn connect_local() -> Result<Self, OrchestratorError> {
        let client = Docker::connect_with_local_defaults().map_err(|e| {
            OrchestratorError::Unavailable(format!("Failed to connect to Docker: {e}"))
        })?;
        Ok(Self { client })
    }

    pub fn new(client: Docker) -> Self {
        Self { client }
    }

    async fn inspect(&self, job_name: &str) -> Result<(Condition, Vec<String>), OrchestratorError> {
        let container = self
            .client
            .inspect_container(job_name, None)
            .await
            .map_err(|e| map_error(e, job_name))?;

        let arguments = container
            .config
            .and_then(|config| config.cmd)
            .unwrap_or_default();

        let condition = match container.state {
            Some(state) => condition_from(state.status, state.exit_code, state.error.as_deref()),
            None => Condition::new(Phase::Unknown, "Container state unavailable"),
        };
        Ok((condition, arguments))
    }
}

/// Maps daemon errors. 4xx answers other than 404 are rejections.
fn map_error(err: DockerError, job_name: &str) -> OrchestratorError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        } => OrchestratorError::NotFound(job_name.to_string()),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } if (400..500).contains(&status_code) => OrchestratorError::Rejected {
            code: status_code,
            reason: reason_phrase(status_code).to_string(),
            message,
        },
        DockerError::RequestTimeoutError => {
            OrchestratorError::Timeout(format!("Docker request for {job_name}"))
        }
        other => OrchestratorError::Unavailable(other.to_string()),
    }
}

/// Maps errors of the create and start calls. A 404 there names a missing
/// image or volume, not the job, so it is a rejection with the daemon's message.
fn map_submit_error(err: DockerError, job_name: &str) -> OrchestratorError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => OrchestratorError::Rejected {
            code: 404,
            reason: reason_phrase(404).to_string(),
            message,
        },
        other => map_error(other, job_name),
    }
}

fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        400 => "BadRequest",
        404 => "NotFound",
        403 => "Forbidden",
        409 => "Conflict",
        _ => "Rejected",
    }
}

/// Interprets a container state. A zero exit code is success.
pub fn condition_from(
    status: Option<ContainerStateStatusEnum>,
    exit_code: Option<i64>,
    error: Option<&str>,
) -> Condition {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => Condition::new(Phase::Pending, "Container created"),
        Some(ContainerStateStatusEnum::RUNNING | ContainerStateStatusEnum::RESTARTING) => {
            Condition::new(Phase::Running, "Container running")
        }
        Some(ContainerStateStatusEnum::PAUSED) => Condition::new(Phase::Running, "Container paused"),
        Some(ContainerStateStatusEnum::EXITED) => match exit_code {
            Some(0) => Condition::new(Phase::Succeeded, "Container exited with code 0"),
            Some(code) => {
                let message = match error.filter(|e| !e.is_empty()) {
                    Some(error) => format!("Container exited with code {code}: {error}"),
                    None => format!("Container exited with code {code}"),
                };
                Condition::new(Phase::Failed, message)
            }
            None => Condition::new(Phase::Unknown, "Container exited without exit code"),
        },
        Some(ContainerStateStatusEnum::DEAD) => Condition::new(
            Phase::Failed,
            error.unwrap_or("Container is dead").to_string(),
        ),
        _ => Condition::new(Phase::Unknown, "Container state unknown"),
    }
}

/// `name:/mount[:ro]` for every volume of the job.
pub fn binds(spec: &JobSpec) -> Vec<String> {
    spec.volumes
        .iter()
        .map(|mount| {
            let source = match &mount.source {
                VolumeSource::Claim(name) => name,
                VolumeSource::HostPath(path) => path,
            };
            if mount.read_only {
                format!("{source}:{}:ro", mount.mount_path)
            } else {
                format!("{source}:{}", mount.mount_path)
            }
        })
        .collect()
}

/// Parses `4Gi`, `512Mi`, `1G`, `1000` into bytes.
pub fn parse_memory(quantity: &str) -> Option<i64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(quantity.len());
    let (number, unit) = quantity.split_at(split);
    let number: f64 = number.parse().ok()?;
    let factor: f64 = match unit {
        "" => 1.0,
        "k" | "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((number * factor) as i64)
}

/// Parses `500m` or `1.5` CPUs into Docker's nano CPUs.
pub fn parse_cpu(quantity: &str) -> Option<i64> {
    let quantity = quantity.trim();
    let cpus: f64 = match quantity.strip_suffix('m') {
        Some(millis) => millis.parse::<f64>().ok()? / 1000.0,
        None => quantity.parse().ok()?,
    };
    (cpus > 0.0).then(|| (cpus * 1e9) as i64)
}

impl Orchestrator for DockerOrchestrator {
    async fn init(&self) -> Result<(), OrchestratorError> {
        self.client
            .version()
            .await
            .map_err(|e| OrchestratorError::Unavailable(format!("Docker unavailable: {e}")))?;

        Ok(())
    }

    async fn submit(&self, spec: &JobSpec) -> Result<String, OrchestratorError> {
        let name = spec.job_name.clone();

        let labels: HashMap<String, String> = spec
            .labels
            .iter()
            .chain(spec.annotations.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let limit = |value: &Option<String>, parse: fn(&str) -> Option<i64>| {
            value.as_deref().and_then(parse)
        };

        let options = CreateContainerOptions {
            name: name.clone().into(),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            entrypoint: (!spec.command.is_empty()).then(|| spec.command.clone()),
            cmd: Some(spec.args.clone()),
            labels: Some(labels),
            host_config: Some(HostConfig {
                binds: Some(binds(spec)),
                memory: limit(&spec.resources.memory_limit, parse_memory),
                nano_cpus: limit(&spec.resources.cpu_limit, parse_cpu),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.client
            .create_container(Some(options), body)
            .await
            .map_err(|e| map_submit_error(e, &name))?;

        if let Err(e) = self.client.start_container(name.as_str(), None).await {
            let err = map_submit_error(e, &name);
            let remove = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(cleanup) = self.client.remove_container(&name, Some(remove)).await {
                warn!(job_name = %name, "Failed to remove unstarted container: {cleanup}");
            }
            return Err(err);
        }

        debug!(job_name = %name, image = %spec.image, "Container started");
        Ok(name)
    }

    async fn get_status(&self, job_name: &str) -> Result<Condition, OrchestratorError> {
        Ok(self.inspect(job_name).await?.0)
    }

    async fn get_logs(&self, job_name: &str) -> Result<LogStream, OrchestratorError> {
        // Fail with NotFound up front; the log stream only errors lazily.
        self.inspect(job_name).await?;

        let options = LogsOptions {
            follow: false,
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        let job_name = job_name.to_string();
        let stream = self.client.logs(&job_name, Some(options));
        let mapped_stream = stream.map(move |res| match res {
            Ok(output) => {
                let (source, bytes) = match output {
                    DockerLogOutput::StdOut { message } => (LogSource::Stdout, message),
                    DockerLogOutput::StdErr { message } => (LogSource::Stderr, message),
                    DockerLogOutput::Console { message } => (LogSource::Console, message),
                    DockerLogOutput::StdIn { message } => (LogSource::Console, message),
                };

                let full_line = String::from_utf8_lossy(&bytes);
                let (ts, msg) = match full_line.split_once(' ') {
                    Some((t, m)) => (Some(t.to_string()), m.to_string()),
                    None => (None, full_line.to_string()),
                };

                Ok(LogOutput {
                    source,
                    timestamp: ts,
                    message: msg,
                })
            }
            Err(e) => Err(map_error(e, &job_name)),
        });

        Ok(mapped_stream.boxed())
    }

    async fn delete(&self, job_name: &str) -> Result<Deletion, OrchestratorError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(job_name, Some(options)).await {
            Ok(()) => Ok(Deletion::Deleted),
            Err(e) => match map_error(e, job_name) {
                OrchestratorError::NotFound(_) => Ok(Deletion::NotFound),
                // Removal already in progress.
                OrchestratorError::Rejected { code: 409, .. } => Ok(Deletion::Deleted),
                other => Err(other),
            },
        }
    }

    async fn list(&self) -> Result<Vec<JobSummary>, OrchestratorError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![labels::MANAGED_BY_SELECTOR.to_string()],
        )]);
        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| OrchestratorError::Unavailable(e.to_string()))?;

        let mut summaries = Vec::with_capacity(containers.len());
        for container in containers {
            let container_labels = container.labels.unwrap_or_default();
            let Some(job_name) = container_labels.get(labels::JOB_NAME).cloned() else {
                continue;
            };
            let (condition, arguments) = match self.inspect(&job_name).await {
                Ok(inspected) => inspected,
                Err(e) => {
                    warn!(job_name = %job_name, "Skipping container: {e}");
                    continue;
                }
            };
            summaries.push(JobSummary {
                created_at: container
                    .created
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
                output_file: container_labels.get(labels::OUTPUT_FILE).cloned(),
                job_name,
                condition,
                arguments,
            });
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec() -> JobSpec {
        JobSpec {
            job_name: "lidar-job-0123456789".into(),
            namespace: "default".into(),
            image: "lidardatamanager:latest".into(),
            command: vec![],
            args: vec!["-i=/data/a.las".into()],
            volumes: vec![
                VolumeMount {
                    name: "data-volume".into(),
                    source: VolumeSource::HostPath("/srv/lidar".into()),
                    mount_path: "/data".into(),
                    read_only: true,
                },
                VolumeMount {
                    name: "data-output-volume".into(),
                    source: VolumeSource::Claim("lidar-output".into()),
                    mount_path: "/output".into(),
                    read_only: false,
                },
            ],
            resources: Resources::default(),
            ttl_seconds_after_finished: 3600,
            active_deadline_seconds: None,
            backoff_limit: 0,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    #[test]
    fn volumes_become_binds() {
        assert_eq!(
            binds(&spec()),
            ["/srv/lidar:/data:ro", "lidar-output:/output"]
        );
    }

    #[test]
    fn exit_code_decides_success() {
        let exited = || Some(ContainerStateStatusEnum::EXITED);
        assert_eq!(condition_from(exited(), Some(0), None).phase, Phase::Succeeded);

        let failed = condition_from(exited(), Some(137), Some("OOMKilled"));
        assert_eq!(failed.phase, Phase::Failed);
        assert_eq!(failed.message, "Container exited with code 137: OOMKilled");

        assert_eq!(
            condition_from(Some(ContainerStateStatusEnum::CREATED), None, None).phase,
            Phase::Pending
        );
        assert_eq!(
            condition_from(Some(ContainerStateStatusEnum::RUNNING), None, None).phase,
            Phase::Running
        );
        assert_eq!(condition_from(None, None, None).phase, Phase::Unknown);
    }

    #[test]
    fn quantities_parse_like_kubernetes() {
        assert_eq!(parse_memory("4Gi"), Some(4 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory("512Mi"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory("1G"), Some(1_000_000_000));
        assert_eq!(parse_memory("2048"), Some(2048));
        assert_eq!(parse_memory("lots"), None);

        assert_eq!(parse_cpu("500m"), Some(500_000_000));
        assert_eq!(parse_cpu("2"), Some(2_000_000_000));
        assert_eq!(parse_cpu("0"), None);
    }

    #[test]
    fn daemon_errors_are_classified() {
        let not_found = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        assert!(matches!(
            map_error(not_found, "j"),
            OrchestratorError::NotFound(name) if name == "j"
        ));

        let conflict = DockerError::DockerResponseServerError {
            status_code: 409,
            message: "name already in use".into(),
        };
        assert!(matches!(
            map_error(conflict, "j"),
            OrchestratorError::Rejected { code: 409, .. }
        ));

        let server = DockerError::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        };
        assert!(map_error(server, "j").is_retryable());
    }

    #[test]
    fn missing_image_on_create_keeps_the_daemon_message() {
        let missing_image = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "No such image: ghcr.io/epfl-enac/lidardatamanager:latest".into(),
        };
        let err = map_submit_error(missing_image, "lidar-job-0123456789");
        assert!(matches!(
            &err,
            OrchestratorError::Rejected { code: 404, message, .. } if message.contains("No such image")
        ));

        let detail = ErrorDetail::from(&JobError::Submission {
            job_name: "lidar-job-0123456789".into(),
            source: err,
        });
        assert_eq!(detail.code, codes::SUBMISSION_REJECTED);
        assert!(detail.message.contains("No such image"));
    }
}
