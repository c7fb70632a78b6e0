//! Backend-neutral job manifests.
//!
//! A [`JobSpec`] is built once per submission from the server's
//! [`JobSpecConfig`] and the CLI argument list, handed to the
//! [`Orchestrator`](crate::traits::Orchestrator) and then dropped.

use crate::constants::labels;
use crate::error::ConfigError;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Where a mounted volume comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeSource {
    /// A persistent volume claim (Kubernetes) or named volume (Docker).
    Claim(String),
    /// A directory on the node.
    HostPath(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    pub name: String,
    pub source: VolumeSource,
    pub mount_path: String,
    pub read_only: bool,
}

/// Uniform resource policy, quantities in orchestrator notation (`500m`, `2Gi`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resources {
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    pub job_name: String,
    pub namespace: String,
    pub image: String,
    /// Entrypoint override. Empty keeps the image entrypoint.
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub volumes: Vec<VolumeMount>,
    pub resources: Resources,
    /// Orchestrator-side garbage collection, independent of the reaper.
    pub ttl_seconds_after_finished: u32,
    pub active_deadline_seconds: Option<u64>,
    pub backoff_limit: u32,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Settings every job manifest is built from.
///
/// `namespace`, `image`, `input_volume` and `output_volume` have no defaults:
/// [`build_job_spec`] fails until they are configured.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpecConfig {
    pub namespace: Option<String>,
    pub image: Option<String>,
    pub image_tag: Option<String>,
    pub command: Vec<String>,
    pub input_volume: Option<VolumeSource>,
    pub input_mount_path: String,
    pub input_read_only: bool,
    pub output_volume: Option<VolumeSource>,
    pub output_mount_path: String,
    pub resources: Resources,
    pub ttl_seconds_after_finished: u32,
    /// Hard limit enforced by the orchestrator. Also the watcher's timeout.
    pub active_deadline: Option<Duration>,
    pub backoff_limit: u32,
    pub job_name_prefix: String,
}

impl Default for JobSpecConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            image: None,
            image_tag: None,
            command: Vec::new(),
            input_volume: None,
            input_mount_path: "/data".to_string(),
            input_read_only: true,
            output_volume: None,
            output_mount_path: "/output".to_string(),
            resources: Resources::default(),
            ttl_seconds_after_finished: 3600,
            active_deadline: Some(Duration::from_secs(300)),
            backoff_limit: 0,
            job_name_prefix: "lidar-job".to_string(),
        }
    }
}

impl JobSpecConfig {
    /// Checks the settings without building anything, so a server can refuse to start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        required("namespace", &self.namespace)?;
        required("image", &self.image)?;
        if self.input_volume.is_none() {
            return Err(ConfigError::Missing("input_volume"));
        }
        if self.output_volume.is_none() {
            return Err(ConfigError::Missing("output_volume"));
        }

        for (name, path) in [
            ("input_mount_path", &self.input_mount_path),
            ("output_mount_path", &self.output_mount_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(name, format!("'{path}' is not absolute")));
            }
        }
        if self.input_mount_path == self.output_mount_path {
            return Err(ConfigError::Invalid(
                "output_mount_path",
                "must differ from input_mount_path".into(),
            ));
        }

        let prefix = &self.job_name_prefix;
        let valid_prefix = !prefix.is_empty()
            && prefix.len() <= 40
            && prefix.starts_with(|c: char| c.is_ascii_lowercase())
            && prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid_prefix {
            return Err(ConfigError::Invalid(
                "job_name_prefix",
                format!("'{prefix}' is not a DNS-1123 label prefix"),
            ));
        }

        Ok(())
    }

    pub fn image_reference(&self) -> Result<String, ConfigError> {
        let image = required("image", &self.image)?;
        Ok(match self.image_tag.as_deref().filter(|t| !t.is_empty()) {
            Some(tag) => format!("{image}:{tag}"),
            None => image.to_string(),
        })
    }
}

fn required<'a>(name: &'static str, value: &'a Option<String>) -> Result<&'a str, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(name))
}

/// Renders the manifest of one job.
pub fn build_job_spec(
    job_name: &str,
    args: Vec<String>,
    config: &JobSpecConfig,
) -> Result<JobSpec, ConfigError> {
    config.validate()?;

    let namespace = required("namespace", &config.namespace)?.to_string();
    let image = config.image_reference()?;

    let input = config
        .input_volume
        .clone()
        .ok_or(ConfigError::Missing("input_volume"))?;
    let output = config
        .output_volume
        .clone()
        .ok_or(ConfigError::Missing("output_volume"))?;

    let volumes = vec![
        VolumeMount {
            name: "data-volume".to_string(),
            source: input,
            mount_path: config.input_mount_path.clone(),
            read_only: config.input_read_only,
        },
        VolumeMount {
            name: "data-output-volume".to_string(),
            source: output,
            mount_path: config.output_mount_path.clone(),
            read_only: false,
        },
    ];

    let labels = BTreeMap::from([
        (
            labels::MANAGED_BY.to_string(),
            labels::MANAGED_BY_VALUE.to_string(),
        ),
        (labels::JOB_NAME.to_string(), job_name.to_string()),
    ]);

    Ok(JobSpec {
        job_name: job_name.to_string(),
        namespace,
        image,
        command: config.command.clone(),
        args,
        volumes,
        resources: config.resources.clone(),
        ttl_seconds_after_finished: config.ttl_seconds_after_finished,
        active_deadline_seconds: config.active_deadline.map(|d| d.as_secs().max(1)),
        backoff_limit: config.backoff_limit,
        labels,
        annotations: BTreeMap::new(),
    })
}

impl JobSpec {
    /// Records the output file so the job can be matched back to it later.
    pub fn with_output_file(mut self, file_name: &str) -> Self {
        self.annotations
            .insert(labels::OUTPUT_FILE.to_string(), file_name.to_string());
        self
    }

    pub fn output_file(&self) -> Option<&str> {
        self.annotations.get(labels::OUTPUT_FILE).map(String::as_str)
    }
}
