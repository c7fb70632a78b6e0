//! Translation between [`JobSpec`]/[`Condition`] and the batch/v1 wire types.

use addlidar_core::prelude::*;
use k8s_openapi::api::batch::v1::{Job, JobSpec as BatchJobSpec};
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    PodTemplateSpec, ResourceRequirements, Volume, VolumeMount as K8sVolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

pub const CONTAINER_NAME: &str = "lidar-container";

/// Renders the Job manifest. Pods never restart and failed pods are not retried.
pub fn to_job(spec: &JobSpec) -> Job {
    let volumes = spec
        .volumes
        .iter()
        .map(|mount| match &mount.source {
            VolumeSource::Claim(claim) => Volume {
                name: mount.name.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.clone(),
                    read_only: Some(mount.read_only),
                }),
                ..Default::default()
            },
            VolumeSource::HostPath(path) => Volume {
                name: mount.name.clone(),
                host_path: Some(HostPathVolumeSource {
                    path: path.clone(),
                    type_: Some("Directory".to_string()),
                }),
                ..Default::default()
            },
        })
        .collect();

    let volume_mounts = spec
        .volumes
        .iter()
        .map(|mount| K8sVolumeMount {
            name: mount.name.clone(),
            mount_path: mount.mount_path.clone(),
            read_only: Some(mount.read_only),
            ..Default::default()
        })
        .collect();

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(spec.image.clone()),
        command: (!spec.command.is_empty()).then(|| spec.command.clone()),
        args: Some(spec.args.clone()),
        volume_mounts: Some(volume_mounts),
        resources: resources(&spec.resources),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(spec.job_name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(spec.labels.clone()),
            annotations: Some(spec.annotations.clone()),
            ..Default::default()
        },
        spec: Some(BatchJobSpec {
            backoff_limit: Some(clamp_i32(spec.backoff_limit)),
            ttl_seconds_after_finished: Some(clamp_i32(spec.ttl_seconds_after_finished)),
            active_deadline_seconds: spec
                .active_deadline_seconds
                .map(|secs| i64::try_from(secs).unwrap_or(i64::MAX)),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(spec.labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn clamp_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn resources(resources: &Resources) -> Option<ResourceRequirements> {
    let quantities = |entries: [(&str, &Option<String>); 2]| {
        let map: BTreeMap<String, Quantity> = entries
            .into_iter()
            .filter_map(|(key, value)| Some((key.to_string(), Quantity(value.clone()?))))
            .collect();
        (!map.is_empty()).then_some(map)
    };

    let requests = quantities([
        ("cpu", &resources.cpu_request),
        ("memory", &resources.memory_request),
    ]);
    let limits = quantities([
        ("cpu", &resources.cpu_limit),
        ("memory", &resources.memory_limit),
    ]);
    if requests.is_none() && limits.is_none() {
        return None;
    }
    Some(ResourceRequirements {
        requests,
        limits,
        ..Default::default()
    })
}

/// Interprets a Job and its pods as one [`Condition`].
///
/// The Job's own counters and conditions win. Pods only refine a job that is
/// still active, e.g. to surface an image pull error while it is pending.
pub fn condition_from(job: &Job, pods: &[Pod]) -> Condition {
    if let Some(status) = &job.status {
        if status.succeeded.unwrap_or(0) > 0 {
            return Condition::new(Phase::Succeeded, "Job completed");
        }

        let conditions = status.conditions.as_deref().unwrap_or_default();
        let active = |kind: &str| {
            conditions
                .iter()
                .find(|c| c.type_ == kind && c.status == "True")
        };
        if let Some(failed) = active("Failed") {
            let message = failed
                .message
                .clone()
                .or_else(|| failed.reason.clone())
                .unwrap_or_else(|| "Job failed".to_string());
            return Condition::new(Phase::Failed, message);
        }
        if active("Complete").is_some() {
            return Condition::new(Phase::Succeeded, "Job completed");
        }
        if status.failed.unwrap_or(0) > 0 {
            return Condition::new(Phase::Failed, pod_failure(pods));
        }
    }

    let Some(pod) = pods.iter().max_by_key(|pod| {
        pod.metadata
            .creation_timestamp
            .as_ref()
            .map(|time| time.0)
    }) else {
        return Condition::new(Phase::Pending, "Waiting for pod to be scheduled");
    };

    let status = pod.status.as_ref();
    match status.and_then(|s| s.phase.as_deref()) {
        Some("Running") => Condition::new(Phase::Running, "Pod running"),
        // The Job controller has not caught up yet.
        Some("Succeeded") => Condition::new(Phase::Running, "Pod finished"),
        Some("Failed") => Condition::new(Phase::Failed, pod_failure(pods)),
        Some("Pending") | None => {
            let waiting = status
                .and_then(|s| s.container_statuses.as_ref())
                .into_iter()
                .flatten()
                .filter_map(|c| c.state.as_ref()?.waiting.as_ref())
                .find_map(|w| w.reason.clone());
            match waiting {
                Some(reason) => Condition::new(Phase::Pending, format!("Pod pending: {reason}")),
                None => Condition::new(Phase::Pending, "Pod pending"),
            }
        }
        Some(other) => Condition::new(Phase::Unknown, format!("Pod phase {other}")),
    }
}

fn pod_failure(pods: &[Pod]) -> String {
    pods.iter()
        .filter_map(|pod| pod.status.as_ref()?.container_statuses.as_ref())
        .flatten()
        .filter_map(|c| c.state.as_ref()?.terminated.as_ref())
        .map(|t| {
            let detail = t
                .message
                .clone()
                .or_else(|| t.reason.clone())
                .unwrap_or_default();
            format!("Container exited with code {} {detail}", t.exit_code)
                .trim_end()
                .to_string()
        })
        .next()
        .unwrap_or_else(|| "Pod failed".to_string())
}

/// Rebuilds a [`JobSummary`] from a listed Job.
pub fn summary_from(job: &Job) -> Option<JobSummary> {
    let job_name = job.metadata.name.clone()?;
    let output_file = job
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(labels::OUTPUT_FILE))
        .cloned();
    let arguments = job
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|s| s.containers.first())
        .and_then(|c| c.args.clone())
        .unwrap_or_default();

    Some(JobSummary {
        job_name,
        condition: condition_from(job, &[]),
        created_at: job.metadata.creation_timestamp.as_ref().map(|t| t.0),
        output_file,
        arguments,
    })
}
