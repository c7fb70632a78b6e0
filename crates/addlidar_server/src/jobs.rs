//! The job service: submission, lookup, streaming and cleanup on top of one
//! [`Orchestrator`].

use crate::channel::{StatusHub, StatusSubscription};
use crate::output::{DEFAULT_CHUNK_SIZE, OutputResolver};
use crate::reaper::{Reaper, ReaperConfig};
use crate::registry::JobRegistry;
use crate::watcher::{StatusWatcher, WatcherConfig};

use addlidar_core::prelude::*;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use futures::future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub spec: JobSpecConfig,
    /// The output volume as mounted in this process.
    pub output_dir: PathBuf,
    pub submit_timeout: Duration,
    pub request_timeout: Duration,
    pub chunk_size: usize,
    pub watcher: WatcherConfig,
    pub reaper: ReaperConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            spec: JobSpecConfig::default(),
            output_dir: PathBuf::from("/output"),
            submit_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
            chunk_size: DEFAULT_CHUNK_SIZE,
            watcher: WatcherConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

/// A streamed download with the metadata the response headers need.
pub struct Download {
    pub file_name: String,
    pub content_type: String,
    pub len: u64,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

#[derive(Clone)]
pub struct JobService<O: Orchestrator> {
    orchestrator: O,
    registry: JobRegistry,
    hub: StatusHub,
    watcher: StatusWatcher<O>,
    reaper: Reaper<O>,
    resolver: OutputResolver,
    config: Arc<ServiceConfig>,
}

impl<O: Orchestrator> JobService<O> {
    /// Fails when the job manifest settings are incomplete.
    pub fn new(orchestrator: O, config: ServiceConfig) -> Result<Self, ConfigError> {
        config.spec.validate()?;

        let registry = JobRegistry::new();
        let hub = StatusHub::new();
        let watcher = StatusWatcher::new(
            orchestrator.clone(),
            registry.clone(),
            hub.clone(),
            config.watcher.clone(),
        );
        let reaper = Reaper::new(
            orchestrator.clone(),
            registry.clone(),
            hub.clone(),
            config.reaper.clone(),
        );
        let resolver = OutputResolver::new(&config.output_dir).with_chunk_size(config.chunk_size);

        Ok(Self {
            orchestrator,
            registry,
            hub,
            watcher,
            reaper,
            resolver,
            config: Arc::new(config),
        })
    }

    pub fn orchestrator(&self) -> &O {
        &self.orchestrator
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &StatusHub {
        &self.hub
    }

    pub fn reaper(&self) -> &Reaper<O> {
        &self.reaper
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Validates the request, creates the job and starts watching it.
    ///
    /// A refused submission still leaves a `SubmitFailed` record behind and
    /// returns [`JobError::Submission`] naming it.
    pub async fn submit(&self, request: ProcessingRequest) -> Result<JobRecord, JobError> {
        let spec_config = &self.config.spec;
        let request = request.validate(&spec_config.input_mount_path)?;

        let job_name = generate_job_name(&spec_config.job_name_prefix);
        let output_file = generate_output_file(&output_extension(request.format.as_deref()));
        let mut arguments = build_arguments(&request);
        arguments.push(output_argument(&spec_config.output_mount_path, &output_file));

        let spec =
            build_job_spec(&job_name, arguments.clone(), spec_config)?.with_output_file(&output_file);

        self.registry.insert(JobRecord::new(
            &job_name,
            Some(request),
            arguments,
            Some(output_file),
        ))?;
        self.registry.update(
            &job_name,
            Transition::new(JobState::Submitting, "Submitting job to the orchestrator"),
        )?;

        let submitted = time::timeout(self.config.submit_timeout, self.orchestrator.submit(&spec))
            .await
            .unwrap_or_else(|_| {
                Err(OrchestratorError::Timeout(format!(
                    "submission of {job_name} after {:?}",
                    self.config.submit_timeout
                )))
            });

        match submitted {
            Ok(_) => {
                let record = self.registry.update(
                    &job_name,
                    Transition::new(JobState::Running, "Job accepted by the orchestrator")
                        .with_phase(Phase::Pending),
                )?;
                self.hub.publish(record.snapshot());
                self.watcher.spawn(&job_name);
                info!(job_name = %job_name, args = ?record.arguments, "Job submitted");
                Ok(record)
            }
            Err(source) => {
                if matches!(source, OrchestratorError::Timeout(_)) {
                    self.forget_on_orchestrator(&job_name);
                }
                let err = JobError::Submission {
                    job_name: job_name.clone(),
                    source,
                };
                let detail = ErrorDetail::from(&err);
                let record = self.registry.update(
                    &job_name,
                    Transition::new(JobState::SubmitFailed, detail.message.clone())
                        .with_phase(Phase::Failed)
                        .with_error(detail),
                )?;
                self.hub.publish(record.snapshot());
                warn!(job_name = %job_name, "Job submission failed: {err}");
                Err(err)
            }
        }
    }

    /// A timed out create may still land; delete it in the background.
    fn forget_on_orchestrator(&self, job_name: &str) {
        let orchestrator = self.orchestrator.clone();
        let request_timeout = self.config.request_timeout;
        let job_name = job_name.to_string();
        tokio::spawn(async move {
            match time::timeout(request_timeout, orchestrator.delete(&job_name)).await {
                Ok(Ok(deletion)) => debug!(job_name = %job_name, ?deletion, "Cleaned up timed out submission"),
                Ok(Err(err)) => warn!(job_name = %job_name, "Failed to clean up timed out submission: {err}"),
                Err(_) => warn!(job_name = %job_name, "Cleanup of timed out submission timed out"),
            }
        });
    }

    pub fn status(&self, job_name: &str) -> Result<StatusSnapshot, JobError> {
        self.registry.get(job_name).map(|record| record.snapshot())
    }

    pub fn record(&self, job_name: &str) -> Result<JobRecord, JobError> {
        self.registry.get(job_name)
    }

    pub fn list(&self) -> Vec<StatusSnapshot> {
        self.registry.list().iter().map(JobRecord::snapshot).collect()
    }

    pub fn subscribe(&self, job_name: &str) -> Result<StatusSubscription, JobError> {
        let record = self.registry.get(job_name)?;
        Ok(self.hub.subscribe(record.snapshot()))
    }

    pub async fn logs(&self, job_name: &str) -> Result<LogStream, JobError> {
        self.registry.get(job_name)?;
        let logs = time::timeout(self.config.request_timeout, self.orchestrator.get_logs(job_name))
            .await
            .map_err(|_| OrchestratorError::Timeout(format!("logs of {job_name}")))??;
        Ok(logs)
    }

    /// Opens the output for streaming. The job counts as downloaded once the
    /// stream reached the end of the file.
    pub async fn download(&self, job_name: &str) -> Result<Download, JobError> {
        let record = self.registry.get(job_name)?;
        let output = self.resolver.resolve(&record).await?;
        info!(job_name, path = %output.path.display(), len = output.len, "Serving job output");

        let file_name = output.file_name.clone();
        let content_type = output.content_type.clone();
        let len = output.len;

        let body = mark_downloaded_when_read(
            self.resolver.stream(output),
            self.registry.clone(),
            job_name.to_string(),
        );
        Ok(Download {
            file_name,
            content_type,
            len,
            body,
        })
    }

    /// Deletes the job everywhere. Unknown jobs are not an error.
    ///
    /// A job that is still active is cancelled first and its subscribers see
    /// a terminal `Failed` snapshot.
    pub async fn cleanup(&self, job_name: &str) -> Result<(), JobError> {
        let active = self
            .registry
            .get(job_name)
            .is_ok_and(|record| !record.state.is_terminal());

        if active {
            let deleted = time::timeout(self.config.request_timeout, self.orchestrator.delete(job_name))
                .await
                .map_err(|_| OrchestratorError::Timeout(format!("delete of {job_name}")))??;
            debug!(job_name, ?deleted, "Cancelled active job");

            let message = "Job cancelled by cleanup request";
            if let Ok(record) = self.registry.update(
                job_name,
                Transition::new(JobState::Failed, message)
                    .with_phase(Phase::Failed)
                    .with_error(ErrorDetail::new(codes::JOB_FAILED, message)),
            ) {
                self.hub.publish(record.snapshot());
            }
        }

        self.reaper.reap(job_name).await?;
        info!(job_name, "Job cleaned up");
        Ok(())
    }

    /// Rebuilds records for jobs found on the orchestrator and resumes
    /// watching the active ones. Returns the number of recovered jobs.
    pub async fn reconcile(&self) -> Result<usize, JobError> {
        let listed = time::timeout(self.config.request_timeout, self.orchestrator.list())
            .await
            .map_err(|_| OrchestratorError::Timeout("list of managed jobs".into()))?;
        let summaries = match listed {
            Ok(summaries) => summaries,
            Err(OrchestratorError::Unsupported(reason)) => {
                debug!("Skipping reconciliation: {reason}");
                return Ok(0);
            }
            Err(err) => return Err(err.into()),
        };

        let mut recovered = 0;
        for summary in summaries {
            if self.registry.contains(&summary.job_name) {
                continue;
            }
            let record = recovered_record(summary);
            let active = !record.state.is_terminal();
            let record = self.registry.insert(record)?;
            if active {
                self.watcher.spawn(&record.job_name);
            }
            debug!(job_name = %record.job_name, state = %record.state, "Recovered job");
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "Reconciled jobs from the orchestrator");
        }
        Ok(recovered)
    }

    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        self.reaper.clone().spawn()
    }
}

fn recovered_record(summary: JobSummary) -> JobRecord {
    let JobSummary {
        job_name,
        condition,
        created_at,
        output_file,
        arguments,
    } = summary;

    let mut record = JobRecord::new(job_name, None, arguments, output_file);
    if let Some(created_at) = created_at {
        record.created_at = created_at;
    }

    let (state, phase) = match condition.phase {
        Phase::Pending | Phase::Unknown => (JobState::Running, Phase::Pending),
        Phase::Running => (JobState::Running, Phase::Running),
        Phase::Succeeded => (JobState::Succeeded, Phase::Succeeded),
        Phase::Failed => (JobState::Failed, Phase::Failed),
        Phase::Lost => (JobState::Lost, Phase::Lost),
    };
    record.state = state;
    record.phase = phase;
    record.message = format!("Recovered from the orchestrator: {}", condition.message);
    if state.is_terminal() {
        record.finished_at = Some(record.updated_at);
    }
    match state {
        JobState::Failed => record.error = Some(ErrorDetail::new(codes::JOB_FAILED, condition.message)),
        JobState::Lost => record.error = Some(ErrorDetail::new(codes::JOB_LOST, condition.message)),
        _ => {}
    }
    record
}

/// Marks the job as downloaded once `body` ended without a failed chunk.
fn mark_downloaded_when_read(
    body: BoxStream<'static, io::Result<Bytes>>,
    registry: JobRegistry,
    job_name: String,
) -> BoxStream<'static, io::Result<Bytes>> {
    let failed = Arc::new(AtomicBool::new(false));
    let body = body.inspect_err({
        let failed = failed.clone();
        move |_| failed.store(true, Ordering::Relaxed)
    });

    let on_complete = stream::once(async move {
        if failed.load(Ordering::Relaxed) {
            debug!(job_name = %job_name, "Download aborted, not marking the job");
            return;
        }
        if let Err(err) = registry.mark_downloaded(&job_name) {
            debug!(job_name = %job_name, "Download finished after the job was reaped: {err}");
        }
    })
    .filter_map(|()| future::ready(None::<io::Result<Bytes>>));

    body.chain(on_complete).boxed()
}
