use addlidar_core::prelude::*;
use addlidar_docker::DockerOrchestrator;
use addlidar_k8s::KubernetesOrchestrator;
use addlidar_mock::MockOrchestrator;
use addlidar_server::prelude::*;

use anyhow::Context;
use clap::{Args, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Backend {
    /// `batch/v1` Jobs through the Kubernetes API
    Kubernetes,
    /// Containers on the local Docker daemon
    Docker,
    /// In-memory jobs that succeed after a few polls
    Mock,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[arg(long, value_enum, env = "ADDLIDAR_BACKEND", default_value = "kubernetes")]
    pub backend: Backend,

    #[arg(long, env = "ADDLIDAR_BIND", default_value = "0.0.0.0:3000")]
    pub bind: SocketAddr,

    #[arg(long, env = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Image of the point cloud CLI, without tag.
    #[arg(long, env = "IMAGE_NAME")]
    pub image_name: Option<String>,

    #[arg(long, env = "IMAGE_TAG")]
    pub image_tag: Option<String>,

    /// Claim (or Docker volume) holding the input data.
    #[arg(long, env = "PVC_NAME", conflicts_with = "input_host_path")]
    pub pvc_name: Option<String>,

    #[arg(long, env = "INPUT_HOST_PATH")]
    pub input_host_path: Option<String>,

    /// Claim (or Docker volume) receiving the output files.
    #[arg(long, env = "PVC_OUTPUT_NAME", conflicts_with = "output_host_path")]
    pub pvc_output_name: Option<String>,

    #[arg(long, env = "OUTPUT_HOST_PATH")]
    pub output_host_path: Option<String>,

    /// Input mount path inside the job container.
    #[arg(long, env = "MOUNT_PATH", default_value = "/data")]
    pub mount_path: String,

    /// Output mount path inside the job container.
    #[arg(long, env = "OUTPUT_PATH", default_value = "/output")]
    pub output_path: String,

    /// The output volume as mounted in this process.
    #[arg(long, env = "OUTPUT_DIR", default_value = "/output")]
    pub output_dir: PathBuf,

    /// Seconds a job may run before it is failed.
    #[arg(long, env = "JOB_TIMEOUT", default_value_t = 300)]
    pub job_timeout: u64,

    /// Seconds the orchestrator keeps a finished job.
    #[arg(long, env = "JOB_TTL", default_value_t = 3600)]
    pub job_ttl: u32,

    /// Seconds between status polls.
    #[arg(long, env = "POLL_INTERVAL", default_value_t = 2)]
    pub poll_interval: u64,

    /// Seconds a finished job stays available for download.
    #[arg(long, env = "RETENTION", default_value_t = 3600)]
    pub retention: u64,

    /// Seconds between reaper sweeps.
    #[arg(long, env = "REAPER_INTERVAL", default_value_t = 300)]
    pub reaper_interval: u64,

    #[arg(long, env = "CPU_REQUEST")]
    pub cpu_request: Option<String>,

    #[arg(long, env = "CPU_LIMIT")]
    pub cpu_limit: Option<String>,

    #[arg(long, env = "MEMORY_REQUEST")]
    pub memory_request: Option<String>,

    #[arg(long, env = "MEMORY_LIMIT")]
    pub memory_limit: Option<String>,
}

impl ServeArgs {
    pub fn service_config(&self) -> ServiceConfig {
        let job_timeout = Duration::from_secs(self.job_timeout);
        let volume = |claim: &Option<String>, host: &Option<String>| match (claim, host) {
            (Some(claim), _) => Some(VolumeSource::Claim(claim.clone())),
            (None, Some(path)) => Some(VolumeSource::HostPath(path.clone())),
            (None, None) => None,
        };

        let spec = JobSpecConfig {
            namespace: self.namespace.clone(),
            image: self.image_name.clone(),
            image_tag: self.image_tag.clone(),
            input_volume: volume(&self.pvc_name, &self.input_host_path),
            input_mount_path: self.mount_path.clone(),
            output_volume: volume(&self.pvc_output_name, &self.output_host_path),
            output_mount_path: self.output_path.clone(),
            resources: Resources {
                cpu_request: self.cpu_request.clone(),
                cpu_limit: self.cpu_limit.clone(),
                memory_request: self.memory_request.clone(),
                memory_limit: self.memory_limit.clone(),
            },
            ttl_seconds_after_finished: self.job_ttl,
            active_deadline: Some(job_timeout),
            ..Default::default()
        };

        ServiceConfig {
            spec,
            output_dir: self.output_dir.clone(),
            watcher: WatcherConfig {
                poll_interval: Duration::from_secs(self.poll_interval.max(1)),
                job_timeout,
                ..Default::default()
            },
            reaper: ReaperConfig {
                interval: Duration::from_secs(self.reaper_interval.max(1)),
                retention: Duration::from_secs(self.retention),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Fills the settings a development backend can do without.
    fn with_local_defaults(mut self) -> Self {
        self.namespace.get_or_insert_with(|| "default".to_string());
        self.image_name
            .get_or_insert_with(|| "ghcr.io/epfl-enac/lidardatamanager".to_string());
        if self.input_host_path.is_none() {
            self.pvc_name.get_or_insert_with(|| "lidar-data".to_string());
        }
        if self.output_host_path.is_none() {
            self.pvc_output_name
                .get_or_insert_with(|| "lidar-data-output".to_string());
        }
        self
    }
}

pub async fn run(args: ServeArgs) -> anyhow::Result<()> {
    match args.backend {
        Backend::Kubernetes => {
            let namespace = args
                .namespace
                .clone()
                .context("--namespace (NAMESPACE) is required for the kubernetes backend")?;
            let orchestrator = KubernetesOrchestrator::connect(namespace).await?;
            serve(orchestrator, args).await
        }
        Backend::Docker => {
            let orchestrator = DockerOrchestrator::connect_local()?;
            serve(orchestrator, args.with_local_defaults()).await
        }
        Backend::Mock => {
            let orchestrator = MockOrchestrator::new()
                .with_script(vec![
                    Condition::new(Phase::Running, "Pod running"),
                    Condition::new(Phase::Running, "Pod running"),
                    Condition::new(Phase::Succeeded, "Job completed"),
                ])
                .with_output_dir(&args.output_dir);
            serve(orchestrator, args.with_local_defaults()).await
        }
    }
}

async fn serve<O: Orchestrator>(orchestrator: O, args: ServeArgs) -> anyhow::Result<()> {
    orchestrator
        .init()
        .await
        .context("Orchestrator is not reachable")?;

    let jobs = JobService::new(orchestrator, args.service_config())?;
    match jobs.reconcile().await {
        Ok(0) => {}
        Ok(n) => info!("Recovered {n} jobs from the orchestrator"),
        Err(e) => warn!("Startup reconciliation failed: {e}"),
    }
    jobs.spawn_reaper();

    let app = AddLidarServer::default().build(jobs);
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;

    info!("Listening on {}", args.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;
    Ok(())
}
