//! # Docker Server Example
//!
//! Runs jobs as containers on the local Docker daemon. Input and output are
//! bind mounted from `./addlidar_data` and `./addlidar_output`.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --example docker_server --features "server docker"
//! ```

use addlidar::prelude::*;
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cwd = env::current_dir()?;
    let data_dir = cwd.join("addlidar_data");
    let output_dir = cwd.join("addlidar_output");
    std::fs::create_dir_all(&data_dir)?;
    std::fs::create_dir_all(&output_dir)?;

    let orchestrator = DockerOrchestrator::connect_local()?;
    orchestrator.init().await?;

    let config = ServiceConfig {
        spec: JobSpecConfig {
            namespace: Some("local".into()),
            image: Some(
                env::var("IMAGE_NAME")
                    .unwrap_or_else(|_| "ghcr.io/epfl-enac/lidardatamanager".to_string()),
            ),
            image_tag: env::var("IMAGE_TAG").ok(),
            input_volume: Some(VolumeSource::HostPath(data_dir.display().to_string())),
            output_volume: Some(VolumeSource::HostPath(output_dir.display().to_string())),
            ..Default::default()
        },
        output_dir,
        ..Default::default()
    };

    let jobs = JobService::new(orchestrator, config)?;
    jobs.reconcile().await?;
    jobs.spawn_reaper();

    let app = AddLidarServer::default().build(jobs);

    let port = env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");
    println!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
