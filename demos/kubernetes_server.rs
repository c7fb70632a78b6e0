//! # Kubernetes Server Example
//!
//! Runs jobs as `batch/v1` Jobs in the namespace given by `NAMESPACE`, with
//! input and output on the claims `PVC_NAME` and `PVC_OUTPUT_NAME`. The output
//! claim must also be mounted into this process at `OUTPUT_DIR`.
//!
//! ## Usage
//!
//! ```sh
//! NAMESPACE=lidar PVC_NAME=lidar-data-pvc PVC_OUTPUT_NAME=lidar-data-output-pvc \
//!   OUTPUT_DIR=/output cargo run --example kubernetes_server --features "server kubernetes"
//! ```

use addlidar::prelude::*;
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let namespace = env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let orchestrator = KubernetesOrchestrator::connect(namespace.clone()).await?;
    orchestrator.init().await?;

    let config = ServiceConfig {
        spec: JobSpecConfig {
            namespace: Some(namespace),
            image: Some(
                env::var("IMAGE_NAME")
                    .unwrap_or_else(|_| "ghcr.io/epfl-enac/lidardatamanager".to_string()),
            ),
            image_tag: env::var("IMAGE_TAG").ok(),
            input_volume: Some(VolumeSource::Claim(env::var("PVC_NAME")?)),
            output_volume: Some(VolumeSource::Claim(env::var("PVC_OUTPUT_NAME")?)),
            ..Default::default()
        },
        output_dir: env::var("OUTPUT_DIR")
            .unwrap_or_else(|_| "/output".to_string())
            .into(),
        ..Default::default()
    };

    let jobs = JobService::new(orchestrator, config)?;

    // Pick up jobs started by a previous run
    let recovered = jobs.reconcile().await?;
    println!("Recovered {recovered} jobs");
    jobs.spawn_reaper();

    let app = AddLidarServer::default().build(jobs);

    let port = env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");
    println!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
