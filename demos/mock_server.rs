//! # Mock Server Example
//!
//! Runs an [`AddLidarServer`] on the in-memory [`MockOrchestrator`]. Jobs run
//! for three status polls, then succeed and leave a placeholder output file in
//! `./addlidar_output`.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --example mock_server --features "server mock"
//! ```
//!
//! ```sh
//! curl -X POST localhost:3000/jobs -H 'content-type: application/json' \
//!   -d '{"file_path": "scans/tile.las", "format": "pcd-ascii"}'
//! ```

use addlidar::prelude::*;
use std::env;
use std::time::Duration;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let output_dir = env::current_dir().unwrap().join("addlidar_output");
    std::fs::create_dir_all(&output_dir).unwrap();

    // Don't use this in production! Nothing is actually executed.
    let orchestrator = MockOrchestrator::new()
        .with_script(vec![
            Condition::new(Phase::Running, "Pod running"),
            Condition::new(Phase::Running, "Pod running"),
            Condition::new(Phase::Succeeded, "Job completed"),
        ])
        .with_output_dir(&output_dir);

    let config = ServiceConfig {
        spec: JobSpecConfig {
            namespace: Some("default".into()),
            image: Some("ghcr.io/epfl-enac/lidardatamanager".into()),
            input_volume: Some(VolumeSource::Claim("lidar-data".into())),
            output_volume: Some(VolumeSource::Claim("lidar-data-output".into())),
            ..Default::default()
        },
        output_dir,
        watcher: WatcherConfig {
            poll_interval: Duration::from_secs(1),
            ..Default::default()
        },
        ..Default::default()
    };

    let jobs = JobService::new(orchestrator, config).unwrap();
    jobs.spawn_reaper();

    // Build App
    let app = AddLidarServer::default().build(jobs);

    // Serve
    let port = env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");
    println!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
