//! # addlidar
//!
//! Runs point cloud processing jobs as ephemeral containers on a cluster
//! orchestrator, pushes their status to clients and streams back the output.
//!
//! This crate serves as an entry point, re-exporting the core types and
//! optionally including the server, the client and the orchestrator backends
//! via feature flags.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | **`server`** | Includes the Axum-based server implementation (`addlidar_server`). |
//! | **`client`** | Includes the HTTP/WebSocket client (`addlidar_client`) for tooling. |
//! | **`kubernetes`** | Runs jobs as `batch/v1` Jobs (`addlidar_k8s`). |
//! | **`docker`** | Runs jobs as containers on a local Docker daemon (`addlidar_docker`). |
//! | **`mock`** | In-memory orchestrator for tests and demos (`addlidar_mock`). |
//!
//! ## Example: Kubernetes Server
//!
//! ```toml
//! [dependencies]
//! addlidar = { version = "0.3", features = ["server", "kubernetes"] }
//! ```
//!
//! ```rust,ignore
//! use addlidar::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = KubernetesOrchestrator::connect("lidar").await?;
//!
//!     let config = ServiceConfig {
//!         spec: JobSpecConfig {
//!             namespace: Some("lidar".into()),
//!             image: Some("ghcr.io/epfl-enac/lidardatamanager".into()),
//!             input_volume: Some(VolumeSource::Claim("lidar-data-pvc".into())),
//!             output_volume: Some(VolumeSource::Claim("lidar-data-output-pvc".into())),
//!             ..Default::default()
//!         },
//!         ..Default::default()
//!     };
//!     let jobs = JobService::new(orchestrator, config)?;
//!     jobs.reconcile().await?;
//!     jobs.spawn_reaper();
//!
//!     // Build
//!     let app = AddLidarServer::default().build(jobs);
//!
//!     // Serve
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub use addlidar_core::*;

#[cfg(feature = "server")]
pub mod server {
    pub use addlidar_server::*;
}

#[cfg(feature = "client")]
pub mod client {
    pub use addlidar_client::*;
}

#[cfg(feature = "kubernetes")]
pub mod kubernetes {
    pub use addlidar_k8s::*;
}

#[cfg(feature = "docker")]
pub mod docker {
    pub use addlidar_docker::*;
}

#[cfg(feature = "mock")]
pub mod mock {
    pub use addlidar_mock::*;
}

pub mod prelude {
    pub use addlidar_core::prelude::*;

    #[cfg(feature = "server")]
    pub use addlidar_server::prelude::*;

    #[cfg(feature = "client")]
    pub use addlidar_client::{AddLidarClient, AddLidarClientError};

    #[cfg(feature = "kubernetes")]
    pub use addlidar_k8s::KubernetesOrchestrator;

    #[cfg(feature = "docker")]
    pub use addlidar_docker::DockerOrchestrator;

    #[cfg(feature = "mock")]
    pub use addlidar_mock::MockOrchestrator;
}
