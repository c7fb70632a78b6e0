//! # addlidar Server
//!
//! An Axum-based server that runs point cloud processing jobs on a container
//! orchestrator and hands their results back to clients.
//!
//! Provides the [`AddLidarServer`] builder, which wires a [`JobService`] over
//! any [`Orchestrator`](addlidar_core::traits::Orchestrator) into a router.
//!
//! ## Endpoints
//!
//! * `POST /jobs`: submit a processing request.
//! * `GET /jobs`, `GET /jobs/{job_name}`: status snapshots.
//! * `GET /jobs/{job_name}/watch`: WebSocket pushing every status change until
//!   the job is terminal.
//! * `GET /jobs/{job_name}/logs`: container output.
//! * `GET /jobs/{job_name}/download`: the output file, streamed.
//! * `DELETE /jobs/{job_name}`: cancel and clean up.
//!
//! Errors are JSON bodies of the form `{"code": "...", "message": "..."}`.
//!
//! ## Example
//!
//! ```no_run
//! use addlidar_server::prelude::*;
//! use addlidar_mock::MockOrchestrator;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let jobs = JobService::new(MockOrchestrator::new(), ServiceConfig::default())?;
//! jobs.reconcile().await?;
//! jobs.spawn_reaper();
//!
//! let app = AddLidarServer::default().build(jobs);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod server;

pub mod channel;
pub mod jobs;
pub mod output;
pub mod reaper;
pub mod registry;
pub mod state;
pub mod watcher;

pub use api::{ErrorBody, job_status, orchestrator_status};
pub use server::{AddLidarServer, AddLidarServerConfig};

pub mod prelude {
    pub use crate::channel::*;
    pub use crate::jobs::*;
    pub use crate::output::*;
    pub use crate::reaper::*;
    pub use crate::registry::*;
    pub use crate::state::*;
    pub use crate::watcher::*;
    pub use crate::{AddLidarServer, AddLidarServerConfig};
}
