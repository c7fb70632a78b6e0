//! # addlidar core
//!
//! Types and traits shared by the addlidar server, its orchestrator backends
//! and its client.
//!
//! - **[`ProcessingRequest`](request::ProcessingRequest)**: what a client asks for, and
//!   [`build_arguments`](request::build_arguments), which turns it into the CLI's argv.
//! - **[`JobSpec`](manifest::JobSpec)**: the backend-neutral manifest of one job.
//! - **[`JobRecord`](job::JobRecord)** / **[`StatusSnapshot`](job::StatusSnapshot)**: lifecycle tracking.
//! - **[`Orchestrator`](traits::Orchestrator)**: trait implemented by the Kubernetes, Docker and mock backends.

pub mod constants;
pub mod error;
pub mod job;
pub mod manifest;
pub mod request;
pub mod traits;

pub mod prelude {
    pub use super::constants::*;
    pub use super::error::*;
    pub use super::job::*;
    pub use super::manifest::*;
    pub use super::request::*;
    pub use super::traits::*;
}
