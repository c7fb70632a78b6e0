use crate::jobs::JobService;
use addlidar_core::prelude::*;

#[derive(Clone)]
pub struct AppState<O: Orchestrator> {
    pub jobs: JobService<O>,
}
