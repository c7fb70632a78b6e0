use crate::{api, prelude::*};
use addlidar_core::prelude::*;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// The builder for the addlidar server.
#[derive(Clone, Debug, Default)]
pub struct AddLidarServer {
    config: AddLidarServerConfig,
}

impl AddLidarServer {
    pub fn new(config: AddLidarServerConfig) -> Self {
        Self { config }
    }
}

#[derive(Clone, Debug)]
pub struct AddLidarServerConfig {
    /// Upper bound for request bodies.
    ///
    /// Defaults to 64 KiB, processing requests are small JSON documents.
    pub body_limit: usize,
}

impl Default for AddLidarServerConfig {
    fn default() -> Self {
        Self {
            body_limit: 64 * 1024,
        }
    }
}

impl AddLidarServer {
    pub fn build<O: Orchestrator>(self, jobs: JobService<O>) -> Router {
        let AddLidarServerConfig { body_limit } = self.config;
        Router::new()
            .route(routes::HEALTH, get(|| async { "OK" }))
            .route(
                routes::JOBS,
                post(api::submit::<O>).get(api::list_jobs::<O>),
            )
            .route(
                routes::JOB_BY_NAME,
                get(api::get_status::<O>).delete(api::cleanup::<O>),
            )
            .route(routes::JOB_WATCH, get(api::watch::<O>))
            .route(routes::JOB_LOGS, get(api::get_logs::<O>))
            .route(routes::JOB_DOWNLOAD, get(api::download::<O>))
            .layer(DefaultBodyLimit::max(body_limit))
            .layer(TraceLayer::new_for_http())
            .with_state(AppState { jobs })
    }
}
