use crate::jobs::Download;
use crate::state::AppState;

use addlidar_core::prelude::*;
use axum::{
    Json,
    body::Body,
    extract::{
        Path, State,
        rejection::JsonRejection,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde::Serialize;
use tracing::{debug, error, info};

/// Error body of every failed request: `{"code": "...", "message": "..."}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

pub struct ApiError(anyhow::Error);

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Some(err) = self.0.downcast_ref::<JobError>() {
            let status = job_status(err);
            if status.is_server_error() {
                error!("Internal Server JobError: {:?}", self.0);
            }
            return error_response(status, err.code(), err.to_string());
        }

        if let Some(err) = self.0.downcast_ref::<OrchestratorError>() {
            let status = orchestrator_status(err);
            if status.is_server_error() {
                error!("Orchestrator Error: {:?}", self.0);
            }
            return error_response(status, err.code(), err.to_string());
        }

        if let Some(err) = self.0.downcast_ref::<ValidationError>() {
            return error_response(
                StatusCode::BAD_REQUEST,
                codes::VALIDATION_FAILED,
                err.to_string(),
            );
        }

        error!("Internal Server Error: {:?}", self.0);
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::INTERNAL,
            "Internal Server Error".to_string(),
        )
    }
}

fn error_response(status: StatusCode, code: &str, message: String) -> Response {
    let body = ErrorBody {
        code: code.to_string(),
        message,
    };
    (status, Json(body)).into_response()
}

/// HTTP status of a [`JobError`].
pub fn job_status(err: &JobError) -> StatusCode {
    match err {
        JobError::Validation(_) => StatusCode::BAD_REQUEST,
        JobError::Submission { source, .. } | JobError::Orchestrator(source) => {
            orchestrator_status(source)
        }
        JobError::NotFound(_) => StatusCode::NOT_FOUND,
        JobError::NotReady { .. }
        | JobError::InvalidTransition { .. }
        | JobError::AlreadyExists(_) => StatusCode::CONFLICT,
        JobError::OutputMissing { .. } | JobError::Config(_) | JobError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Orchestrator 4xx answers pass through, every other failure is a gateway error.
pub fn orchestrator_status(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::Rejected { code, .. } => StatusCode::from_u16(*code)
            .ok()
            .filter(StatusCode::is_client_error)
            .unwrap_or(StatusCode::BAD_GATEWAY),
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        OrchestratorError::Unavailable(_) => StatusCode::BAD_GATEWAY,
        OrchestratorError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
    }
}

/// POST /jobs
///
/// Answers with a [`SubmitResponse`] for accepted and refused jobs alike.
pub async fn submit<O: Orchestrator>(
    State(state): State<AppState<O>>,
    payload: Result<Json<ProcessingRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let response = SubmitResponse {
                job_name: None,
                accepted: false,
                status: None,
                error: Some(ErrorDetail::new(
                    codes::VALIDATION_FAILED,
                    rejection.body_text(),
                )),
            };
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    match state.jobs.submit(request).await {
        Ok(record) => {
            let response = SubmitResponse {
                job_name: Some(record.job_name.clone()),
                accepted: true,
                status: Some(record.snapshot()),
                error: None,
            };
            (StatusCode::CREATED, Json(response)).into_response()
        }
        Err(err) => {
            let status = job_status(&err);
            if status.is_server_error() {
                error!("Job submission failed: {err}");
            }
            let job_name = match &err {
                JobError::Submission { job_name, .. } => Some(job_name.clone()),
                _ => None,
            };
            let response = SubmitResponse {
                status: job_name.as_deref().and_then(|n| state.jobs.status(n).ok()),
                job_name,
                accepted: false,
                error: Some(ErrorDetail::from(&err)),
            };
            (status, Json(response)).into_response()
        }
    }
}

/// GET /jobs
pub async fn list_jobs<O: Orchestrator>(
    State(state): State<AppState<O>>,
) -> Json<Vec<StatusSnapshot>> {
    Json(state.jobs.list())
}

/// GET /jobs/{job_name}
pub async fn get_status<O: Orchestrator>(
    State(state): State<AppState<O>>,
    Path(job_name): Path<String>,
) -> Result<Json<StatusSnapshot>, ApiError> {
    Ok(Json(state.jobs.status(&job_name)?))
}

/// GET /jobs/{job_name}/logs
pub async fn get_logs<O: Orchestrator>(
    State(state): State<AppState<O>>,
    Path(job_name): Path<String>,
) -> Result<Response, ApiError> {
    let logs = state.jobs.logs(&job_name).await?;
    let body = Body::from_stream(logs.map_ok(|log| log.message));
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}

/// GET /jobs/{job_name}/download
pub async fn download<O: Orchestrator>(
    State(state): State<AppState<O>>,
    Path(job_name): Path<String>,
) -> Result<Response, ApiError> {
    let Download {
        file_name,
        content_type,
        len,
        body,
    } = state.jobs.download(&job_name).await?;

    let headers = [
        (header::CONTENT_TYPE, content_type),
        (header::CONTENT_LENGTH, len.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        ),
    ];
    Ok((headers, Body::from_stream(body)).into_response())
}

/// DELETE /jobs/{job_name}
pub async fn cleanup<O: Orchestrator>(
    State(state): State<AppState<O>>,
    Path(job_name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.jobs.cleanup(&job_name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /jobs/{job_name}/watch
pub async fn watch<O: Orchestrator>(
    State(state): State<AppState<O>>,
    Path(job_name): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_watch_socket(state, job_name, socket))
}

async fn handle_watch_socket<O: Orchestrator>(
    state: AppState<O>,
    job_name: String,
    mut socket: WebSocket,
) {
    let mut subscription = match state.jobs.subscribe(&job_name) {
        Ok(subscription) => subscription,
        Err(err) => {
            let frame = CloseFrame {
                code: close_codes::UNKNOWN_JOB,
                reason: err.to_string().into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    info!("Watching job {}", job_name);

    let close = loop {
        tokio::select! {
            snapshot = subscription.next() => {
                let Some(snapshot) = snapshot else {
                    break Some(CloseFrame {
                        code: close_codes::NORMAL,
                        reason: "job finished".into(),
                    });
                };
                match serde_json::to_string(&snapshot) {
                    Ok(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break None;
                        }
                    }
                    Err(e) => {
                        error!("Serialization error: {:?}", e);
                        break Some(CloseFrame {
                            code: close_codes::INTERNAL,
                            reason: "serialization error".into(),
                        });
                    }
                }
            }
            client_msg = socket.recv() => {
                match client_msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break None,
                    _ => {}
                }
            }
        }
    };

    if let Some(frame) = close {
        let _ = socket.send(Message::Close(Some(frame))).await;
    }
    debug!("Stopped watching job {}", job_name);
}
