//! # addlidar Client
//!
//! An async HTTP client for an addlidar server.
//!
//! Used by the `addlidar` CLI and by scripts to submit processing requests,
//! follow their status and fetch the resulting point cloud.
//!
//! ## Example
//!
//! ```no_run
//!  use addlidar_client::AddLidarClient;
//!  use addlidar_core::request::ProcessingRequest;
//!  use std::path::Path;
//!
//!  async fn run() -> anyhow::Result<()> {
//!     let client = AddLidarClient::new("http://localhost:3000", None);
//!
//!     let mut request = ProcessingRequest::new("survey/tile_42.laz");
//!     request.format = Some("laz".into());
//!     let submitted = client.submit(&request).await?;
//!     let job_name = submitted.job_name.unwrap_or_default();
//!
//!     // Block until the job is terminal
//!     let last = client
//!         .watch(&job_name, |snapshot| println!("{}: {}", snapshot.state, snapshot.message))
//!         .await?;
//!
//!     if last.is_some_and(|s| s.state == addlidar_core::job::JobState::Succeeded) {
//!         client.download(&job_name, Path::new("tile_42.laz")).await?;
//!     }
//!     Ok(())
//! }
//! ```

use addlidar_core::prelude::{routes::*, *};
use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

#[derive(Error, Debug)]
pub enum AddLidarClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Error answer that did not carry a JSON error body.
    #[error("Server returned error {0}: {1}")]
    ServerError(StatusCode, String),

    /// Error answer with the server's `{code, message}` body.
    #[error("Server returned {status} ({code}): {message}")]
    Api {
        status: StatusCode,
        code: String,
        message: String,
    },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl AddLidarClientError {
    /// The machine-readable error code, if the server sent one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AddLidarClientError>;

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Clone)]
pub struct AddLidarClient {
    base_url: String,
    client: Client,
    token: Option<String>,
}

impl AddLidarClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn auth_request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.token {
            builder.header("Authorization", format!("Bearer {token}"))
        } else {
            builder
        }
    }

    fn job_url(&self, route: &str, job_name: &str) -> String {
        format!("{}{}", self.base_url, route.replace("{job_name}", job_name))
    }

    /// Submits a processing request.
    ///
    /// Refused submissions come back as [`AddLidarClientError::Api`]; use
    /// [`AddLidarClient::submit_raw`] to get the [`SubmitResponse`] instead.
    pub async fn submit(&self, request: &ProcessingRequest) -> Result<SubmitResponse> {
        let (status, body) = self.submit_raw(request).await?;
        if status.is_success() {
            return Ok(body);
        }
        let (code, message) = match body.error {
            Some(error) => (error.code, error.message),
            None => (codes::INTERNAL.to_string(), "Submission refused".to_string()),
        };
        Err(AddLidarClientError::Api {
            status,
            code,
            message,
        })
    }

    /// Submits a processing request and returns the answer as is, accepted or not.
    pub async fn submit_raw(
        &self,
        request: &ProcessingRequest,
    ) -> Result<(StatusCode, SubmitResponse)> {
        let url = format!("{}{}", self.base_url, JOBS);
        let response = self
            .auth_request(self.client.post(&url))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        match serde_json::from_str::<SubmitResponse>(&text) {
            Ok(body) => Ok((status, body)),
            Err(_) if !status.is_success() => Err(error_from_text(status, text)),
            Err(e) => Err(AddLidarClientError::Validation(format!(
                "Failed to parse submit response: {e}"
            ))),
        }
    }

    pub async fn status(&self, job_name: &str) -> Result<StatusSnapshot> {
        let url = self.job_url(JOB_BY_NAME, job_name);
        let response = self.auth_request(self.client.get(&url)).send().await?;
        let response = check(response).await?;

        response
            .json()
            .await
            .map_err(|e| AddLidarClientError::Validation(format!("Failed to parse status: {e}")))
    }

    pub async fn list(&self) -> Result<Vec<StatusSnapshot>> {
        let url = format!("{}{}", self.base_url, JOBS);
        let response = self.auth_request(self.client.get(&url)).send().await?;
        let response = check(response).await?;

        response
            .json()
            .await
            .map_err(|e| AddLidarClientError::Validation(format!("Failed to parse job list: {e}")))
    }

    pub async fn logs(&self, job_name: &str) -> Result<String> {
        let url = self.job_url(JOB_LOGS, job_name);
        let response = self.auth_request(self.client.get(&url)).send().await?;
        let response = check(response).await?;
        Ok(response.text().await?)
    }

    /// Streams the job's output into `destination`, returning the number of bytes written.
    pub async fn download(&self, job_name: &str, destination: &Path) -> Result<u64> {
        let url = self.job_url(JOB_DOWNLOAD, job_name);
        let response = self.auth_request(self.client.get(&url)).send().await?;
        let response = check(response).await?;

        let mut file = File::create(destination).await?;
        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }

    /// Cancels the job if it is still running and forgets it. Deleting twice is fine.
    pub async fn delete(&self, job_name: &str) -> Result<()> {
        let url = self.job_url(JOB_BY_NAME, job_name);
        let response = self.auth_request(self.client.delete(&url)).send().await?;
        check(response).await?;
        Ok(())
    }

    /// Follows the job's status over a WebSocket, calling `on_update` for every snapshot.
    ///
    /// Returns the last snapshot received once the server closes the stream.
    pub async fn watch<F>(&self, job_name: &str, mut on_update: F) -> Result<Option<StatusSnapshot>>
    where
        F: FnMut(&StatusSnapshot),
    {
        let ws_url = websocket_url(&self.job_url(JOB_WATCH, job_name))?;

        let mut req = ws_url.into_client_request()?;
        if let Some(token) = &self.token {
            let header_val = tokio_tungstenite::tungstenite::http::HeaderValue::from_str(&format!(
                "Bearer {token}"
            ))
            .map_err(|e| AddLidarClientError::Validation(e.to_string()))?;
            req.headers_mut().insert("Authorization", header_val);
        }

        let (mut stream, res) = tokio_tungstenite::connect_async(req)
            .await
            .map_err(|e| match e {
                tokio_tungstenite::tungstenite::Error::Http(res) => {
                    AddLidarClientError::ServerError(res.status(), "Handshake rejected".into())
                }
                _ => AddLidarClientError::WebSocket(e),
            })?;

        if res.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(AddLidarClientError::ServerError(
                res.status(),
                "Upgrade failed".into(),
            ));
        }

        let mut last = None;
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(txt)) => {
                    let snapshot: StatusSnapshot = serde_json::from_str(txt.as_str()).map_err(|e| {
                        AddLidarClientError::Validation(format!("Failed to parse snapshot: {e}"))
                    })?;
                    on_update(&snapshot);
                    last = Some(snapshot);
                }
                Ok(Message::Close(frame)) => {
                    if frame
                        .as_ref()
                        .is_some_and(|f| u16::from(f.code) == close_codes::UNKNOWN_JOB)
                    {
                        return Err(AddLidarClientError::NotFound(job_name.to_string()));
                    }
                    break;
                }
                Err(e) => {
                    return Err(AddLidarClientError::Connection(format!(
                        "Connection error: {e}"
                    )));
                }
                _ => {}
            }
        }

        Ok(last)
    }
}

/// Maps `http(s)` to `ws(s)`.
pub fn websocket_url(url: &str) -> Result<String> {
    let scheme = Url::from_str(url)?.scheme().to_string();
    match scheme.as_str() {
        "https" => Ok(url.replacen("https://", "wss://", 1)),
        "http" => Ok(url.replacen("http://", "ws://", 1)),
        "ws" | "wss" => Ok(url.to_string()),
        other => Err(AddLidarClientError::Validation(format!(
            "Unsupported URL scheme: {other}"
        ))),
    }
}

async fn check(response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    Err(error_from_text(status, text))
}

fn error_from_text(status: StatusCode, text: String) -> AddLidarClientError {
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => AddLidarClientError::Api {
            status,
            code: body.code,
            message: body.message,
        },
        Err(_) => AddLidarClientError::ServerError(status, text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_urls_follow_the_http_scheme() {
        assert_eq!(
            websocket_url("http://localhost:3000/jobs/a/watch").unwrap(),
            "ws://localhost:3000/jobs/a/watch"
        );
        assert_eq!(
            websocket_url("https://lidar.example.org/jobs/a/watch").unwrap(),
            "wss://lidar.example.org/jobs/a/watch"
        );
        assert!(matches!(
            websocket_url("ftp://example.org/"),
            Err(AddLidarClientError::Validation(_))
        ));
        assert!(matches!(
            websocket_url("not a url"),
            Err(AddLidarClientError::UrlParse(_))
        ));
    }

    #[test]
    fn error_bodies_are_decoded() {
        let err = error_from_text(
            StatusCode::CONFLICT,
            r#"{"code":"not_ready","message":"Job is still running"}"#.into(),
        );
        assert_eq!(err.code(), Some("not_ready"));

        let err = error_from_text(StatusCode::BAD_GATEWAY, "upstream down".into());
        assert!(matches!(err, AddLidarClientError::ServerError(s, _) if s == StatusCode::BAD_GATEWAY));
        assert_eq!(err.code(), None);
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = AddLidarClient::new("http://localhost:3000/", None);
        assert_eq!(
            client.job_url(JOB_LOGS, "lidar-1"),
            "http://localhost:3000/jobs/lidar-1/logs"
        );
    }
}
