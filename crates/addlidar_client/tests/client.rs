use addlidar_client::{AddLidarClient, AddLidarClientError};
use addlidar_core::prelude::*;
use addlidar_mock::MockOrchestrator;
use addlidar_server::prelude::*;

use reqwest::StatusCode;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    client: AddLidarClient,
    mock: MockOrchestrator,
    dir: TempDir,
}

async fn start(mock: MockOrchestrator) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mock = mock.with_output_dir(dir.path());

    let config = ServiceConfig {
        spec: JobSpecConfig {
            namespace: Some("lidar".into()),
            image: Some("ghcr.io/epfl-enac/lidardatamanager".into()),
            image_tag: Some("latest".into()),
            input_volume: Some(VolumeSource::Claim("lidar-data-pvc".into())),
            output_volume: Some(VolumeSource::Claim("lidar-data-output-pvc".into())),
            ..Default::default()
        },
        output_dir: dir.path().to_path_buf(),
        watcher: WatcherConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        },
        ..Default::default()
    };
    let jobs = JobService::new(mock.clone(), config).unwrap();
    let app = AddLidarServer::default().build(jobs);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Harness {
        client: AddLidarClient::new(format!("http://{addr}"), Some("test-token".into())),
        mock,
        dir,
    }
}

fn completing() -> MockOrchestrator {
    MockOrchestrator::new().with_script(vec![
        Condition::new(Phase::Running, "Pod running"),
        Condition::new(Phase::Succeeded, "Job completed"),
    ])
}

fn request() -> ProcessingRequest {
    let mut request = ProcessingRequest::new("sample.las");
    request.format = Some("las".into());
    request.remove_color = true;
    request
}

#[tokio::test]
async fn submit_watch_and_download() {
    let harness = start(completing()).await;
    let client = &harness.client;

    let submitted = client.submit(&request()).await.unwrap();
    assert!(submitted.accepted);
    let job_name = submitted.job_name.unwrap();

    let mut seen = Vec::new();
    let last = client
        .watch(&job_name, |snapshot| seen.push(snapshot.state))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.state, JobState::Succeeded);
    assert_eq!(seen.last(), Some(&JobState::Succeeded));

    let destination = harness.dir.path().join("downloaded.las");
    let written = client.download(&job_name, &destination).await.unwrap();
    let content = std::fs::read_to_string(&destination).unwrap();
    assert_eq!(written, content.len() as u64);
    assert!(content.contains("--remove-color"));

    let listed = client.list().await.unwrap();
    assert!(listed.iter().any(|s| s.job_name == job_name));
}

#[tokio::test]
async fn invalid_request_is_an_api_error() {
    let harness = start(MockOrchestrator::new()).await;

    let mut bad = request();
    bad.input_file = "../etc/passwd".into();
    let err = harness.client.submit(&bad).await.unwrap_err();

    assert_eq!(err.code(), Some(codes::VALIDATION_FAILED));
    assert!(matches!(err, AddLidarClientError::Api { status, .. } if status == StatusCode::BAD_REQUEST));
    assert!(harness.mock.submitted().is_empty());

    let (status, body) = harness.client.submit_raw(&bad).await.unwrap();
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body.accepted);
}

#[tokio::test]
async fn unknown_jobs_are_reported() {
    let harness = start(MockOrchestrator::new()).await;
    let client = &harness.client;

    let err = client.status("nope").await.unwrap_err();
    assert_eq!(err.code(), Some(codes::JOB_NOT_FOUND));

    let err = client.watch("nope", |_| {}).await.unwrap_err();
    assert!(matches!(err, AddLidarClientError::NotFound(name) if name == "nope"));
}

#[tokio::test]
async fn delete_removes_the_job() {
    let harness = start(MockOrchestrator::new()).await;
    let client = &harness.client;

    let job_name = client.submit(&request()).await.unwrap().job_name.unwrap();
    client.delete(&job_name).await.unwrap();
    client.delete(&job_name).await.unwrap();

    assert!(!harness.mock.contains(&job_name));
    assert!(client.status(&job_name).await.is_err());
}
