//! Periodic cleanup of finished jobs.
//!
//! A record is only dropped after the orchestrator confirmed the deletion.
//! Failed deletions are retried on the next sweep.

use crate::channel::StatusHub;
use crate::registry::JobRegistry;

use addlidar_core::prelude::*;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{Instrument, debug, info, info_span, warn};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// How long a finished job is kept around for status and download.
    pub retention: Duration,
    /// Shorter retention once the output was downloaded.
    pub download_grace: Duration,
    pub request_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            retention: Duration::from_secs(3600),
            download_grace: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reaped: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Clone)]
pub struct Reaper<O: Orchestrator> {
    orchestrator: O,
    registry: JobRegistry,
    hub: StatusHub,
    config: ReaperConfig,
}

impl<O: Orchestrator> Reaper<O> {
    pub fn new(orchestrator: O, registry: JobRegistry, hub: StatusHub, config: ReaperConfig) -> Self {
        Self {
            orchestrator,
            registry,
            hub,
            config,
        }
    }

    /// Whether a record has outlived its retention at `now`.
    pub fn is_expired(&self, record: &JobRecord, now: DateTime<Utc>) -> bool {
        if !record.state.is_terminal() {
            return false;
        }
        let finished_at = record.finished_at.unwrap_or(record.updated_at);
        let age = (now - finished_at).to_std().unwrap_or_default();
        if age >= self.config.retention {
            return true;
        }
        record.downloaded_at.is_some_and(|downloaded_at| {
            (now - downloaded_at).to_std().unwrap_or_default() >= self.config.download_grace
        })
    }

    pub async fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();

        for record in self.registry.list() {
            if !self.is_expired(&record, now) {
                continue;
            }
            match self.reap(&record.job_name).await {
                Ok(_) => report.reaped.push(record.job_name),
                Err(err) => {
                    warn!(job_name = %record.job_name, "Failed to reap job, retrying next sweep: {err}");
                    report.failed.push(record.job_name);
                }
            }
        }

        if !report.reaped.is_empty() || !report.failed.is_empty() {
            info!(
                reaped = report.reaped.len(),
                failed = report.failed.len(),
                "Reaper sweep finished"
            );
        }
        report
    }

    /// Deletes the job on the orchestrator, then forgets it locally.
    pub async fn reap(&self, job_name: &str) -> Result<Deletion, OrchestratorError> {
        let deletion = time::timeout(self.config.request_timeout, self.orchestrator.delete(job_name))
            .await
            .map_err(|_| OrchestratorError::Timeout(format!("delete of {job_name}")))??;

        if deletion == Deletion::NotFound {
            debug!(job_name, "Job was already gone from the orchestrator");
        }
        if self.registry.remove(job_name).is_some() {
            debug!(job_name, "Job reaped");
        }
        self.hub.remove(job_name);
        Ok(deletion)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let span = info_span!("reaper");
        tokio::spawn(
            async move {
                let mut ticker = time::interval(self.config.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    self.sweep().await;
                }
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use addlidar_mock::MockOrchestrator;
    use std::collections::BTreeMap;

    fn spec(name: &str) -> JobSpec {
        JobSpec {
            job_name: name.into(),
            namespace: "lidar".into(),
            image: "lidardatamanager:latest".into(),
            command: vec![],
            args: vec![],
            volumes: vec![],
            resources: Resources::default(),
            ttl_seconds_after_finished: 3600,
            active_deadline_seconds: None,
            backoff_limit: 0,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    fn finished(registry: &JobRegistry, name: &str, state: JobState) -> JobRecord {
        registry
            .insert(JobRecord::new(name, None, vec![], None))
            .unwrap();
        registry
            .update(name, Transition::new(JobState::Submitting, "submitting"))
            .unwrap();
        registry
            .update(name, Transition::new(JobState::Running, "accepted"))
            .unwrap();
        registry
            .update(name, Transition::new(state, "done"))
            .unwrap()
    }

    fn reaper(mock: &MockOrchestrator, registry: &JobRegistry, retention: Duration) -> Reaper<MockOrchestrator> {
        let config = ReaperConfig {
            retention,
            ..Default::default()
        };
        Reaper::new(mock.clone(), registry.clone(), StatusHub::new(), config)
    }

    #[test]
    fn retention_counts_from_finish_and_download() {
        let registry = JobRegistry::new();
        let reaper = reaper(&MockOrchestrator::new(), &registry, Duration::from_secs(3600));
        let now = Utc::now();

        let mut record = finished(&registry, "lidar-job-a", JobState::Succeeded);
        record.finished_at = Some(now - chrono::Duration::minutes(30));
        assert!(!reaper.is_expired(&record, now));

        record.downloaded_at = Some(now - chrono::Duration::seconds(61));
        assert!(reaper.is_expired(&record, now));

        record.downloaded_at = None;
        record.finished_at = Some(now - chrono::Duration::hours(2));
        assert!(reaper.is_expired(&record, now));

        record.state = JobState::Running;
        assert!(!reaper.is_expired(&record, now));
    }

    #[tokio::test]
    async fn sweep_deletes_then_forgets() {
        let mock = MockOrchestrator::new();
        let registry = JobRegistry::new();
        mock.submit(&spec("lidar-job-a")).await.unwrap();
        finished(&registry, "lidar-job-a", JobState::Succeeded);
        finished(&registry, "lidar-job-b", JobState::Failed);

        let report = reaper(&mock, &registry, Duration::ZERO).sweep().await;

        assert_eq!(report.reaped, ["lidar-job-a", "lidar-job-b"]);
        assert!(report.failed.is_empty());
        assert!(registry.is_empty());
        assert!(!mock.contains("lidar-job-a"));
        assert_eq!(mock.deleted(), ["lidar-job-a", "lidar-job-b"]);
    }

    #[tokio::test]
    async fn failed_delete_keeps_the_record() {
        let mock = MockOrchestrator::new();
        let registry = JobRegistry::new();
        mock.submit(&spec("lidar-job-a")).await.unwrap();
        finished(&registry, "lidar-job-a", JobState::Succeeded);
        mock.fail_delete(
            "lidar-job-a",
            OrchestratorError::Unavailable("connection reset".into()),
        );
        let reaper = reaper(&mock, &registry, Duration::ZERO);

        let report = reaper.sweep().await;
        assert_eq!(report.failed, ["lidar-job-a"]);
        assert!(registry.contains("lidar-job-a"));

        mock.clear_delete_failure("lidar-job-a");
        let report = reaper.sweep().await;
        assert_eq!(report.reaped, ["lidar-job-a"]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn running_jobs_are_never_reaped() {
        let mock = MockOrchestrator::new();
        let registry = JobRegistry::new();
        registry
            .insert(JobRecord::new("lidar-job-a", None, vec![], None))
            .unwrap();

        let report = reaper(&mock, &registry, Duration::ZERO).sweep().await;
        assert_eq!(report, SweepReport::default());
        assert!(mock.deleted().is_empty());
    }
}
