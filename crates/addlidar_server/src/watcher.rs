//! Background polling of the orchestrator, one task per running job.

use crate::channel::StatusHub;
use crate::registry::JobRegistry;

use addlidar_core::prelude::*;
use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{Instrument, debug, info, info_span, warn};

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    /// Wall-clock budget of a job, counted from its creation.
    pub job_timeout: Duration,
    /// Bound on a single status call.
    pub request_timeout: Duration,
    /// Consecutive `NotFound` answers before a job counts as lost.
    pub not_found_threshold: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            job_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
            not_found_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The watcher moved the job into this terminal state.
    Finished(JobState),
    /// The job was finished or removed by someone else.
    Released,
}

#[derive(Clone)]
pub struct StatusWatcher<O: Orchestrator> {
    orchestrator: O,
    registry: JobRegistry,
    hub: StatusHub,
    config: WatcherConfig,
}

impl<O: Orchestrator> StatusWatcher<O> {
    pub fn new(orchestrator: O, registry: JobRegistry, hub: StatusHub, config: WatcherConfig) -> Self {
        Self {
            orchestrator,
            registry,
            hub,
            config,
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn spawn(&self, job_name: &str) -> JoinHandle<WatchOutcome> {
        let watcher = self.clone();
        let job_name = job_name.to_string();
        let span = info_span!("watch", job_name = %job_name);
        tokio::spawn(async move { watcher.watch(&job_name).await }.instrument(span))
    }

    /// Polls until the job is terminal, timed out or gone from the registry.
    pub async fn watch(&self, job_name: &str) -> WatchOutcome {
        let deadline = match self.registry.get(job_name) {
            Ok(record) => self.deadline_for(&record),
            Err(_) => return WatchOutcome::Released,
        };

        let mut ticker = time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut misses = 0;
        debug!("Watching job");

        loop {
            ticker.tick().await;

            let record = match self.registry.get(job_name) {
                Ok(record) if !record.state.is_terminal() => record,
                _ => return WatchOutcome::Released,
            };

            if Instant::now() >= deadline {
                let message = format!(
                    "Job did not finish within {}s",
                    self.config.job_timeout.as_secs()
                );
                let transition = Transition::new(JobState::Failed, message.clone())
                    .with_phase(Phase::Failed)
                    .with_error(ErrorDetail::new(codes::JOB_TIMEOUT, message));
                return self
                    .commit(job_name, transition)
                    .unwrap_or(WatchOutcome::Released);
            }

            let polled = time::timeout(
                self.config.request_timeout,
                self.orchestrator.get_status(job_name),
            )
            .await
            .unwrap_or_else(|_| {
                Err(OrchestratorError::Timeout(format!(
                    "status of {job_name} after {:?}",
                    self.config.request_timeout
                )))
            });

            match polled {
                Ok(condition) => {
                    misses = 0;
                    let Some(transition) = next_transition(&record, condition) else {
                        continue;
                    };
                    if let Some(outcome) = self.commit(job_name, transition) {
                        return outcome;
                    }
                }
                Err(OrchestratorError::NotFound(_)) => {
                    misses += 1;
                    debug!(misses, "Job not found on the orchestrator");
                    if misses >= self.config.not_found_threshold {
                        let message = "Job disappeared from the orchestrator";
                        let transition = Transition::new(JobState::Lost, message)
                            .with_phase(Phase::Lost)
                            .with_error(ErrorDetail::new(codes::JOB_LOST, message));
                        return self
                            .commit(job_name, transition)
                            .unwrap_or(WatchOutcome::Released);
                    }
                }
                Err(err) => warn!(retryable = err.is_retryable(), "Status poll failed: {err}"),
            }
        }
    }

    fn deadline_for(&self, record: &JobRecord) -> Instant {
        let elapsed = (Utc::now() - record.created_at)
            .to_std()
            .unwrap_or_default();
        Instant::now() + self.config.job_timeout.saturating_sub(elapsed)
    }

    /// Applies and publishes a transition. [`Some`] means the watch is over.
    fn commit(&self, job_name: &str, transition: Transition) -> Option<WatchOutcome> {
        match self.registry.update(job_name, transition) {
            Ok(record) => {
                self.hub.publish(record.snapshot());
                if record.state.is_terminal() {
                    info!(state = %record.state, "Job finished: {}", record.message);
                    Some(WatchOutcome::Finished(record.state))
                } else {
                    debug!(phase = %record.phase, "Job progressed");
                    None
                }
            }
            Err(err) => {
                debug!("Stopping watch: {err}");
                Some(WatchOutcome::Released)
            }
        }
    }
}

/// Maps a polled condition onto the record, or [`None`] when nothing changed.
///
/// `Unknown` never overwrites a known phase and phases never move backwards.
fn next_transition(record: &JobRecord, condition: Condition) -> Option<Transition> {
    let Condition { phase, message } = condition;
    if phase == record.phase || phase.rank() < record.phase.rank() {
        return None;
    }

    let message = if message.is_empty() {
        format!("Job is {phase}")
    } else {
        message
    };
    let transition = match phase {
        Phase::Unknown => return None,
        Phase::Pending | Phase::Running => Transition::new(JobState::Running, message),
        Phase::Succeeded => Transition::new(JobState::Succeeded, message),
        Phase::Failed => Transition::new(JobState::Failed, message.clone())
            .with_error(ErrorDetail::new(codes::JOB_FAILED, message)),
        Phase::Lost => Transition::new(JobState::Lost, message.clone())
            .with_error(ErrorDetail::new(codes::JOB_LOST, message)),
    };
    Some(transition.with_phase(phase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use addlidar_mock::MockOrchestrator;
    use std::collections::BTreeMap;

    const JOB: &str = "lidar-job-0123456789";

    struct Harness {
        mock: MockOrchestrator,
        registry: JobRegistry,
        hub: StatusHub,
        watcher: StatusWatcher<MockOrchestrator>,
    }

    async fn harness(script: Vec<Condition>, config: WatcherConfig) -> Harness {
        let mock = MockOrchestrator::new().with_script(script);
        let registry = JobRegistry::new();
        let hub = StatusHub::new();

        mock.submit(&JobSpec {
            job_name: JOB.into(),
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
        })
        .await
        .unwrap();

        registry
            .insert(JobRecord::new(JOB, None, vec![], None))
            .unwrap();
        registry
            .update(JOB, Transition::new(JobState::Submitting, "submitting"))
            .unwrap();
        let record = registry
            .update(
                JOB,
                Transition::new(JobState::Running, "accepted").with_phase(Phase::Pending),
            )
            .unwrap();
        hub.publish(record.snapshot());

        let watcher = StatusWatcher::new(mock.clone(), registry.clone(), hub.clone(), config);
        Harness {
            mock,
            registry,
            hub,
            watcher,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn follows_the_job_to_success() {
        let h = harness(
            vec![
                Condition::new(Phase::Running, "Pod running"),
                Condition::new(Phase::Succeeded, "Job completed"),
            ],
            WatcherConfig::default(),
        )
        .await;

        let outcome = h.watcher.spawn(JOB).await.unwrap();
        assert_eq!(outcome, WatchOutcome::Finished(JobState::Succeeded));

        let record = h.registry.get(JOB).unwrap();
        assert_eq!(record.phase, Phase::Succeeded);
        assert_eq!(record.message, "Job completed");
        assert!(record.finished_at.is_some());
        assert!(h.hub.latest(JOB).unwrap().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_phase_is_never_published() {
        let h = harness(
            vec![
                Condition::new(Phase::Unknown, "no pods yet"),
                Condition::new(Phase::Running, "Pod running"),
                Condition::new(Phase::Unknown, "status unavailable"),
                Condition::new(Phase::Failed, "exit code 1"),
            ],
            WatcherConfig::default(),
        )
        .await;
        let mut sub = h.hub.subscribe(h.registry.get(JOB).unwrap().snapshot());

        let outcome = h.watcher.watch(JOB).await;
        assert_eq!(outcome, WatchOutcome::Finished(JobState::Failed));

        let mut phases = Vec::new();
        while let Some(snapshot) = sub.next().await {
            phases.push(snapshot.phase);
        }
        assert_eq!(phases, [Phase::Pending, Phase::Running, Phase::Failed]);

        let error = h.registry.get(JOB).unwrap().error.unwrap();
        assert_eq!(error.code, codes::JOB_FAILED);
        assert_eq!(error.message, "exit code 1");
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_job_is_lost_after_threshold() {
        let h = harness(vec![], WatcherConfig::default()).await;
        h.mock.vanish(JOB);

        let outcome = h.watcher.watch(JOB).await;
        assert_eq!(outcome, WatchOutcome::Finished(JobState::Lost));
        assert_eq!(h.mock.status_calls(), 3);

        let record = h.registry.get(JOB).unwrap();
        assert_eq!(record.phase, Phase::Lost);
        assert_eq!(record.error.unwrap().code, codes::JOB_LOST);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_job_times_out() {
        let config = WatcherConfig {
            job_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let h = harness(vec![], config).await;

        let outcome = h.watcher.watch(JOB).await;
        assert_eq!(outcome, WatchOutcome::Finished(JobState::Failed));

        let record = h.registry.get(JOB).unwrap();
        assert_eq!(record.error.unwrap().code, codes::JOB_TIMEOUT);
        assert!(h.mock.status_calls() >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let h = harness(
            vec![Condition::new(Phase::Succeeded, "Job completed")],
            WatcherConfig::default(),
        )
        .await;
        h.mock
            .fail_status(JOB, OrchestratorError::Unavailable("connection refused".into()));

        let handle = h.watcher.spawn(JOB);
        time::sleep(Duration::from_secs(7)).await;
        assert_eq!(h.registry.get(JOB).unwrap().state, JobState::Running);

        h.mock.clear_status_failure(JOB);
        let outcome = handle.await.unwrap();
        assert_eq!(outcome, WatchOutcome::Finished(JobState::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_someone_else_finished_the_job() {
        let h = harness(vec![], WatcherConfig::default()).await;
        h.registry
            .update(JOB, Transition::new(JobState::Failed, "cancelled"))
            .unwrap();

        assert_eq!(h.watcher.watch(JOB).await, WatchOutcome::Released);
        assert_eq!(h.mock.status_calls(), 0);
    }
}
