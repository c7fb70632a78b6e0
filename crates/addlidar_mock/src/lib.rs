//! # addlidar Mock Orchestrator
//!
//! An in-memory [`Orchestrator`] for tests and local demos.
//!
//! Every submitted job starts `Pending` and then walks through a script of
//! conditions, one step per status poll. Tests can also drive a job by hand,
//! make it vanish, or inject rejections and failures.
//!
//! **DO NOT use this in production!!!** Nothing is actually executed.
//!
//! ## Usage
//!
//! ```rust
//! # use addlidar_mock::MockOrchestrator;
//! # use addlidar_core::prelude::*;
//! let orchestrator = MockOrchestrator::new().with_script(vec![
//!     Condition::new(Phase::Running, "Pod running"),
//!     Condition::new(Phase::Succeeded, "Job completed"),
//! ]);
//! ```

use addlidar_core::prelude::*;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Default)]
pub struct MockOrchestrator {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    jobs: HashMap<String, MockJob>,
    script: Vec<Condition>,
    output_dir: Option<PathBuf>,
    reject_next: Option<OrchestratorError>,
    hang_next_submit: bool,
    status_failures: HashMap<String, OrchestratorError>,
    delete_failures: HashMap<String, OrchestratorError>,
    submitted: Vec<JobSpec>,
    deleted: Vec<String>,
    status_calls: usize,
}

struct MockJob {
    spec: JobSpec,
    created_at: DateTime<Utc>,
    current: Condition,
    steps: VecDeque<Condition>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conditions every new job walks through, one per status poll.
    pub fn with_script(self, script: Vec<Condition>) -> Self {
        self.state().script = script;
        self
    }

    /// Writes a placeholder output file here when a job reaches `Succeeded`.
    pub fn with_output_dir(self, dir: impl Into<PathBuf>) -> Self {
        self.state().output_dir = Some(dir.into());
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next submission fails like an admission controller would.
    pub fn reject_next(&self, code: u16, reason: &str, message: &str) {
        self.state().reject_next = Some(OrchestratorError::Rejected {
            code,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }

    /// The next submission fails with an arbitrary error.
    pub fn fail_next_submit(&self, error: OrchestratorError) {
        self.state().reject_next = Some(error);
    }

    /// The next submission creates the job but never answers.
    pub fn hang_next_submit(&self) {
        self.state().hang_next_submit = true;
    }

    /// Replaces the job's condition and drops any remaining script steps.
    pub fn set_condition(&self, job_name: &str, condition: Condition) {
        let mut state = self.state();
        let output_dir = state.output_dir.clone();
        if let Some(job) = state.jobs.get_mut(job_name) {
            job.steps.clear();
            job.current = condition;
            job.produce_output(output_dir.as_ref());
        }
    }

    /// Removes the job as if it had been deleted behind our back.
    pub fn vanish(&self, job_name: &str) {
        self.state().jobs.remove(job_name);
    }

    /// Adds a job that was created outside this process.
    pub fn insert_existing(&self, spec: JobSpec, condition: Condition) {
        let job = MockJob {
            spec,
            created_at: Utc::now(),
            current: condition,
            steps: VecDeque::new(),
        };
        self.state().jobs.insert(job.spec.job_name.clone(), job);
    }

    pub fn fail_status(&self, job_name: &str, error: OrchestratorError) {
        self.state()
            .status_failures
            .insert(job_name.to_string(), error);
    }

    pub fn clear_status_failure(&self, job_name: &str) {
        self.state().status_failures.remove(job_name);
    }

    pub fn fail_delete(&self, job_name: &str, error: OrchestratorError) {
        self.state()
            .delete_failures
            .insert(job_name.to_string(), error);
    }

    pub fn clear_delete_failure(&self, job_name: &str) {
        self.state().delete_failures.remove(job_name);
    }

    pub fn contains(&self, job_name: &str) -> bool {
        self.state().jobs.contains_key(job_name)
    }

    pub fn submitted(&self) -> Vec<JobSpec> {
        self.state().submitted.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub fn status_calls(&self) -> usize {
        self.state().status_calls
    }
}

impl MockJob {
    fn produce_output(&self, output_dir: Option<&PathBuf>) {
        if self.current.phase != Phase::Succeeded {
            return;
        }
        let (Some(dir), Some(file)) = (output_dir, self.spec.output_file()) else {
            return;
        };
        let content = format!("{}\n", self.spec.args.join(" "));
        // A missing output is what the server has to cope with anyway.
        let _ = std::fs::write(dir.join(file), content);
    }
}

impl Orchestrator for MockOrchestrator {
    async fn submit(&self, spec: &JobSpec) -> Result<String, OrchestratorError> {
        let hang = {
            let mut state = self.state();
            if let Some(err) = state.reject_next.take() {
                return Err(err);
            }
            if state.jobs.contains_key(&spec.job_name) {
                return Err(OrchestratorError::Rejected {
                    code: 409,
                    reason: "AlreadyExists".into(),
                    message: format!("jobs.batch \"{}\" already exists", spec.job_name),
                });
            }

            let job = MockJob {
                spec: spec.clone(),
                created_at: Utc::now(),
                current: Condition::new(Phase::Pending, "Job submitted"),
                steps: state.script.iter().cloned().collect(),
            };
            state.submitted.push(spec.clone());
            state.jobs.insert(spec.job_name.clone(), job);
            std::mem::take(&mut state.hang_next_submit)
        };

        if hang {
            std::future::pending::<()>().await;
        }
        Ok(spec.job_name.clone())
    }

    async fn get_status(&self, job_name: &str) -> Result<Condition, OrchestratorError> {
        let mut state = self.state();
        state.status_calls += 1;
        if let Some(err) = state.status_failures.get(job_name) {
            return Err(err.clone());
        }

        let output_dir = state.output_dir.clone();
        let job = state
            .jobs
            .get_mut(job_name)
            .ok_or_else(|| OrchestratorError::NotFound(job_name.to_string()))?;

        if let Some(next) = job.steps.pop_front() {
            job.current = next;
            job.produce_output(output_dir.as_ref());
        }
        Ok(job.current.clone())
    }

    async fn get_logs(&self, job_name: &str) -> Result<LogStream, OrchestratorError> {
        let state = self.state();
        let job = state
            .jobs
            .get(job_name)
            .ok_or_else(|| OrchestratorError::NotFound(job_name.to_string()))?;

        let lines = vec![
            format!("Running {} {}\n", job.spec.image, job.spec.args.join(" ")),
            format!("{}\n", job.current.message),
        ];
        let timestamp = Some(job.created_at.to_rfc3339());
        let stream = stream::iter(lines).map(move |message| {
            Ok(LogOutput {
                source: LogSource::Stdout,
                timestamp: timestamp.clone(),
                message,
            })
        });

        Ok(stream.boxed())
    }

    async fn delete(&self, job_name: &str) -> Result<Deletion, OrchestratorError> {
        let mut state = self.state();
        if let Some(err) = state.delete_failures.get(job_name) {
            return Err(err.clone());
        }
        state.deleted.push(job_name.to_string());
        Ok(match state.jobs.remove(job_name) {
            Some(_) => Deletion::Deleted,
            None => Deletion::NotFound,
        })
    }

    async fn list(&self) -> Result<Vec<JobSummary>, OrchestratorError> {
        let state = self.state();
        let mut jobs: Vec<JobSummary> = state
            .jobs
            .values()
            .map(|job| JobSummary {
                job_name: job.spec.job_name.clone(),
                condition: job.current.clone(),
                created_at: Some(job.created_at),
                output_file: job.spec.output_file().map(str::to_string),
                arguments: job.spec.args.clone(),
            })
            .collect();
        jobs.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(name: &str) -> JobSpec {
        JobSpec {
            job_name: name.to_string(),
            namespace: "default".into(),
            image: "lidardatamanager:latest".into(),
            command: vec![],
            args: vec!["-i=/data/a.las".into()],
            volumes: vec![],
            resources: Resources::default(),
            ttl_seconds_after_finished: 3600,
            active_deadline_seconds: None,
            backoff_limit: 0,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn walks_through_script_one_step_per_poll() {
        let mock = MockOrchestrator::new().with_script(vec![
            Condition::new(Phase::Running, "running"),
            Condition::new(Phase::Succeeded, "done"),
        ]);
        mock.submit(&spec("job-a")).await.unwrap();

        assert_eq!(mock.get_status("job-a").await.unwrap().phase, Phase::Running);
        assert_eq!(
            mock.get_status("job-a").await.unwrap().phase,
            Phase::Succeeded
        );
        assert_eq!(
            mock.get_status("job-a").await.unwrap().phase,
            Phase::Succeeded
        );
    }

    #[tokio::test]
    async fn rejection_applies_once() {
        let mock = MockOrchestrator::new();
        mock.reject_next(403, "Forbidden", "exceeded quota");

        let err = mock.submit(&spec("job-a")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Rejected { code: 403, .. }));
        assert!(!mock.contains("job-a"));
        assert!(mock.submit(&spec("job-a")).await.is_ok());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let mock = MockOrchestrator::new();
        mock.submit(&spec("job-a")).await.unwrap();

        assert_eq!(mock.delete("job-a").await.unwrap(), Deletion::Deleted);
        assert_eq!(mock.delete("job-a").await.unwrap(), Deletion::NotFound);
        assert!(matches!(
            mock.get_status("job-a").await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn writes_output_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockOrchestrator::new().with_output_dir(dir.path());
        mock.submit(&spec("job-a").with_output_file("out.pcd"))
            .await
            .unwrap();

        mock.set_condition("job-a", Condition::new(Phase::Succeeded, "done"));
        let content = std::fs::read_to_string(dir.path().join("out.pcd")).unwrap();
        assert_eq!(content, "-i=/data/a.las\n");
    }
}
