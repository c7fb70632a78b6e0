//! In-memory record of every job this process submitted or recovered.
//!
//! All mutations take the same write lock and never await while holding it,
//! so updates to one record are serialized and readers always see a
//! consistent snapshot.

use addlidar_core::prelude::*;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<String, JobRecord>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, JobRecord>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, JobRecord>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, record: JobRecord) -> Result<JobRecord, JobError> {
        let mut jobs = self.write();
        if jobs.contains_key(&record.job_name) {
            return Err(JobError::AlreadyExists(record.job_name));
        }
        jobs.insert(record.job_name.clone(), record.clone());
        Ok(record)
    }

    pub fn get(&self, job_name: &str) -> Result<JobRecord, JobError> {
        self.read()
            .get(job_name)
            .cloned()
            .ok_or_else(|| JobError::NotFound(job_name.to_string()))
    }

    pub fn contains(&self, job_name: &str) -> bool {
        self.read().contains_key(job_name)
    }

    /// Applies `transition` and returns the record as it is afterwards.
    pub fn update(&self, job_name: &str, transition: Transition) -> Result<JobRecord, JobError> {
        let mut jobs = self.write();
        let record = jobs
            .get_mut(job_name)
            .ok_or_else(|| JobError::NotFound(job_name.to_string()))?;
        record.transition(transition)?;
        Ok(record.clone())
    }

    /// All records, oldest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.read().values().cloned().collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_name.cmp(&b.job_name))
        });
        records
    }

    /// Drops the record, returning it in its final `Reaped` state.
    pub fn remove(&self, job_name: &str) -> Option<JobRecord> {
        let mut record = self.write().remove(job_name)?;
        let _ = record.transition(Transition::new(JobState::Reaped, "Job resources released"));
        Some(record)
    }

    /// Notes the first completed download; the reaper shortens retention afterwards.
    pub fn mark_downloaded(&self, job_name: &str) -> Result<JobRecord, JobError> {
        let mut jobs = self.write();
        let record = jobs
            .get_mut(job_name)
            .ok_or_else(|| JobError::NotFound(job_name.to_string()))?;
        if record.downloaded_at.is_none() {
            record.downloaded_at = Some(Utc::now());
        }
        Ok(record.clone())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitted(registry: &JobRegistry, name: &str) {
        registry
            .insert(JobRecord::new(name, None, vec![], Some("out.bin".into())))
            .unwrap();
        registry
            .update(name, Transition::new(JobState::Submitting, "submitting"))
            .unwrap();
        registry
            .update(
                name,
                Transition::new(JobState::Running, "accepted").with_phase(Phase::Pending),
            )
            .unwrap();
    }

    #[test]
    fn rejects_duplicate_names() {
        let registry = JobRegistry::new();
        registry
            .insert(JobRecord::new("lidar-job-a", None, vec![], None))
            .unwrap();
        let err = registry
            .insert(JobRecord::new("lidar-job-a", None, vec![], None))
            .unwrap_err();
        assert!(matches!(err, JobError::AlreadyExists(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn update_returns_the_new_state() {
        let registry = JobRegistry::new();
        submitted(&registry, "lidar-job-a");

        let record = registry
            .update(
                "lidar-job-a",
                Transition::new(JobState::Succeeded, "done").with_phase(Phase::Succeeded),
            )
            .unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(registry.get("lidar-job-a").unwrap().phase, Phase::Succeeded);
    }

    #[test]
    fn invalid_transition_leaves_record_untouched() {
        let registry = JobRegistry::new();
        submitted(&registry, "lidar-job-a");
        registry
            .update("lidar-job-a", Transition::new(JobState::Failed, "boom"))
            .unwrap();

        assert!(
            registry
                .update("lidar-job-a", Transition::new(JobState::Running, "again"))
                .is_err()
        );
        let record = registry.get("lidar-job-a").unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.message, "boom");
    }

    #[test]
    fn unknown_jobs_are_not_found() {
        let registry = JobRegistry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(JobError::NotFound(name)) if name == "nope"
        ));
        assert!(registry.remove("nope").is_none());
    }

    #[test]
    fn remove_marks_reaped() {
        let registry = JobRegistry::new();
        submitted(&registry, "lidar-job-a");

        let record = registry.remove("lidar-job-a").unwrap();
        assert_eq!(record.state, JobState::Reaped);
        assert!(registry.is_empty());
    }

    #[test]
    fn first_download_time_sticks() {
        let registry = JobRegistry::new();
        submitted(&registry, "lidar-job-a");

        let first = registry.mark_downloaded("lidar-job-a").unwrap().downloaded_at;
        let second = registry.mark_downloaded("lidar-job-a").unwrap().downloaded_at;
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn lists_oldest_first() {
        let registry = JobRegistry::new();
        submitted(&registry, "lidar-job-b");
        std::thread::sleep(std::time::Duration::from_millis(2));
        submitted(&registry, "lidar-job-a");

        let names: Vec<_> = registry.list().into_iter().map(|r| r.job_name).collect();
        assert_eq!(names, ["lidar-job-b", "lidar-job-a"]);
    }
}
