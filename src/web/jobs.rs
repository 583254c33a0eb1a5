//! In-memory job registry for the REST surface.
//!
//! Starting an operation returns an opaque job id immediately; the work
//! runs in a spawned task and updates the record. Completed records are
//! kept for five minutes so pollers can observe the outcome, then dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::constants::jobs::EXPIRY_SECONDS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub host_id: Option<String>,
    pub action: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    finished_at: Option<Instant>,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, host_id: Option<&str>, action: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let record = JobRecord {
            id: id.clone(),
            host_id: host_id.map(str::to_string),
            action: action.to_string(),
            status: JobStatus::Running,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.jobs.lock().unwrap().insert(id.clone(), record);
        id
    }

    pub fn complete(&self, id: &str, error: Option<String>) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(record) = jobs.get_mut(id) {
            record.status = if error.is_some() {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            };
            record.error = error;
            record.finished_at = Some(Instant::now());
        }
    }

    pub fn get(&self, id: &str) -> Option<JobRecord> {
        self.jobs.lock().unwrap().get(id).cloned()
    }

    /// Drop finished records past their retention window.
    pub fn cleanup_expired(&self) -> usize {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, record| match record.finished_at {
            Some(finished) => finished.elapsed().as_secs() < EXPIRY_SECONDS,
            None => true,
        });
        let removed = before - jobs.len();
        if removed > 0 {
            debug!("Expired {} finished job records", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_lifecycle() {
        let registry = JobRegistry::new();
        let id = registry.create(Some("h1"), "check");

        let record = registry.get(&id).unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.host_id.as_deref(), Some("h1"));

        registry.complete(&id, None);
        assert_eq!(registry.get(&id).unwrap().status, JobStatus::Completed);

        let id2 = registry.create(None, "check_all");
        registry.complete(&id2, Some("boom".into()));
        let failed = registry.get(&id2).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn running_jobs_survive_cleanup() {
        let registry = JobRegistry::new();
        let running = registry.create(Some("h1"), "check");
        let finished = registry.create(Some("h1"), "check");
        registry.complete(&finished, None);

        // Freshly finished records are still within the window.
        assert_eq!(registry.cleanup_expired(), 0);
        assert!(registry.get(&running).is_some());
        assert!(registry.get(&finished).is_some());
    }

    #[test]
    fn unknown_job_is_none() {
        assert!(JobRegistry::new().get("nope").is_none());
    }
}
