//! Background job registry.
//!
//! Training and merge runs started over HTTP return immediately with a job
//! id. The registry tracks each job through
//! `pending → running → completed | failed` so clients can poll for the
//! outcome. Jobs live in memory for the life of the process.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Train,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobError {
    pub stage: String,
    pub code: String,
    pub message: String,
}

impl From<&PipelineError> for JobError {
    fn from(err: &PipelineError) -> Self {
        Self {
            stage: err.stage().to_string(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub model_name: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, kind: JobKind, model_name: &str) -> Uuid {
        let id = Uuid::new_v4();
        let job = Job {
            id,
            kind,
            model_name: model_name.to_string(),
            status: JobStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.lock().insert(id, job);
        id
    }

    pub fn mark_running(&self, id: Uuid) {
        if let Some(job) = self.lock().get_mut(&id) {
            job.status = JobStatus::Running;
        }
    }

    pub fn complete(&self, id: Uuid, result: serde_json::Value) {
        if let Some(job) = self.lock().get_mut(&id) {
            job.status = JobStatus::Completed;
            job.result = Some(result);
            job.finished_at = Some(Utc::now());
        }
    }

    pub fn fail(&self, id: Uuid, err: &PipelineError) {
        if let Some(job) = self.lock().get_mut(&id) {
            job.status = JobStatus::Failed;
            job.error = Some(err.into());
            job.finished_at = Some(Utc::now());
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.lock().get(&id).cloned()
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }
}
