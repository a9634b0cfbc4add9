use std::collections::HashMap;
use std::fs;
use std::path::Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::error::{PipelineError, Result};
use crate::job::{Job, JobStatus};
use crate::orchestrator::EngineStatus;

/// What the daemon persists for status viewers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub updated_at: DateTime<Utc>,
    pub engine: EngineStatus,
    pub jobs: Vec<JobSnapshot>,
}

impl StatusSnapshot {
    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    pub fn active(&self) -> usize {
        self.jobs.iter().filter(|j| !j.status.is_terminal()).count()
    }
}

/// Write the snapshot through a scratch file so readers never see half a document
pub fn write_status(path: &Path, snapshot: &StatusSnapshot) -> Result<()> {
    let json = serde_json::to_vec_pretty(snapshot).map_err(|source| PipelineError::Metadata {
        path: path.to_path_buf(),
        source,
    })?;
    let scratch = path.with_extension("json.tmp");
    fs::write(&scratch, json).map_err(|e| PipelineError::io(&scratch, e))?;
    fs::rename(&scratch, path).map_err(|e| PipelineError::io(path, e))
}

pub fn read_status(path: &Path) -> Result<StatusSnapshot> {
    let content = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    serde_json::from_str(&content).map_err(|source| PipelineError::Metadata {
        path: path.to_path_buf(),
        source,
    })
}

/// Operator request dropped into the command directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFile {
    pub action: String,
    pub file_id: String,
    pub timestamp: DateTime<Utc>,
}

impl CommandFile {
    pub fn retry(file_id: impl Into<String>) -> Self {
        Self {
            action: "retry".to_string(),
            file_id: file_id.into(),
            timestamp: Utc::now(),
        }
    }

    /// Drop the command as `<dir>/<action>-<fileId>.json`
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
        let path = dir.join(format!("{}-{}.json", self.action, self.file_id));
        let json = serde_json::to_vec(self).map_err(|source| PipelineError::Metadata {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(|e| PipelineError::io(&path, e))
    }
}

/// Polling view of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub file_id: String,
    pub job_id: Uuid,
    pub original_name: String,
    pub status: JobStatus,
    pub progress: f64,
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        JobSnapshot {
            file_id: job.file_id.clone(),
            job_id: job.job_id,
            original_name: job.original_name.clone(),
            status: job.status,
            progress: job.progress,
            step: job.current_step.clone(),
            error: job.error.as_ref().map(|e| e.message.clone()),
        }
    }
}

/// Jobs currently tracked, one per fileId. Owned by the orchestrator.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Job>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a job; refused while another non-terminal job owns the fileId
    pub fn insert(&mut self, job: Job) -> std::result::Result<(), Job> {
        if let Some(existing) = self.jobs.get(&job.file_id) {
            if !existing.status.is_terminal() {
                return Err(job);
            }
        }
        self.jobs.insert(job.file_id.clone(), job);
        Ok(())
    }

    pub fn get(&self, file_id: &str) -> Option<&Job> {
        self.jobs.get(file_id)
    }

    /// Apply a change to the job if it is still the tracked instance
    pub fn update<R>(&mut self, file_id: &str, job_id: Uuid, change: impl FnOnce(&mut Job) -> R) -> Option<R> {
        self.jobs
            .get_mut(file_id)
            .filter(|job| job.job_id == job_id)
            .map(change)
    }

    /// Drop a terminal job. A newer job for the same fileId is left alone.
    pub fn evict(&mut self, file_id: &str, job_id: Uuid) -> bool {
        let evictable = self
            .jobs
            .get(file_id)
            .map(|job| job.job_id == job_id && job.status.is_terminal())
            .unwrap_or(false);
        if evictable {
            self.jobs.remove(file_id);
        }
        evictable
    }

    /// Snapshot ordered by start time
    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.file_id.cmp(&b.file_id)));
        jobs.into_iter().map(JobSnapshot::from).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
