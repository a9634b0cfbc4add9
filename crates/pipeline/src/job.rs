use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::assets::AssetSummary;
use crate::error::ErrorKind;

/// Lifecycle of one job. Stages run strictly in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Preparing,
    ExtractingMetadata,
    ConvertingMaster,
    GeneratingRenditions,
    GeneratingThumbnails,
    ExtractingSubtitles,
    Finalizing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Working stages in execution order
    pub const STAGES: [JobStatus; 7] = [
        JobStatus::Preparing,
        JobStatus::ExtractingMetadata,
        JobStatus::ConvertingMaster,
        JobStatus::GeneratingRenditions,
        JobStatus::GeneratingThumbnails,
        JobStatus::ExtractingSubtitles,
        JobStatus::Finalizing,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Percentage band (floor, ceiling) owned by the state
    pub fn band(&self) -> (f64, f64) {
        match self {
            JobStatus::Queued => (0.0, 0.0),
            JobStatus::Preparing => (0.0, 10.0),
            JobStatus::ExtractingMetadata => (10.0, 15.0),
            JobStatus::ConvertingMaster => (15.0, 60.0),
            JobStatus::GeneratingRenditions => (60.0, 80.0),
            JobStatus::GeneratingThumbnails => (80.0, 90.0),
            JobStatus::ExtractingSubtitles => (90.0, 95.0),
            JobStatus::Finalizing => (95.0, 100.0),
            JobStatus::Completed => (100.0, 100.0),
            JobStatus::Failed => (0.0, 100.0),
        }
    }

    /// Map an engine percent-complete into this state's band
    pub fn scale(&self, percent: f64) -> f64 {
        let (floor, ceiling) = self.band();
        let percent = if percent.is_finite() { percent.clamp(0.0, 100.0) } else { 0.0 };
        floor + (ceiling - floor) * percent / 100.0
    }

    /// The state that follows in the happy path
    pub fn next(&self) -> Option<JobStatus> {
        match self {
            JobStatus::Queued => Some(JobStatus::Preparing),
            JobStatus::Preparing => Some(JobStatus::ExtractingMetadata),
            JobStatus::ExtractingMetadata => Some(JobStatus::ConvertingMaster),
            JobStatus::ConvertingMaster => Some(JobStatus::GeneratingRenditions),
            JobStatus::GeneratingRenditions => Some(JobStatus::GeneratingThumbnails),
            JobStatus::GeneratingThumbnails => Some(JobStatus::ExtractingSubtitles),
            JobStatus::ExtractingSubtitles => Some(JobStatus::Finalizing),
            JobStatus::Finalizing => Some(JobStatus::Completed),
            JobStatus::Completed | JobStatus::Failed => None,
        }
    }

    /// Human-readable step description
    pub fn step(&self) -> &'static str {
        match self {
            JobStatus::Queued => "Waiting to start",
            JobStatus::Preparing => "Preparing source",
            JobStatus::ExtractingMetadata => "Extracting metadata",
            JobStatus::ConvertingMaster => "Converting to master",
            JobStatus::GeneratingRenditions => "Generating web renditions",
            JobStatus::GeneratingThumbnails => "Generating thumbnails",
            JobStatus::ExtractingSubtitles => "Extracting subtitles",
            JobStatus::Finalizing => "Finalizing",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
        }
    }
}

/// Why a job ended in FAILED
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// The stage that was running when the error surfaced
    pub failed_stage: JobStatus,
    pub failed_step: String,
}

/// Rejected state change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// One unit of work for one fileId
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: Uuid,
    pub file_id: String,
    pub original_name: String,
    pub status: JobStatus,
    pub progress: f64,
    pub current_step: String,
    pub start_time: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<AssetSummary>,
    pub error: Option<JobFailure>,
}

impl Job {
    pub fn new(file_id: impl Into<String>, original_name: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            file_id: file_id.into(),
            original_name: original_name.into(),
            status: JobStatus::Queued,
            progress: 0.0,
            current_step: JobStatus::Queued.step().to_string(),
            start_time: Utc::now(),
            finished_at: None,
            result: None,
            error: None,
        }
    }

    /// Move to the next stage; progress jumps to the new stage's floor but never back
    pub fn advance(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        if to == JobStatus::Failed || to == JobStatus::Completed || self.status.next() != Some(to) {
            return Err(TransitionError { from: self.status, to });
        }
        self.status = to;
        self.current_step = to.step().to_string();
        self.progress = self.progress.max(to.band().0);
        Ok(())
    }

    /// Record progress inside the current stage. Returns true when the value moved forward.
    pub fn report(&mut self, engine_percent: f64, detail: Option<&str>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if let Some(detail) = detail {
            self.current_step = format!("{}: {}", self.status.step(), detail);
        }
        let scaled = self.status.scale(engine_percent);
        if scaled > self.progress {
            self.progress = scaled;
            true
        } else {
            false
        }
    }

    pub fn complete(&mut self, summary: AssetSummary) -> Result<(), TransitionError> {
        if self.status != JobStatus::Finalizing {
            return Err(TransitionError { from: self.status, to: JobStatus::Completed });
        }
        self.status = JobStatus::Completed;
        self.current_step = JobStatus::Completed.step().to_string();
        self.progress = 100.0;
        self.finished_at = Some(Utc::now());
        self.result = Some(summary);
        Ok(())
    }

    /// Terminal failure; progress stays where it was and the failing step is kept
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError { from: self.status, to: JobStatus::Failed });
        }
        self.error = Some(JobFailure {
            kind,
            message: message.into(),
            failed_stage: self.status,
            failed_step: self.current_step.clone(),
        });
        self.status = JobStatus::Failed;
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}
