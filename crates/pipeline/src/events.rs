use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::assets::AssetCounts;
use crate::error::ErrorKind;
use crate::job::{Job, JobStatus};

/// Push-channel notifications. Per job they arrive in stage and percentage order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PipelineEvent {
    #[serde(rename_all = "camelCase")]
    Progress {
        file_id: String,
        status: JobStatus,
        step: String,
        progress: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        file_id: String,
        assets: AssetCounts,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        file_id: String,
        kind: ErrorKind,
        step: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn progress(job: &Job, details: Option<String>) -> Self {
        PipelineEvent::Progress {
            file_id: job.file_id.clone(),
            status: job.status,
            step: job.current_step.clone(),
            progress: job.progress,
            details,
            timestamp: Utc::now(),
        }
    }

    pub fn file_id(&self) -> &str {
        match self {
            PipelineEvent::Progress { file_id, .. }
            | PipelineEvent::Completed { file_id, .. }
            | PipelineEvent::Failed { file_id, .. } => file_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineEvent::Progress { .. })
    }
}
