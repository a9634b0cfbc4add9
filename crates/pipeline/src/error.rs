use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure taxonomy shared by intake, the content store and the orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Upload rejected before it could enter the pipeline
    #[error("validation failed: {0}")]
    Validation(String),

    /// Received bytes do not match what the uploader declared
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// The transcoding engine cannot be started at all
    #[error("transcoding engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The engine ran but failed on this particular input
    #[error("transcoding engine failed: {message}")]
    EngineProcessing {
        message: String,
        exit_code: Option<i32>,
        stderr: Option<String>,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// A persisted JSON document could not be read or written
    #[error("metadata document error for {}: {source}", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Coarse error class, used for event payloads and status reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Integrity,
    EngineUnavailable,
    EngineProcessing,
    Io,
    Timeout,
}

impl PipelineError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation(message.into())
    }

    pub fn processing(message: impl Into<String>, exit_code: Option<i32>, stderr: Option<String>) -> Self {
        PipelineError::EngineProcessing {
            message: message.into(),
            exit_code,
            stderr,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Integrity(_) => ErrorKind::Integrity,
            PipelineError::EngineUnavailable(_) => ErrorKind::EngineUnavailable,
            PipelineError::EngineProcessing { .. } => ErrorKind::EngineProcessing,
            PipelineError::Io { .. } | PipelineError::Metadata { .. } => ErrorKind::Io,
            PipelineError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    pub fn is_engine_unavailable(&self) -> bool {
        matches!(self, PipelineError::EngineUnavailable(_))
    }

    /// Errors reported synchronously to the uploader; they never create a job.
    pub fn is_rejection(&self) -> bool {
        matches!(self, PipelineError::Validation(_) | PipelineError::Integrity(_))
    }
}
