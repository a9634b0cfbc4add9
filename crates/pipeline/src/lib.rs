pub mod assets;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod ffprobe;
pub mod intake;
pub mod job;
pub mod metadata;
pub mod orchestrator;
pub mod progress;
pub mod quality;
pub mod registry;
pub mod scan;
pub mod sidecar;
pub mod store;

pub use assets::{AssetCounts, AssetSummary, RenditionFormat, ThumbnailSize};
pub use config::PipelineConfig;
pub use engine::{Engine, EngineVersion, FfmpegEngine};
pub use error::{ErrorKind, PipelineError, Result};
pub use events::PipelineEvent;
pub use ffprobe::{FFProbeData, FFProbeFormat, FFProbeStream};
pub use intake::{Intake, IntakeOutcome};
pub use job::{Job, JobStatus};
pub use metadata::{MediaMetadata, MetadataDocument};
pub use orchestrator::{EngineStatus, Orchestrator};
pub use quality::QualityTier;
pub use registry::{CommandFile, JobSnapshot, StatusSnapshot};
pub use scan::{InboxScanner, ScanResult};
pub use store::{Area, AssetLocation, ContentStore, PurgeReport, UploadRecord};
