use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::store::Area;

/// Configuration for the media pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root directory of the content store taxonomy
    pub storage_root: PathBuf,
    /// Drop directory polled by the daemon for new uploads
    pub inbox_dir: PathBuf,
    /// Largest accepted upload in bytes (e.g., 2GB)
    pub max_upload_bytes: u64,
    /// Smallest upload that can plausibly be a video
    pub min_upload_bytes: u64,
    /// Accepted file extensions, lowercase, without the dot
    pub allowed_extensions: Vec<String>,
    /// Path to ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Upper bound for a single probe call
    pub probe_timeout_secs: u64,
    /// Admission limit: jobs allowed in the encoding stages at once
    pub max_concurrent_encodes: usize,
    /// How long a completed job stays queryable
    pub success_retention_secs: u64,
    /// How long a failed job stays queryable
    pub failure_retention_secs: u64,
    /// How long an "engine unavailable" verdict is trusted before re-probing
    pub engine_recheck_secs: u64,
    /// Age after which intake/processing/temp leftovers are reaped
    pub orphan_max_age_secs: u64,
    /// Interval in seconds between reaper sweeps
    pub reap_interval_secs: u64,
    /// Interval in seconds between inbox scans
    pub scan_interval_secs: u64,
    /// Language tags preferred for single-track renditions, most wanted first
    pub language_priority: Vec<String>,
    /// Emit one single-track MP4 per audio language for multi-track sources
    pub language_renditions: bool,
    /// Optional rendition formats generated after the primary web MP4
    pub optional_renditions: Vec<String>,
    /// Keep the processing-area copy of the upload after a successful job
    pub retain_source: bool,
    /// URL prefix under which published renditions are served
    pub public_url_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl PipelineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            storage_root: PathBuf::from("./media"),
            inbox_dir: PathBuf::from("./media/inbox"),
            max_upload_bytes: 2 * 1024 * 1024 * 1024, // 2GB
            min_upload_bytes: 1024 * 1024,            // 1MB
            allowed_extensions: ["mp4", "webm", "ogg", "avi", "mov", "wmv", "flv", "mkv"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            probe_timeout_secs: 30,
            max_concurrent_encodes: 2,
            success_retention_secs: 5 * 60,
            failure_retention_secs: 30 * 60,
            engine_recheck_secs: 60,
            orphan_max_age_secs: 2 * 60 * 60,
            reap_interval_secs: 60 * 60,
            scan_interval_secs: 5,
            language_priority: ["por", "pt", "eng", "en"].iter().map(|s| s.to_string()).collect(),
            language_renditions: true,
            optional_renditions: vec!["webm".to_string(), "mobile".to_string()],
            retain_source: false,
            public_url_prefix: "/videos".to_string(),
        }
    }

    /// Configuration rooted at `root`, everything else default. Used by tests and `ingest`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            inbox_dir: root.join("inbox"),
            storage_root: root,
            ..Self::default_config()
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// Directory of one content store area
    pub fn area_path(&self, area: Area) -> PathBuf {
        self.storage_root.join(area.dir_name())
    }

    /// Location of the status snapshot written by the daemon
    pub fn status_path(&self) -> PathBuf {
        self.storage_root.join("status.json")
    }

    /// Drop directory for operator commands (retry requests from the TUI)
    pub fn command_dir(&self) -> PathBuf {
        self.storage_root.join("commands")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg = PipelineConfig::load_config(Some(Path::new("/nonexistent/pipeline.toml"))).unwrap();
        assert_eq!(cfg.probe_timeout_secs, 30);
        assert!(cfg.failure_retention_secs > cfg.success_retention_secs);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "storage_root = \"/srv/media\"\nmax_concurrent_encodes = 4\n").unwrap();

        let cfg = PipelineConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.storage_root, PathBuf::from("/srv/media"));
        assert_eq!(cfg.max_concurrent_encodes, 4);
        assert_eq!(cfg.min_upload_bytes, 1024 * 1024);
        assert_eq!(cfg.area_path(Area::Masters), PathBuf::from("/srv/media/masters"));
    }

    #[test]
    fn test_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"language_priority": ["eng"], "retain_source": true}"#).unwrap();

        let cfg = PipelineConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.language_priority, vec!["eng".to_string()]);
        assert!(cfg.retain_source);
    }
}
