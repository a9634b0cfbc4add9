use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use crate::config::PipelineConfig;
use crate::engine::Engine;
use crate::error::{PipelineError, Result};
use crate::metadata::MetadataDocument;
use crate::store::{self, Area, ContentStore, UploadRecord};

/// Characters never allowed in an uploaded file name
const DANGEROUS_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Device names Windows reserves, with or without an extension
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL",
    "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8", "COM9",
    "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const FINGERPRINT_CHUNK: usize = 64 * 1024;

/// Container detected from the leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    Mp4,
    Matroska,
    Avi,
    Flv,
    Asf,
    Ogg,
    /// Audio-only container posing as video
    Mp3,
    Unknown,
}

impl Signature {
    pub fn detect(header: &[u8]) -> Signature {
        if header.len() >= 8 && &header[4..8] == b"ftyp" {
            return Signature::Mp4;
        }
        // QuickTime files without an ftyp box open with a moov/mdat/wide atom
        if header.len() >= 8 && matches!(&header[4..8], b"moov" | b"mdat" | b"wide" | b"free") {
            return Signature::Mp4;
        }
        if header.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
            return Signature::Matroska;
        }
        if header.starts_with(b"RIFF") {
            return Signature::Avi;
        }
        if header.starts_with(&[0x46, 0x4C, 0x56, 0x01]) {
            return Signature::Flv;
        }
        if header.starts_with(&[0x30, 0x26, 0xB2, 0x75]) {
            return Signature::Asf;
        }
        if header.starts_with(b"OggS") {
            return Signature::Ogg;
        }
        if header.starts_with(&[0xFF, 0xFB]) || header.starts_with(b"ID3") {
            return Signature::Mp3;
        }
        Signature::Unknown
    }

    pub fn is_video(&self) -> bool {
        !matches!(self, Signature::Mp3)
    }
}

/// Reject names that could escape the store or collide with device files
pub fn check_filename(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::validation("file name is empty"));
    }
    if trimmed.contains("..") {
        return Err(PipelineError::validation(format!("file name {:?} contains a path traversal", name)));
    }
    if trimmed.chars().any(|c| DANGEROUS_CHARS.contains(&c) || c.is_control()) {
        return Err(PipelineError::validation(format!("file name {:?} contains invalid characters", name)));
    }
    let stem = trimmed.split('.').next().unwrap_or_default().trim().to_uppercase();
    if RESERVED_NAMES.contains(&stem.as_str()) {
        return Err(PipelineError::validation(format!("file name {:?} is a reserved device name", name)));
    }
    Ok(())
}

/// Read the leading bytes and reject audio-only containers. Unknown signatures pass.
pub fn check_signature(path: &Path) -> Result<Signature> {
    use std::io::Read;

    let mut header = [0u8; 16];
    let mut file = std::fs::File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let read = file.read(&mut header).map_err(|e| PipelineError::io(path, e))?;
    let signature = Signature::detect(&header[..read]);
    if !signature.is_video() {
        return Err(PipelineError::validation("file is audio-only, not a video"));
    }
    debug!("Detected container {:?} for {}", signature, path.display());
    Ok(signature)
}

/// Synchronous pre-pipeline checks: size bounds, extension, name safety, container signature
pub fn validate(path: &Path, original_name: &str, cfg: &PipelineConfig) -> Result<Signature> {
    check_filename(original_name)?;

    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    if !cfg.allowed_extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(&ext)) {
        return Err(PipelineError::validation(format!("extension {:?} is not accepted", ext)));
    }

    let size = std::fs::metadata(path).map_err(|e| PipelineError::io(path, e))?.len();
    if size > cfg.max_upload_bytes {
        return Err(PipelineError::validation(format!(
            "file is {} bytes, larger than the {} byte limit",
            size, cfg.max_upload_bytes
        )));
    }
    if size < cfg.min_upload_bytes {
        return Err(PipelineError::validation(format!(
            "file is {} bytes, too small to be a video (minimum {})",
            size, cfg.min_upload_bytes
        )));
    }

    check_signature(path)
}

/// Ask the engine whether it can read the file at all.
///
/// Timeouts and probe failures both mean "incompatible" and surface as validation errors;
/// only an unavailable engine is passed through as-is.
pub async fn probe_compatibility(engine: &dyn Engine, path: &Path, timeout: Duration) -> Result<()> {
    let probed = match tokio::time::timeout(timeout, engine.probe(path)).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout(timeout.as_secs())),
    };

    match probed {
        Ok(data) => {
            if data.streams.iter().any(|s| s.codec_type.as_deref() == Some("video")) {
                Ok(())
            } else {
                Err(PipelineError::validation("file contains no video stream"))
            }
        }
        Err(e) if e.is_engine_unavailable() => Err(e),
        Err(e) => {
            warn!("Compatibility probe failed for {}: {}", path.display(), e);
            Err(PipelineError::validation(format!("file is not compatible with the transcoding engine: {}", e)))
        }
    }
}

/// Streaming SHA-256 of the whole file, hex encoded
pub async fn fingerprint(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| PipelineError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; FINGERPRINT_CHUNK];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| PipelineError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Result of a successful intake
#[derive(Debug, Clone, PartialEq)]
pub enum IntakeOutcome {
    /// New content, staged in the processing area and ready for a job
    Accepted(UploadRecord),
    /// Byte-identical content already known; the new bytes were discarded
    Duplicate { file_id: String },
}

impl IntakeOutcome {
    pub fn file_id(&self) -> &str {
        match self {
            IntakeOutcome::Accepted(record) => &record.file_id,
            IntakeOutcome::Duplicate { file_id } => file_id,
        }
    }
}

/// Validates, fingerprints and deduplicates uploads before they enter the pipeline
#[derive(Clone)]
pub struct Intake {
    config: Arc<PipelineConfig>,
    store: ContentStore,
    engine: Arc<dyn Engine>,
}

impl Intake {
    pub fn new(config: Arc<PipelineConfig>, store: ContentStore, engine: Arc<dyn Engine>) -> Self {
        Self { config, store, engine }
    }

    /// Run every check on an uploaded file and hand back its record.
    ///
    /// Validation and integrity failures leave the upload where it was; the caller decides
    /// what to do with rejected bytes.
    pub async fn accept(&self, path: &Path, original_name: &str, declared_size: u64) -> Result<IntakeOutcome> {
        let received = tokio::fs::metadata(path).await.map_err(|e| PipelineError::io(path, e))?.len();
        if received != declared_size {
            return Err(PipelineError::Integrity(format!(
                "received {} bytes, {} declared",
                received, declared_size
            )));
        }

        validate(path, original_name, &self.config)?;
        probe_compatibility(
            self.engine.as_ref(),
            path,
            Duration::from_secs(self.config.probe_timeout_secs),
        )
        .await?;

        let content_hash = fingerprint(path).await?;
        if let Some(existing) = self.deduplicate(&content_hash).await? {
            info!("♻️ {} is identical to {}, discarding new bytes", original_name, existing);
            tokio::fs::remove_file(path).await.map_err(|e| PipelineError::io(path, e))?;
            return Ok(IntakeOutcome::Duplicate { file_id: existing });
        }

        let store = self.store.clone();
        let upload = path.to_path_buf();
        let name = original_name.to_string();
        let record = store::blocking(move || {
            let staged = store.stage(&upload, &name, Some(content_hash.clone()))?;
            let promoted = store.promote(&staged, Area::Processing)?;
            // recorded right away so a second identical upload is caught before the job persists
            store.persist_metadata(&MetadataDocument {
                file_id: promoted.file_id.clone(),
                original_name: name.clone(),
                content_hash: Some(content_hash),
                extracted_at: Utc::now(),
                quality_tier: None,
                media: None,
                assets: None,
            })?;
            Ok(promoted)
        })
        .await?;

        info!("✅ Accepted {} as {}", original_name, record.file_id);
        Ok(IntakeOutcome::Accepted(record))
    }

    pub async fn deduplicate(&self, content_hash: &str) -> Result<Option<String>> {
        let store = self.store.clone();
        let hash = content_hash.to_string();
        store::blocking(move || store.find_by_hash(&hash)).await
    }
}
