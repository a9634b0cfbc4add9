use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;
use crate::assets::{RenditionFormat, ThumbnailSize};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::metadata::MetadataDocument;
use crate::quality::QualityTier;
use crate::sidecar::{self, LockMarker, PendingWrite};

/// Top-level areas of the on-disk taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Area {
    Uploads,
    Processing,
    Masters,
    Renditions,
    Subtitles,
    Thumbnails,
    Metadata,
    Temp,
    Public,
}

impl Area {
    pub const ALL: [Area; 9] = [
        Area::Uploads,
        Area::Processing,
        Area::Masters,
        Area::Renditions,
        Area::Subtitles,
        Area::Thumbnails,
        Area::Metadata,
        Area::Temp,
        Area::Public,
    ];

    /// Areas holding transient files that `reap` may sweep
    pub const TRANSIENT: [Area; 3] = [Area::Uploads, Area::Processing, Area::Temp];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Area::Uploads => "uploads",
            Area::Processing => "processing",
            Area::Masters => "masters",
            Area::Renditions => "renditions",
            Area::Subtitles => "subtitles",
            Area::Thumbnails => "thumbnails",
            Area::Metadata => "metadata",
            Area::Temp => "temp",
            Area::Public => "public",
        }
    }

    /// Partitions created up front by `ensure_layout`
    pub fn sub_dirs(&self) -> &'static [&'static str] {
        match self {
            Area::Masters => &["4k", "1080p", "720p", "480p"],
            Area::Renditions => &["mp4", "webm", "mobile"],
            Area::Subtitles => &["pt", "en", "es", "fr", "auto-generated"],
            Area::Thumbnails => &["small", "medium", "large", "poster"],
            Area::Temp => &["daily", "processing", "failed"],
            _ => &[],
        }
    }
}

/// A staged upload. Immutable once staged; moving it yields a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub file_id: String,
    pub file_name: String,
    pub original_name: String,
    pub path: PathBuf,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub content_hash: Option<String>,
}

/// Everything found on disk for one fileId
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetLocation {
    pub file_id: String,
    pub uploads: Vec<PathBuf>,
    pub master: Option<PathBuf>,
    pub renditions: Vec<PathBuf>,
    pub thumbnails: Vec<PathBuf>,
    pub subtitles: Vec<PathBuf>,
    pub public_links: Vec<PathBuf>,
    pub metadata: Option<PathBuf>,
}

impl AssetLocation {
    /// True when no derived asset of any kind exists
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
            && self.master.is_none()
            && self.renditions.is_empty()
            && self.thumbnails.is_empty()
            && self.subtitles.is_empty()
            && self.public_links.is_empty()
            && self.metadata.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub file_id: String,
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

fn log_file_operation(operation: &str, name: &str, outcome: std::result::Result<&str, &str>) {
    match outcome {
        Ok(detail) => info!("📁 {} {} -> {}", operation, name, detail),
        Err(reason) => error!("📁 {} {} failed: {}", operation, name, reason),
    }
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = format!("{:x}", hasher.finalize());
    digest[..len].to_string()
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Restart a file's age at now; reap measures age from when the store took the file over
fn touch(path: &Path) {
    let touched = fs::File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = touched {
        warn!("Could not reset modification time of {}: {}", path.display(), e);
    }
}

/// Move a file, falling back to copy + delete across filesystems
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| PipelineError::io(from, e))?;
    fs::remove_file(from).map_err(|e| PipelineError::io(from, e))?;
    Ok(())
}

/// Owner of the directory taxonomy.
///
/// Cheap to clone; clones share the purge tombstones and the set of pinned fileIds.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
    public_url_prefix: String,
    tombstones: Arc<Mutex<HashMap<String, SystemTime>>>,
    pinned: Arc<Mutex<HashSet<String>>>,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>, public_url_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_url_prefix: public_url_prefix.into(),
            tombstones: Arc::new(Mutex::new(HashMap::new())),
            pinned: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self::new(cfg.storage_root.clone(), cfg.public_url_prefix.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn area_path(&self, area: Area) -> PathBuf {
        self.root.join(area.dir_name())
    }

    /// Create every area and its fixed partitions
    pub fn ensure_layout(&self) -> Result<()> {
        for area in Area::ALL {
            let dir = self.area_path(area);
            fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
            for sub in area.sub_dirs() {
                let sub_dir = dir.join(sub);
                fs::create_dir_all(&sub_dir).map_err(|e| PipelineError::io(&sub_dir, e))?;
            }
        }
        debug!("Storage layout ready under {}", self.root.display());
        Ok(())
    }

    /// `{millis}_{namehash}[_{contenthash}]_{salt}`
    pub fn generate_file_id(original_name: &str, content_hash: Option<&str>) -> String {
        let timestamp = Utc::now().timestamp_millis();
        let name_hash = hex_prefix(original_name.as_bytes(), 8);
        let salt: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
        match content_hash {
            Some(hash) if hash.len() >= 8 => {
                format!("{}_{}_{}_{}", timestamp, name_hash, &hash[..8], salt)
            }
            _ => format!("{}_{}_{}", timestamp, name_hash, salt),
        }
    }

    fn lock_set<T>(set: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_purged(&self, file_id: &str) -> bool {
        Self::lock_set(&self.tombstones).contains_key(file_id)
    }

    /// Fails with an I/O error once `file_id` has been purged
    pub fn ensure_live(&self, file_id: &str) -> Result<()> {
        if self.is_purged(file_id) {
            return Err(PipelineError::io(
                self.root.join(file_id),
                std::io::Error::new(std::io::ErrorKind::NotFound, "assets were purged"),
            ));
        }
        Ok(())
    }

    /// Protect a fileId's transient files from `reap` while a job owns them
    pub fn pin(&self, file_id: &str) {
        Self::lock_set(&self.pinned).insert(file_id.to_string());
    }

    /// Release a fileId once its job is over. A purge tombstone has nothing left to guard.
    pub fn unpin(&self, file_id: &str) {
        Self::lock_set(&self.pinned).remove(file_id);
        Self::lock_set(&self.tombstones).remove(file_id);
    }

    /// Move an incoming file into the intake buffer under a fresh fileId
    pub fn stage(&self, upload_path: &Path, original_name: &str, content_hash: Option<String>) -> Result<UploadRecord> {
        let file_id = Self::generate_file_id(original_name, content_hash.as_deref());
        let ext = Path::new(original_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
            .unwrap_or_default();
        let file_name = format!("{}{}", file_id, ext);
        let dest = self.area_path(Area::Uploads).join(&file_name);

        let staged = fs::metadata(upload_path)
            .map_err(|e| PipelineError::io(upload_path, e))
            .and_then(|_| move_file(upload_path, &dest))
            .and_then(|_| {
                touch(&dest);
                fs::metadata(&dest).map_err(|e| PipelineError::io(&dest, e))
            });

        match staged {
            Ok(meta) => {
                log_file_operation("stage", original_name, Ok(&file_name));
                Ok(UploadRecord {
                    file_id,
                    file_name,
                    original_name: original_name.to_string(),
                    path: dest,
                    size: meta.len(),
                    uploaded_at: Utc::now(),
                    content_hash,
                })
            }
            Err(e) => {
                log_file_operation("stage", original_name, Err(&e.to_string()));
                Err(e)
            }
        }
    }

    /// Move a record into `area`, all-or-nothing.
    ///
    /// The bytes land under a lock marker and a scratch name first; the source is only
    /// removed once the destination is committed.
    pub fn promote(&self, record: &UploadRecord, area: Area) -> Result<UploadRecord> {
        let target = self.area_path(area).join(&record.file_name);
        let result = self.promote_inner(record, area, &target);
        match &result {
            Ok(_) => log_file_operation("promote", &record.original_name, Ok(area.dir_name())),
            Err(e) => log_file_operation("promote", &record.original_name, Err(&e.to_string())),
        }
        result
    }

    fn promote_inner(&self, record: &UploadRecord, area: Area, target: &Path) -> Result<UploadRecord> {
        if record.path == target {
            return Ok(record.clone());
        }
        self.ensure_live(&record.file_id)?;

        let write = PendingWrite::begin(target, &record.path, &format!("promote:{}", area.dir_name()))?;
        if fs::hard_link(&record.path, write.temp_path()).is_err() {
            fs::copy(&record.path, write.temp_path()).map_err(|e| PipelineError::io(&record.path, e))?;
        }
        self.ensure_live(&record.file_id)?;
        let path = write.commit()?;
        touch(&path);

        if let Err(e) = fs::remove_file(&record.path) {
            warn!("Promoted {} but could not remove {}: {}", record.file_id, record.path.display(), e);
        }

        Ok(UploadRecord {
            path,
            ..record.clone()
        })
    }

    /// Open a lock-guarded write to `target` on behalf of `file_id`
    pub fn begin_write(&self, file_id: &str, target: &Path, source: &Path, stage: &str) -> Result<PendingWrite> {
        self.ensure_live(file_id)?;
        PendingWrite::begin(target, source, stage)
    }

    /// Commit a write unless the fileId was purged meanwhile
    pub fn commit_write(&self, file_id: &str, write: PendingWrite) -> Result<PathBuf> {
        if let Err(e) = self.ensure_live(file_id) {
            write.abort();
            return Err(e);
        }
        let name = file_name_of(write.target());
        match write.commit() {
            Ok(path) => {
                log_file_operation("save", &name, Ok("committed"));
                Ok(path)
            }
            Err(e) => {
                log_file_operation("save", &name, Err(&e.to_string()));
                Err(e)
            }
        }
    }

    pub fn master_path(&self, file_id: &str, tier: QualityTier) -> PathBuf {
        self.area_path(Area::Masters)
            .join(tier.as_str())
            .join(format!("{}_master.mkv", file_id))
    }

    /// `label` is the tier, the normalized language or "mobile"
    pub fn rendition_path(&self, file_id: &str, format: RenditionFormat, label: &str) -> PathBuf {
        self.area_path(Area::Renditions)
            .join(format.dir_name())
            .join(format!("{}_{}.{}", file_id, label, format.extension()))
    }

    pub fn thumbnail_path(&self, file_id: &str, size: ThumbnailSize) -> PathBuf {
        self.area_path(Area::Thumbnails)
            .join(size.dir_name())
            .join(format!("{}_{}.jpg", file_id, size.dir_name()))
    }

    /// `ordinal` distinguishes several tracks in the same language
    pub fn subtitle_path(&self, file_id: &str, language: &str, ordinal: usize) -> PathBuf {
        let name = if ordinal == 0 {
            format!("{}_{}.vtt", file_id, language)
        } else {
            format!("{}_{}_{}.vtt", file_id, language, ordinal)
        };
        self.area_path(Area::Subtitles).join(language).join(name)
    }

    pub fn metadata_path(&self, file_id: &str) -> PathBuf {
        self.area_path(Area::Metadata).join(format!("{}_metadata.json", file_id))
    }

    pub fn public_url(&self, public_name: &str) -> String {
        format!("{}/{}", self.public_url_prefix.trim_end_matches('/'), public_name)
    }

    /// Write the metadata document for its fileId; repeated calls replace it atomically
    pub fn persist_metadata(&self, doc: &MetadataDocument) -> Result<PathBuf> {
        let target = self.metadata_path(&doc.file_id);
        let body = serde_json::to_vec_pretty(doc).map_err(|e| PipelineError::Metadata {
            path: target.clone(),
            source: e,
        })?;

        let write = self.begin_write(&doc.file_id, &target, &target, "metadata")?;
        fs::write(write.temp_path(), body).map_err(|e| PipelineError::io(write.temp_path(), e))?;
        self.commit_write(&doc.file_id, write)
    }

    pub fn load_metadata(&self, file_id: &str) -> Result<Option<MetadataDocument>> {
        let path = self.metadata_path(file_id);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PipelineError::io(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| PipelineError::Metadata { path, source: e })
    }

    /// Scan persisted metadata for a document with this content hash
    pub fn find_by_hash(&self, content_hash: &str) -> Result<Option<String>> {
        let dir = self.area_path(Area::Metadata);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PipelineError::io(&dir, e)),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let name = file_name_of(&path);
            if !name.ends_with("_metadata.json") || sidecar::is_temp_file(&path) {
                continue;
            }
            let doc: MetadataDocument = match fs::read(&path)
                .ok()
                .and_then(|b| serde_json::from_slice(&b).ok())
            {
                Some(doc) => doc,
                None => {
                    warn!("Skipping unreadable metadata document {}", path.display());
                    continue;
                }
            };
            if doc.content_hash.as_deref() == Some(content_hash) && !self.is_purged(&doc.file_id) {
                return Ok(Some(doc.file_id));
            }
        }
        Ok(None)
    }

    /// Expose a rendition under `public/<public_name>` without copying bytes; returns its URL
    pub fn publish(&self, rendition_path: &Path, public_name: &str) -> Result<String> {
        let link = self.area_path(Area::Public).join(public_name);
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        if fs::symlink_metadata(&link).is_ok() {
            fs::remove_file(&link).map_err(|e| PipelineError::io(&link, e))?;
        }

        let target = fs::canonicalize(rendition_path).map_err(|e| PipelineError::io(rendition_path, e))?;
        match link_file(&target, &link) {
            Ok(()) => {
                log_file_operation("publish", public_name, Ok("linked"));
                Ok(self.public_url(public_name))
            }
            Err(e) => {
                log_file_operation("publish", public_name, Err(&e.to_string()));
                Err(PipelineError::io(&link, e))
            }
        }
    }

    fn entries_matching(&self, area: Area, file_id: &str) -> Vec<PathBuf> {
        let dir = self.area_path(area);
        if !dir.exists() {
            return Vec::new();
        }
        let mut found: Vec<PathBuf> = WalkDir::new(&dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_type().is_dir())
            .map(|e| e.into_path())
            .filter(|p| {
                file_name_of(p).contains(file_id)
                    && !sidecar::is_lock_marker(p)
                    && !sidecar::is_temp_file(p)
            })
            .collect();
        found.sort();
        found
    }

    /// Find every committed asset of a fileId. Missing areas yield empty collections.
    pub fn locate(&self, file_id: &str) -> AssetLocation {
        let mut location = AssetLocation {
            file_id: file_id.to_string(),
            ..Default::default()
        };
        if file_id.trim().is_empty() {
            return location;
        }

        location.uploads = self.entries_matching(Area::Uploads, file_id);
        location.uploads.extend(self.entries_matching(Area::Processing, file_id));
        location.master = self.entries_matching(Area::Masters, file_id)
            .into_iter()
            .find(|p| p.extension().and_then(|e| e.to_str()) == Some("mkv"));
        location.renditions = self.entries_matching(Area::Renditions, file_id);
        location.thumbnails = self.entries_matching(Area::Thumbnails, file_id);
        location.subtitles = self.entries_matching(Area::Subtitles, file_id);
        location.public_links = self.entries_matching(Area::Public, file_id);
        location.metadata = self.entries_matching(Area::Metadata, file_id).into_iter().next();
        location
    }

    /// Remove every file of a fileId from every area, public links included.
    ///
    /// Later writes for the fileId fail. A file that cannot be removed is logged and
    /// reported; the purge carries on with the rest.
    pub fn purge(&self, file_id: &str) -> PurgeReport {
        let mut report = PurgeReport {
            file_id: file_id.to_string(),
            ..Default::default()
        };
        if file_id.trim().is_empty() {
            return report;
        }
        Self::lock_set(&self.tombstones).insert(file_id.to_string(), SystemTime::now());

        for area in Area::ALL {
            let dir = self.area_path(area);
            if !dir.exists() {
                continue;
            }
            for entry in WalkDir::new(&dir).follow_links(false) {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("Error reading directory entry: {}", e);
                        continue;
                    }
                };
                if entry.file_type().is_dir() || !file_name_of(entry.path()).contains(file_id) {
                    continue;
                }
                let path = entry.into_path();
                let name = file_name_of(&path);
                match fs::remove_file(&path) {
                    Ok(()) => {
                        log_file_operation("purge", &name, Ok("removed"));
                        report.removed.push(path);
                    }
                    Err(e) => {
                        log_file_operation("purge", &name, Err(&e.to_string()));
                        report.failed.push((path, e.to_string()));
                    }
                }
            }
        }

        info!("Purged {}: {} removed, {} failed", file_id, report.removed.len(), report.failed.len());
        report
    }

    /// Delete transient files older than `max_age`.
    ///
    /// Files of pinned fileIds are kept. So are uploads whose fileId still has a metadata
    /// document: those belong to a failed, interrupted or retained job and stay retryable.
    pub fn reap(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let pinned: Vec<String> = Self::lock_set(&self.pinned).iter().cloned().collect();
        let mut removed = 0;

        Self::lock_set(&self.tombstones).retain(|file_id, purged_at| {
            pinned.contains(file_id)
                || now.duration_since(*purged_at).map(|age| age <= max_age).unwrap_or(true)
        });

        for area in Area::TRANSIENT {
            let dir = self.area_path(area);
            if !dir.exists() {
                continue;
            }
            for entry in WalkDir::new(&dir).follow_links(false).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_dir() {
                    continue;
                }
                let path = entry.path();
                let name = file_name_of(path);
                if pinned.iter().any(|id| name.contains(id.as_str())) {
                    continue;
                }
                if area != Area::Temp && self.has_metadata(path) {
                    debug!("Keeping {}: its upload is still on record", path.display());
                    continue;
                }
                let age = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|mtime| now.duration_since(mtime).ok());
                match age {
                    Some(age) if age > max_age => match fs::remove_file(path) {
                        Ok(()) => {
                            info!("🗑️ Reaped orphan {}", path.display());
                            removed += 1;
                        }
                        Err(e) => warn!("Failed to reap {}: {}", path.display(), e),
                    },
                    _ => {}
                }
            }
        }

        info!("Reap complete: {} files removed", removed);
        Ok(removed)
    }

    fn has_metadata(&self, upload: &Path) -> bool {
        upload
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|file_id| self.metadata_path(file_id).is_file())
            .unwrap_or(false)
    }

    /// Startup crash recovery over the whole taxonomy
    pub fn recover_locks(&self) -> Result<Vec<LockMarker>> {
        let cleared = sidecar::sweep_lock_markers(&self.root)?;
        if !cleared.is_empty() {
            info!("Recovered {} interrupted writes", cleared.len());
        }
        Ok(cleared)
    }

    /// Uploads waiting in the processing area, rebuilt from their file names and metadata
    pub fn processing_records(&self) -> Result<Vec<UploadRecord>> {
        let dir = self.area_path(Area::Processing);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::io(&dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || sidecar::is_lock_marker(&path) || sidecar::is_temp_file(&path) {
                continue;
            }
            let file_name = file_name_of(&path);
            let file_id = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            let doc = self.load_metadata(&file_id).ok().flatten();
            let meta = fs::metadata(&path).map_err(|e| PipelineError::io(&path, e))?;
            records.push(UploadRecord {
                original_name: doc.as_ref().map(|d| d.original_name.clone()).unwrap_or_else(|| file_name.clone()),
                content_hash: doc.and_then(|d| d.content_hash),
                file_id,
                file_name,
                path,
                size: meta.len(),
                uploaded_at: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
            });
        }
        records.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        Ok(records)
    }
}

/// Run a filesystem-heavy store call off the async workers
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|e| {
        PipelineError::io(
            Path::new("<blocking task>"),
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        )
    })?
}

#[cfg(unix)]
fn link_file(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn link_file(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link).or_else(|_| fs::hard_link(target, link))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataDocument;

    fn store() -> (tempfile::TempDir, ContentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("media"), "/videos");
        store.ensure_layout().unwrap();
        (dir, store)
    }

    fn incoming(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    fn doc(file_id: &str, hash: Option<&str>) -> MetadataDocument {
        MetadataDocument {
            file_id: file_id.to_string(),
            original_name: "clip.mp4".to_string(),
            content_hash: hash.map(|h| h.to_string()),
            extracted_at: Utc::now(),
            quality_tier: None,
            media: None,
            assets: None,
        }
    }

    #[test]
    fn test_layout_has_partitions() {
        let (_dir, store) = store();
        assert!(store.area_path(Area::Masters).join("4k").is_dir());
        assert!(store.area_path(Area::Temp).join("failed").is_dir());
        assert!(store.area_path(Area::Public).is_dir());
    }

    #[test]
    fn test_file_id_shape() {
        let plain = ContentStore::generate_file_id("movie.mkv", None);
        assert_eq!(plain.split('_').count(), 3);
        let hashed = ContentStore::generate_file_id("movie.mkv", Some("deadbeefcafebabe"));
        let parts: Vec<&str> = hashed.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[2], "deadbeef");
        assert_ne!(plain, ContentStore::generate_file_id("movie.mkv", None));
    }

    #[test]
    fn test_stage_then_locate() {
        let (dir, store) = store();
        let src = incoming(&dir, "upload.bin", b"video bytes");
        let record = store.stage(&src, "Holiday.MP4", None).unwrap();

        assert!(!src.exists());
        assert!(record.file_name.ends_with(".mp4"));
        assert_eq!(record.size, 11);

        let location = store.locate(&record.file_id);
        assert_eq!(location.uploads, vec![record.path.clone()]);
        assert!(location.master.is_none());
        assert!(location.renditions.is_empty());
        assert!(location.thumbnails.is_empty());
        assert!(location.subtitles.is_empty());
    }

    #[test]
    fn test_stage_missing_file_is_io_error() {
        let (dir, store) = store();
        let err = store.stage(&dir.path().join("nope"), "nope.mp4", None).unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
    }

    #[test]
    fn test_promote_moves_without_leftovers() {
        let (dir, store) = store();
        let src = incoming(&dir, "a.mkv", b"abc");
        let record = store.stage(&src, "a.mkv", None).unwrap();
        let moved = store.promote(&record, Area::Processing).unwrap();

        assert!(!record.path.exists());
        assert_eq!(fs::read(&moved.path).unwrap(), b"abc");
        assert!(!sidecar::lock_path(&moved.path).exists());
        assert!(!sidecar::temp_path(&moved.path).exists());
        assert_eq!(store.locate(&record.file_id).uploads.len(), 1);
    }

    #[test]
    fn test_persist_metadata_is_idempotent() {
        let (_dir, store) = store();
        store.persist_metadata(&doc("f1", Some("aaa"))).unwrap();
        let mut latest = doc("f1", Some("bbb"));
        latest.original_name = "renamed.mkv".to_string();
        store.persist_metadata(&latest).unwrap();

        let files: Vec<_> = fs::read_dir(store.area_path(Area::Metadata)).unwrap().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(store.load_metadata("f1").unwrap(), Some(latest));
        assert_eq!(store.find_by_hash("bbb").unwrap(), Some("f1".to_string()));
        assert_eq!(store.find_by_hash("aaa").unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_publish_links_and_purge_removes_everything() {
        let (dir, store) = store();
        let id = "123_abcd1234_ffff0000";
        let rendition = store.rendition_path(id, RenditionFormat::Mp4, "720p");
        fs::create_dir_all(rendition.parent().unwrap()).unwrap();
        fs::write(&rendition, b"mp4").unwrap();
        let master = store.master_path(id, QualityTier::Hd720);
        fs::write(&master, b"mkv").unwrap();
        let thumb = store.thumbnail_path(id, ThumbnailSize::Poster);
        fs::write(&thumb, b"jpg").unwrap();
        let sub = store.subtitle_path(id, "eng", 0);
        fs::create_dir_all(sub.parent().unwrap()).unwrap();
        fs::write(&sub, b"WEBVTT").unwrap();
        store.persist_metadata(&doc(id, None)).unwrap();
        let src = incoming(&dir, "x.mp4", b"raw");
        fs::rename(&src, store.area_path(Area::Processing).join(format!("{}.mp4", id))).unwrap();

        let url = store.publish(&rendition, &format!("{}_720p.mp4", id)).unwrap();
        assert_eq!(url, format!("/videos/{}_720p.mp4", id));

        let location = store.locate(id);
        assert_eq!(location.master, Some(master));
        assert_eq!(location.renditions.len(), 1);
        assert_eq!(location.public_links.len(), 1);
        assert_eq!(location.subtitles.len(), 1);
        assert!(location.metadata.is_some());

        let report = store.purge(id);
        assert!(report.failed.is_empty());
        assert!(store.locate(id).is_empty());

        // writes racing the purge fail cleanly
        let err = store.persist_metadata(&doc(id, None)).unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
    }

    #[test]
    fn test_locate_ignores_locks_and_unknown_ids() {
        let (_dir, store) = store();
        let target = store.master_path("zzz", QualityTier::Sd480);
        let write = store.begin_write("zzz", &target, Path::new("/src"), "master").unwrap();
        fs::write(write.temp_path(), b"partial").unwrap();

        assert!(store.locate("zzz").master.is_none());
        assert!(store.locate("").is_empty());
        assert!(store.locate("missing").is_empty());
        drop(write);
    }

    #[test]
    fn test_reap_respects_age_and_pins() {
        let (_dir, store) = store();
        let old = store.area_path(Area::Processing).join("old_1.mp4");
        let pinned = store.area_path(Area::Processing).join("busy_2.mp4");
        let fresh = store.area_path(Area::Temp).join("failed").join("new_3.mp4");
        let two_hours_ago = SystemTime::now() - Duration::from_secs(7200);
        for path in [&old, &pinned] {
            fs::write(path, b"x").unwrap();
            fs::File::options().write(true).open(path).unwrap().set_modified(two_hours_ago).unwrap();
        }
        fs::write(&fresh, b"x").unwrap();
        store.pin("busy_2");

        assert_eq!(store.reap(Duration::from_secs(3600)).unwrap(), 1);
        assert!(!old.exists());
        assert!(pinned.exists());
        assert!(fresh.exists());

        store.unpin("busy_2");
        assert_eq!(store.reap(Duration::from_secs(3600)).unwrap(), 1);
        assert!(fresh.exists());
    }

    #[test]
    fn test_reap_keeps_uploads_on_record() {
        let (_dir, store) = store();
        let stale = SystemTime::now() - Duration::from_secs(3 * 3600);
        let kept = store.area_path(Area::Processing).join("77_aa_bb.mp4");
        let orphan = store.area_path(Area::Uploads).join("78_cc_dd.mp4");
        let scratch = store.area_path(Area::Temp).join("daily").join("77_aa_bb.mp4");
        store.persist_metadata(&doc("77_aa_bb", Some("hash"))).unwrap();
        for path in [&kept, &orphan, &scratch] {
            fs::write(path, b"x").unwrap();
            fs::File::options().write(true).open(path).unwrap().set_modified(stale).unwrap();
        }

        assert_eq!(store.reap(Duration::from_secs(2 * 3600)).unwrap(), 2);
        assert!(kept.exists());
        assert!(!orphan.exists());
        assert!(!scratch.exists());
    }

    #[test]
    fn test_stage_and_promote_restart_age() {
        let (dir, store) = store();
        let src = incoming(&dir, "copied.bin", b"preserved timestamps");
        let three_hours_ago = SystemTime::now() - Duration::from_secs(3 * 3600);
        fs::File::options().write(true).open(&src).unwrap().set_modified(three_hours_ago).unwrap();

        let staged = store.stage(&src, "copied.mp4", None).unwrap();
        assert_eq!(store.reap(Duration::from_secs(2 * 3600)).unwrap(), 0);
        let promoted = store.promote(&staged, Area::Processing).unwrap();
        assert_eq!(store.reap(Duration::from_secs(2 * 3600)).unwrap(), 0);
        assert!(promoted.path.exists());
    }

    #[test]
    fn test_tombstones_are_released() {
        let (_dir, store) = store();
        store.pin("busy");
        store.purge("busy");
        store.purge("idle");
        assert!(store.is_purged("busy"));
        assert!(store.is_purged("idle"));

        // the job that owned the fileId is over
        store.unpin("busy");
        assert!(!store.is_purged("busy"));
        assert!(store.persist_metadata(&doc("busy", None)).is_ok());

        std::thread::sleep(Duration::from_millis(20));
        store.reap(Duration::from_millis(5)).unwrap();
        assert!(!store.is_purged("idle"));
    }

    #[test]
    fn test_processing_records_rebuilt_from_disk() {
        let (_dir, store) = store();
        let mut d = doc("42_aa_bb", Some("hash"));
        d.original_name = "Trip.mov".to_string();
        store.persist_metadata(&d).unwrap();
        fs::write(store.area_path(Area::Processing).join("42_aa_bb.mov"), b"x").unwrap();

        let records = store.processing_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file_id, "42_aa_bb");
        assert_eq!(records[0].original_name, "Trip.mov");
        assert_eq!(records[0].content_hash.as_deref(), Some("hash"));
    }
}
