use std::fs;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;
use crate::error::{PipelineError, Result};

/// Contents of a `<target>.lock` marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockMarker {
    pub start_time: DateTime<Utc>,
    pub source: PathBuf,
    pub target: PathBuf,
    pub stage: String,
}

/// Get the path to the lock marker guarding `target`
pub fn lock_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

/// Get the scratch name a write to `target` goes through (`x_master.mkv` -> `x_master.tmp.mkv`)
pub fn temp_path(target: &Path) -> PathBuf {
    let mut path = target.to_path_buf();
    match target.extension().and_then(|e| e.to_str()) {
        Some(ext) => path.set_extension(format!("tmp.{}", ext)),
        None => path.set_extension("tmp"),
    };
    path
}

pub fn is_lock_marker(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("lock")
}

pub fn is_temp_file(path: &Path) -> bool {
    if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
        return true;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.ends_with(".tmp"))
        .unwrap_or(false)
}

/// Recover the guarded target from a lock marker path
fn target_of(lock: &Path) -> PathBuf {
    lock.with_extension("")
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(PipelineError::io(path, e)),
    }
}

/// A write in progress: the lock marker exists and the producer writes into `temp_path()`.
///
/// `commit` renames the scratch file onto the target and only then drops the marker,
/// so the target path never holds partial bytes. Dropping an uncommitted write
/// removes both the scratch file and the marker.
#[derive(Debug)]
pub struct PendingWrite {
    target: PathBuf,
    temp: PathBuf,
    lock: PathBuf,
    done: bool,
}

impl PendingWrite {
    pub fn begin(target: &Path, source: &Path, stage: &str) -> Result<PendingWrite> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let marker = LockMarker {
            start_time: Utc::now(),
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            stage: stage.to_string(),
        };
        let lock = lock_path(target);
        let body = serde_json::to_vec_pretty(&marker).map_err(|e| PipelineError::Metadata {
            path: lock.clone(),
            source: e,
        })?;
        fs::write(&lock, body).map_err(|e| PipelineError::io(&lock, e))?;

        let temp = temp_path(target);
        // leftovers from an earlier attempt must not be mistaken for fresh output
        remove_if_present(&temp)?;

        debug!("Lock acquired for {} ({})", target.display(), stage);
        Ok(PendingWrite {
            target: target.to_path_buf(),
            temp,
            lock,
            done: false,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Publish the scratch file under the target name and release the marker
    pub fn commit(mut self) -> Result<PathBuf> {
        if !self.temp.exists() {
            return Err(PipelineError::io(
                &self.temp,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no output was produced"),
            ));
        }
        fs::rename(&self.temp, &self.target).map_err(|e| PipelineError::io(&self.target, e))?;
        remove_if_present(&self.lock)?;
        self.done = true;
        Ok(self.target.clone())
    }

    /// Discard the partial output explicitly
    pub fn abort(mut self) {
        self.cleanup();
        self.done = true;
    }

    fn cleanup(&self) {
        for path in [&self.temp, &self.lock] {
            if let Err(e) = remove_if_present(path) {
                warn!("Failed to clean up {}: {}", path.display(), e);
            }
        }
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if !self.done {
            debug!("Discarding uncommitted write to {}", self.target.display());
            self.cleanup();
        }
    }
}

/// Read a marker; a corrupt marker still yields the guarded target
pub fn read_lock_marker(lock: &Path) -> LockMarker {
    let parsed = fs::read(lock)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LockMarker>(&bytes).ok());
    match parsed {
        Some(marker) => marker,
        None => LockMarker {
            start_time: Utc::now(),
            source: PathBuf::new(),
            target: target_of(lock),
            stage: "unknown".to_string(),
        },
    }
}

/// Crash recovery: every marker under `root` belongs to a write that never finished.
///
/// The partial scratch file and the marker are deleted. A file at the target itself
/// is only ever produced by the committing rename, so it is complete and stays.
/// Returns the markers that were cleared.
pub fn sweep_lock_markers(root: &Path) -> Result<Vec<LockMarker>> {
    let mut cleared = Vec::new();
    if !root.exists() {
        return Ok(cleared);
    }

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || !is_lock_marker(path) {
            continue;
        }

        let marker = read_lock_marker(path);
        let target = target_of(path);
        let partial = temp_path(&target);
        if remove_if_present(&partial)? {
            info!("Removed partial output {}", partial.display());
        }
        remove_if_present(path)?;
        info!("Cleared stale lock for {} (stage: {})", target.display(), marker.stage);
        cleared.push(marker);
    }

    Ok(cleared)
}

/// Get the path to the why.txt file for a given media file
pub fn why_txt_path(file_path: &Path) -> PathBuf {
    let mut path = file_path.to_path_buf();
    path.set_extension("why.txt");
    path
}

/// Write a why.txt file explaining why a file was rejected
pub fn write_why_txt(file_path: &Path, reason: &str) -> Result<()> {
    let why_path = why_txt_path(file_path);
    fs::write(&why_path, reason).map_err(|e| PipelineError::io(&why_path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_names() {
        let target = Path::new("/m/masters/1080p/abc_master.mkv");
        assert_eq!(lock_path(target), PathBuf::from("/m/masters/1080p/abc_master.mkv.lock"));
        assert_eq!(temp_path(target), PathBuf::from("/m/masters/1080p/abc_master.tmp.mkv"));
        assert_eq!(temp_path(Path::new("/m/noext")), PathBuf::from("/m/noext.tmp"));
        assert_eq!(target_of(&lock_path(target)), target);
        assert!(is_lock_marker(&lock_path(target)));
        assert!(is_temp_file(&temp_path(target)));
        assert!(!is_temp_file(target));
        assert_eq!(why_txt_path(Path::new("/in/clip.mp4")), PathBuf::from("/in/clip.why.txt"));
    }

    #[test]
    fn test_commit_publishes_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out").join("a_720p.mp4");

        let write = PendingWrite::begin(&target, Path::new("/src/a.mkv"), "renditions").unwrap();
        assert!(lock_path(&target).exists());
        let marker = read_lock_marker(&lock_path(&target));
        assert_eq!(marker.stage, "renditions");
        assert_eq!(marker.target, target);

        fs::write(write.temp_path(), b"encoded").unwrap();
        assert!(!target.exists());
        let published = write.commit().unwrap();

        assert_eq!(published, target);
        assert_eq!(fs::read(&target).unwrap(), b"encoded");
        assert!(!lock_path(&target).exists());
        assert!(!temp_path(&target).exists());
    }

    #[test]
    fn test_commit_without_output_fails_and_cleans() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.mkv");
        let write = PendingWrite::begin(&target, Path::new("/src"), "master").unwrap();
        assert!(matches!(write.commit(), Err(PipelineError::Io { .. })));
        assert!(!lock_path(&target).exists());
    }

    #[test]
    fn test_drop_discards_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.mkv");
        {
            let write = PendingWrite::begin(&target, Path::new("/src"), "master").unwrap();
            fs::write(write.temp_path(), b"half").unwrap();
        }
        assert!(!target.exists());
        assert!(!temp_path(&target).exists());
        assert!(!lock_path(&target).exists());
    }

    #[test]
    fn test_sweep_removes_marker_and_partial() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("masters").join("720p").join("x_master.mkv");
        let write = PendingWrite::begin(&target, Path::new("/p/x.mp4"), "master").unwrap();
        fs::write(write.temp_path(), b"partial").unwrap();
        // simulate a crash: the process dies without running destructors
        std::mem::forget(write);

        let cleared = sweep_lock_markers(dir.path()).unwrap();
        assert_eq!(cleared.len(), 1);
        assert_eq!(cleared[0].source, PathBuf::from("/p/x.mp4"));
        assert!(!lock_path(&target).exists());
        assert!(!temp_path(&target).exists());
        assert!(!target.exists());

        // second sweep has nothing to do
        assert!(sweep_lock_markers(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_sweep_tolerates_corrupt_marker() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("y.json");
        fs::write(lock_path(&target), b"{not json").unwrap();
        let cleared = sweep_lock_markers(dir.path()).unwrap();
        assert_eq!(cleared[0].target, target);
        assert!(!lock_path(&target).exists());
    }
}
