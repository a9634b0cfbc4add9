use std::collections::HashMap;
use std::path::{Path, PathBuf};
use log::{debug, info, warn};
use walkdir::WalkDir;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::sidecar;

/// Result of scanning a file
#[derive(Debug, Clone, PartialEq)]
pub enum ScanResult {
    /// File is ready for intake (path, size in bytes)
    Candidate(PathBuf, u64),
    /// File should be left alone for now (path, reason)
    Skipped(PathBuf, String),
}

/// Polls the inbox and hands out files whose size held still across two polls
#[derive(Debug)]
pub struct InboxScanner {
    inbox: PathBuf,
    last_seen: HashMap<PathBuf, u64>,
}

fn is_ignored(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    name.starts_with('.')
        || name.ends_with(".why.txt")
        || sidecar::is_lock_marker(path)
        || sidecar::is_temp_file(path)
}

impl InboxScanner {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self::with_inbox(&cfg.inbox_dir)
    }

    pub fn with_inbox(inbox: impl Into<PathBuf>) -> Self {
        Self {
            inbox: inbox.into(),
            last_seen: HashMap::new(),
        }
    }

    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    /// One polling pass. A file becomes a candidate once; it is forgotten afterwards
    /// so the caller owns moving it out of the inbox.
    pub fn poll(&mut self) -> Result<Vec<ScanResult>> {
        if !self.inbox.exists() {
            std::fs::create_dir_all(&self.inbox).map_err(|e| PipelineError::io(&self.inbox, e))?;
        }

        let mut results = Vec::new();
        let mut current = HashMap::new();

        for entry in WalkDir::new(&self.inbox).min_depth(1).max_depth(1).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file() || is_ignored(path) {
                continue;
            }

            let size = match entry.metadata() {
                Ok(m) => m.len(),
                Err(e) => {
                    warn!("Failed to stat {}: {}", path.display(), e);
                    continue;
                }
            };

            match self.last_seen.get(path) {
                Some(&previous) if previous == size => {
                    info!("📥 Inbox candidate: {} ({} bytes)", path.display(), size);
                    results.push(ScanResult::Candidate(path.to_path_buf(), size));
                }
                Some(_) => {
                    debug!("Still copying: {}", path.display());
                    results.push(ScanResult::Skipped(path.to_path_buf(), "file still copying".to_string()));
                    current.insert(path.to_path_buf(), size);
                }
                None => {
                    results.push(ScanResult::Skipped(path.to_path_buf(), "first sighting".to_string()));
                    current.insert(path.to_path_buf(), size);
                }
            }
        }

        self.last_seen = current;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn candidates(results: &[ScanResult]) -> Vec<PathBuf> {
        results
            .iter()
            .filter_map(|r| match r {
                ScanResult::Candidate(p, _) => Some(p.clone()),
                ScanResult::Skipped(..) => None,
            })
            .collect()
    }

    #[test]
    fn test_candidate_after_two_stable_polls() {
        let dir = tempfile::tempdir().unwrap();
        let mut scanner = InboxScanner::with_inbox(dir.path());
        let file = dir.path().join("movie.mp4");
        fs::write(&file, b"abc").unwrap();

        assert!(candidates(&scanner.poll().unwrap()).is_empty());
        assert_eq!(candidates(&scanner.poll().unwrap()), vec![file.clone()]);
        // handed out once
        assert!(candidates(&scanner.poll().unwrap()).is_empty());
    }

    #[test]
    fn test_growing_file_waits() {
        let dir = tempfile::tempdir().unwrap();
        let mut scanner = InboxScanner::with_inbox(dir.path());
        let file = dir.path().join("movie.mp4");
        fs::write(&file, b"abc").unwrap();
        scanner.poll().unwrap();

        fs::write(&file, b"abcdef").unwrap();
        let results = scanner.poll().unwrap();
        assert_eq!(results, vec![ScanResult::Skipped(file.clone(), "file still copying".into())]);
        assert_eq!(candidates(&scanner.poll().unwrap()), vec![file]);
    }

    #[test]
    fn test_ignores_sidecars_and_creates_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = dir.path().join("inbox");
        let mut scanner = InboxScanner::with_inbox(&inbox);
        assert!(scanner.poll().unwrap().is_empty());
        assert!(inbox.is_dir());

        fs::write(inbox.join("a.mp4.why.txt"), b"x").unwrap();
        fs::write(inbox.join(".hidden"), b"x").unwrap();
        fs::write(inbox.join("a.mp4.lock"), b"x").unwrap();
        fs::create_dir(inbox.join("nested")).unwrap();
        scanner.poll().unwrap();
        assert!(scanner.poll().unwrap().is_empty());
    }
}
