use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::ffprobe::{parse_probe_output, FFProbeData};
use crate::progress::{parse_progress_line, FfmpegProgress};

/// Lines of stderr kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// FFmpeg version information
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Version token as printed, e.g. "6.1.1-3ubuntu5" or "N-112345-g1234abcd"
    pub raw: String,
}

impl EngineVersion {
    /// Parse version from the first line of `ffmpeg -version`.
    /// Example: "ffmpeg version 6.1.1-3ubuntu5 Copyright ..." -> 6.1.1.
    /// Git builds without a release number yield 0.0.0 and keep the raw token.
    pub fn parse(first_line: &str) -> Option<EngineVersion> {
        let mut words = first_line.split_whitespace();
        words.find(|w| *w == "version")?;
        let token = words.next()?;

        let numeric = token.trim_start_matches('n');
        let mut parts = numeric.split('.').map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>().ok()
        });

        let (major, minor, patch) = match parts.next().flatten() {
            Some(major) => (major, parts.next().flatten().unwrap_or(0), parts.next().flatten().unwrap_or(0)),
            None => (0, 0, 0),
        };

        Some(EngineVersion {
            major,
            minor,
            patch,
            raw: token.to_string(),
        })
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One engine run
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    /// Short label for logs ("master", "webm", "thumbnail:poster", ...)
    pub label: String,
    pub args: Vec<String>,
    /// Where the engine writes; the scratch path of a pending write
    pub output: PathBuf,
    /// Expected output duration in seconds, used to turn positions into percentages
    pub duration: f64,
}

/// A running engine invocation: percent-complete notifications plus one terminal result.
///
/// The progress channel closes when the subprocess exits.
pub struct EngineTask {
    pub progress: mpsc::Receiver<f64>,
    pub handle: JoinHandle<Result<()>>,
}

impl EngineTask {
    /// Drain progress into `on_progress` and resolve to the terminal result
    pub async fn wait(mut self, mut on_progress: impl FnMut(f64) + Send) -> Result<()> {
        while let Some(percent) = self.progress.recv().await {
            on_progress(percent);
        }
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::processing(format!("engine task aborted: {}", e), None, None)),
        }
    }
}

/// Seam between the orchestrator and the external transcoding engine
#[async_trait]
pub trait Engine: Send + Sync {
    /// Verify the engine can be started at all
    async fn check(&self) -> Result<EngineVersion>;

    /// Stream inventory of one file
    async fn probe(&self, path: &Path) -> Result<FFProbeData>;

    /// Start an encode; must be called from within the tokio runtime
    fn spawn(&self, request: EncodeRequest) -> Result<EngineTask>;
}

/// Map a failure to start a binary onto the error taxonomy
fn spawn_error(bin: &Path, e: std::io::Error) -> PipelineError {
    match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            PipelineError::EngineUnavailable(format!("{}: {}", bin.display(), e))
        }
        _ => PipelineError::io(bin, e),
    }
}

/// `Engine` backed by the ffmpeg/ffprobe binaries
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    pub probe_timeout: Duration,
}

impl FfmpegEngine {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            ffprobe_bin: config.ffprobe_bin.clone(),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
        }
    }
}

#[async_trait]
impl Engine for FfmpegEngine {
    async fn check(&self) -> Result<EngineVersion> {
        let output = Command::new(&self.ffmpeg_bin)
            .arg("-version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error(&self.ffmpeg_bin, e))?;

        if !output.status.success() {
            return Err(PipelineError::EngineUnavailable(format!(
                "{} -version exited with {:?}",
                self.ffmpeg_bin.display(),
                output.status.code()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout.lines().next().unwrap_or_default();
        let version = EngineVersion::parse(first_line).ok_or_else(|| {
            PipelineError::EngineUnavailable(format!("unrecognized version output: {}", first_line))
        })?;

        info!("🎬 Transcoding engine available: ffmpeg {}", version);
        Ok(version)
    }

    async fn probe(&self, path: &Path) -> Result<FFProbeData> {
        if !path.exists() {
            return Err(PipelineError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "file to probe does not exist"),
            ));
        }

        debug!("Executing FFprobe for: {}", path.display());
        let child = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg("-show_streams")
            .arg("-show_chapters")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.ffprobe_bin, e))?;

        // dropping the future on timeout kills the child
        let output = match tokio::time::timeout(self.probe_timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| PipelineError::io(path, e))?,
            Err(_) => {
                warn!("FFprobe timed out after {:?} on {}", self.probe_timeout, path.display());
                return Err(PipelineError::Timeout(self.probe_timeout.as_secs()));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(PipelineError::processing(
                format!("ffprobe could not read {}", path.display()),
                output.status.code(),
                Some(stderr),
            ));
        }

        parse_probe_output(&String::from_utf8_lossy(&output.stdout), path)
    }

    fn spawn(&self, request: EncodeRequest) -> Result<EngineTask> {
        debug!("Executing FFmpeg ({}): {} {}", request.label, self.ffmpeg_bin.display(), request.args.join(" "));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.ffmpeg_bin, e))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            PipelineError::processing("failed to capture FFmpeg stdout", None, None)
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            PipelineError::processing("failed to capture FFmpeg stderr", None, None)
        })?;

        let (tx, rx) = mpsc::channel(64);
        let duration = request.duration;
        let label = request.label.clone();

        let handle = tokio::spawn(async move {
            let progress_reader = tokio::spawn(async move {
                let mut current = FfmpegProgress::default();
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(snapshot) = parse_progress_line(&line, &mut current) {
                        // a dropped receiver only means nobody is watching
                        let _ = tx.send(snapshot.percent(duration)).await;
                    }
                }
            });

            let stderr_reader = tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>().join("\n")
            });

            let status = child.wait().await.map_err(|e| {
                PipelineError::processing(format!("failed to wait for FFmpeg ({}): {}", label, e), None, None)
            })?;
            let _ = progress_reader.await;
            let stderr_tail = stderr_reader.await.unwrap_or_default();

            if status.success() {
                debug!("FFmpeg ({}) completed successfully", label);
                Ok(())
            } else {
                Err(PipelineError::processing(
                    format!("FFmpeg {} failed (exit code: {})", label, status.code().unwrap_or(-1)),
                    status.code(),
                    Some(stderr_tail),
                ))
            }
        });

        Ok(EngineTask { progress: rx, handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_version_parsing() {
        let v = EngineVersion::parse("ffmpeg version 6.1.1-3ubuntu5 Copyright (c) 2000-2023").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (6, 1, 1));
        assert_eq!(v.to_string(), "6.1.1-3ubuntu5");

        let v = EngineVersion::parse("ffmpeg version n7.0 Copyright").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (7, 0, 0));

        let git = EngineVersion::parse("ffmpeg version N-112345-g1234abcd Copyright").unwrap();
        assert_eq!(git.major, 0);
        assert_eq!(git.raw, "N-112345-g1234abcd");

        assert!(EngineVersion::parse("command not found").is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Any release number printed by ffmpeg parses back to the same triple
        #[test]
        fn test_version_numbers_round_trip(major in 0u32..100, minor in 0u32..100, patch in 0u32..100) {
            let line = format!("ffmpeg version {}.{}.{} Copyright", major, minor, patch);
            let v = EngineVersion::parse(&line).unwrap();
            prop_assert_eq!((v.major, v.minor, v.patch), (major, minor, patch));
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let engine = FfmpegEngine {
            ffmpeg_bin: PathBuf::from("/nonexistent/ffmpeg-binary"),
            ffprobe_bin: PathBuf::from("/nonexistent/ffprobe-binary"),
            probe_timeout: Duration::from_secs(1),
        };

        let err = engine.check().await.unwrap_err();
        assert!(err.is_engine_unavailable());

        let err = engine
            .spawn(EncodeRequest {
                label: "master".into(),
                args: vec![],
                output: PathBuf::from("/tmp/out.mkv"),
                duration: 1.0,
            })
            .err()
            .unwrap();
        assert!(err.is_engine_unavailable());

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mp4");
        std::fs::write(&file, b"x").unwrap();
        assert!(engine.probe(&file).await.unwrap_err().is_engine_unavailable());
    }

    #[tokio::test]
    async fn test_probe_of_missing_file_is_job_scoped() {
        let engine = FfmpegEngine::new(&PipelineConfig::default_config());
        let err = engine.probe(Path::new("/nonexistent/clip.mp4")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
    }
}
