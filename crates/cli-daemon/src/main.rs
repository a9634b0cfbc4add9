use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pipeline::{
    registry::write_status,
    sidecar, Area, CommandFile, ContentStore, Engine, EngineStatus, FfmpegEngine, InboxScanner, Intake,
    IntakeOutcome, Orchestrator, PipelineConfig, PipelineEvent, ScanResult, StatusSnapshot,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::broadcast::error::RecvError;

/// Media ingestion and transcoding daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the inbox and run jobs until interrupted (default)
    Run,
    /// Ingest one file and run its job to completion
    Ingest {
        file: PathBuf,
        /// Original name to record instead of the file's own name
        #[arg(long)]
        name: Option<String>,
    },
    /// Print every asset stored for a fileId
    Locate { file_id: String },
    /// Remove every asset of a fileId
    Purge { file_id: String },
    /// Delete stale transient files
    Reap {
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
    /// Clear lock markers left by interrupted writes
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; --verbose only moves the default
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = PipelineConfig::load_config(args.config.as_deref()).context("Failed to load configuration")?;
    let cfg = Arc::new(cfg);

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(cfg).await,
        Command::Ingest { file, name } => ingest(cfg, &file, name).await,
        Command::Locate { file_id } => {
            let store = ContentStore::from_config(&cfg);
            print_json(&store.locate(&file_id))
        }
        Command::Purge { file_id } => {
            let store = ContentStore::from_config(&cfg);
            let report = store.purge(&file_id);
            print_json(&report)?;
            if !report.failed.is_empty() {
                bail!("{} file(s) could not be removed", report.failed.len());
            }
            Ok(())
        }
        Command::Reap { max_age_secs } => {
            let store = ContentStore::from_config(&cfg);
            let max_age = Duration::from_secs(max_age_secs.unwrap_or(cfg.orphan_max_age_secs));
            let removed = store.reap(max_age).context("Failed to reap transient files")?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
        Command::Recover => {
            let store = ContentStore::from_config(&cfg);
            let cleared = store.recover_locks().context("Failed to sweep lock markers")?;
            print_json(&cleared)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build(cfg: &Arc<PipelineConfig>) -> Result<(ContentStore, Intake, Orchestrator)> {
    let store = ContentStore::from_config(cfg);
    store.ensure_layout().context("Failed to create storage layout")?;
    let engine: Arc<dyn Engine> = Arc::new(FfmpegEngine::new(cfg));
    let intake = Intake::new(cfg.clone(), store.clone(), engine.clone());
    let orchestrator = Orchestrator::new(cfg.clone(), store.clone(), engine);
    Ok((store, intake, orchestrator))
}

fn log_engine(status: &EngineStatus) {
    match status {
        EngineStatus::Available { version } => info!("🎬 Transcoding engine: {}", version),
        EngineStatus::Unavailable { reason, .. } => {
            warn!("⚠️  Transcoding engine unavailable: {} (jobs will fail fast until it returns)", reason)
        }
        EngineStatus::Unknown => debug!("Transcoding engine not checked yet"),
    }
}

async fn run(cfg: Arc<PipelineConfig>) -> Result<()> {
    info!("Media pipeline daemon starting");
    info!("Configuration loaded:");
    info!("  Storage root: {}", cfg.storage_root.display());
    info!("  Inbox: {}", cfg.inbox_dir.display());
    info!("  Max concurrent encodes: {}", cfg.max_concurrent_encodes);
    info!("  Scan interval: {}s", cfg.scan_interval_secs);

    let (store, intake, orchestrator) = build(&cfg)?;

    log_engine(&orchestrator.check_engine().await);
    spawn_status_writer(&cfg, &orchestrator);
    startup_recovery(&cfg, &store, &orchestrator)?;

    let mut scanner = InboxScanner::new(&cfg);
    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.scan_interval_secs.max(1)));
    let mut last_reap = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested; in-flight writes are cleared by the next startup sweep");
                break;
            }
        }

        let results = match scanner.poll() {
            Ok(results) => results,
            Err(e) => {
                error!("Failed to scan inbox {}: {}", scanner.inbox().display(), e);
                continue;
            }
        };
        for result in results {
            match result {
                ScanResult::Candidate(path, size) => accept_candidate(&cfg, &intake, &orchestrator, &path, size).await,
                ScanResult::Skipped(path, reason) => debug!("Skipped {}: {}", path.display(), reason),
            }
        }

        if let Err(e) = process_command_files(&cfg, &orchestrator) {
            warn!("Failed to process command files: {:#}", e);
        }

        if last_reap.elapsed() >= Duration::from_secs(cfg.reap_interval_secs) {
            match store.reap(Duration::from_secs(cfg.orphan_max_age_secs)) {
                Ok(n) if n > 0 => info!("🧹 Reaped {} orphaned file(s)", n),
                Ok(_) => debug!("Reap found nothing to remove"),
                Err(e) => warn!("Periodic reap failed: {}", e),
            }
            last_reap = Instant::now();
        }
    }

    Ok(())
}

/// Interrupted writes are swept first. Interrupted uploads are resumed (and so pinned)
/// before stale transient files are reaped.
fn startup_recovery(cfg: &PipelineConfig, store: &ContentStore, orchestrator: &Orchestrator) -> Result<(usize, usize)> {
    info!("🔄 Starting recovery checks...");
    let cleared = store.recover_locks().context("Failed to sweep lock markers on startup")?;
    let resumed = resume_processing(store, orchestrator)?;
    let reaped = store
        .reap(Duration::from_secs(cfg.orphan_max_age_secs))
        .context("Failed to reap orphaned files on startup")?;
    info!(
        "✅ Startup recovery complete: {} interrupted write(s) cleared, {} orphan(s) removed",
        cleared.len(),
        reaped
    );
    Ok((resumed, reaped))
}

/// Uploads left in the processing area by a previous run get a fresh job
fn resume_processing(store: &ContentStore, orchestrator: &Orchestrator) -> Result<usize> {
    let records = store.processing_records().context("Failed to list processing area")?;
    let mut resumed = 0;
    for record in records {
        let finished = store
            .load_metadata(&record.file_id)
            .ok()
            .flatten()
            .map(|doc| doc.assets.is_some())
            .unwrap_or(false);
        if finished {
            debug!("{} already has assets, not resuming", record.file_id);
            continue;
        }
        match orchestrator.submit(record) {
            Ok(_) => resumed += 1,
            Err(e) => warn!("Could not resume job: {}", e),
        }
    }
    if resumed > 0 {
        info!("🔁 Resumed {} job(s) from the processing area", resumed);
    }
    Ok(resumed)
}

async fn accept_candidate(cfg: &PipelineConfig, intake: &Intake, orchestrator: &Orchestrator, path: &Path, size: u64) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    match intake.accept(path, &name, size).await {
        Ok(IntakeOutcome::Accepted(record)) => {
            let file_id = record.file_id.clone();
            if let Err(e) = orchestrator.submit(record) {
                error!("❌ Could not start job for {}: {}", file_id, e);
            }
        }
        Ok(IntakeOutcome::Duplicate { file_id }) => {
            info!("{} duplicates {}; nothing to do", name, file_id);
        }
        Err(e) if e.is_engine_unavailable() => {
            // left in the inbox; the scanner offers it again
            warn!("Engine unavailable, {} stays in the inbox: {}", name, e);
        }
        Err(e) => {
            warn!("Rejected {}: {}", name, e);
            if let Err(move_err) = reject(cfg, path, &e.to_string()) {
                error!("Failed to move rejected file {}: {:#}", path.display(), move_err);
            }
        }
    }
}

/// Park a rejected upload in temp/failed with a .why.txt explaining the rejection
fn reject(cfg: &PipelineConfig, path: &Path, reason: &str) -> Result<()> {
    let failed_dir = cfg.area_path(Area::Temp).join("failed");
    fs::create_dir_all(&failed_dir)
        .with_context(|| format!("Failed to create {}", failed_dir.display()))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let dest = failed_dir.join(format!("{}_{}", Utc::now().timestamp_millis(), name));

    if fs::rename(path, &dest).is_err() {
        fs::copy(path, &dest).with_context(|| format!("Failed to copy {} to {}", path.display(), dest.display()))?;
        fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    sidecar::write_why_txt(&dest, reason)?;
    Ok(())
}

/// Log every event and refresh the status snapshot after each one
fn spawn_status_writer(cfg: &PipelineConfig, orchestrator: &Orchestrator) {
    let mut events = orchestrator.subscribe();
    let orchestrator = orchestrator.clone();
    let status_path = cfg.status_path();

    let write = move |orchestrator: &Orchestrator| {
        let snapshot = StatusSnapshot {
            updated_at: Utc::now(),
            engine: orchestrator.engine_status(),
            jobs: orchestrator.get_status(),
        };
        if let Err(e) = write_status(&status_path, &snapshot) {
            warn!("Failed to write status snapshot: {}", e);
        }
    };
    write(&orchestrator);

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    log_event(&event);
                    write(&orchestrator);
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Status writer skipped {} event(s)", skipped);
                    write(&orchestrator);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn log_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::Progress { file_id, step, progress, .. } => {
            debug!("Job {}: {:.1}% {}", file_id, progress, step)
        }
        PipelineEvent::Completed { file_id, assets, .. } => info!(
            "Job {}: done ({} master, {} renditions, {} thumbnails, {} subtitles)",
            file_id, assets.masters, assets.renditions, assets.thumbnails, assets.subtitles
        ),
        PipelineEvent::Failed { file_id, step, error, .. } => {
            info!("Job {}: failed at '{}': {}", file_id, step, error)
        }
    }
}

/// Process command files from the TUI
fn process_command_files(cfg: &PipelineConfig, orchestrator: &Orchestrator) -> Result<usize> {
    let command_dir = cfg.command_dir();
    if !command_dir.exists() {
        fs::create_dir_all(&command_dir)
            .with_context(|| format!("Failed to create command directory: {}", command_dir.display()))?;
    }

    let mut processed_count = 0;
    let entries = match fs::read_dir(&command_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Failed to read command directory {}: {}", command_dir.display(), e);
            return Ok(0);
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }

        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read command file {}: {}", path.display(), e);
                continue;
            }
        };

        match serde_json::from_str::<CommandFile>(&content) {
            Ok(cmd) if cmd.action == "retry" => match orchestrator.retry(&cmd.file_id) {
                Ok(_) => {
                    info!("Job {}: processing manual retry command", cmd.file_id);
                    processed_count += 1;
                }
                Err(e) => warn!("Job {}: cannot retry: {}", cmd.file_id, e),
            },
            Ok(cmd) => warn!("Unknown command action: {}", cmd.action),
            Err(e) => warn!("Failed to parse command file {}: {}", path.display(), e),
        }

        fs::remove_file(&path)
            .with_context(|| format!("Failed to delete processed command file: {}", path.display()))?;
    }

    if processed_count > 0 {
        info!("✅ Processed {} command file(s)", processed_count);
    }
    Ok(processed_count)
}

/// One-shot: copy the file in, run intake and the whole job, print events as JSON lines
async fn ingest(cfg: Arc<PipelineConfig>, file: &Path, name: Option<String>) -> Result<()> {
    let (store, intake, orchestrator) = build(&cfg)?;
    store.recover_locks().context("Failed to sweep lock markers")?;

    let original_name = match name {
        Some(name) => name,
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", file.display()))?,
    };

    // intake consumes its input; work on a copy so the caller's file stays put
    let scratch_dir = store.area_path(Area::Temp).join("daily");
    fs::create_dir_all(&scratch_dir)
        .with_context(|| format!("Failed to create {}", scratch_dir.display()))?;
    let scratch = scratch_dir.join(format!("{}_{}", Utc::now().timestamp_millis(), original_name.replace('/', "_")));
    let size = fs::copy(file, &scratch)
        .with_context(|| format!("Failed to copy {} into {}", file.display(), scratch.display()))?;

    let outcome = match intake.accept(&scratch, &original_name, size).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let _ = fs::remove_file(&scratch);
            bail!("Upload rejected: {}", e);
        }
    };

    let record = match outcome {
        IntakeOutcome::Accepted(record) => record,
        IntakeOutcome::Duplicate { file_id } => {
            println!("{}", serde_json::json!({ "type": "duplicate", "fileId": file_id }));
            return Ok(());
        }
    };

    let mut events = orchestrator.subscribe();
    let handle = orchestrator.submit(record).context("Failed to start job")?;
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{}", line);
                    }
                    if event.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let outcome = handle.await.context("Job task panicked")?;
    let _ = printer.await;
    write_status(
        &cfg.status_path(),
        &StatusSnapshot {
            updated_at: Utc::now(),
            engine: orchestrator.engine_status(),
            jobs: orchestrator.get_status(),
        },
    )?;

    match outcome {
        Ok(_) => Ok(()),
        Err(e) => bail!("Job failed: {}", e),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pipeline::engine::{EncodeRequest, EngineTask};
    use pipeline::{EngineVersion, FFProbeData, PipelineError};
    use std::time::SystemTime;

    /// Never answers its health check, so resumed jobs stay pinned
    struct StalledEngine;

    #[async_trait]
    impl Engine for StalledEngine {
        async fn check(&self) -> pipeline::Result<EngineVersion> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(PipelineError::EngineUnavailable("stalled".into()))
        }

        async fn probe(&self, _path: &Path) -> pipeline::Result<FFProbeData> {
            Err(PipelineError::EngineUnavailable("stalled".into()))
        }

        fn spawn(&self, _request: EncodeRequest) -> pipeline::Result<EngineTask> {
            Err(PipelineError::EngineUnavailable("stalled".into()))
        }
    }

    fn write_stale(path: &Path, age: Duration) {
        fs::write(path, b"bytes").unwrap();
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - age)
            .unwrap();
    }

    #[tokio::test]
    async fn test_startup_resumes_uploads_before_reaping() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(PipelineConfig::with_root(dir.path()));
        let store = ContentStore::from_config(&cfg);
        store.ensure_layout().unwrap();
        let orchestrator = Orchestrator::new(cfg.clone(), store.clone(), Arc::new(StalledEngine));

        // no metadata document: only the resumed job's pin protects it
        let stale = Duration::from_secs(cfg.orphan_max_age_secs + 3600);
        let interrupted = store
            .area_path(Area::Processing)
            .join("1700000000000_abcd1234_0badf00d.mp4");
        let orphan = store.area_path(Area::Temp).join("daily").join("leftover.mp4");
        write_stale(&interrupted, stale);
        write_stale(&orphan, stale);

        let (resumed, reaped) = startup_recovery(&cfg, &store, &orchestrator).unwrap();
        assert_eq!(resumed, 1);
        assert_eq!(reaped, 1);
        assert!(interrupted.exists());
        assert!(!orphan.exists());
    }

    #[test]
    fn test_reject_moves_file_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PipelineConfig::with_root(dir.path());
        let incoming = dir.path().join("notes.txt");
        fs::write(&incoming, b"text").unwrap();

        reject(&cfg, &incoming, "unsupported extension").unwrap();
        assert!(!incoming.exists());
        let failed: Vec<PathBuf> = fs::read_dir(cfg.storage_root.join("temp/failed"))
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .collect();
        assert!(failed.iter().any(|p| p.to_string_lossy().ends_with("_notes.txt")));
    }
}
