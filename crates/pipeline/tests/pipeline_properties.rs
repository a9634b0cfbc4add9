use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pipeline::engine::{EncodeRequest, EngineTask};
use pipeline::ffprobe::parse_probe_output;
use pipeline::metadata::AudioTrack;
use pipeline::quality::{select_primary_audio, select_tier};
use pipeline::sidecar::{self, LockMarker};
use pipeline::{
    ContentStore, Engine, EngineVersion, FFProbeData, Intake, IntakeOutcome, JobStatus, MetadataDocument,
    Orchestrator, PipelineConfig, PipelineError, PipelineEvent, QualityTier, Result,
};
use tokio::sync::mpsc;

const PROBE: &str = r#"{
    "streams": [
        {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720},
        {"index": 1, "codec_type": "audio", "codec_name": "aac", "tags": {"language": "eng"}}
    ],
    "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "12.5"}
}"#;

/// Writes a small file for every request; fails the master encode when asked to
struct ScriptedEngine {
    fail_master: AtomicBool,
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn check(&self) -> Result<EngineVersion> {
        Ok(EngineVersion::parse("ffmpeg version 7.0.2").unwrap())
    }

    async fn probe(&self, path: &Path) -> Result<FFProbeData> {
        parse_probe_output(PROBE, path)
    }

    fn spawn(&self, request: EncodeRequest) -> Result<EngineTask> {
        let fail = request.label == "master" && self.fail_master.load(Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(async move {
            for percent in [10.0, 60.0, 100.0] {
                let _ = tx.send(percent).await;
            }
            if fail {
                return Err(PipelineError::processing("FFmpeg master failed (exit code: 1)", Some(1), None));
            }
            tokio::fs::write(&request.output, b"encoded")
                .await
                .map_err(|e| PipelineError::io(&request.output, e))
        });
        Ok(EngineTask { progress: rx, handle })
    }
}

struct Harness {
    dir: tempfile::TempDir,
    config: Arc<PipelineConfig>,
    store: ContentStore,
    engine: Arc<ScriptedEngine>,
    intake: Intake,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::with_root(dir.path().join("media"));
        config.min_upload_bytes = 16;
        config.optional_renditions = vec!["webm".into()];
        let config = Arc::new(config);
        let store = ContentStore::from_config(&config);
        store.ensure_layout().unwrap();
        let engine = Arc::new(ScriptedEngine {
            fail_master: AtomicBool::new(false),
        });
        let intake = Intake::new(config.clone(), store.clone(), engine.clone());
        let orchestrator = Orchestrator::new(config.clone(), store.clone(), engine.clone());
        Harness { dir, config, store, engine, intake, orchestrator }
    }

    /// Drop an MP4-looking upload with the given payload into a scratch location
    fn upload(&self, name: &str, payload: &[u8]) -> (PathBuf, u64) {
        let mut bytes = vec![0x00, 0x00, 0x00, 0x20];
        bytes.extend_from_slice(b"ftypisom");
        bytes.extend_from_slice(&[0u8; 20]);
        bytes.extend_from_slice(payload);
        let path = self.dir.path().join(format!("upload-{}", name));
        std::fs::write(&path, &bytes).unwrap();
        (path, bytes.len() as u64)
    }

    async fn accept(&self, name: &str, payload: &[u8]) -> IntakeOutcome {
        let (path, size) = self.upload(name, payload);
        self.intake.accept(&path, name, size).await.unwrap()
    }
}

fn accepted(outcome: IntakeOutcome) -> pipeline::UploadRecord {
    match outcome {
        IntakeOutcome::Accepted(record) => record,
        IntakeOutcome::Duplicate { file_id } => panic!("unexpected duplicate of {}", file_id),
    }
}

#[tokio::test]
async fn staged_upload_is_located_alone() {
    let h = Harness::new();
    let record = accepted(h.accept("holiday.mp4", b"one").await);

    let location = h.store.locate(&record.file_id);
    assert_eq!(location.uploads, vec![record.path.clone()]);
    assert!(location.master.is_none());
    assert!(location.renditions.is_empty());
    assert!(location.thumbnails.is_empty());
    assert!(location.subtitles.is_empty());
    assert!(location.metadata.is_some());
}

#[tokio::test]
async fn rejected_upload_leaves_store_untouched() {
    let h = Harness::new();
    let (path, size) = h.upload("notes.txt", b"x");
    let err = h.intake.accept(&path, "notes.txt", size).await.unwrap_err();
    assert!(err.is_rejection());

    let (path, size) = h.upload("clip.mp4", b"x");
    let err = h.intake.accept(&path, "clip.mp4", size + 1).await.unwrap_err();
    assert!(matches!(err, PipelineError::Integrity(_)));
    assert!(path.exists(), "rejected bytes stay with the caller");
    assert!(h.store.processing_records().unwrap().is_empty());
}

#[tokio::test]
async fn metadata_persistence_is_idempotent() {
    let h = Harness::new();
    let mut doc = MetadataDocument {
        file_id: "1700000000000_abcd1234_deadbeef".into(),
        original_name: "a.mp4".into(),
        content_hash: Some("first".into()),
        extracted_at: chrono::Utc::now(),
        quality_tier: None,
        media: None,
        assets: None,
    };
    h.store.persist_metadata(&doc).unwrap();
    doc.content_hash = Some("second".into());
    doc.quality_tier = Some(QualityTier::Hd720);
    let path = h.store.persist_metadata(&doc).unwrap();

    let docs: Vec<_> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().contains(&doc.file_id))
        .collect();
    assert_eq!(docs.len(), 1);
    assert_eq!(h.store.load_metadata(&doc.file_id).unwrap(), Some(doc));
}

#[tokio::test]
async fn identical_content_is_deduplicated() {
    let h = Harness::new();
    let record = accepted(h.accept("first.mp4", b"same bytes").await);
    h.orchestrator.submit(record.clone()).unwrap().await.unwrap().unwrap();

    let (path, size) = h.upload("renamed.mp4", b"same bytes");
    match h.intake.accept(&path, "renamed.mp4", size).await.unwrap() {
        IntakeOutcome::Duplicate { file_id } => assert_eq!(file_id, record.file_id),
        IntakeOutcome::Accepted(r) => panic!("duplicate accepted as {}", r.file_id),
    }
    assert!(!path.exists(), "duplicate bytes are discarded");

    let masters = walkdir::WalkDir::new(h.store.area_path(pipeline::Area::Masters))
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .count();
    assert_eq!(masters, 1);
}

#[tokio::test]
async fn tier_and_primary_track_examples() {
    assert_eq!(select_tier(4000, 2000), QualityTier::Uhd4k);
    assert_eq!(select_tier(1900, 1000), QualityTier::Fhd1080);
    assert_eq!(select_tier(1000, 600), QualityTier::Hd720);
    assert_eq!(select_tier(500, 300), QualityTier::Sd480);

    let track = |index: i32, language: &str| AudioTrack {
        index,
        codec: "aac".into(),
        language: language.into(),
        title: String::new(),
        channels: 2,
        bitrate: None,
        sample_rate: None,
    };
    let priority = vec!["por".to_string(), "eng".to_string()];
    let tracks = vec![track(1, "jpn"), track(2, "eng"), track(3, "por")];
    assert_eq!(select_primary_audio(&tracks, &priority).unwrap().language, "por");
    let lone = vec![track(1, "jpn")];
    assert_eq!(select_primary_audio(&lone, &priority).unwrap().language, "jpn");
}

#[tokio::test]
async fn job_events_are_monotonic_with_single_terminal() {
    let h = Harness::new();
    let mut events = h.orchestrator.subscribe();
    let record = accepted(h.accept("movie.mp4", b"movie").await);
    let summary = h.orchestrator.submit(record.clone()).unwrap().await.unwrap().unwrap();
    assert_eq!(summary.master.unwrap().quality_tier, QualityTier::Hd720);

    let mut last = 0.0;
    let mut terminals = 0;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.file_id(), record.file_id);
        if let PipelineEvent::Progress { progress, .. } = event {
            assert!(progress >= last, "progress regressed from {} to {}", last, progress);
            last = progress;
        } else {
            terminals += 1;
        }
    }
    assert_eq!(terminals, 1);

    let snapshot = h.orchestrator.get_status();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].status, JobStatus::Completed);
    assert_eq!(snapshot[0].progress, 100.0);
}

#[tokio::test]
async fn failed_job_keeps_step_and_upload() {
    let h = Harness::new();
    h.engine.fail_master.store(true, Ordering::SeqCst);
    let mut events = h.orchestrator.subscribe();
    let record = accepted(h.accept("broken.mp4", b"broken").await);

    let err = h.orchestrator.submit(record.clone()).unwrap().await.unwrap().unwrap_err();
    assert!(matches!(err, PipelineError::EngineProcessing { exit_code: Some(1), .. }));

    let job = h.orchestrator.job(&record.file_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let failure = job.error.unwrap();
    assert_eq!(failure.failed_stage, JobStatus::ConvertingMaster);
    assert!(failure.failed_step.starts_with("Converting to master"));
    assert!(record.path.exists(), "a failed conversion never deletes the upload");

    let failures = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, PipelineEvent::Failed { .. }))
        .count();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn startup_sweep_clears_interrupted_writes() {
    let h = Harness::new();
    let target = h
        .store
        .master_path("1700000000000_abcd1234_deadbeef", QualityTier::Fhd1080);
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
    let partial = sidecar::temp_path(&target);
    std::fs::write(&partial, b"half an encode").unwrap();
    let marker = LockMarker {
        start_time: chrono::Utc::now(),
        source: h.config.storage_root.join("processing/x.mp4"),
        target: target.clone(),
        stage: "master".into(),
    };
    std::fs::write(sidecar::lock_path(&target), serde_json::to_vec(&marker).unwrap()).unwrap();

    let cleared = h.store.recover_locks().unwrap();
    assert_eq!(cleared.len(), 1);
    assert!(!target.exists());
    assert!(!partial.exists());
    assert!(!sidecar::lock_path(&target).exists());
    assert!(h.orchestrator.get_status().is_empty(), "recovery never resurrects a job");
}

#[tokio::test]
async fn purge_removes_every_asset_kind() {
    let h = Harness::new();
    let record = accepted(h.accept("gone.mp4", b"gone").await);
    let mut retained = (*h.config).clone();
    retained.retain_source = true;
    let orchestrator = Orchestrator::new(Arc::new(retained), h.store.clone(), h.engine.clone());
    orchestrator.submit(record.clone()).unwrap().await.unwrap().unwrap();

    let before = h.store.locate(&record.file_id);
    assert!(before.master.is_some());
    assert!(!before.public_links.is_empty());
    assert_eq!(before.thumbnails.len(), 4);

    let report = h.store.purge(&record.file_id);
    assert!(report.failed.is_empty());

    let after = h.store.locate(&record.file_id);
    assert!(after.is_empty());
    assert!(after.public_links.is_empty());
    assert!(after.metadata.is_none());

    let again = h.store.begin_write(&record.file_id, &before.master.unwrap(), &record.path, "master");
    assert!(matches!(again, Err(PipelineError::Io { .. })));
}

#[tokio::test]
async fn failed_upload_survives_reap_and_retries() {
    let h = Harness::new();
    h.engine.fail_master.store(true, Ordering::SeqCst);
    let (path, size) = h.upload("archived.mp4", b"copied with preserved times");
    let three_hours_ago = std::time::SystemTime::now() - std::time::Duration::from_secs(3 * 3600);
    std::fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(three_hours_ago)
        .unwrap();
    let record = accepted(h.intake.accept(&path, "archived.mp4", size).await.unwrap());

    h.orchestrator.submit(record.clone()).unwrap().await.unwrap().unwrap_err();
    std::fs::File::options()
        .write(true)
        .open(&record.path)
        .unwrap()
        .set_modified(three_hours_ago)
        .unwrap();
    assert_eq!(h.store.reap(std::time::Duration::from_secs(2 * 3600)).unwrap(), 0);
    assert!(record.path.exists());

    h.engine.fail_master.store(false, Ordering::SeqCst);
    let summary = h.orchestrator.retry(&record.file_id).unwrap().await.unwrap().unwrap();
    assert!(summary.master.is_some());
}

#[tokio::test]
async fn failed_promotion_leaves_no_duplicate_record() {
    let h = Harness::new();
    let processing = h.store.area_path(pipeline::Area::Processing);
    std::fs::remove_dir_all(&processing).unwrap();
    std::fs::write(&processing, b"not a directory").unwrap();

    let (path, size) = h.upload("stuck.mp4", b"stuck");
    let err = h.intake.accept(&path, "stuck.mp4", size).await.unwrap_err();
    assert!(matches!(err, PipelineError::Io { .. }));

    let docs = std::fs::read_dir(h.store.area_path(pipeline::Area::Metadata))
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().ends_with("_metadata.json"))
        .count();
    assert_eq!(docs, 0);

    std::fs::remove_file(&processing).unwrap();
    h.store.ensure_layout().unwrap();
    let (path, size) = h.upload("stuck-again.mp4", b"stuck");
    accepted(h.intake.accept(&path, "stuck-again.mp4", size).await.unwrap());
}
