use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;
use crate::assets::{
    AssetSummary, MasterAsset, RenditionAsset, RenditionFormat, SubtitleAsset, ThumbnailAsset, ThumbnailSize,
};
use crate::command::CommandBuilder;
use crate::config::PipelineConfig;
use crate::engine::{EncodeRequest, Engine, EngineVersion};
use crate::error::{PipelineError, Result};
use crate::events::PipelineEvent;
use crate::job::{Job, JobStatus};
use crate::metadata::{probe_media, MediaMetadata, MetadataDocument, UNDETERMINED};
use crate::quality::{normalize_language, select_primary_audio, select_tier, QualityTier};
use crate::registry::{JobRegistry, JobSnapshot};
use crate::store::{self, Area, ContentStore, UploadRecord};

const EVENT_CAPACITY: usize = 1024;

/// Pipeline-wide view of the transcoding engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum EngineStatus {
    /// Not checked yet
    Unknown,
    Available { version: EngineVersion },
    Unavailable { reason: String, since: DateTime<Utc> },
}

impl EngineStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, EngineStatus::Available { .. })
    }
}

#[derive(Debug)]
struct EngineHealth {
    status: EngineStatus,
    checked_at: Option<Instant>,
}

/// One rendition in the fan-out plan
#[derive(Debug, Clone)]
enum RenditionKind {
    /// Primary web MP4; the job fails without it
    Web,
    Language { audio_pos: usize, language: String },
    Webm,
    Mobile,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Directory-safe subtitle language
fn subtitle_language(language: &str) -> String {
    let cleaned: String = language
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    if cleaned.is_empty() {
        UNDETERMINED.to_string()
    } else {
        cleaned
    }
}

struct Shared {
    config: Arc<PipelineConfig>,
    store: ContentStore,
    engine: Arc<dyn Engine>,
    commands: CommandBuilder,
    registry: Mutex<JobRegistry>,
    /// Uploads of tracked jobs, kept for `retry`
    records: Mutex<HashMap<String, UploadRecord>>,
    admission: Arc<Semaphore>,
    events: broadcast::Sender<PipelineEvent>,
    health: Mutex<EngineHealth>,
}

impl Shared {
    fn emit(&self, event: PipelineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn mark_unavailable(&self, reason: String) {
        let mut health = lock(&self.health);
        if health.status.is_available() || matches!(health.status, EngineStatus::Unknown) {
            warn!("⚠️ Transcoding engine unavailable: {}", reason);
        }
        health.status = EngineStatus::Unavailable { reason, since: Utc::now() };
        health.checked_at = Some(Instant::now());
    }

    /// Pass an error through, flipping engine health when the engine itself is gone
    fn note(&self, err: PipelineError) -> PipelineError {
        if let PipelineError::EngineUnavailable(reason) = &err {
            self.mark_unavailable(reason.clone());
        }
        err
    }

    async fn check_engine(&self) -> EngineStatus {
        match self.engine.check().await {
            Ok(version) => {
                let mut health = lock(&self.health);
                health.status = EngineStatus::Available { version };
                health.checked_at = Some(Instant::now());
                health.status.clone()
            }
            Err(e) => {
                self.mark_unavailable(e.to_string());
                lock(&self.health).status.clone()
            }
        }
    }

    /// Fail fast while a recent check said the engine is gone
    async fn ensure_engine(&self) -> Result<()> {
        let recheck = Duration::from_secs(self.config.engine_recheck_secs);
        let cached = {
            let health = lock(&self.health);
            match (&health.status, health.checked_at) {
                (EngineStatus::Available { .. }, _) => return Ok(()),
                (EngineStatus::Unavailable { reason, .. }, Some(at)) if at.elapsed() < recheck => {
                    Some(reason.clone())
                }
                _ => None,
            }
        };
        if let Some(reason) = cached {
            return Err(PipelineError::EngineUnavailable(reason));
        }

        match self.check_engine().await {
            EngineStatus::Unavailable { reason, .. } => Err(PipelineError::EngineUnavailable(reason)),
            _ => Ok(()),
        }
    }
}

/// Owns job lifecycles: stage sequencing, admission, progress events and retirement.
///
/// Cheap to clone; clones drive the same registry.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(config: Arc<PipelineConfig>, store: ContentStore, engine: Arc<dyn Engine>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let permits = config.max_concurrent_encodes.max(1);
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                engine,
                commands: CommandBuilder::new(),
                registry: Mutex::new(JobRegistry::new()),
                records: Mutex::new(HashMap::new()),
                admission: Arc::new(Semaphore::new(permits)),
                events,
                health: Mutex::new(EngineHealth {
                    status: EngineStatus::Unknown,
                    checked_at: None,
                }),
            }),
        }
    }

    pub fn store(&self) -> &ContentStore {
        &self.shared.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.events.subscribe()
    }

    /// Snapshot of every tracked job for polling
    pub fn get_status(&self) -> Vec<JobSnapshot> {
        lock(&self.shared.registry).snapshot()
    }

    pub fn job(&self, file_id: &str) -> Option<Job> {
        lock(&self.shared.registry).get(file_id).cloned()
    }

    pub fn engine_status(&self) -> EngineStatus {
        lock(&self.shared.health).status.clone()
    }

    /// Probe the engine now, regardless of the cached verdict
    pub async fn check_engine(&self) -> EngineStatus {
        self.shared.check_engine().await
    }

    /// Start a job for a staged upload. Returns once the job is tracked; the handle
    /// resolves when it reaches a terminal state.
    pub fn submit(&self, record: UploadRecord) -> Result<JoinHandle<Result<AssetSummary>>> {
        let job = Job::new(record.file_id.clone(), record.original_name.clone());
        let job_id = job.job_id;
        let queued = PipelineEvent::progress(&job, None);

        lock(&self.shared.registry).insert(job).map_err(|_| {
            PipelineError::validation(format!("a job for {} is already running", record.file_id))
        })?;
        lock(&self.shared.records).insert(record.file_id.clone(), record.clone());
        self.shared.store.pin(&record.file_id);
        self.shared.emit(queued);
        info!("Job {}: queued ({})", record.file_id, record.original_name);

        let run = JobRun {
            shared: self.shared.clone(),
            file_id: record.file_id.clone(),
            job_id,
        };
        Ok(tokio::spawn(run.drive(record)))
    }

    /// Restart a failed job from PREPARING with the upload still held in processing
    pub fn retry(&self, file_id: &str) -> Result<JoinHandle<Result<AssetSummary>>> {
        let status = lock(&self.shared.registry).get(file_id).map(|j| j.status);
        if let Some(status) = status {
            if status != JobStatus::Failed {
                return Err(PipelineError::validation(format!(
                    "job for {} is {:?}; only failed jobs can be retried",
                    file_id, status
                )));
            }
        }

        let known = lock(&self.shared.records).get(file_id).cloned();
        let record = match known {
            Some(record) => record,
            None => self
                .shared
                .store
                .processing_records()?
                .into_iter()
                .find(|r| r.file_id == file_id)
                .ok_or_else(|| PipelineError::validation(format!("no upload held for {}", file_id)))?,
        };
        info!("Job {}: 🔁 retrying from the start", file_id);
        self.submit(record)
    }
}

/// Handle a running job uses to drive its own record
struct JobRun {
    shared: Arc<Shared>,
    file_id: String,
    job_id: Uuid,
}

impl JobRun {
    async fn drive(self, record: UploadRecord) -> Result<AssetSummary> {
        let outcome = self.execute(record).await;
        match &outcome {
            Ok(summary) => self.complete(summary.clone()),
            Err(e) => self.fail(e),
        }
        self.shared.store.unpin(&self.file_id);
        self.schedule_retirement(outcome.is_ok());
        outcome
    }

    async fn execute(&self, record: UploadRecord) -> Result<AssetSummary> {
        self.advance(JobStatus::Preparing)?;
        self.shared.ensure_engine().await?;
        let record = self.prepare(record).await?;
        self.report(100.0, None);

        self.advance(JobStatus::ExtractingMetadata)?;
        let (media, tier) = self.extract_metadata(&record).await?;
        self.report(100.0, None);

        // held through every stage that runs the encoder
        let permit = self.admit().await?;

        self.advance(JobStatus::ConvertingMaster)?;
        let master = self.convert_master(&record, &media, tier).await?;

        self.advance(JobStatus::GeneratingRenditions)?;
        let renditions = self.generate_renditions(&master, &media).await?;

        self.advance(JobStatus::GeneratingThumbnails)?;
        let thumbnails = self.generate_thumbnails(&master, &media).await?;

        self.advance(JobStatus::ExtractingSubtitles)?;
        let subtitles = self.extract_subtitles(&master, &media).await?;
        drop(permit);

        let summary = AssetSummary {
            master: Some(master),
            renditions,
            thumbnails,
            subtitles,
        };

        self.advance(JobStatus::Finalizing)?;
        self.finalize(&record, &media, tier, &summary).await?;
        self.report(100.0, None);
        Ok(summary)
    }

    fn advance(&self, to: JobStatus) -> Result<()> {
        let event = lock(&self.shared.registry).update(&self.file_id, self.job_id, |job| {
            job.advance(to).map(|_| PipelineEvent::progress(job, None))
        });
        match event {
            Some(Ok(event)) => {
                debug!("Job {}: -> {:?}", self.file_id, to);
                self.shared.emit(event);
                Ok(())
            }
            Some(Err(e)) => Err(PipelineError::processing(e.to_string(), None, None)),
            None => Err(PipelineError::processing(
                format!("job {} is no longer tracked", self.file_id),
                None,
                None,
            )),
        }
    }

    fn report(&self, percent: f64, detail: Option<&str>) {
        let event = lock(&self.shared.registry)
            .update(&self.file_id, self.job_id, |job| {
                job.report(percent, detail)
                    .then(|| PipelineEvent::progress(job, detail.map(str::to_string)))
            })
            .flatten();
        if let Some(event) = event {
            self.shared.emit(event);
        }
    }

    fn complete(&self, summary: AssetSummary) {
        let counts = summary.counts();
        let done = lock(&self.shared.registry).update(&self.file_id, self.job_id, |job| job.complete(summary));
        if let Some(Ok(())) = done {
            info!(
                "Job {}: ✅ completed ({} renditions, {} thumbnails, {} subtitles)",
                self.file_id, counts.renditions, counts.thumbnails, counts.subtitles
            );
            lock(&self.shared.records).remove(&self.file_id);
            self.shared.emit(PipelineEvent::Completed {
                file_id: self.file_id.clone(),
                assets: counts,
                timestamp: Utc::now(),
            });
        }
    }

    fn fail(&self, err: &PipelineError) {
        let step = lock(&self.shared.registry)
            .update(&self.file_id, self.job_id, |job| {
                job.fail(err.kind(), err.to_string()).ok()?;
                job.error.as_ref().map(|f| f.failed_step.clone())
            })
            .flatten();

        if let Some(step) = step {
            error!("Job {}: ❌ failed during {}: {}", self.file_id, step, err);
            if let PipelineError::EngineProcessing { stderr: Some(stderr), .. } = err {
                debug!("Job {}: engine stderr:\n{}", self.file_id, stderr);
            }
            self.shared.emit(PipelineEvent::Failed {
                file_id: self.file_id.clone(),
                kind: err.kind(),
                step,
                error: err.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    fn schedule_retirement(&self, succeeded: bool) {
        let grace = Duration::from_secs(if succeeded {
            self.shared.config.success_retention_secs
        } else {
            self.shared.config.failure_retention_secs
        });
        let shared = self.shared.clone();
        let file_id = self.file_id.clone();
        let job_id = self.job_id;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if lock(&shared.registry).evict(&file_id, job_id) {
                lock(&shared.records).remove(&file_id);
                debug!("Job {}: retired from tracking", file_id);
            }
        });
    }

    /// Make sure the upload sits in the processing area
    async fn prepare(&self, record: UploadRecord) -> Result<UploadRecord> {
        let processing = self.shared.store.area_path(Area::Processing);
        if record.path.parent() == Some(processing.as_path()) {
            if !record.path.exists() {
                return Err(PipelineError::io(
                    &record.path,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "upload is gone"),
                ));
            }
            return Ok(record);
        }

        let store = self.shared.store.clone();
        let promoted = store::blocking(move || store.promote(&record, Area::Processing)).await?;
        lock(&self.shared.records).insert(promoted.file_id.clone(), promoted.clone());
        Ok(promoted)
    }

    async fn extract_metadata(&self, record: &UploadRecord) -> Result<(MediaMetadata, QualityTier)> {
        let timeout = Duration::from_secs(self.shared.config.probe_timeout_secs);
        let media = probe_media(self.shared.engine.as_ref(), &record.path, timeout)
            .await
            .map_err(|e| self.shared.note(e))?;
        let tier = select_tier(media.video.width, media.video.height);
        info!(
            "Job {}: 📊 {}x{} {} ({:.1}s, {} audio, {} subtitle) -> {}",
            self.file_id,
            media.video.width,
            media.video.height,
            media.video.codec,
            media.duration(),
            media.audio.len(),
            media.subtitles.len(),
            tier
        );

        let existing = self.shared.store.load_metadata(&self.file_id).ok().flatten();
        let doc = MetadataDocument {
            file_id: self.file_id.clone(),
            original_name: record.original_name.clone(),
            content_hash: existing.and_then(|d| d.content_hash).or_else(|| record.content_hash.clone()),
            extracted_at: Utc::now(),
            quality_tier: Some(tier),
            media: Some(media.clone()),
            assets: None,
        };
        self.shared.store.persist_metadata(&doc)?;
        Ok((media, tier))
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        if self.shared.admission.available_permits() == 0 {
            self.report(100.0, Some("waiting for an encoder slot"));
        }
        self.shared
            .admission
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::processing("admission control shut down", None, None))
    }

    /// Run one engine invocation, mapping its progress into slot `slot` of `slots`
    /// equal parts of the current stage band
    async fn run_engine(&self, request: EncodeRequest, slot: usize, slots: usize) -> Result<()> {
        let detail = request.label.clone();
        let task = self.shared.engine.spawn(request).map_err(|e| self.shared.note(e))?;
        let slots = slots.max(1) as f64;
        task.wait(|percent| {
            let overall = (slot as f64 * 100.0 + percent.clamp(0.0, 100.0)) / slots;
            self.report(overall, Some(&detail));
        })
        .await
        .map_err(|e| self.shared.note(e))
    }

    async fn convert_master(&self, record: &UploadRecord, media: &MediaMetadata, tier: QualityTier) -> Result<MasterAsset> {
        let store = &self.shared.store;
        let target = store.master_path(&self.file_id, tier);
        let write = store.begin_write(&self.file_id, &target, &record.path, "master")?;

        let args = self.shared.commands.build_master_command(&record.path, write.temp_path(), media, tier);
        self.run_engine(
            EncodeRequest {
                label: "master".to_string(),
                args,
                output: write.temp_path().to_path_buf(),
                duration: media.duration(),
            },
            0,
            1,
        )
        .await?;

        let path = store.commit_write(&self.file_id, write)?;
        info!("Job {}: 🎞️ master ready at {}", self.file_id, path.display());
        Ok(MasterAsset {
            file_id: self.file_id.clone(),
            path,
            quality_tier: tier,
            format: "mkv".to_string(),
        })
    }

    fn rendition_plan(&self, media: &MediaMetadata) -> Vec<RenditionKind> {
        let config = &self.shared.config;
        let mut plan = vec![RenditionKind::Web];

        if config.language_renditions && media.audio.len() > 1 {
            let mut seen = HashSet::new();
            for (pos, track) in media.audio.iter().enumerate() {
                let mut language = normalize_language(Some(&track.language), pos);
                if !seen.insert(language.clone()) {
                    language = format!("{}_{}", language, pos);
                    seen.insert(language.clone());
                }
                plan.push(RenditionKind::Language { audio_pos: pos, language });
            }
        }

        for name in &config.optional_renditions {
            match RenditionFormat::parse(name) {
                Some(RenditionFormat::Webm) => plan.push(RenditionKind::Webm),
                Some(RenditionFormat::Mobile) => plan.push(RenditionKind::Mobile),
                Some(RenditionFormat::Mp4) => {}
                None => warn!("Job {}: unknown rendition format {:?} ignored", self.file_id, name),
            }
        }
        plan
    }

    async fn produce_rendition(
        &self,
        master: &MasterAsset,
        media: &MediaMetadata,
        kind: &RenditionKind,
        slot: usize,
        slots: usize,
    ) -> Result<RenditionAsset> {
        let store = &self.shared.store;
        let commands = &self.shared.commands;
        let tier = master.quality_tier;

        let (format, out_tier, label, language) = match kind {
            RenditionKind::Web => (RenditionFormat::Mp4, tier, tier.as_str().to_string(), None),
            RenditionKind::Language { language, .. } => {
                (RenditionFormat::Mp4, tier, language.clone(), Some(language.clone()))
            }
            RenditionKind::Webm => {
                let capped = tier.cap(QualityTier::Hd720);
                (RenditionFormat::Webm, capped, capped.as_str().to_string(), None)
            }
            RenditionKind::Mobile => (RenditionFormat::Mobile, tier.cap(QualityTier::Sd480), "mobile".to_string(), None),
        };

        let target = store.rendition_path(&self.file_id, format, &label);
        let write = store.begin_write(&self.file_id, &target, &master.path, "renditions")?;
        let temp = write.temp_path().to_path_buf();

        let args = match kind {
            RenditionKind::Web => commands.build_web_mp4_command(&master.path, &temp, tier),
            RenditionKind::Language { audio_pos, language } => {
                commands.build_language_mp4_command(&master.path, &temp, tier, *audio_pos, language)
            }
            RenditionKind::Webm => commands.build_webm_command(&master.path, &temp, tier),
            RenditionKind::Mobile => {
                let primary = select_primary_audio(&media.audio, &self.shared.config.language_priority)
                    .and_then(|chosen| media.audio.iter().position(|t| t.index == chosen.index));
                commands.build_mobile_command(&master.path, &temp, primary)
            }
        };

        self.run_engine(
            EncodeRequest {
                label: format!("{}:{}", format, label),
                args,
                output: temp,
                duration: media.duration(),
            },
            slot,
            slots,
        )
        .await?;
        let path = store.commit_write(&self.file_id, write)?;

        let public_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}_{}.{}", self.file_id, label, format.extension()));
        let public_url = match store.publish(&path, &public_name) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("Job {}: ⚠️ could not publish {}: {}", self.file_id, public_name, e);
                None
            }
        };

        Ok(RenditionAsset {
            file_id: self.file_id.clone(),
            format,
            quality_tier: out_tier,
            language,
            path,
            public_url,
        })
    }

    /// Fan out delivery renditions. Only the primary web MP4 is mandatory.
    async fn generate_renditions(&self, master: &MasterAsset, media: &MediaMetadata) -> Result<Vec<RenditionAsset>> {
        let plan = self.rendition_plan(media);
        let mut assets = Vec::with_capacity(plan.len());

        for (slot, kind) in plan.iter().enumerate() {
            match self.produce_rendition(master, media, kind, slot, plan.len()).await {
                Ok(asset) => assets.push(asset),
                Err(e) if matches!(kind, RenditionKind::Web) || e.is_engine_unavailable() => return Err(e),
                Err(e) => warn!("Job {}: ⚠️ optional rendition {:?} skipped: {}", self.file_id, kind, e),
            }
        }
        Ok(assets)
    }

    async fn produce_thumbnail(
        &self,
        master: &MasterAsset,
        media: &MediaMetadata,
        size: ThumbnailSize,
        slot: usize,
    ) -> Result<ThumbnailAsset> {
        let store = &self.shared.store;
        let target = store.thumbnail_path(&self.file_id, size);
        let write = store.begin_write(&self.file_id, &target, &master.path, "thumbnails")?;
        let args = self.shared.commands.build_thumbnail_command(
            &master.path,
            write.temp_path(),
            size.offset(media.duration()),
            size.width(),
        );

        self.run_engine(
            EncodeRequest {
                label: format!("thumbnail:{}", size.dir_name()),
                args,
                output: write.temp_path().to_path_buf(),
                duration: 0.0,
            },
            slot,
            ThumbnailSize::ALL.len(),
        )
        .await?;
        let path = store.commit_write(&self.file_id, write)?;
        Ok(ThumbnailAsset { size, path })
    }

    async fn generate_thumbnails(&self, master: &MasterAsset, media: &MediaMetadata) -> Result<Vec<ThumbnailAsset>> {
        let mut thumbnails = Vec::new();
        for (slot, size) in ThumbnailSize::ALL.into_iter().enumerate() {
            match self.produce_thumbnail(master, media, size, slot).await {
                Ok(asset) => thumbnails.push(asset),
                Err(e) if e.is_engine_unavailable() => return Err(e),
                Err(e) => warn!("Job {}: ⚠️ {} thumbnail skipped: {}", self.file_id, size.dir_name(), e),
            }
        }
        Ok(thumbnails)
    }

    async fn extract_subtitles(&self, master: &MasterAsset, media: &MediaMetadata) -> Result<Vec<SubtitleAsset>> {
        let store = &self.shared.store;
        let tracks: Vec<_> = media.text_subtitles().collect();
        let mut per_language: HashMap<String, usize> = HashMap::new();
        let mut subtitles = Vec::new();

        for (pos, track) in tracks.iter().enumerate() {
            let language = subtitle_language(&track.language);
            let ordinal = per_language.entry(language.clone()).or_insert(0);
            let target = store.subtitle_path(&self.file_id, &language, *ordinal);
            *ordinal += 1;

            let produced = async {
                let write = store.begin_write(&self.file_id, &target, &master.path, "subtitles")?;
                let args = self.shared.commands.build_subtitle_command(&master.path, write.temp_path(), pos);
                self.run_engine(
                    EncodeRequest {
                        label: format!("subtitle:{}", language),
                        args,
                        output: write.temp_path().to_path_buf(),
                        duration: media.duration(),
                    },
                    pos,
                    tracks.len(),
                )
                .await?;
                store.commit_write(&self.file_id, write)
            }
            .await;

            match produced {
                Ok(path) => subtitles.push(SubtitleAsset {
                    language,
                    format: "vtt".to_string(),
                    stream_index: track.index,
                    path,
                }),
                Err(e) if e.is_engine_unavailable() => return Err(e),
                Err(e) => warn!("Job {}: ⚠️ subtitle stream {} skipped: {}", self.file_id, track.index, e),
            }
        }
        Ok(subtitles)
    }

    /// Persist the final metadata document and release the processing copy
    async fn finalize(
        &self,
        record: &UploadRecord,
        media: &MediaMetadata,
        tier: QualityTier,
        summary: &AssetSummary,
    ) -> Result<()> {
        let store = &self.shared.store;
        let existing = store.load_metadata(&self.file_id).ok().flatten();
        let doc = MetadataDocument {
            file_id: self.file_id.clone(),
            original_name: record.original_name.clone(),
            content_hash: existing.and_then(|d| d.content_hash).or_else(|| record.content_hash.clone()),
            extracted_at: Utc::now(),
            quality_tier: Some(tier),
            media: Some(media.clone()),
            assets: Some(summary.clone()),
        };
        store.persist_metadata(&doc)?;

        if !self.shared.config.retain_source {
            if let Err(e) = tokio::fs::remove_file(&record.path).await {
                warn!("Job {}: could not remove processed source {}: {}", self.file_id, record.path.display(), e);
            }
        }
        Ok(())
    }
}
