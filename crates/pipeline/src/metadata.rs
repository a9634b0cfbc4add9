use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::assets::AssetSummary;
use crate::engine::Engine;
use crate::error::{PipelineError, Result};
use crate::ffprobe::{parse_duration, parse_frame_rate, FFProbeChapter, FFProbeData, FFProbeStream};
use crate::quality::QualityTier;

/// Placeholder for missing language and title tags
pub const UNDETERMINED: &str = "undetermined";

/// Primary video stream description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub index: i32,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub bitrate: Option<u64>,
    pub duration: f64,
    pub pixel_format: String,
    pub ten_bit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioTrack {
    pub index: i32,
    pub codec: String,
    pub language: String,
    pub title: String,
    pub channels: u32,
    pub bitrate: Option<u64>,
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtitleTrack {
    pub index: i32,
    pub codec: String,
    pub language: String,
    pub title: String,
    pub forced: bool,
    pub default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: i64,
    pub start: f64,
    pub end: f64,
    pub title: String,
}

/// One probed stream, classified once at the prober boundary
#[derive(Debug, Clone, PartialEq)]
pub enum StreamInfo {
    Video(VideoInfo),
    Audio(AudioTrack),
    Subtitle(SubtitleTrack),
}

/// Subtitle codecs that can be converted to WebVTT text
const TEXT_SUBTITLE_CODECS: &[&str] = &["subrip", "srt", "ass", "ssa", "webvtt", "mov_text", "text"];

impl SubtitleTrack {
    pub fn is_textual(&self) -> bool {
        TEXT_SUBTITLE_CODECS.contains(&self.codec.to_lowercase().as_str())
    }
}

fn parse_u64(value: Option<&String>) -> Option<u64> {
    value.and_then(|v| v.trim().parse::<u64>().ok())
}

fn tag_or_undetermined(stream: &FFProbeStream, key: &str) -> String {
    stream.tag(key).map(|s| s.to_string()).unwrap_or_else(|| UNDETERMINED.to_string())
}

impl StreamInfo {
    /// Classify a raw stream; data and attachment streams yield `None`.
    /// `container_duration` is used when the stream carries no duration of its own.
    pub fn from_probe(stream: &FFProbeStream, container_duration: f64) -> Option<StreamInfo> {
        let codec = stream.codec_name.clone().unwrap_or_else(|| "unknown".to_string());
        match stream.codec_type.as_deref() {
            Some("video") => {
                let frame_rate = stream.avg_frame_rate.as_deref()
                    .and_then(parse_frame_rate)
                    .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
                    .unwrap_or(0.0);
                let duration = stream.duration.as_deref()
                    .and_then(parse_duration)
                    .or_else(|| stream.tag("DURATION").and_then(parse_duration))
                    .filter(|d| *d > 0.0)
                    .unwrap_or(container_duration);
                Some(StreamInfo::Video(VideoInfo {
                    index: stream.index,
                    codec,
                    width: stream.width.unwrap_or(0).max(0) as u32,
                    height: stream.height.unwrap_or(0).max(0) as u32,
                    frame_rate,
                    bitrate: parse_u64(stream.bit_rate.as_ref()),
                    duration,
                    pixel_format: stream.pix_fmt.clone().unwrap_or_else(|| "yuv420p".to_string()),
                    ten_bit: stream.detect_bit_depth() == crate::ffprobe::BitDepth::Bit10,
                }))
            }
            Some("audio") => Some(StreamInfo::Audio(AudioTrack {
                index: stream.index,
                codec,
                language: tag_or_undetermined(stream, "language"),
                title: tag_or_undetermined(stream, "title"),
                channels: stream.channels.unwrap_or(2),
                bitrate: parse_u64(stream.bit_rate.as_ref()),
                sample_rate: stream.sample_rate.as_deref().and_then(|s| s.parse().ok()),
            })),
            Some("subtitle") => Some(StreamInfo::Subtitle(SubtitleTrack {
                index: stream.index,
                codec,
                language: tag_or_undetermined(stream, "language"),
                title: tag_or_undetermined(stream, "title"),
                forced: stream.disposition_flag("forced"),
                default: stream.disposition_flag("default"),
            })),
            _ => None,
        }
    }
}

/// Normalized stream inventory of one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub video: VideoInfo,
    pub audio: Vec<AudioTrack>,
    pub subtitles: Vec<SubtitleTrack>,
    pub chapters: Vec<Chapter>,
    pub global_tags: BTreeMap<String, String>,
    pub format_name: String,
}

impl MediaMetadata {
    /// Build strongly-typed metadata from raw probe output.
    /// The first video stream is the primary one; a source without video is a job-scoped failure.
    pub fn from_probe(data: &FFProbeData) -> Result<MediaMetadata> {
        let container_duration = data.format.duration.as_deref()
            .and_then(parse_duration)
            .unwrap_or(0.0);

        let mut video = None;
        let mut audio = Vec::new();
        let mut subtitles = Vec::new();

        for stream in &data.streams {
            match StreamInfo::from_probe(stream, container_duration) {
                Some(StreamInfo::Video(v)) => {
                    // cover art shows up as a single-frame mjpeg/png "video"
                    let attached_pic = stream.disposition_flag("attached_pic");
                    if video.is_none() && !attached_pic {
                        video = Some(v);
                    }
                }
                Some(StreamInfo::Audio(a)) => audio.push(a),
                Some(StreamInfo::Subtitle(s)) => subtitles.push(s),
                None => {}
            }
        }

        let video = video.ok_or_else(|| {
            PipelineError::processing("source contains no video stream", None, None)
        })?;

        Ok(MediaMetadata {
            video,
            audio,
            subtitles,
            chapters: data.chapters.iter().map(Chapter::from_probe).collect(),
            global_tags: data.format.tags.clone().unwrap_or_default().into_iter().collect(),
            format_name: data.format.format_name.clone(),
        })
    }

    pub fn duration(&self) -> f64 {
        self.video.duration
    }

    pub fn text_subtitles(&self) -> impl Iterator<Item = &SubtitleTrack> {
        self.subtitles.iter().filter(|s| s.is_textual())
    }
}

/// Metadata Prober: inspect `path` through the engine, bounded by `timeout`.
///
/// An absent engine surfaces as `EngineUnavailable`; an unreadable file as a
/// job-scoped processing error.
pub async fn probe_media(engine: &dyn Engine, path: &Path, timeout: Duration) -> Result<MediaMetadata> {
    let data = match tokio::time::timeout(timeout, engine.probe(path)).await {
        Ok(result) => result?,
        Err(_) => return Err(PipelineError::Timeout(timeout.as_secs())),
    };
    MediaMetadata::from_probe(&data)
}

impl Chapter {
    fn from_probe(chapter: &FFProbeChapter) -> Chapter {
        Chapter {
            id: chapter.id,
            start: chapter.start_time.as_deref().and_then(parse_duration).unwrap_or(0.0),
            end: chapter.end_time.as_deref().and_then(parse_duration).unwrap_or(0.0),
            title: chapter.tags.as_ref()
                .and_then(|t| t.get("title"))
                .cloned()
                .unwrap_or_else(|| UNDETERMINED.to_string()),
        }
    }
}

/// Document persisted as `metadata/<fileId>_metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataDocument {
    pub file_id: String,
    pub original_name: String,
    pub content_hash: Option<String>,
    pub extracted_at: DateTime<Utc>,
    pub quality_tier: Option<QualityTier>,
    pub media: Option<MediaMetadata>,
    pub assets: Option<AssetSummary>,
}
