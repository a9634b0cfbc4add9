use std::fmt;
use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use crate::quality::QualityTier;

/// Delivery formats, each with its own rendition archive partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenditionFormat {
    Mp4,
    Webm,
    Mobile,
}

impl RenditionFormat {
    pub fn dir_name(&self) -> &'static str {
        match self {
            RenditionFormat::Mp4 => "mp4",
            RenditionFormat::Webm => "webm",
            RenditionFormat::Mobile => "mobile",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            RenditionFormat::Webm => "webm",
            RenditionFormat::Mp4 | RenditionFormat::Mobile => "mp4",
        }
    }

    pub fn parse(value: &str) -> Option<RenditionFormat> {
        match value.trim().to_lowercase().as_str() {
            "mp4" => Some(RenditionFormat::Mp4),
            "webm" => Some(RenditionFormat::Webm),
            "mobile" => Some(RenditionFormat::Mobile),
            _ => None,
        }
    }
}

impl fmt::Display for RenditionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailSize {
    Small,
    Medium,
    Large,
    Poster,
}

impl ThumbnailSize {
    pub const ALL: [ThumbnailSize; 4] = [
        ThumbnailSize::Small,
        ThumbnailSize::Medium,
        ThumbnailSize::Large,
        ThumbnailSize::Poster,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            ThumbnailSize::Small => "small",
            ThumbnailSize::Medium => "medium",
            ThumbnailSize::Large => "large",
            ThumbnailSize::Poster => "poster",
        }
    }

    /// Output width in pixels
    pub fn width(&self) -> u32 {
        match self {
            ThumbnailSize::Small => 320,
            ThumbnailSize::Medium => 640,
            ThumbnailSize::Large => 1280,
            ThumbnailSize::Poster => 1920,
        }
    }

    /// Grab offset in seconds; 0 when the duration is unknown
    pub fn offset(&self, duration: f64) -> f64 {
        if !(duration.is_finite() && duration > 0.0) {
            return 0.0;
        }
        let fraction = match self {
            ThumbnailSize::Poster => 0.25,
            _ => 0.10,
        };
        duration * fraction
    }
}

/// Canonical high-fidelity encode; the only input renditions are derived from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterAsset {
    pub file_id: String,
    pub path: PathBuf,
    pub quality_tier: QualityTier,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenditionAsset {
    pub file_id: String,
    pub format: RenditionFormat,
    pub quality_tier: QualityTier,
    /// Normalized language for single-track renditions
    pub language: Option<String>,
    pub path: PathBuf,
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailAsset {
    pub size: ThumbnailSize,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtitleAsset {
    pub language: String,
    pub format: String,
    pub stream_index: i32,
    pub path: PathBuf,
}

/// Everything a completed job produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSummary {
    pub master: Option<MasterAsset>,
    pub renditions: Vec<RenditionAsset>,
    pub thumbnails: Vec<ThumbnailAsset>,
    pub subtitles: Vec<SubtitleAsset>,
}

/// Asset counts carried by the completion event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetCounts {
    pub masters: usize,
    pub renditions: usize,
    pub thumbnails: usize,
    pub subtitles: usize,
}

impl AssetSummary {
    pub fn counts(&self) -> AssetCounts {
        AssetCounts {
            masters: usize::from(self.master.is_some()),
            renditions: self.renditions.len(),
            thumbnails: self.thumbnails.len(),
            subtitles: self.subtitles.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_offsets() {
        assert_eq!(ThumbnailSize::Small.offset(100.0), 10.0);
        assert_eq!(ThumbnailSize::Poster.offset(100.0), 25.0);
        assert_eq!(ThumbnailSize::Large.offset(0.0), 0.0);
        assert_eq!(ThumbnailSize::Medium.offset(f64::NAN), 0.0);
    }

    #[test]
    fn test_format_names() {
        assert_eq!(RenditionFormat::Mobile.extension(), "mp4");
        assert_eq!(RenditionFormat::parse("WebM"), Some(RenditionFormat::Webm));
        assert_eq!(RenditionFormat::parse("hls"), None);
        assert_eq!(serde_json::to_string(&RenditionFormat::Mobile).unwrap(), "\"mobile\"");
    }

    #[test]
    fn test_counts() {
        let summary = AssetSummary {
            master: Some(MasterAsset {
                file_id: "f".into(),
                path: PathBuf::from("/m/f_master.mkv"),
                quality_tier: QualityTier::Hd720,
                format: "mkv".into(),
            }),
            thumbnails: vec![ThumbnailAsset { size: ThumbnailSize::Small, path: PathBuf::from("/t") }],
            ..Default::default()
        };
        let counts = summary.counts();
        assert_eq!(counts.masters, 1);
        assert_eq!(counts.thumbnails, 1);
        assert_eq!(counts.renditions, 0);
    }
}
