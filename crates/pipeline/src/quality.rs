use std::fmt;
use serde::{Deserialize, Serialize};
use crate::metadata::AudioTrack;

/// Resolution bucket used to pick encode parameters and the master archive partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QualityTier {
    #[serde(rename = "480p")]
    Sd480,
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "1080p")]
    Fhd1080,
    #[serde(rename = "4k")]
    Uhd4k,
}

/// Encode parameters attached to a tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierParams {
    /// CRF used for the Matroska master
    pub master_crf: u8,
    /// CRF used for delivery renditions
    pub rendition_crf: u8,
    /// Output height; width follows the source aspect ratio
    pub target_height: u32,
    /// Video bitrate cap for delivery renditions
    pub video_bitrate: &'static str,
}

impl QualityTier {
    /// All tiers, highest first
    pub const DESCENDING: [QualityTier; 4] = [
        QualityTier::Uhd4k,
        QualityTier::Fhd1080,
        QualityTier::Hd720,
        QualityTier::Sd480,
    ];

    /// Minimum (width, height) a source must meet on both axes
    pub fn threshold(&self) -> (u32, u32) {
        match self {
            QualityTier::Uhd4k => (3200, 1600),
            QualityTier::Fhd1080 => (1600, 800),
            QualityTier::Hd720 => (960, 540),
            QualityTier::Sd480 => (0, 0),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Uhd4k => "4k",
            QualityTier::Fhd1080 => "1080p",
            QualityTier::Hd720 => "720p",
            QualityTier::Sd480 => "480p",
        }
    }

    pub fn parse(value: &str) -> Option<QualityTier> {
        QualityTier::DESCENDING
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(value.trim()))
    }

    pub fn params(&self) -> TierParams {
        match self {
            QualityTier::Uhd4k => TierParams {
                master_crf: 18,
                rendition_crf: 22,
                target_height: 2160,
                video_bitrate: "8000k",
            },
            QualityTier::Fhd1080 => TierParams {
                master_crf: 18,
                rendition_crf: 20,
                target_height: 1080,
                video_bitrate: "2000k",
            },
            QualityTier::Hd720 => TierParams {
                master_crf: 19,
                rendition_crf: 21,
                target_height: 720,
                video_bitrate: "1200k",
            },
            QualityTier::Sd480 => TierParams {
                master_crf: 20,
                rendition_crf: 23,
                target_height: 480,
                video_bitrate: "800k",
            },
        }
    }

    /// The lower of two tiers; used to cap WebM and mobile renditions
    pub fn cap(self, ceiling: QualityTier) -> QualityTier {
        self.min(ceiling)
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the highest tier whose threshold both dimensions satisfy
pub fn select_tier(width: u32, height: u32) -> QualityTier {
    QualityTier::DESCENDING
        .into_iter()
        .find(|tier| {
            let (min_w, min_h) = tier.threshold();
            width >= min_w && height >= min_h
        })
        .unwrap_or(QualityTier::Sd480)
}

/// Choose the track a single-track rendition keeps.
///
/// Priority entries are tried in order; the first track whose language tag contains the
/// entry (case-insensitive) wins. Without a match the first track in stream order is used.
pub fn select_primary_audio<'a>(tracks: &'a [AudioTrack], priority: &[String]) -> Option<&'a AudioTrack> {
    for wanted in priority {
        let wanted = wanted.to_lowercase();
        if wanted.is_empty() {
            continue;
        }
        if let Some(track) = tracks
            .iter()
            .find(|t| t.language.to_lowercase().contains(&wanted))
        {
            return Some(track);
        }
    }
    tracks.first()
}

/// Canonical language code used in per-language rendition names.
/// `position` is the track's order among audio tracks, used when the tag is missing.
pub fn normalize_language(language: Option<&str>, position: usize) -> String {
    let raw = match language.map(str::trim).filter(|l| !l.is_empty()) {
        Some(l) if l != crate::metadata::UNDETERMINED => l,
        _ => return format!("track{}", position),
    };

    match raw.to_lowercase().as_str() {
        "en" | "eng" | "english" => "eng".to_string(),
        "pt" | "por" | "pt-br" | "portuguese" => "por".to_string(),
        "es" | "spa" | "spanish" => "spa".to_string(),
        "fr" | "fre" | "fra" | "french" => "fre".to_string(),
        _ => raw.to_string(),
    }
}
