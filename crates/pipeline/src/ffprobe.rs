use std::collections::HashMap;
use std::path::Path;
use serde::Deserialize;
use crate::error::{PipelineError, Result};

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: FFProbeFormat,
    #[serde(default)]
    pub chapters: Vec<FFProbeChapter>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FFProbeFormat {
    #[serde(rename = "format_name", default)]
    pub format_name: String,
    pub duration: Option<String>,
    #[serde(rename = "bit_rate")]
    pub bit_rate: Option<String>,
    pub size: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    #[serde(rename = "codec_type")]
    pub codec_type: Option<String>,
    #[serde(rename = "codec_name")]
    pub codec_name: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    #[serde(rename = "avg_frame_rate")]
    pub avg_frame_rate: Option<String>,
    #[serde(rename = "r_frame_rate")]
    pub r_frame_rate: Option<String>,
    pub duration: Option<String>,
    pub tags: Option<HashMap<String, String>>,
    #[serde(rename = "bit_rate")]
    pub bit_rate: Option<String>,
    pub disposition: Option<HashMap<String, i32>>,
    #[serde(rename = "pix_fmt")]
    pub pix_fmt: Option<String>,
    #[serde(rename = "bits_per_raw_sample")]
    pub bits_per_raw_sample: Option<String>,
    #[serde(rename = "color_transfer")]
    pub color_transfer: Option<String>,
    pub channels: Option<u32>,
    #[serde(rename = "sample_rate")]
    pub sample_rate: Option<String>,
}

/// Chapter entry from `-show_chapters`
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeChapter {
    pub id: i64,
    #[serde(rename = "start_time")]
    pub start_time: Option<String>,
    #[serde(rename = "end_time")]
    pub end_time: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

/// Parse the JSON printed by `ffprobe -print_format json`
pub fn parse_probe_output(json_str: &str, file_path: &Path) -> Result<FFProbeData> {
    serde_json::from_str(json_str).map_err(|e| {
        PipelineError::processing(
            format!("failed to parse ffprobe JSON for {}: {}", file_path.display(), e),
            None,
            None,
        )
    })
}

/// Bit depth of video content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitDepth {
    Bit8,
    Bit10,
}

impl FFProbeStream {
    /// Tag lookup that tolerates the upper-case keys Matroska muxers write
    pub fn tag(&self, key: &str) -> Option<&str> {
        let tags = self.tags.as_ref()?;
        tags.get(key)
            .or_else(|| tags.get(&key.to_uppercase()))
            .map(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn disposition_flag(&self, key: &str) -> bool {
        self.disposition
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|v| *v != 0)
            .unwrap_or(false)
    }

    /// Detect bit depth from stream metadata
    /// Checks multiple sources: bits_per_raw_sample, pix_fmt, and HDR transfer
    pub fn detect_bit_depth(&self) -> BitDepth {
        if let Some(ref bits) = self.bits_per_raw_sample {
            if bits == "10" {
                return BitDepth::Bit10;
            } else if bits == "8" {
                return BitDepth::Bit8;
            }
        }

        if let Some(ref pix_fmt) = self.pix_fmt {
            let fmt_lower = pix_fmt.to_lowercase();
            if fmt_lower.contains("10") || fmt_lower.contains("p010") {
                return BitDepth::Bit10;
            }
        }

        // PQ / HLG transfer implies 10-bit content
        if let Some(ref transfer) = self.color_transfer {
            let t = transfer.to_lowercase();
            if t.contains("smpte2084") || t.contains("arib-std-b67") {
                return BitDepth::Bit10;
            }
        }

        BitDepth::Bit8
    }
}

/// Parse frame rate from string (e.g., "30/1", "30000/1001", "29.97")
pub fn parse_frame_rate(frame_rate_str: &str) -> Option<f64> {
    if let Some((num_str, den_str)) = frame_rate_str.split_once('/') {
        if let (Ok(num), Ok(den)) = (num_str.trim().parse::<f64>(), den_str.trim().parse::<f64>()) {
            if den != 0.0 && num > 0.0 {
                return Some(num / den);
            }
        }
        return None;
    }

    frame_rate_str.trim().parse::<f64>().ok()
        .filter(|&f| f > 0.0 && f < 1000.0)
}

/// Parse a duration given either as seconds ("5400.120") or "HH:MM:SS.mmm"
pub fn parse_duration(duration_str: &str) -> Option<f64> {
    let s = duration_str.trim();
    if s.contains(':') {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() == 3 {
            let hours: f64 = parts[0].parse().ok()?;
            let minutes: f64 = parts[1].parse().ok()?;
            let seconds: f64 = parts[2].parse().ok()?;
            return Some(hours * 3600.0 + minutes * 60.0 + seconds);
        }
        return None;
    }

    s.parse::<f64>().ok().filter(|d| d.is_finite() && *d >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080,
             "avg_frame_rate": "24000/1001", "r_frame_rate": "24000/1001", "pix_fmt": "yuv420p",
             "tags": {"DURATION": "00:01:30.000000000"}},
            {"index": 1, "codec_type": "audio", "codec_name": "ac3", "channels": 6, "sample_rate": "48000",
             "tags": {"language": "eng", "title": "Surround"}, "disposition": {"default": 1, "forced": 0}},
            {"index": 2, "codec_type": "subtitle", "codec_name": "subrip", "tags": {"LANGUAGE": "por"}}
        ],
        "format": {"format_name": "matroska,webm", "duration": "90.000000", "bit_rate": "8000000"},
        "chapters": [{"id": 0, "start_time": "0.000000", "end_time": "45.000000", "tags": {"title": "One"}}]
    }"#;

    #[test]
    fn test_parse_probe_output() {
        let data = parse_probe_output(SAMPLE, Path::new("movie.mkv")).unwrap();
        assert_eq!(data.streams.len(), 3);
        assert_eq!(data.chapters.len(), 1);
        assert_eq!(data.format.duration.as_deref(), Some("90.000000"));
        assert_eq!(data.streams[1].channels, Some(6));
        assert!(data.streams[1].disposition_flag("default"));
        // upper-case Matroska tag keys are found too
        assert_eq!(data.streams[2].tag("language"), Some("por"));
    }

    #[test]
    fn test_garbage_is_processing_error() {
        let err = parse_probe_output("not json", Path::new("x.mkv")).unwrap_err();
        assert!(matches!(err, PipelineError::EngineProcessing { .. }));
    }

    #[test]
    fn test_frame_rate_parsing() {
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(parse_duration("5400.5"), Some(5400.5));
        assert_eq!(parse_duration("01:30:00.000"), Some(5400.0));
        assert_eq!(parse_duration("N/A"), None);
    }

    #[test]
    fn test_bit_depth_detection() {
        let mut stream = FFProbeStream {
            codec_type: Some("video".to_string()),
            pix_fmt: Some("yuv420p10le".to_string()),
            ..Default::default()
        };
        assert_eq!(stream.detect_bit_depth(), BitDepth::Bit10);

        stream.pix_fmt = Some("yuv420p".to_string());
        assert_eq!(stream.detect_bit_depth(), BitDepth::Bit8);

        stream.color_transfer = Some("smpte2084".to_string());
        assert_eq!(stream.detect_bit_depth(), BitDepth::Bit10);
    }
}
