use std::path::Path;
use crate::metadata::{MediaMetadata, UNDETERMINED};
use crate::quality::QualityTier;

/// Subtitle codecs Matroska can carry as-is; the rest are converted to SubRip
const MKV_NATIVE_SUBTITLES: &[&str] = &["subrip", "srt", "ass", "ssa", "webvtt"];

/// Container language tag; muxers expect `und` for an unknown language
fn iso_language(language: &str) -> &str {
    if language == UNDETERMINED {
        "und"
    } else {
        language
    }
}

/// Command builder for generating FFmpeg command lines
pub struct CommandBuilder;

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBuilder {
    /// Create a new command builder
    pub fn new() -> Self {
        CommandBuilder
    }

    fn preamble(args: &mut Vec<String>) {
        args.push("-hide_banner".to_string());
        args.push("-nostdin".to_string());
        args.push("-y".to_string());
        args.push("-loglevel".to_string());
        args.push("error".to_string());
    }

    fn input(args: &mut Vec<String>, input: &Path) {
        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());
    }

    /// Progress to stdout as key=value blocks, then the output file
    fn output(args: &mut Vec<String>, muxer: &str, output: &Path) {
        args.push("-progress".to_string());
        args.push("pipe:1".to_string());
        args.push("-nostats".to_string());
        args.push("-f".to_string());
        args.push(muxer.to_string());
        args.push(output.to_string_lossy().to_string());
    }

    /// Downscale to at most `height` lines, keeping the aspect ratio and even width
    fn scale_cap(args: &mut Vec<String>, height: u32) {
        args.push("-vf".to_string());
        args.push(format!("scale=-2:'min({},ih)'", height));
    }

    /// Build the master encode: Matroska, every audio track and every text subtitle kept.
    ///
    /// Audio is normalized to AAC stereo with language/title metadata so derived
    /// renditions can address tracks by position.
    pub fn build_master_command(
        &self,
        input: &Path,
        output: &Path,
        meta: &MediaMetadata,
        tier: QualityTier,
    ) -> Vec<String> {
        let mut args = Vec::new();
        Self::preamble(&mut args);
        Self::input(&mut args, input);

        args.push("-map".to_string());
        args.push(format!("0:{}", meta.video.index));
        args.push("-c:v".to_string());
        args.push("libx264".to_string());
        args.push("-preset".to_string());
        args.push("slow".to_string());
        args.push("-crf".to_string());
        args.push(tier.params().master_crf.to_string());
        args.push("-pix_fmt".to_string());
        if meta.video.ten_bit {
            args.push("yuv420p10le".to_string());
        } else {
            args.push("yuv420p".to_string());
        }

        for (pos, track) in meta.audio.iter().enumerate() {
            args.push("-map".to_string());
            args.push(format!("0:{}", track.index));
            args.push(format!("-c:a:{}", pos));
            args.push("aac".to_string());
            args.push(format!("-b:a:{}", pos));
            args.push("256k".to_string());
            args.push(format!("-ac:a:{}", pos));
            args.push("2".to_string());
            args.push(format!("-metadata:s:a:{}", pos));
            args.push(format!("language={}", iso_language(&track.language)));
            if track.title != UNDETERMINED {
                args.push(format!("-metadata:s:a:{}", pos));
                args.push(format!("title={}", track.title));
            }
        }

        for (pos, sub) in meta.text_subtitles().enumerate() {
            args.push("-map".to_string());
            args.push(format!("0:{}", sub.index));
            args.push(format!("-c:s:{}", pos));
            if MKV_NATIVE_SUBTITLES.contains(&sub.codec.to_lowercase().as_str()) {
                args.push("copy".to_string());
            } else {
                args.push("srt".to_string());
            }
            args.push(format!("-metadata:s:s:{}", pos));
            args.push(format!("language={}", iso_language(&sub.language)));
        }

        args.push("-map_chapters".to_string());
        args.push("0".to_string());
        Self::output(&mut args, "matroska", output);
        args
    }

    fn h264_web(args: &mut Vec<String>, tier: QualityTier, profile: &str, level: &str) {
        let params = tier.params();
        args.push("-c:v".to_string());
        args.push("libx264".to_string());
        args.push("-preset".to_string());
        args.push("medium".to_string());
        args.push("-crf".to_string());
        args.push(params.rendition_crf.to_string());
        args.push("-maxrate".to_string());
        args.push(params.video_bitrate.to_string());
        args.push("-bufsize".to_string());
        args.push(params.video_bitrate.to_string());
        args.push("-profile:v".to_string());
        args.push(profile.to_string());
        args.push("-level".to_string());
        args.push(level.to_string());
        args.push("-pix_fmt".to_string());
        args.push("yuv420p".to_string());
        Self::scale_cap(args, params.target_height);
    }

    /// Primary web rendition: H.264 high profile, every audio track, faststart
    pub fn build_web_mp4_command(&self, master: &Path, output: &Path, tier: QualityTier) -> Vec<String> {
        let mut args = Vec::new();
        Self::preamble(&mut args);
        Self::input(&mut args, master);

        args.push("-map".to_string());
        args.push("0:v:0".to_string());
        args.push("-map".to_string());
        args.push("0:a?".to_string());
        Self::h264_web(&mut args, tier, "high", "4.1");
        args.push("-c:a".to_string());
        args.push("aac".to_string());
        args.push("-b:a".to_string());
        args.push("192k".to_string());
        args.push("-sn".to_string());
        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
        Self::output(&mut args, "mp4", output);
        args
    }

    /// Single-audio-track MP4 for one language; `audio_pos` is the track's position in the master
    pub fn build_language_mp4_command(
        &self,
        master: &Path,
        output: &Path,
        tier: QualityTier,
        audio_pos: usize,
        language: &str,
    ) -> Vec<String> {
        let mut args = Vec::new();
        Self::preamble(&mut args);
        Self::input(&mut args, master);

        args.push("-map".to_string());
        args.push("0:v:0".to_string());
        args.push("-map".to_string());
        args.push(format!("0:a:{}", audio_pos));
        Self::h264_web(&mut args, tier, "high", "4.1");
        args.push("-c:a".to_string());
        args.push("aac".to_string());
        args.push("-b:a".to_string());
        args.push("192k".to_string());
        args.push("-metadata:s:a:0".to_string());
        args.push(format!("language={}", language));
        args.push("-sn".to_string());
        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
        Self::output(&mut args, "mp4", output);
        args
    }

    /// VP9 + Opus, capped at 720p
    pub fn build_webm_command(&self, master: &Path, output: &Path, tier: QualityTier) -> Vec<String> {
        let tier = tier.cap(QualityTier::Hd720);
        let mut args = Vec::new();
        Self::preamble(&mut args);
        Self::input(&mut args, master);

        args.push("-map".to_string());
        args.push("0:v:0".to_string());
        args.push("-map".to_string());
        args.push("0:a?".to_string());
        args.push("-c:v".to_string());
        args.push("libvpx-vp9".to_string());
        args.push("-b:v".to_string());
        args.push(tier.params().video_bitrate.to_string());
        args.push("-deadline".to_string());
        args.push("good".to_string());
        args.push("-cpu-used".to_string());
        args.push("2".to_string());
        args.push("-row-mt".to_string());
        args.push("1".to_string());
        Self::scale_cap(&mut args, tier.params().target_height);
        args.push("-c:a".to_string());
        args.push("libopus".to_string());
        args.push("-b:a".to_string());
        args.push("128k".to_string());
        args.push("-sn".to_string());
        Self::output(&mut args, "webm", output);
        args
    }

    /// H.264 baseline at 480p with only the primary audio track
    pub fn build_mobile_command(&self, master: &Path, output: &Path, audio_pos: Option<usize>) -> Vec<String> {
        let mut args = Vec::new();
        Self::preamble(&mut args);
        Self::input(&mut args, master);

        args.push("-map".to_string());
        args.push("0:v:0".to_string());
        if let Some(pos) = audio_pos {
            args.push("-map".to_string());
            args.push(format!("0:a:{}", pos));
        }
        Self::h264_web(&mut args, QualityTier::Sd480, "baseline", "3.0");
        args.push("-c:a".to_string());
        args.push("aac".to_string());
        args.push("-b:a".to_string());
        args.push("96k".to_string());
        args.push("-ac".to_string());
        args.push("2".to_string());
        args.push("-sn".to_string());
        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
        Self::output(&mut args, "mp4", output);
        args
    }

    /// Single JPEG frame at `offset` seconds, scaled to `width`
    pub fn build_thumbnail_command(&self, master: &Path, output: &Path, offset: f64, width: u32) -> Vec<String> {
        let mut args = Vec::new();
        Self::preamble(&mut args);

        // Seek before input for faster seeking
        args.push("-ss".to_string());
        args.push(format!("{:.3}", offset.max(0.0)));
        Self::input(&mut args, master);

        args.push("-map".to_string());
        args.push("0:v:0".to_string());
        args.push("-frames:v".to_string());
        args.push("1".to_string());
        args.push("-vf".to_string());
        args.push(format!("scale={}:-2", width));
        args.push("-q:v".to_string());
        args.push("2".to_string());
        Self::output(&mut args, "image2", output);
        args
    }

    /// Convert the master's `subtitle_pos`-th subtitle stream to WebVTT
    pub fn build_subtitle_command(&self, master: &Path, output: &Path, subtitle_pos: usize) -> Vec<String> {
        let mut args = Vec::new();
        Self::preamble(&mut args);
        Self::input(&mut args, master);

        args.push("-map".to_string());
        args.push(format!("0:s:{}", subtitle_pos));
        args.push("-c:s".to_string());
        args.push("webvtt".to_string());
        Self::output(&mut args, "webvtt", output);
        args
    }
}
