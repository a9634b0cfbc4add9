//! Parsing of ffmpeg's `-progress pipe:1` key=value stream.

/// Snapshot of one progress block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FfmpegProgress {
    /// Output position in microseconds
    pub out_time_us: i64,
    pub frame: u64,
    /// Encoding speed relative to realtime (1.5 = 1.5x)
    pub speed: f64,
    pub is_complete: bool,
}

impl FfmpegProgress {
    /// Percent complete given the expected output duration; 0 when unknown
    pub fn percent(&self, total_secs: f64) -> f64 {
        if self.is_complete {
            return 100.0;
        }
        if !(total_secs.is_finite() && total_secs > 0.0) || self.out_time_us <= 0 {
            return 0.0;
        }
        let done = self.out_time_us as f64 / 1_000_000.0;
        (done / total_secs * 100.0).clamp(0.0, 100.0)
    }
}

/// Feed one line; returns a snapshot at the end of each block (`progress=continue|end`).
///
/// ffmpeg reports `out_time_ms` in microseconds despite the name, so both keys are
/// read the same way.
pub fn parse_progress_line(line: &str, current: &mut FfmpegProgress) -> Option<FfmpegProgress> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => {
            if let Ok(us) = value.trim().parse::<i64>() {
                current.out_time_us = us;
            }
        }
        "frame" => {
            if let Ok(frame) = value.trim().parse() {
                current.frame = frame;
            }
        }
        "speed" => {
            if let Some(speed) = value.trim().strip_suffix('x').and_then(|s| s.trim().parse().ok()) {
                current.speed = speed;
            }
        }
        "progress" => {
            if value.trim() == "end" {
                current.is_complete = true;
            }
            return Some(current.clone());
        }
        _ => {}
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_block_parsing() {
        let mut current = FfmpegProgress::default();
        let block = "frame=240\nfps=48.0\nout_time_us=10000000\nout_time_ms=10000000\nspeed=2.01x\nprogress=continue";

        let mut snapshots = Vec::new();
        for line in block.lines() {
            if let Some(p) = parse_progress_line(line, &mut current) {
                snapshots.push(p);
            }
        }
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].frame, 240);
        assert!((snapshots[0].speed - 2.01).abs() < 1e-9);
        assert!((snapshots[0].percent(40.0) - 25.0).abs() < 1e-9);
        assert!(!snapshots[0].is_complete);

        let end = parse_progress_line("progress=end", &mut current).unwrap();
        assert_eq!(end.percent(40.0), 100.0);
    }

    #[test]
    fn test_percent_edge_cases() {
        let p = FfmpegProgress { out_time_us: 90_000_000, ..Default::default() };
        assert_eq!(p.percent(0.0), 0.0);
        // overshoot past the probed duration is clamped
        assert_eq!(p.percent(60.0), 100.0);
        assert_eq!(parse_progress_line("speed=N/A", &mut FfmpegProgress::default()), None);
        assert_eq!(parse_progress_line("garbage", &mut FfmpegProgress::default()), None);
    }
}
