//! Parses the encoder's `-progress pipe:1` key=value stream. Distinct from
//! free-form stderr scraping: each line is exactly one key=value pair, and a
//! block always ends with a `progress=continue` or `progress=end` line.

/// One completed progress block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSample {
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    pub out_time_secs: Option<f64>,
    pub total_size_bytes: Option<u64>,
    pub speed: Option<f64>,
    pub done: bool,
}

/// Accumulates key=value lines into [`ProgressSample`]s. One instance per
/// running child process.
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: ProgressSample,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line of the progress stream. Returns the completed sample
    /// once the block-terminating `progress=` key arrives; `None` while the
    /// block is still accumulating.
    pub fn feed(&mut self, line: &str) -> Option<ProgressSample> {
        let (key, value) = line.split_once('=')?;
        let key = key.trim();
        let value = value.trim();
        match key {
            "frame" => self.current.frame = value.parse().ok(),
            "fps" => self.current.fps = value.parse().ok(),
            "bitrate" => self.current.bitrate_kbps = parse_bitrate(value),
            "out_time_ms" | "out_time_us" => {
                self.current.out_time_secs = value.parse::<f64>().ok().map(|us| us / 1_000_000.0);
            }
            "total_size" => self.current.total_size_bytes = value.parse().ok(),
            "speed" => self.current.speed = parse_speed(value),
            "progress" => {
                self.current.done = value == "end";
                return Some(std::mem::take(&mut self.current));
            }
            _ => {}
        }
        None
    }
}

fn parse_bitrate(raw: &str) -> Option<f64> {
    if raw == "N/A" {
        return None;
    }
    raw.trim_end_matches("kbits/s").trim().parse().ok()
}

fn parse_speed(raw: &str) -> Option<f64> {
    if raw == "N/A" {
        return None;
    }
    raw.trim_end_matches('x').trim().parse().ok()
}

/// Percent complete, preferring frame-based progress when the probe knows
/// the total frame count, falling back to elapsed/declared duration.
pub fn compute_percent(sample: &ProgressSample, total_frames: Option<u64>, duration_secs: f64) -> f64 {
    if let (Some(frame), Some(total)) = (sample.frame, total_frames) {
        if total > 0 {
            return ((frame as f64 / total as f64) * 100.0).min(100.0);
        }
    }
    if let Some(out_time) = sample.out_time_secs {
        if duration_secs > 0.0 {
            return ((out_time / duration_secs) * 100.0).min(100.0);
        }
    }
    0.0
}

/// ETA in seconds from elapsed wall-clock time and percent complete.
pub fn compute_eta_secs(percent: f64, elapsed_secs: f64) -> Option<f64> {
    if percent > 0.0 && percent < 100.0 {
        Some(elapsed_secs * (100.0 - percent) / percent)
    } else {
        None
    }
}

/// Formats a duration in seconds as `HH:MM:SS`, used as the dedup key for
/// running-job patches.
pub fn format_timemark(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_a_full_block() {
        let mut parser = ProgressParser::new();
        assert!(parser.feed("frame=120").is_none());
        assert!(parser.feed("fps=24.0").is_none());
        assert!(parser.feed("bitrate=1234.5kbits/s").is_none());
        assert!(parser.feed("total_size=9876543").is_none());
        assert!(parser.feed("out_time_ms=5000000").is_none());
        assert!(parser.feed("speed=1.02x").is_none());
        let sample = parser.feed("progress=continue").unwrap();
        assert_eq!(sample.frame, Some(120));
        assert_eq!(sample.fps, Some(24.0));
        assert_eq!(sample.bitrate_kbps, Some(1234.5));
        assert_eq!(sample.total_size_bytes, Some(9876543));
        assert!((sample.out_time_secs.unwrap() - 5.0).abs() < 1e-9);
        assert_eq!(sample.speed, Some(1.02));
        assert!(!sample.done);
    }

    #[test]
    fn progress_end_marks_block_done_and_resets_state() {
        let mut parser = ProgressParser::new();
        parser.feed("frame=500");
        let sample = parser.feed("progress=end").unwrap();
        assert!(sample.done);
        assert_eq!(sample.frame, Some(500));

        let next = parser.feed("progress=continue").unwrap();
        assert_eq!(next.frame, None);
    }

    #[test]
    fn na_values_parse_to_none() {
        let mut parser = ProgressParser::new();
        parser.feed("bitrate=N/A");
        parser.feed("speed=N/A");
        let sample = parser.feed("progress=continue").unwrap();
        assert_eq!(sample.bitrate_kbps, None);
        assert_eq!(sample.speed, None);
    }

    #[test]
    fn percent_prefers_frame_based_when_total_known() {
        let sample = ProgressSample {
            frame: Some(50),
            out_time_secs: Some(999.0),
            ..Default::default()
        };
        assert_eq!(compute_percent(&sample, Some(100), 10.0), 50.0);
    }

    #[test]
    fn percent_falls_back_to_time_based() {
        let sample = ProgressSample {
            out_time_secs: Some(30.0),
            ..Default::default()
        };
        assert_eq!(compute_percent(&sample, None, 60.0), 50.0);
    }

    #[test]
    fn eta_is_none_outside_the_open_interval() {
        assert_eq!(compute_eta_secs(0.0, 10.0), None);
        assert_eq!(compute_eta_secs(100.0, 10.0), None);
        assert!(compute_eta_secs(50.0, 10.0).is_some());
    }
}
