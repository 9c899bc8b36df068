use serde::{Deserialize, Serialize};

/// One media stream as reported by the probe binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStreamInfo {
    pub index: u32,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub bit_depth: u32,
    pub pix_fmt: String,
    pub fps: f64,
    pub color_primaries: Option<String>,
    pub color_transfer: Option<String>,
    pub color_space: Option<String>,
    /// Mastering-display side data, pre-formatted as an encoder-ready string.
    pub master_display: Option<String>,
    /// Content light level side data, pre-formatted as an encoder-ready string.
    pub max_cll: Option<String>,
    pub dolby_vision_profile: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioStreamInfo {
    pub index: u32,
    pub codec: String,
    pub channels: u32,
    pub language: Option<String>,
    pub bit_rate: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleStreamInfo {
    pub index: u32,
    pub codec: String,
    pub language: Option<String>,
}

/// Result of probing one file with the external probe binary. Treated as
/// opaque by the scheduler; the instruction planner and scoring function
/// read specific fields out of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub video: Vec<VideoStreamInfo>,
    pub audio: Vec<AudioStreamInfo>,
    pub subtitles: Vec<SubtitleStreamInfo>,
    pub chapter_count: u32,
    pub duration_secs: f64,
    pub size_bytes: u64,
    pub bit_rate: Option<u64>,
    pub display_aspect_ratio: Option<f64>,
    /// The `encode_version` tag embedded as a metadata field on a
    /// previously-transcoded file, if present.
    pub encode_version_tag: Option<String>,
}

impl ProbeResult {
    pub fn primary_video(&self) -> Option<&VideoStreamInfo> {
        self.video.first()
    }

    pub fn total_frames(&self) -> Option<u64> {
        let video = self.primary_video()?;
        if video.fps <= 0.0 || self.duration_secs <= 0.0 {
            return None;
        }
        Some((self.duration_secs * video.fps).round() as u64)
    }

    pub fn stream_count(&self) -> usize {
        self.video.len() + self.audio.len() + self.subtitles.len()
    }

    pub fn is_pq_transfer(&self) -> bool {
        self.primary_video()
            .and_then(|v| v.color_transfer.as_deref())
            .map(|t| t.contains("2084"))
            .unwrap_or(false)
    }

    pub fn has_hdr_side_data(&self) -> bool {
        self.primary_video()
            .map(|v| v.master_display.is_some() || v.max_cll.is_some())
            .unwrap_or(false)
    }
}
