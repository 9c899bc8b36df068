//! Pure function from a probe result to encoder instructions. Deterministic:
//! same input always produces the same output, with no I/O or catalog
//! access performed here.

use std::collections::{BTreeSet, HashSet};

use crate::error::{Result, VidforgeError};
use crate::types::{AudioStreamInfo, ProbeResult, SubtitleStreamInfo};

const GIB: u64 = 1024 * 1024 * 1024;

const SUPPORTED_SUBTITLE_CODECS: &[&str] =
    &["subrip", "srt", "ass", "ssa", "mov_text", "webvtt", "hdmv_pgs_subtitle"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidthBucket {
    Uhd,
    FullHd,
    Hd,
    Sd,
}

impl WidthBucket {
    fn from_width(width: u32) -> Self {
        if width >= 3840 {
            WidthBucket::Uhd
        } else if width >= 1920 {
            WidthBucket::FullHd
        } else if width >= 1280 {
            WidthBucket::Hd
        } else {
            WidthBucket::Sd
        }
    }

    fn crf(self) -> u32 {
        match self {
            WidthBucket::Uhd => 27,
            WidthBucket::FullHd => 26,
            WidthBucket::Hd => 28,
            WidthBucket::Sd => 30,
        }
    }

    fn base_preset(self) -> u32 {
        match self {
            WidthBucket::Uhd => 7,
            WidthBucket::FullHd => 6,
            WidthBucket::Hd => 4,
            WidthBucket::Sd => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeVideoParams {
    pub source_index: u32,
    pub codec: String,
    pub crf: u32,
    pub preset: u32,
    pub gop: u32,
    pub keyint_min: u32,
    pub pix_fmt: String,
    pub color_primaries: Option<String>,
    pub color_transfer: Option<String>,
    pub color_space: Option<String>,
    pub master_display: Option<String>,
    pub max_cll: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VideoInstruction {
    Copy { source_index: u32 },
    Transcode(TranscodeVideoParams),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AudioInstruction {
    Copy {
        source_index: u32,
        codec: String,
        language: Option<String>,
    },
    Encode {
        source_index: u32,
        codec: String,
        channels: u32,
        bitrate_kbps: u32,
        language: Option<String>,
    },
}

impl AudioInstruction {
    pub fn source_index(&self) -> u32 {
        match self {
            AudioInstruction::Copy { source_index, .. } => *source_index,
            AudioInstruction::Encode { source_index, .. } => *source_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleInstruction {
    pub source_index: u32,
    pub codec: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instructions {
    pub video: VideoInstruction,
    pub audio: Vec<AudioInstruction>,
    pub subtitles: Vec<SubtitleInstruction>,
}

fn is_hevc(codec: &str) -> bool {
    let c = codec.to_ascii_lowercase();
    c.contains("hevc") || c.contains("h265") || c.contains("x265")
}

fn is_passthrough_audio_codec(codec: &str) -> bool {
    matches!(codec.to_ascii_lowercase().as_str(), "aac" | "ac3" | "eac3")
}

fn is_high_channel_codec(codec: &str) -> bool {
    matches!(
        codec.to_ascii_lowercase().as_str(),
        "eac3" | "truehd" | "dts"
    )
}

fn is_ac3(codec: &str) -> bool {
    codec.eq_ignore_ascii_case("ac3")
}

fn chroma_multiplier(pix_fmt: &str) -> f64 {
    if pix_fmt.contains("444") {
        1.3
    } else if pix_fmt.contains("422") {
        1.1
    } else {
        1.0
    }
}

/// Builds the video instruction. Copy when the source is already small
/// HEVC; otherwise a full transcode profile selected by width bucket.
fn plan_video(probe: &ProbeResult, target_codec: &str) -> Result<VideoInstruction> {
    let video = probe
        .primary_video()
        .ok_or_else(|| VidforgeError::Planner("no video stream".to_string()))?;

    if probe.size_bytes <= GIB && is_hevc(&video.codec) {
        return Ok(VideoInstruction::Copy {
            source_index: video.index,
        });
    }

    let bucket = WidthBucket::from_width(video.width);
    let preset = if probe.size_bytes > 10 * GIB {
        (bucket.base_preset() + 1).min(8)
    } else {
        bucket.base_preset()
    };
    let gop = (video.fps * 2.0).round().max(1.0) as u32;
    let keyint_min = (gop / 2).max(1);

    let (color_primaries, color_transfer, color_space, master_display, max_cll) =
        if probe.is_pq_transfer() {
            (
                video.color_primaries.clone(),
                video.color_transfer.clone(),
                video.color_space.clone(),
                video.master_display.clone(),
                video.max_cll.clone(),
            )
        } else {
            (None, None, None, None, None)
        };

    Ok(VideoInstruction::Transcode(TranscodeVideoParams {
        source_index: video.index,
        codec: target_codec.to_string(),
        crf: bucket.crf(),
        preset,
        gop,
        keyint_min,
        pix_fmt: "yuv420p10le".to_string(),
        color_primaries,
        color_transfer,
        color_space,
        master_display,
        max_cll,
    }))
}

/// Filters and re-encodes audio tracks.
fn plan_audio(tracks: &[AudioStreamInfo], audio_language: &BTreeSet<String>) -> Vec<AudioInstruction> {
    let mut kept: Vec<&AudioStreamInfo> = tracks
        .iter()
        .filter(|t| {
            audio_language.is_empty()
                || t.language
                    .as_deref()
                    .map(|l| audio_language.contains(l))
                    .unwrap_or(true)
        })
        .collect();

    let drop: HashSet<u32> = kept
        .iter()
        .filter_map(|t| {
            if is_ac3(&t.codec) && t.channels == 6 {
                let has_better = kept.iter().any(|o| {
                    o.index != t.index
                        && o.language == t.language
                        && is_high_channel_codec(&o.codec)
                        && o.channels > t.channels
                });
                has_better.then_some(t.index)
            } else {
                None
            }
        })
        .collect();
    kept.retain(|t| !drop.contains(&t.index));

    kept.into_iter()
        .map(|t| {
            if is_passthrough_audio_codec(&t.codec) {
                AudioInstruction::Copy {
                    source_index: t.index,
                    codec: t.codec.clone(),
                    language: t.language.clone(),
                }
            } else if t.channels <= 2 {
                AudioInstruction::Encode {
                    source_index: t.index,
                    codec: "aac".to_string(),
                    channels: 2,
                    bitrate_kbps: 96 * 2,
                    language: t.language.clone(),
                }
            } else {
                let kbps = (128 * t.channels).min(768);
                AudioInstruction::Encode {
                    source_index: t.index,
                    codec: "eac3".to_string(),
                    channels: t.channels,
                    bitrate_kbps: kbps,
                    language: t.language.clone(),
                }
            }
        })
        .collect()
}

fn plan_subtitles(tracks: &[SubtitleStreamInfo]) -> Vec<SubtitleInstruction> {
    tracks
        .iter()
        .filter(|t| {
            let lang_ok = t
                .language
                .as_deref()
                .map(|l| l.eq_ignore_ascii_case("eng") || l.eq_ignore_ascii_case("und"))
                .unwrap_or(true);
            let codec_ok = SUPPORTED_SUBTITLE_CODECS
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&t.codec));
            lang_ok && codec_ok
        })
        .map(|t| SubtitleInstruction {
            source_index: t.index,
            codec: t.codec.clone(),
            language: t.language.clone(),
        })
        .collect()
}

/// Builds the full instruction set for one probed file.
pub fn plan(
    probe: &ProbeResult,
    audio_language: &BTreeSet<String>,
    target_codec: &str,
) -> Result<Instructions> {
    Ok(Instructions {
        video: plan_video(probe, target_codec)?,
        audio: plan_audio(&probe.audio, audio_language),
        subtitles: plan_subtitles(&probe.subtitles),
    })
}

/// Derives the compute score for a probed file. Rounded to the nearest
/// 1/8 with a floor of 1/8.
pub fn compute_score(probe: &ProbeResult) -> f64 {
    let Some(video) = probe.primary_video() else {
        return crate::types::MIN_COMPUTE_SCORE;
    };

    let mut score = (video.width as f64 * video.height as f64) / (3840.0 * 2160.0);
    if video.bit_depth > 8 {
        score *= 1.2;
    }
    score *= chroma_multiplier(&video.pix_fmt);

    let audio_tracks = probe.audio.len().max(1) as f64;
    score *= 1.0 + 0.05 * (audio_tracks - 1.0);

    if probe.stream_count() > 10 {
        score *= 1.1;
    }

    let rounded = (score * 8.0).round() / 8.0;
    rounded.max(crate::types::MIN_COMPUTE_SCORE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioStreamInfo, SubtitleStreamInfo, VideoStreamInfo};

    fn video(codec: &str, width: u32, height: u32, bit_depth: u32, pix_fmt: &str) -> VideoStreamInfo {
        VideoStreamInfo {
            index: 0,
            codec: codec.to_string(),
            width,
            height,
            bit_depth,
            pix_fmt: pix_fmt.to_string(),
            fps: 23.976,
            color_primaries: None,
            color_transfer: None,
            color_space: None,
            master_display: None,
            max_cll: None,
            dolby_vision_profile: None,
        }
    }

    fn probe_with(video_stream: VideoStreamInfo, audio: Vec<AudioStreamInfo>, size_bytes: u64) -> ProbeResult {
        ProbeResult {
            video: vec![video_stream],
            audio,
            subtitles: vec![],
            chapter_count: 0,
            duration_secs: 3600.0,
            size_bytes,
            bit_rate: None,
            display_aspect_ratio: None,
            encode_version_tag: None,
        }
    }

    fn audio(index: u32, codec: &str, channels: u32, language: &str) -> AudioStreamInfo {
        AudioStreamInfo {
            index,
            codec: codec.to_string(),
            channels,
            language: Some(language.to_string()),
            bit_rate: None,
        }
    }

    // Scenario 1: copy-only small HEVC.
    #[test]
    fn small_hevc_source_is_copied() {
        let probe = probe_with(
            video("hevc", 1920, 1080, 8, "yuv420p"),
            vec![audio(1, "aac", 2, "eng")],
            800 * 1024 * 1024,
        );
        let instructions = plan(&probe, &BTreeSet::new(), "hevc").unwrap();
        assert_eq!(instructions.video, VideoInstruction::Copy { source_index: 0 });
        assert_eq!(
            instructions.audio,
            vec![AudioInstruction::Copy {
                source_index: 1,
                codec: "aac".to_string(),
                language: Some("eng".to_string())
            }]
        );
    }

    // Scenario 2: UHD re-encode.
    #[test]
    fn uhd_source_gets_full_reencode_profile() {
        let probe = probe_with(
            video("h264", 3840, 2160, 8, "yuv420p"),
            vec![audio(1, "ac3", 6, "eng")],
            12 * GIB,
        );
        let instructions = plan(&probe, &BTreeSet::new(), "hevc").unwrap();
        match instructions.video {
            VideoInstruction::Transcode(params) => {
                assert_eq!(params.crf, 27);
                assert_eq!(params.preset, 8);
                assert_eq!(params.pix_fmt, "yuv420p10le");
            }
            _ => panic!("expected transcode"),
        }
        assert_eq!(
            instructions.audio,
            vec![AudioInstruction::Encode {
                source_index: 1,
                codec: "eac3".to_string(),
                channels: 6,
                bitrate_kbps: 768,
                language: Some("eng".to_string())
            }]
        );
        let score = compute_score(&probe);
        assert!((score - 1.0).abs() < 1e-9);
    }

    // Scenario 3: HDR PQ source carries color metadata through.
    #[test]
    fn pq_transfer_carries_hdr_fields() {
        let mut v = video("h264", 3840, 2160, 10, "yuv420p10le");
        v.color_primaries = Some("bt2020".to_string());
        v.color_transfer = Some("smpte2084".to_string());
        v.color_space = Some("bt2020nc".to_string());
        v.master_display = Some("G(...)".to_string());
        v.max_cll = Some("1000,400".to_string());
        let probe = probe_with(v, vec![], 6 * GIB);
        let instructions = plan(&probe, &BTreeSet::new(), "hevc").unwrap();
        match instructions.video {
            VideoInstruction::Transcode(params) => {
                assert_eq!(params.color_transfer.as_deref(), Some("smpte2084"));
                assert!(params.master_display.is_some());
                assert!(params.max_cll.is_some());
            }
            _ => panic!("expected transcode"),
        }
    }

    // Scenario 4: AC-3 dropped in favor of higher-channel EAC-3.
    #[test]
    fn ac3_dropped_when_better_eac3_present() {
        let probe = probe_with(
            video("h264", 1920, 1080, 8, "yuv420p"),
            vec![audio(1, "ac3", 6, "eng"), audio(2, "eac3", 8, "eng")],
            4 * GIB,
        );
        let instructions = plan(&probe, &BTreeSet::new(), "hevc").unwrap();
        assert_eq!(instructions.audio.len(), 1);
        assert_eq!(instructions.audio[0].source_index(), 2);
    }

    #[test]
    fn compute_score_has_floor() {
        let probe = probe_with(video("hevc", 160, 90, 8, "yuv420p"), vec![], 1024);
        assert_eq!(compute_score(&probe), crate::types::MIN_COMPUTE_SCORE);
    }

    #[test]
    fn no_video_stream_is_planner_rejection() {
        let probe = ProbeResult {
            video: vec![],
            audio: vec![],
            subtitles: vec![],
            chapter_count: 0,
            duration_secs: 0.0,
            size_bytes: 0,
            bit_rate: None,
            display_aspect_ratio: None,
            encode_version_tag: None,
        };
        let err = plan(&probe, &BTreeSet::new(), "hevc").unwrap_err();
        assert!(matches!(err, VidforgeError::Planner(_)));
    }
}
