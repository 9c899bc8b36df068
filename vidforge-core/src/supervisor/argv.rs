//! Assembles the encoder child process's argument vector from a planned
//! instruction set: input and progress options, one `-map` per preserved
//! stream, codec/bitrate/preset flags, and the encode-version metadata tag.

use std::path::Path;

use crate::planner::{AudioInstruction, Instructions, VideoInstruction};

fn video_encoder_name(codec: &str) -> String {
    match codec.to_ascii_lowercase().as_str() {
        "hevc" | "h265" => "libx265",
        "h264" => "libx264",
        "av1" => "libaom-av1",
        other => return other.to_string(),
    }
    .to_string()
}

fn preset_name(preset: u32) -> &'static str {
    match preset {
        0 => "ultrafast",
        1 => "superfast",
        2 => "veryfast",
        3 => "faster",
        4 => "fast",
        5 => "medium",
        6 => "slow",
        7 => "slower",
        _ => "veryslow",
    }
}

/// Builds the full argv, excluding the binary name itself. `permit_hw_decode`
/// gates whether a hardware decode hint is added ahead of the input.
pub fn build_argv(
    input: &Path,
    output: &Path,
    instructions: &Instructions,
    encode_version: &str,
    permit_hw_decode: bool,
) -> Vec<String> {
    let mut args = vec!["-hide_banner".to_string(), "-y".to_string()];

    if permit_hw_decode {
        args.push("-hwaccel".to_string());
        args.push("auto".to_string());
    }

    args.push("-i".to_string());
    args.push(input.display().to_string());

    match &instructions.video {
        VideoInstruction::Copy { source_index } => {
            args.push("-map".to_string());
            args.push(format!("0:{source_index}"));
            args.push("-c:v:0".to_string());
            args.push("copy".to_string());
        }
        VideoInstruction::Transcode(params) => {
            args.push("-map".to_string());
            args.push(format!("0:{}", params.source_index));
            args.push("-c:v:0".to_string());
            args.push(video_encoder_name(&params.codec));
            args.push("-crf".to_string());
            args.push(params.crf.to_string());
            args.push("-preset".to_string());
            args.push(preset_name(params.preset).to_string());
            args.push("-g".to_string());
            args.push(params.gop.to_string());
            args.push("-keyint_min".to_string());
            args.push(params.keyint_min.to_string());
            args.push("-pix_fmt".to_string());
            args.push(params.pix_fmt.clone());

            if let Some(primaries) = &params.color_primaries {
                args.push("-color_primaries".to_string());
                args.push(primaries.clone());
            }
            if let Some(transfer) = &params.color_transfer {
                args.push("-color_trc".to_string());
                args.push(transfer.clone());
            }
            if let Some(space) = &params.color_space {
                args.push("-colorspace".to_string());
                args.push(space.clone());
            }
            if let Some(master_display) = &params.master_display {
                args.push("-master_display".to_string());
                args.push(master_display.clone());
            }
            if let Some(max_cll) = &params.max_cll {
                args.push("-max_cll".to_string());
                args.push(max_cll.clone());
            }
        }
    }

    for (stream_pos, audio) in instructions.audio.iter().enumerate() {
        match audio {
            AudioInstruction::Copy { source_index, .. } => {
                args.push("-map".to_string());
                args.push(format!("0:{source_index}"));
                args.push(format!("-c:a:{stream_pos}"));
                args.push("copy".to_string());
            }
            AudioInstruction::Encode {
                source_index,
                codec,
                channels,
                bitrate_kbps,
                ..
            } => {
                args.push("-map".to_string());
                args.push(format!("0:{source_index}"));
                args.push(format!("-c:a:{stream_pos}"));
                args.push(codec.clone());
                args.push(format!("-ac:a:{stream_pos}"));
                args.push(channels.to_string());
                args.push(format!("-b:a:{stream_pos}"));
                args.push(format!("{bitrate_kbps}k"));
            }
        }
    }

    for (stream_pos, subtitle) in instructions.subtitles.iter().enumerate() {
        args.push("-map".to_string());
        args.push(format!("0:{}", subtitle.source_index));
        args.push(format!("-c:s:{stream_pos}"));
        args.push("copy".to_string());
    }

    args.push("-metadata:s:v:0".to_string());
    args.push(format!("encode_version={encode_version}"));

    args.push("-progress".to_string());
    args.push("pipe:1".to_string());
    args.push("-nostats".to_string());

    args.push(output.display().to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{AudioInstruction, SubtitleInstruction, TranscodeVideoParams};
    use std::path::PathBuf;

    #[test]
    fn copy_video_maps_the_source_stream_and_copies() {
        let instructions = Instructions {
            video: VideoInstruction::Copy { source_index: 0 },
            audio: vec![AudioInstruction::Copy {
                source_index: 1,
                codec: "aac".to_string(),
                language: Some("eng".to_string()),
            }],
            subtitles: vec![],
        };
        let args = build_argv(
            &PathBuf::from("/scratch/in.mkv"),
            &PathBuf::from("/dest/out.mkv"),
            &instructions,
            "h265-v3",
            true,
        );
        assert!(args.contains(&"-hwaccel".to_string()));
        assert_eq!(args.iter().filter(|a| *a == "-map").count(), 2);
        assert!(args.windows(2).any(|w| w == ["-c:v:0".to_string(), "copy".to_string()]));
        assert!(args.windows(2).any(|w| w == ["-c:a:0".to_string(), "copy".to_string()]));
        assert_eq!(args.last().unwrap(), "/dest/out.mkv");
        assert!(args.windows(2).any(|w| w == ["-progress".to_string(), "pipe:1".to_string()]));
    }

    #[test]
    fn transcode_video_carries_hdr_fields_and_metadata_tag() {
        let instructions = Instructions {
            video: VideoInstruction::Transcode(TranscodeVideoParams {
                source_index: 0,
                codec: "hevc".to_string(),
                crf: 27,
                preset: 7,
                gop: 48,
                keyint_min: 24,
                pix_fmt: "yuv420p10le".to_string(),
                color_primaries: Some("bt2020".to_string()),
                color_transfer: Some("smpte2084".to_string()),
                color_space: Some("bt2020nc".to_string()),
                master_display: Some("G(...)".to_string()),
                max_cll: Some("1000,400".to_string()),
            }),
            audio: vec![AudioInstruction::Encode {
                source_index: 1,
                codec: "eac3".to_string(),
                channels: 6,
                bitrate_kbps: 384,
                language: Some("eng".to_string()),
            }],
            subtitles: vec![SubtitleInstruction {
                source_index: 2,
                codec: "subrip".to_string(),
                language: Some("eng".to_string()),
            }],
        };
        let args = build_argv(
            &PathBuf::from("/scratch/in.mkv"),
            &PathBuf::from("/dest/out.mkv"),
            &instructions,
            "h265-v3",
            false,
        );
        assert!(!args.contains(&"-hwaccel".to_string()));
        assert!(args.contains(&"libx265".to_string()));
        assert!(args.contains(&"-master_display".to_string()));
        assert!(args.contains(&"-max_cll".to_string()));
        assert!(args.contains(&"encode_version=h265-v3".to_string()));
        assert!(args.windows(2).any(|w| w == ["-c:s:0".to_string(), "copy".to_string()]));
        assert!(args.windows(2).any(|w| w == ["-b:a:0".to_string(), "384k".to_string()]));
    }
}
