//! Probe + upsert pipeline: given a path, ensures the catalog's File record
//! reflects the file currently on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, FileUpdate};
use crate::error::{Result, VidforgeError};
use crate::kv::{KvStore, NamedLock};
use crate::types::{
    AudioStreamInfo, ErrorInfo, FileRecord, FileStatus, ProbeResult, SubtitleStreamInfo,
    VideoStreamInfo,
};

const PATH_LOCK_TTL: Duration = Duration::from_secs(300);

const GIB: u64 = 1024 * 1024 * 1024;
const MIN_SUPPORTED_DOLBY_VISION_PROFILE: u32 = 8;

/// Size-based default priority buckets. Lower is more important; an
/// existing manual priority below 90 always wins over these.
const PRIORITY_LARGE_FILE: i32 = 96;
const PRIORITY_SMALL_HEVC: i32 = 97;
const PRIORITY_DEFAULT: i32 = 100;
const PRIORITY_MANUAL_THRESHOLD: i32 = 90;

/// Streams a file through SHA-256 without holding the whole thing in memory.
async fn fingerprint_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn default_priority(size_bytes: u64, video_codec: Option<&str>) -> i32 {
    if size_bytes >= 20 * GIB {
        PRIORITY_LARGE_FILE
    } else if size_bytes <= GIB && video_codec.map(|c| c.eq_ignore_ascii_case("hevc")).unwrap_or(false) {
        PRIORITY_SMALL_HEVC
    } else {
        PRIORITY_DEFAULT
    }
}

fn effective_priority(existing: Option<i32>, size_bytes: u64, video_codec: Option<&str>) -> i32 {
    let default = default_priority(size_bytes, video_codec);
    match existing {
        Some(p) if p < PRIORITY_MANUAL_THRESHOLD => p,
        Some(p) => p.min(default),
        None => default,
    }
}

/// Raw shape of `ffprobe -print_format json -show_format -show_streams`.
/// Numeric fields frequently arrive as strings; everything is parsed
/// defensively.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: u32,
    codec_type: String,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    pix_fmt: Option<String>,
    #[serde(default)]
    r_frame_rate: Option<String>,
    #[serde(default)]
    color_primaries: Option<String>,
    #[serde(default)]
    color_transfer: Option<String>,
    #[serde(default)]
    color_space: Option<String>,
    #[serde(default)]
    channels: Option<u32>,
    #[serde(default)]
    bit_rate: Option<String>,
    #[serde(default)]
    tags: Option<serde_json::Value>,
    #[serde(default)]
    side_data_list: Option<Vec<serde_json::Value>>,
}

fn parse_frame_rate(raw: &str) -> f64 {
    let mut parts = raw.splitn(2, '/');
    let num: f64 = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0.0);
    let den: f64 = parts.next().and_then(|v| v.parse().ok()).unwrap_or(1.0);
    if den == 0.0 { 0.0 } else { num / den }
}

fn bit_depth_from_pix_fmt(pix_fmt: &str) -> u32 {
    if pix_fmt.contains("p12") || pix_fmt.contains("12le") || pix_fmt.contains("12be") {
        12
    } else if pix_fmt.contains("p10") || pix_fmt.contains("10le") || pix_fmt.contains("10be") {
        10
    } else {
        8
    }
}

fn stream_language(tags: &Option<serde_json::Value>) -> Option<String> {
    tags.as_ref()?
        .get("language")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn stream_tag(tags: &Option<serde_json::Value>, key: &str) -> Option<String> {
    tags.as_ref()?
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn dolby_vision_profile(side_data: &Option<Vec<serde_json::Value>>) -> Option<u32> {
    side_data.as_ref()?.iter().find_map(|entry| {
        let kind = entry.get("side_data_type")?.as_str()?;
        if !kind.to_lowercase().contains("dovi") && !kind.to_lowercase().contains("dolby vision") {
            return None;
        }
        entry
            .get("dv_profile")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
    })
}

fn side_data_string(side_data: &Option<Vec<serde_json::Value>>, needle: &str) -> Option<String> {
    let list = side_data.as_ref()?;
    list.iter()
        .find(|entry| {
            entry
                .get("side_data_type")
                .and_then(|v| v.as_str())
                .map(|s| s.to_lowercase().contains(needle))
                .unwrap_or(false)
        })
        .map(|entry| entry.to_string())
}

fn parse_ffprobe_output(raw: &FfprobeOutput, size_bytes: u64) -> Result<ProbeResult> {
    let mut video = Vec::new();
    let mut audio = Vec::new();
    let mut subtitles = Vec::new();

    for stream in &raw.streams {
        match stream.codec_type.as_str() {
            "video" => {
                let pix_fmt = stream.pix_fmt.clone().unwrap_or_default();
                video.push(VideoStreamInfo {
                    index: stream.index,
                    codec: stream.codec_name.clone().unwrap_or_default(),
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                    bit_depth: bit_depth_from_pix_fmt(&pix_fmt),
                    pix_fmt,
                    fps: stream
                        .r_frame_rate
                        .as_deref()
                        .map(parse_frame_rate)
                        .unwrap_or(0.0),
                    color_primaries: stream.color_primaries.clone(),
                    color_transfer: stream.color_transfer.clone(),
                    color_space: stream.color_space.clone(),
                    master_display: side_data_string(&stream.side_data_list, "mastering display"),
                    max_cll: side_data_string(&stream.side_data_list, "content light level"),
                    dolby_vision_profile: dolby_vision_profile(&stream.side_data_list),
                });
            }
            "audio" => {
                audio.push(AudioStreamInfo {
                    index: stream.index,
                    codec: stream.codec_name.clone().unwrap_or_default(),
                    channels: stream.channels.unwrap_or(2),
                    language: stream_language(&stream.tags),
                    bit_rate: stream.bit_rate.as_deref().and_then(|v| v.parse().ok()),
                });
            }
            "subtitle" => {
                subtitles.push(SubtitleStreamInfo {
                    index: stream.index,
                    codec: stream.codec_name.clone().unwrap_or_default(),
                    language: stream_language(&stream.tags),
                });
            }
            _ => {}
        }
    }

    let format = raw.format.as_ref();
    let duration_secs = format
        .and_then(|f| f.duration.as_deref())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    let bit_rate = format
        .and_then(|f| f.bit_rate.as_deref())
        .and_then(|v| v.parse().ok());
    let display_aspect_ratio = video
        .first()
        .filter(|v| v.height > 0)
        .map(|v| (v.width as f64 / v.height as f64 * 100.0).round() / 100.0);
    let encode_version_tag = raw
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .and_then(|s| stream_tag(&s.tags, "encode_version"));

    Ok(ProbeResult {
        video,
        audio,
        subtitles,
        chapter_count: 0,
        duration_secs,
        size_bytes,
        bit_rate,
        display_aspect_ratio,
        encode_version_tag,
    })
}

async fn run_ffprobe(path: &Path) -> Result<ProbeResult> {
    let path_str = path
        .to_str()
        .ok_or_else(|| VidforgeError::Probe {
            path: path.display().to_string(),
            reason: "path is not valid UTF-8".to_string(),
        })?;

    let size_bytes = tokio::fs::metadata(path).await?.len();

    let output = tokio::process::Command::new("ffprobe")
        .args([
            "-v", "quiet",
            "-print_format", "json",
            "-show_format",
            "-show_streams",
            path_str,
        ])
        .output()
        .await?;

    if !output.status.success() {
        return Err(VidforgeError::Probe {
            path: path_str.to_string(),
            reason: format!(
                "ffprobe exited with status {}",
                output.status.code().unwrap_or(-1)
            ),
        });
    }

    let raw: FfprobeOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
        VidforgeError::Probe {
            path: path_str.to_string(),
            reason: format!("could not parse ffprobe output: {e}"),
        }
    })?;

    parse_ffprobe_output(&raw, size_bytes)
}

/// Resolves the language codes a piece of indexer metadata implies. Kept
/// separate from the HTTP fetch so it is trivially testable.
fn merge_languages(
    existing: &std::collections::BTreeSet<String>,
    indexer_languages: &[String],
) -> std::collections::BTreeSet<String> {
    let mut merged = existing.clone();
    for lang in indexer_languages {
        merged.insert(lang.to_lowercase());
    }
    merged
}

#[derive(Debug, Deserialize)]
struct IndexerResponse {
    #[serde(default)]
    languages: Vec<String>,
}

/// Drives the probe-and-upsert pipeline for a single path at a time. One
/// instance is shared across the watcher's event consumer and the
/// supervisor's on-success path.
pub struct CatalogUpdate {
    catalog: Arc<dyn Catalog>,
    kv: Arc<dyn KvStore>,
    http: reqwest::Client,
    indexer_url: Option<String>,
    target_encode_version: String,
    trash_dir_name: String,
}

impl CatalogUpdate {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        kv: Arc<dyn KvStore>,
        indexer_url: Option<String>,
        target_encode_version: String,
    ) -> Self {
        Self {
            catalog,
            kv,
            http: reqwest::Client::new(),
            indexer_url,
            target_encode_version,
            trash_dir_name: ".trash".to_string(),
        }
    }

    /// Probes and upserts the record for `path`. Silently returns if another
    /// update for the same path is already in flight (the named lock stands
    /// in for the debounce: a burst of watcher events collapses to whichever
    /// update wins the lock).
    pub async fn update(&self, raw_path: &str) -> Result<()> {
        let path = raw_path.trim();
        let lock_key = format!("catalog-update:{path}");
        let lock = match NamedLock::try_acquire(self.kv.as_ref(), &lock_key, PATH_LOCK_TTL).await? {
            Some(lock) => lock,
            None => {
                debug!(path, "update already in flight, skipping");
                return Ok(());
            }
        };
        let result = self.update_locked(path).await;
        if let Err(err) = lock.release().await {
            warn!(path, error = %err, "failed to release catalog-update lock");
        }
        result
    }

    async fn update_locked(&self, path: &str) -> Result<()> {
        let fs_path = Path::new(path);
        if tokio::fs::metadata(fs_path).await.is_err() {
            return self.handle_missing(path).await;
        }

        let existing = self.catalog.find_one_by_path(path).await?;
        let fingerprint = fingerprint_file(fs_path).await?;

        let probe = if let Some(record) = &existing {
            if record.file_hash.as_deref() == Some(fingerprint.as_str()) && record.probe.is_some() {
                record.probe.clone().expect("checked above")
            } else {
                self.probe_and_validate(fs_path).await?
            }
        } else {
            self.probe_and_validate(fs_path).await?
        };

        let audio_language = self.resolve_languages(path, &existing, &probe).await;

        let video_codec = probe.primary_video().map(|v| v.codec.as_str());
        let priority = effective_priority(
            existing.as_ref().map(|r| r.sort_fields.priority),
            probe.size_bytes,
            video_codec,
        );

        let status = if probe
            .encode_version_tag
            .as_deref()
            .map(|tag| tag == self.target_encode_version)
            .unwrap_or(false)
        {
            FileStatus::Complete
        } else {
            FileStatus::Pending
        };

        let width = probe.primary_video().map(|v| v.width).unwrap_or(0);
        let compute_score = crate::planner::compute_score(&probe);
        let encode_version = probe.encode_version_tag.clone().unwrap_or_default();
        let probe_json = serde_json::to_value(&probe)?;

        match existing {
            Some(record) => self.apply_update(record, probe_json, fingerprint, audio_language, priority, status, width, probe.size_bytes, compute_score, encode_version).await,
            None => self.insert_new(path, probe_json, fingerprint, audio_language, priority, status, width, probe.size_bytes, compute_score, encode_version).await,
        }
    }

    async fn probe_and_validate(&self, fs_path: &Path) -> Result<ProbeResult> {
        let probe = run_ffprobe(fs_path).await?;
        if let Some(video) = probe.primary_video() {
            if let Some(profile) = video.dolby_vision_profile {
                if profile < MIN_SUPPORTED_DOLBY_VISION_PROFILE {
                    self.trash(fs_path).await?;
                    return Err(VidforgeError::Planner(format!(
                        "unsupported dolby vision profile {profile}"
                    )));
                }
            }
        }
        Ok(probe)
    }

    async fn resolve_languages(
        &self,
        path: &str,
        existing: &Option<FileRecord>,
        probe: &ProbeResult,
    ) -> std::collections::BTreeSet<String> {
        let mut languages = existing
            .as_ref()
            .map(|r| r.audio_language.clone())
            .unwrap_or_default();
        for track in &probe.audio {
            if let Some(lang) = &track.language {
                languages.insert(lang.to_lowercase());
            }
        }
        if let Some(base_url) = &self.indexer_url {
            match self.fetch_indexer_languages(base_url, path).await {
                Ok(extra) => languages = merge_languages(&languages, &extra),
                Err(err) => debug!(path, error = %err, "indexer language lookup failed"),
            }
        }
        languages
    }

    async fn fetch_indexer_languages(&self, base_url: &str, path: &str) -> Result<Vec<String>> {
        let response = self
            .http
            .get(format!("{base_url}/languages"))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| VidforgeError::Internal(format!("indexer request failed: {e}")))?;
        let parsed: IndexerResponse = response
            .json()
            .await
            .map_err(|e| VidforgeError::Internal(format!("indexer response invalid: {e}")))?;
        Ok(parsed.languages)
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_update(
        &self,
        record: FileRecord,
        probe_json: serde_json::Value,
        fingerprint: String,
        audio_language: std::collections::BTreeSet<String>,
        priority: i32,
        status: FileStatus,
        width: u32,
        size_bytes: u64,
        compute_score: f64,
        encode_version: String,
    ) -> Result<()> {
        let patch = FileUpdate {
            status: Some(status),
            encode_version: Some(encode_version),
            probe: Some(Some(probe_json)),
            last_probe_at: Some(chrono::Utc::now()),
            file_hash: Some(fingerprint),
            audio_language: Some(audio_language.into_iter().collect()),
            priority: Some(priority),
            width: Some(width as i32),
            size_bytes: Some(size_bytes as i64),
            compute_score: Some(compute_score),
            ..Default::default()
        };
        if let Err(err) = self.catalog.update_one(record.id, &patch).await {
            warn!(path = %record.path, error = %err, "update conflict, retrying once");
            self.catalog.update_one(record.id, &patch).await?;
        }
        info!(path = %record.path, "catalog record refreshed");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_new(
        &self,
        path: &str,
        probe_json: serde_json::Value,
        fingerprint: String,
        audio_language: std::collections::BTreeSet<String>,
        priority: i32,
        status: FileStatus,
        width: u32,
        size_bytes: u64,
        compute_score: f64,
        encode_version: String,
    ) -> Result<()> {
        let mut record = FileRecord::new(path.to_string(), priority);
        record.status = status;
        record.encode_version = encode_version.clone();
        record.probe = serde_json::from_value(probe_json.clone()).ok();
        record.last_probe_at = Some(chrono::Utc::now());
        record.file_hash = Some(fingerprint.clone());
        record.audio_language = audio_language.clone();
        record.compute_score = compute_score;
        record.sort_fields.priority = priority;
        record.sort_fields.width = width;
        record.sort_fields.size = size_bytes;

        // `insert` is `ON CONFLICT (path) DO NOTHING`, so a racing watcher
        // event and supervisor completion never both insert a row; whichever
        // loses the race falls through to the update below so its probe data
        // still lands.
        self.catalog.insert(&record).await?;

        if let Some(existing) = self.catalog.find_one_by_path(path).await? {
            let patch = FileUpdate {
                status: Some(status),
                encode_version: Some(encode_version),
                probe: Some(Some(probe_json)),
                last_probe_at: Some(chrono::Utc::now()),
                file_hash: Some(fingerprint),
                audio_language: Some(audio_language.into_iter().collect()),
                priority: Some(priority),
                width: Some(width as i32),
                size_bytes: Some(size_bytes as i64),
                compute_score: Some(compute_score),
                ..Default::default()
            };
            self.catalog.update_one(existing.id, &patch).await?;
        }
        info!(path, "catalog record created");
        Ok(())
    }

    async fn handle_missing(&self, path: &str) -> Result<()> {
        if let Some(record) = self.catalog.find_one_by_path(path).await? {
            let patch = FileUpdate {
                status: Some(FileStatus::Deleted),
                ..Default::default()
            };
            self.catalog.update_one(record.id, &patch).await?;
            info!(path, "source missing, record marked deleted");
        }
        Ok(())
    }

    /// Moves a rejected source into a sibling trash subtree, leaving its
    /// catalog record for the caller to delete.
    async fn trash(&self, fs_path: &Path) -> Result<()> {
        let parent = fs_path.parent().unwrap_or_else(|| Path::new("."));
        let trash_dir = parent.join(&self.trash_dir_name);
        tokio::fs::create_dir_all(&trash_dir).await?;
        let destination: PathBuf = trash_dir.join(
            fs_path
                .file_name()
                .ok_or_else(|| VidforgeError::Internal("path has no file name".to_string()))?,
        );
        tokio::fs::rename(fs_path, &destination).await?;
        warn!(source = %fs_path.display(), destination = %destination.display(), "moved rejected source to trash");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_priority_buckets() {
        assert_eq!(default_priority(21 * GIB, Some("h264")), PRIORITY_LARGE_FILE);
        assert_eq!(default_priority(GIB / 2, Some("hevc")), PRIORITY_SMALL_HEVC);
        assert_eq!(default_priority(GIB / 2, Some("h264")), PRIORITY_DEFAULT);
    }

    #[test]
    fn manual_priority_below_threshold_is_preserved() {
        assert_eq!(effective_priority(Some(10), 21 * GIB, Some("h264")), 10);
    }

    #[test]
    fn manual_priority_above_threshold_takes_better_of_the_two() {
        assert_eq!(effective_priority(Some(95), 21 * GIB, Some("h264")), 95);
        assert_eq!(effective_priority(Some(99), GIB / 2, Some("h264")), 99);
    }

    #[test]
    fn no_existing_priority_uses_default() {
        assert_eq!(effective_priority(None, 21 * GIB, None), PRIORITY_LARGE_FILE);
    }

    #[test]
    fn frame_rate_parses_fractional_form() {
        assert!((parse_frame_rate("24000/1001") - 23.976).abs() < 0.001);
        assert_eq!(parse_frame_rate("25/1"), 25.0);
    }

    #[test]
    fn bit_depth_detected_from_pix_fmt() {
        assert_eq!(bit_depth_from_pix_fmt("yuv420p10le"), 10);
        assert_eq!(bit_depth_from_pix_fmt("yuv420p12be"), 12);
        assert_eq!(bit_depth_from_pix_fmt("yuv420p"), 8);
    }

    #[test]
    fn merge_languages_lowercases_and_dedupes() {
        let mut existing = std::collections::BTreeSet::new();
        existing.insert("eng".to_string());
        let merged = merge_languages(&existing, &["ENG".to_string(), "fra".to_string()]);
        assert_eq!(merged.len(), 2);
        assert!(merged.contains("eng"));
        assert!(merged.contains("fra"));
    }
}
