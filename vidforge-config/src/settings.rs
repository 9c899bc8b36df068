use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result};

/// Raw, TOML-shaped configuration. Durations are plain strings
/// (`"5s"`, `"15s"`, `"8h"`) parsed with `humantime` after deserialization,
/// matching the human-friendly values an operator would hand-edit.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSettings {
    pub sources: Vec<RawSourceConfig>,
    #[serde(default = "default_file_ext")]
    pub file_ext: Vec<String>,
    pub encode_version: String,
    #[serde(default = "default_max_memory_score")]
    pub max_memory_score: f64,
    #[serde(default = "default_max_cpu_score")]
    pub max_cpu_score: f64,
    #[serde(default = "default_concurrent_integrity_checks")]
    pub concurrent_integrity_checks: usize,
    #[serde(default = "default_poll_delay")]
    pub poll_delay: String,
    #[serde(default = "default_resource_poll_interval")]
    pub resource_poll_interval: String,
    #[serde(default = "default_max_poll_delay")]
    pub max_poll_delay: String,
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout: String,
    #[serde(default = "default_preflight_timeout")]
    pub preflight_timeout: String,
    #[serde(default = "default_stalled_job_after")]
    pub stalled_job_after: String,
    #[serde(default = "default_stderr_ring_lines")]
    pub stderr_ring_lines: usize,
    #[serde(default)]
    pub resource_thresholds: RawResourceThresholds,
    pub catalog_url: String,
    pub kv_url: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub indexer_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSourceConfig {
    pub path: PathBuf,
    pub scratch: PathBuf,
    #[serde(default)]
    pub stage_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawResourceThresholds {
    #[serde(default = "default_memory_warn_pct")]
    pub memory_warn_pct: f64,
    #[serde(default = "default_memory_critical_pct")]
    pub memory_critical_pct: f64,
    #[serde(default = "default_cpu_warn_ratio")]
    pub cpu_warn_ratio: f64,
    #[serde(default = "default_cpu_critical_ratio")]
    pub cpu_critical_ratio: f64,
}

impl Default for RawResourceThresholds {
    fn default() -> Self {
        Self {
            memory_warn_pct: default_memory_warn_pct(),
            memory_critical_pct: default_memory_critical_pct(),
            cpu_warn_ratio: default_cpu_warn_ratio(),
            cpu_critical_ratio: default_cpu_critical_ratio(),
        }
    }
}

fn default_file_ext() -> Vec<String> {
    vec!["mkv", "mp4", "avi", "m4v", "ts"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_max_memory_score() -> f64 {
    4.0
}
fn default_max_cpu_score() -> f64 {
    4.0
}
fn default_concurrent_integrity_checks() -> usize {
    1
}
fn default_poll_delay() -> String {
    "5s".to_string()
}
fn default_resource_poll_interval() -> String {
    "5s".to_string()
}
fn default_max_poll_delay() -> String {
    "15s".to_string()
}
fn default_flush_interval() -> String {
    "5s".to_string()
}
fn default_stage_timeout() -> String {
    "30m".to_string()
}
fn default_preflight_timeout() -> String {
    "1h".to_string()
}
fn default_stalled_job_after() -> String {
    "8h".to_string()
}
fn default_stderr_ring_lines() -> usize {
    500
}
fn default_memory_warn_pct() -> f64 {
    85.0
}
fn default_memory_critical_pct() -> f64 {
    90.0
}
fn default_cpu_warn_ratio() -> f64 {
    4.0
}
fn default_cpu_critical_ratio() -> f64 {
    6.0
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

/// Resolved, typed configuration used by the rest of the crate.
#[derive(Debug, Clone)]
pub struct Settings {
    pub sources: Vec<SourceConfig>,
    pub file_ext: Vec<String>,
    pub encode_version: String,
    pub max_memory_score: f64,
    pub max_cpu_score: f64,
    pub concurrent_integrity_checks: usize,
    pub poll_delay: Duration,
    pub resource_poll_interval: Duration,
    pub max_poll_delay: Duration,
    pub flush_interval: Duration,
    pub stage_timeout: Duration,
    pub preflight_timeout: Duration,
    pub stalled_job_after: Duration,
    pub stderr_ring_lines: usize,
    pub resource_thresholds: ResourceThresholds,
    pub catalog_url: String,
    pub kv_url: String,
    pub output_dir: PathBuf,
    pub indexer_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub path: PathBuf,
    pub scratch: PathBuf,
    pub stage_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceThresholds {
    pub memory_warn_pct: f64,
    pub memory_critical_pct: f64,
    pub cpu_warn_ratio: f64,
    pub cpu_critical_ratio: f64,
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|_| ConfigError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
    })
}

impl Settings {
    pub fn from_raw(raw: RawSettings) -> Result<Self> {
        if raw.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        let sources = raw
            .sources
            .into_iter()
            .map(|s| SourceConfig {
                path: s.path,
                scratch: s.scratch,
                stage_path: s.stage_path,
            })
            .collect();

        Ok(Settings {
            sources,
            file_ext: raw.file_ext,
            encode_version: raw.encode_version,
            max_memory_score: raw.max_memory_score,
            max_cpu_score: raw.max_cpu_score,
            concurrent_integrity_checks: raw.concurrent_integrity_checks,
            poll_delay: parse_duration("poll_delay", &raw.poll_delay)?,
            resource_poll_interval: parse_duration(
                "resource_poll_interval",
                &raw.resource_poll_interval,
            )?,
            max_poll_delay: parse_duration("max_poll_delay", &raw.max_poll_delay)?,
            flush_interval: parse_duration("flush_interval", &raw.flush_interval)?,
            stage_timeout: parse_duration("stage_timeout", &raw.stage_timeout)?,
            preflight_timeout: parse_duration("preflight_timeout", &raw.preflight_timeout)?,
            stalled_job_after: parse_duration("stalled_job_after", &raw.stalled_job_after)?,
            stderr_ring_lines: raw.stderr_ring_lines,
            resource_thresholds: ResourceThresholds {
                memory_warn_pct: raw.resource_thresholds.memory_warn_pct,
                memory_critical_pct: raw.resource_thresholds.memory_critical_pct,
                cpu_warn_ratio: raw.resource_thresholds.cpu_warn_ratio,
                cpu_critical_ratio: raw.resource_thresholds.cpu_critical_ratio,
            },
            catalog_url: raw.catalog_url,
            kv_url: raw.kv_url,
            output_dir: raw.output_dir,
            indexer_url: raw.indexer_url,
        })
    }
}
