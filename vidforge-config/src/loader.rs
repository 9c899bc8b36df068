use std::path::Path;

use crate::error::{ConfigError, Result};
use crate::settings::{RawSettings, Settings};

/// Environment variable prefix for concurrency-knob overrides, e.g.
/// `VIDFORGE_MAX_MEMORY_SCORE=3.5`.
const ENV_PREFIX: &str = "VIDFORGE_";

/// Loads configuration from a TOML file, then applies environment
/// variable overrides for every concurrency-related scalar field.
/// `.env` files are loaded first (if present) via `dotenvy`, letting a
/// local `.env` seed `std::env` before overrides are read.
pub fn load(path: impl AsRef<Path>) -> Result<Settings> {
    let _ = dotenvy::dotenv();

    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let mut raw: RawSettings = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    apply_env_overrides(&mut raw)?;

    Settings::from_raw(raw)
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}")).ok()
}

fn override_f64(raw_value: &mut f64, key: &str) -> Result<()> {
    if let Some(v) = env_var(key) {
        *raw_value = v.parse().map_err(|_| ConfigError::InvalidEnvOverride {
            key: format!("{ENV_PREFIX}{key}"),
            value: v.clone(),
            reason: "expected a floating point number".to_string(),
        })?;
    }
    Ok(())
}

fn override_usize(raw_value: &mut usize, key: &str) -> Result<()> {
    if let Some(v) = env_var(key) {
        *raw_value = v.parse().map_err(|_| ConfigError::InvalidEnvOverride {
            key: format!("{ENV_PREFIX}{key}"),
            value: v.clone(),
            reason: "expected a non-negative integer".to_string(),
        })?;
    }
    Ok(())
}

fn override_string(raw_value: &mut String, key: &str) {
    if let Some(v) = env_var(key) {
        *raw_value = v;
    }
}

/// Every concurrency knob gets a `VIDFORGE_`-prefixed override, upper-cased
/// field name.
fn apply_env_overrides(raw: &mut RawSettings) -> Result<()> {
    override_f64(&mut raw.max_memory_score, "MAX_MEMORY_SCORE")?;
    override_f64(&mut raw.max_cpu_score, "MAX_CPU_SCORE")?;
    override_usize(
        &mut raw.concurrent_integrity_checks,
        "CONCURRENT_INTEGRITY_CHECKS",
    )?;
    override_string(&mut raw.poll_delay, "POLL_DELAY");
    override_string(&mut raw.resource_poll_interval, "RESOURCE_POLL_INTERVAL");
    override_string(&mut raw.max_poll_delay, "MAX_POLL_DELAY");
    override_string(&mut raw.flush_interval, "FLUSH_INTERVAL");
    override_string(&mut raw.stage_timeout, "STAGE_TIMEOUT");
    override_string(&mut raw.preflight_timeout, "PREFLIGHT_TIMEOUT");
    override_string(&mut raw.stalled_job_after, "STALLED_JOB_AFTER");
    override_usize(&mut raw.stderr_ring_lines, "STDERR_RING_LINES")?;
    override_f64(
        &mut raw.resource_thresholds.memory_warn_pct,
        "MEMORY_WARN_PCT",
    )?;
    override_f64(
        &mut raw.resource_thresholds.memory_critical_pct,
        "MEMORY_CRITICAL_PCT",
    )?;
    override_f64(
        &mut raw.resource_thresholds.cpu_warn_ratio,
        "CPU_WARN_RATIO",
    )?;
    override_f64(
        &mut raw.resource_thresholds.cpu_critical_ratio,
        "CPU_CRITICAL_RATIO",
    )?;
    override_string(&mut raw.catalog_url, "CATALOG_URL");
    override_string(&mut raw.kv_url, "KV_URL");
    if let Some(v) = env_var("INDEXER_URL") {
        raw.indexer_url = Some(v);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_minimal(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("vidforge.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
encode_version = "h265-v3"
catalog_url = "postgres://localhost/vidforge"
kv_url = "redis://localhost"

[[sources]]
path = "/media/movies"
scratch = "/media/movies/.scratch"
"#
        )
        .unwrap();
        path
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_minimal(&dir);
        let settings = load(&path).unwrap();
        assert_eq!(settings.encode_version, "h265-v3");
        assert_eq!(settings.sources.len(), 1);
        assert_eq!(settings.max_memory_score, 4.0);
        assert_eq!(settings.stderr_ring_lines, 500);
        assert_eq!(settings.max_poll_delay, std::time::Duration::from_secs(15));
    }

    #[test]
    fn rejects_empty_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vidforge.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
encode_version = "h265-v3"
catalog_url = "postgres://localhost/vidforge"
kv_url = "redis://localhost"
sources = []
"#
        )
        .unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::NoSources));
    }

    #[test]
    fn env_override_wins_over_file_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_minimal(&dir);
        std::env::set_var("VIDFORGE_MAX_MEMORY_SCORE", "2.5");
        let settings = load(&path).unwrap();
        std::env::remove_var("VIDFORGE_MAX_MEMORY_SCORE");
        assert_eq!(settings.max_memory_score, 2.5);
    }
}
