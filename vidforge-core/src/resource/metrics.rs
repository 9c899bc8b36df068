use crate::error::{Result, VidforgeError};

/// Abstraction over the host metrics the resource controller samples.
/// Exists so the samplers can be driven by a fake in tests instead of
/// reading `/proc`.
pub trait SystemMetrics: Send + Sync + 'static {
    /// Fraction (0.0-100.0) of memory currently in use, derived from total
    /// vs. available memory.
    fn memory_used_pct(&self) -> Result<f64>;

    /// 1-minute load average divided by core count.
    fn cpu_load_ratio(&self) -> Result<f64>;
}

/// Reads `/proc/meminfo` and `/proc/loadavg`, the conventional Linux
/// sources for this data (the host the daemon shares with its encoder
/// children is assumed to be Linux, matching the deployment target).
#[derive(Debug, Default)]
pub struct ProcMetrics {
    cores: usize,
}

impl ProcMetrics {
    pub fn new() -> Self {
        Self {
            cores: num_cpus::get(),
        }
    }
}

impl SystemMetrics for ProcMetrics {
    fn memory_used_pct(&self) -> Result<f64> {
        let text = std::fs::read_to_string("/proc/meminfo")?;
        let mut total_kb: Option<f64> = None;
        let mut available_kb: Option<f64> = None;
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                total_kb = parse_kb_field(rest);
            } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                available_kb = parse_kb_field(rest);
            }
        }
        let (total, available) = match (total_kb, available_kb) {
            (Some(t), Some(a)) => (t, a),
            _ => {
                return Err(VidforgeError::Internal(
                    "/proc/meminfo missing MemTotal or MemAvailable".to_string(),
                ))
            }
        };
        if total <= 0.0 {
            return Ok(0.0);
        }
        Ok(((total - available) / total) * 100.0)
    }

    fn cpu_load_ratio(&self) -> Result<f64> {
        let text = std::fs::read_to_string("/proc/loadavg")?;
        let one_min: f64 = text
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                VidforgeError::Internal("/proc/loadavg had unexpected format".to_string())
            })?;
        let cores = self.cores.max(1) as f64;
        Ok(one_min / cores)
    }
}

fn parse_kb_field(rest: &str) -> Option<f64> {
    rest.trim().split_whitespace().next()?.parse().ok()
}
