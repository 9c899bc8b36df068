pub mod metrics;
mod window;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use metrics::{ProcMetrics, SystemMetrics};
use vidforge_config::Settings;
use window::RollingWindow;

const WINDOW_SAMPLES: usize = 120;

/// Lock-free scalar the samplers write and the scheduler reads on every
/// tick. Plain reads only; samplers never block the scheduler.
#[derive(Debug, Default)]
struct PenaltyCell(AtomicU64);

impl PenaltyCell {
    fn new() -> Self {
        Self(AtomicU64::new(0f64.to_bits()))
    }

    fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Stepped penalty: half the configured max at the first (warn) threshold,
/// the remaining half at the second (critical) threshold. Implemented as
/// two independent schedules (memory, CPU) per the Open Question resolved
/// in DESIGN.md, so a spike in one pool never masks headroom in the other.
fn stepped_penalty(avg: f64, warn_threshold: f64, critical_threshold: f64, max_score: f64) -> f64 {
    let mut penalty = 0.0;
    if avg > warn_threshold {
        penalty += max_score / 2.0;
    }
    if avg > critical_threshold {
        penalty += max_score / 2.0;
    }
    penalty.min(max_score)
}

/// Shared, cheaply-cloneable handle to the current memory/CPU penalty
/// values. The scheduler holds one of these; the resource controller owns
/// the writer side.
#[derive(Debug, Clone)]
pub struct ResourcePenalties {
    memory: Arc<PenaltyCell>,
    cpu: Arc<PenaltyCell>,
}

impl ResourcePenalties {
    pub fn memory_penalty(&self) -> f64 {
        self.memory.get()
    }

    pub fn cpu_penalty(&self) -> f64 {
        self.cpu.get()
    }
}

/// Owns the two independent periodic samplers. Dropping this (or
/// cancelling its token) stops both background tasks.
#[derive(Debug)]
pub struct ResourceController {
    penalties: ResourcePenalties,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ResourceController {
    /// Spawns the memory and CPU samplers as independent periodic tasks.
    pub fn spawn(settings: Arc<Settings>, metrics: Arc<dyn SystemMetrics>) -> Self {
        let penalties = ResourcePenalties {
            memory: Arc::new(PenaltyCell::new()),
            cpu: Arc::new(PenaltyCell::new()),
        };
        let shutdown = CancellationToken::new();

        let memory_handle = tokio::spawn(run_memory_sampler(
            settings.clone(),
            metrics.clone(),
            penalties.memory.clone(),
            shutdown.clone(),
        ));
        let cpu_handle = tokio::spawn(run_cpu_sampler(
            settings,
            metrics,
            penalties.cpu.clone(),
            shutdown.clone(),
        ));

        Self {
            penalties,
            shutdown,
            handles: vec![memory_handle, cpu_handle],
        }
    }

    pub fn penalties(&self) -> ResourcePenalties {
        self.penalties.clone()
    }

    /// Stops both samplers and waits for them to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_memory_sampler(
    settings: Arc<Settings>,
    metrics: Arc<dyn SystemMetrics>,
    cell: Arc<PenaltyCell>,
    shutdown: CancellationToken,
) {
    let mut window = RollingWindow::new(WINDOW_SAMPLES);
    let mut interval = tokio::time::interval(settings.resource_poll_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        match metrics.memory_used_pct() {
            Ok(pct) => {
                window.push(pct);
                let avg = window.average();
                let penalty = stepped_penalty(
                    avg,
                    settings.resource_thresholds.memory_warn_pct,
                    settings.resource_thresholds.memory_critical_pct,
                    settings.max_memory_score,
                );
                cell.set(penalty);
                debug!(avg_used_pct = avg, penalty, "memory sample");
            }
            Err(err) => warn!(error = %err, "memory sample failed"),
        }
    }
}

async fn run_cpu_sampler(
    settings: Arc<Settings>,
    metrics: Arc<dyn SystemMetrics>,
    cell: Arc<PenaltyCell>,
    shutdown: CancellationToken,
) {
    let mut window = RollingWindow::new(WINDOW_SAMPLES);
    let mut interval = tokio::time::interval(settings.resource_poll_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        match metrics.cpu_load_ratio() {
            Ok(ratio) => {
                window.push(ratio);
                let avg = window.average();
                let penalty = stepped_penalty(
                    avg,
                    settings.resource_thresholds.cpu_warn_ratio,
                    settings.resource_thresholds.cpu_critical_ratio,
                    settings.max_cpu_score,
                );
                cell.set(penalty);
                debug!(avg_load_ratio = avg, penalty, "cpu sample");
            }
            Err(err) => warn!(error = %err, "cpu sample failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_penalty_below_warn_threshold() {
        assert_eq!(stepped_penalty(50.0, 85.0, 90.0, 4.0), 0.0);
    }

    #[test]
    fn half_penalty_between_thresholds() {
        assert_eq!(stepped_penalty(87.0, 85.0, 90.0, 4.0), 2.0);
    }

    #[test]
    fn full_penalty_past_critical_threshold() {
        assert_eq!(stepped_penalty(95.0, 85.0, 90.0, 4.0), 4.0);
    }

    #[test]
    fn penalty_never_exceeds_max_score() {
        assert_eq!(stepped_penalty(200.0, 85.0, 90.0, 4.0), 4.0);
    }
}
