pub mod candidate;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::resource::ResourcePenalties;
use crate::types::{FileId, JobAction, JobDescriptor, JobKind, RunningJob};
use candidate::candidate_query;
use vidforge_config::Settings;

/// How many blocked passes at the leader's own priority are tolerated
/// before same-priority candidates are allowed to cut in front of it.
const STARVATION_THRESHOLD: u32 = 5;

/// Max candidates fetched from the generator per tick.
const CANDIDATES_PER_TICK: i64 = 50;

const POLL_DELAY_GROWTH: f64 = 1.5;

/// Shared running-job set. The driver is the only writer; everyone else
/// (the flusher, status reads) sees a cloned snapshot.
pub type RunningSet = Arc<RwLock<HashMap<FileId, RunningJob>>>;

/// Implemented by whatever actually executes an admitted job (the encoder
/// supervisor for the transcode pool, the integrity checker for the other).
/// Takes ownership of the running-job entry's lifecycle: it must remove its
/// own entry from `running` when it finishes, success or failure.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, descriptor: JobDescriptor, running: RunningSet, shutdown: CancellationToken);
}

#[derive(Debug, Default, Clone)]
struct SchedulerState {
    blocked_leader: Option<FileId>,
    starvation_counter: u32,
    poll_delay: Option<Duration>,
}

/// Pure selection logic extracted from the driver loop so it can be tested
/// without a catalog or resource controller. Mutates `state`'s blocked
/// leader / starvation bookkeeping as a side effect of the scan.
fn select_admission<'a>(
    candidates: &'a [JobDescriptor],
    running: &std::collections::HashSet<FileId>,
    headroom: f64,
    state: &mut SchedulerState,
) -> Option<&'a JobDescriptor> {
    let leader = candidates.iter().find(|c| c.compute_score > headroom);

    match leader {
        Some(leader) => {
            if state.blocked_leader == Some(leader.id) {
                state.starvation_counter += 1;
            } else {
                state.blocked_leader = Some(leader.id);
                state.starvation_counter = 0;
            }
        }
        None => {
            state.blocked_leader = None;
            state.starvation_counter = 0;
        }
    }

    for candidate in candidates {
        if running.contains(&candidate.id) {
            continue;
        }
        if candidate.compute_score > headroom {
            continue;
        }
        if let Some(leader) = leader {
            if candidate.id == leader.id {
                continue;
            }
            if candidate.sort_fields.priority > leader.sort_fields.priority {
                continue;
            }
            if candidate.sort_fields.priority == leader.sort_fields.priority
                && state.starvation_counter < STARVATION_THRESHOLD
            {
                continue;
            }
        }
        return Some(candidate);
    }
    None
}

/// One of the two scheduler instances (transcode, integrity). A single
/// cooperative driver task per instance; admissions within one instance
/// are totally ordered.
pub struct Scheduler {
    kind: JobKind,
    catalog: Arc<dyn Catalog>,
    runner: Arc<dyn JobRunner>,
    penalties: ResourcePenalties,
    settings: Arc<Settings>,
    running: RunningSet,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        kind: JobKind,
        catalog: Arc<dyn Catalog>,
        runner: Arc<dyn JobRunner>,
        penalties: ResourcePenalties,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            kind,
            catalog,
            runner,
            penalties,
            settings,
            running: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn running_set(&self) -> RunningSet {
        self.running.clone()
    }

    /// Read-only: min(memory_headroom, cpu_headroom) minus jobs currently
    /// in flight.
    pub async fn available_compute(&self) -> f64 {
        let used: f64 = self.running.read().await.values().map(|j| j.compute_score).sum();
        self.headroom_with_used(used)
    }

    fn headroom_with_used(&self, used: f64) -> f64 {
        let memory_headroom = self.settings.max_memory_score - self.penalties.memory_penalty() - used;
        let cpu_headroom = self.settings.max_cpu_score - self.penalties.cpu_penalty() - used;
        memory_headroom.min(cpu_headroom)
    }

    pub async fn running_jobs(&self) -> Vec<RunningJob> {
        self.running.read().await.values().cloned().collect()
    }

    /// Stops admitting new work; in-flight jobs keep draining until they
    /// finish on their own.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Begins the main loop. Idempotent in the sense that calling it twice
    /// just spawns a second independent driver; callers are expected to
    /// call it once per `Scheduler`.
    pub async fn start(self: Arc<Self>) {
        let mut state = SchedulerState::default();
        let base_delay = self.settings.poll_delay;
        let max_delay = self.settings.max_poll_delay;
        let mut poll_delay = base_delay;

        loop {
            if self.shutdown.is_cancelled() {
                info!(kind = ?self.kind, "scheduler driver stopping");
                break;
            }

            self.evict_stalled_jobs().await;

            let used: f64 = self
                .running
                .read()
                .await
                .values()
                .map(|j| j.compute_score)
                .sum();
            let headroom = self.headroom_with_used(used);

            if headroom <= 0.0 {
                debug!(kind = ?self.kind, headroom, "no headroom, backing off");
                self.sleep_or_stop(poll_delay).await;
                continue;
            }

            if self.any_running_in_io_stage().await {
                debug!(kind = ?self.kind, "io stage in progress, admitting nothing this pass");
                self.sleep_or_stop(poll_delay).await;
                continue;
            }

            let running_ids: std::collections::HashSet<FileId> =
                self.running.read().await.keys().copied().collect();

            let query = candidate_query(
                self.kind,
                &self.settings.encode_version,
                running_ids.iter().copied().collect(),
                CANDIDATES_PER_TICK,
            );
            let candidates = match self.catalog.find(&query).await {
                Ok(c) => c,
                Err(err) => {
                    warn!(kind = ?self.kind, error = %err, "candidate query failed, retrying next tick");
                    self.sleep_or_stop(poll_delay).await;
                    continue;
                }
            };

            if candidates.is_empty() {
                poll_delay = Duration::from_secs_f64(
                    (poll_delay.as_secs_f64() * POLL_DELAY_GROWTH).min(max_delay.as_secs_f64()),
                );
                self.sleep_or_stop(poll_delay).await;
                continue;
            }

            let selected = select_admission(&candidates, &running_ids, headroom, &mut state)
                .cloned();

            match selected {
                Some(descriptor) => {
                    poll_delay = base_delay;
                    self.admit(descriptor).await;
                }
                None => {
                    self.sleep_or_stop(poll_delay).await;
                }
            }
        }
    }

    async fn admit(&self, descriptor: JobDescriptor) {
        let running = RunningJob::from_descriptor(&descriptor, JobAction::Preflight, String::new());
        self.running.write().await.insert(descriptor.id, running);
        info!(kind = ?self.kind, file_id = %descriptor.id, path = %descriptor.path, "admitted job");

        let runner = self.runner.clone();
        let running_set = self.running.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            runner.run(descriptor, running_set, shutdown).await;
        });
    }

    async fn any_running_in_io_stage(&self) -> bool {
        self.running
            .read()
            .await
            .values()
            .any(|j| j.action.is_io_stage())
    }

    async fn evict_stalled_jobs(&self) {
        let stall_after = chrono::Duration::from_std(self.settings.stalled_job_after)
            .unwrap_or_else(|_| chrono::Duration::hours(8));
        let now = chrono::Utc::now();
        let mut running = self.running.write().await;
        let stalled: Vec<FileId> = running
            .iter()
            .filter(|(_, job)| job.is_stalled(now, stall_after))
            .map(|(id, _)| *id)
            .collect();
        for id in stalled {
            warn!(file_id = %id, "evicting stalled running-job entry");
            running.remove(&id);
        }
    }

    async fn sleep_or_stop(&self, delay: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SortFields;

    fn descriptor(id: u128, priority: i32, compute_score: f64) -> JobDescriptor {
        JobDescriptor {
            id: FileId(uuid::Uuid::from_u128(id)),
            path: format!("/media/{id}.mkv"),
            compute_score,
            sort_fields: SortFields {
                priority,
                size: 0,
                width: 0,
            },
        }
    }

    // One leader (compute_score 3) vs ten small same-priority jobs
    // (compute_score 0.25), headroom 2.
    #[test]
    fn starvation_protection_blocks_until_threshold_then_admits() {
        let leader = descriptor(1, 10, 3.0);
        let mut candidates = vec![leader.clone()];
        for i in 0..10 {
            candidates.push(descriptor(100 + i, 10, 0.25));
        }
        let running = std::collections::HashSet::new();
        let mut state = SchedulerState::default();

        for pass in 0..4 {
            let selected = select_admission(&candidates, &running, 2.0, &mut state);
            assert!(
                selected.is_none(),
                "pass {pass} should admit nothing while starvation_counter < 5"
            );
            assert_eq!(state.blocked_leader, Some(leader.id));
        }
        assert_eq!(state.starvation_counter, 3);

        // pass 5 (starvation_counter reaches 5 on the 4th *re-detection*,
        // i.e. this call observes counter==4 going into it and bumps to 5,
        // after which small jobs are allowed).
        let _ = select_admission(&candidates, &running, 2.0, &mut state);
        assert_eq!(state.starvation_counter, 4);
        let selected = select_admission(&candidates, &running, 2.0, &mut state);
        assert_eq!(state.starvation_counter, 5);
        assert!(selected.is_some());
        assert_ne!(selected.unwrap().id, leader.id);
    }

    #[test]
    fn blocked_leader_resets_when_it_changes() {
        let a = descriptor(1, 5, 3.0);
        let b = descriptor(2, 5, 3.0);
        let running = std::collections::HashSet::new();
        let mut state = SchedulerState::default();

        select_admission(std::slice::from_ref(&a), &running, 1.0, &mut state);
        select_admission(std::slice::from_ref(&a), &running, 1.0, &mut state);
        assert_eq!(state.starvation_counter, 1);

        select_admission(std::slice::from_ref(&b), &running, 1.0, &mut state);
        assert_eq!(state.blocked_leader, Some(b.id));
        assert_eq!(state.starvation_counter, 0);
    }

    #[test]
    fn better_priority_candidate_is_never_blocked_by_worse_leader() {
        // If the best-priority candidate itself doesn't fit, it becomes
        // the leader and nothing is admitted.
        let leader = descriptor(1, 1, 5.0);
        let worse = descriptor(2, 5, 0.5);
        let candidates = vec![leader.clone(), worse];
        let running = std::collections::HashSet::new();
        let mut state = SchedulerState::default();
        let selected = select_admission(&candidates, &running, 2.0, &mut state);
        assert!(selected.is_none());
        assert_eq!(state.blocked_leader, Some(leader.id));
    }

    #[test]
    fn no_duplicate_admission_of_running_job() {
        let a = descriptor(1, 1, 0.5);
        let mut running = std::collections::HashSet::new();
        running.insert(a.id);
        let mut state = SchedulerState::default();
        let selected = select_admission(std::slice::from_ref(&a), &running, 5.0, &mut state);
        assert!(selected.is_none());
    }
}
