//! Supervision loop over all worker slots
//!
//! Time is passed in explicitly: [`Supervisor::tick`] takes the current
//! instant so restart timing can be driven step by step.

use super::launcher::{WorkerHandle, WorkerLauncher, WorkerSpec};
use super::policy::{RestartDecision, RestartPolicy, RestartTracker};
use crate::config::SupervisorConfig;
use crate::health::{HealthReport, HealthSink, HealthStatus};
use crate::state::WorkerRole;
use crate::storage::JobStore;
use crate::{FleetError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Interval between exit checks while stopping workers
const STOP_POLL: Duration = Duration::from_millis(100);

/// Something the supervisor did during a tick
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Launched { spec: WorkerSpec, pid: Option<u32> },
    Exited { spec: WorkerSpec, detail: String },
    Stale { spec: WorkerSpec },
    RestartScheduled { spec: WorkerSpec, delay: Duration },
    CircuitOpened { spec: WorkerSpec },
}

enum SlotState {
    Pending { not_before: Instant },
    Running {
        handle: Box<dyn WorkerHandle>,
        started_at: Instant,
    },
    Halted,
}

struct Slot {
    spec: WorkerSpec,
    state: SlotState,
}

/// Keeps the desired replicas of every role alive
pub struct Supervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    heartbeats: Option<Arc<dyn JobStore>>,
    sink: Arc<dyn HealthSink>,
    slots: Vec<Slot>,
    /// Failure history per slot, so a stable sibling cannot reset a crashing one
    trackers: HashMap<WorkerSpec, RestartTracker>,
}

impl Supervisor {
    /// Creates a supervisor for `listener:1`, `extractor:N`, `monitor:1`
    ///
    /// # Arguments
    ///
    /// * `config` - Replica count, backoff and circuit settings
    /// * `launcher` - Starts worker processes
    /// * `heartbeats` - Store read for heartbeat freshness; `None` checks process liveness only
    /// * `sink` - Receives fatal alerts
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn WorkerLauncher>,
        heartbeats: Option<Arc<dyn JobStore>>,
        sink: Arc<dyn HealthSink>,
    ) -> Self {
        let mut specs = vec![WorkerSpec::new(WorkerRole::Listener, 0)];
        specs.extend((0..config.extractor_workers).map(|slot| WorkerSpec::new(WorkerRole::Extractor, slot)));
        specs.push(WorkerSpec::new(WorkerRole::Monitor, 0));

        let policy = RestartPolicy::from(&config);
        let trackers = specs
            .iter()
            .map(|spec| (*spec, RestartTracker::new(policy.clone())))
            .collect();
        let now = Instant::now();
        let slots = specs
            .into_iter()
            .map(|spec| Slot {
                spec,
                state: SlotState::Pending { not_before: now },
            })
            .collect();

        Self {
            config,
            launcher,
            heartbeats,
            sink,
            slots,
            trackers,
        }
    }

    /// Whether the restart circuit of any slot of `role` has opened
    pub fn circuit_open(&self, role: WorkerRole) -> bool {
        self.trackers
            .iter()
            .any(|(spec, tracker)| spec.role == role && tracker.is_open())
    }

    /// Number of slots with a live process
    pub fn running(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Running { .. }))
            .count()
    }

    /// Launches every slot in startup order (listener, extractors, monitor)
    pub async fn start(&mut self, now: Instant) -> Vec<SupervisorEvent> {
        for slot in &mut self.slots {
            slot.state = SlotState::Pending { not_before: now };
        }
        self.tick(now).await
    }

    /// One supervision pass
    ///
    /// Running slots are checked for exit and heartbeat staleness; pending
    /// slots whose backoff elapsed are launched.
    pub async fn tick(&mut self, now: Instant) -> Vec<SupervisorEvent> {
        let mut events = Vec::new();
        let stale = self.stale_specs(now);

        for index in 0..self.slots.len() {
            let due = matches!(
                self.slots[index].state,
                SlotState::Pending { not_before } if not_before <= now
            );
            let failure = if due {
                self.launch(index, now, &mut events).await
            } else {
                self.check_running(index, now, &stale, &mut events)
            };

            if let Some(message) = failure {
                self.handle_failure(index, message, now, &mut events);
            }
        }
        events
    }

    /// Launches a due slot; returns a failure message if it cannot start
    async fn launch(
        &mut self,
        index: usize,
        now: Instant,
        events: &mut Vec<SupervisorEvent>,
    ) -> Option<String> {
        let spec = self.slots[index].spec;
        match self.launcher.launch(&spec).await {
            Ok(handle) => {
                let pid = handle.pid();
                tracing::info!(role = %spec.role, slot = spec.slot, pid, "Worker started");
                events.push(SupervisorEvent::Launched { spec, pid });
                self.slots[index].state = SlotState::Running {
                    handle,
                    started_at: now,
                };
                None
            }
            Err(e) => Some(e.to_string()),
        }
    }

    /// Checks a running slot for exit or a stale heartbeat
    fn check_running(
        &mut self,
        index: usize,
        now: Instant,
        stale: &[WorkerSpec],
        events: &mut Vec<SupervisorEvent>,
    ) -> Option<String> {
        let spec = self.slots[index].spec;
        let SlotState::Running { handle, started_at } = &mut self.slots[index].state else {
            return None;
        };

        match handle.try_exit() {
            Ok(Some(exit)) => {
                events.push(SupervisorEvent::Exited {
                    spec,
                    detail: exit.to_string(),
                });
                Some(format!("exited with {}", exit))
            }
            Err(e) => Some(format!("cannot poll process: {}", e)),
            Ok(None) if stale.contains(&spec) => {
                handle.kill();
                events.push(SupervisorEvent::Stale { spec });
                Some("heartbeat stale".to_string())
            }
            Ok(None) => {
                let started_at = *started_at;
                if let Some(tracker) = self.trackers.get_mut(&spec) {
                    tracker.on_running(started_at, now);
                }
                None
            }
        }
    }

    fn handle_failure(
        &mut self,
        index: usize,
        message: String,
        now: Instant,
        events: &mut Vec<SupervisorEvent>,
    ) {
        let spec = self.slots[index].spec;
        let crash = FleetError::ProcessCrash {
            role: spec.to_string(),
            message,
        };
        tracing::warn!(role = %spec.role, slot = spec.slot, "{}", crash);

        let Some(tracker) = self.trackers.get_mut(&spec) else {
            return;
        };
        let was_open = tracker.is_open();

        match tracker.on_failure(now) {
            RestartDecision::RestartAfter(delay) => {
                tracing::info!(role = %spec.role, slot = spec.slot, "Restarting in {:?}", delay);
                events.push(SupervisorEvent::RestartScheduled { spec, delay });
                self.slots[index].state = SlotState::Pending {
                    not_before: now + delay,
                };
            }
            RestartDecision::CircuitOpen => {
                self.slots[index].state = SlotState::Halted;
                if !was_open {
                    events.push(SupervisorEvent::CircuitOpened { spec });
                    tracing::error!(role = %spec.role, slot = spec.slot, "Restart circuit open, not restarting");
                    self.sink.report(&HealthReport::new(
                        spec.role.as_str(),
                        HealthStatus::Fatal,
                        format!(
                            "{} restarts within {}s; automatic restarts stopped ({})",
                            self.config.max_restarts, self.config.restart_window_secs, crash
                        ),
                    ));
                }
            }
        }
    }

    /// Running slots whose heartbeat is missing or older than the stale limit
    fn stale_specs(&self, now: Instant) -> Vec<WorkerSpec> {
        let Some(store) = &self.heartbeats else {
            return Vec::new();
        };
        let beats = match store.heartbeats() {
            Ok(beats) => beats,
            Err(e) => {
                tracing::warn!("Cannot read heartbeats: {}", e);
                return Vec::new();
            }
        };

        let limit = Duration::from_secs(self.config.heartbeat_stale_secs);
        let wall_now = Utc::now();

        self.slots
            .iter()
            .filter_map(|slot| match &slot.state {
                SlotState::Running { handle, started_at } => {
                    // a fresh process gets one full stale period to write its first beat
                    if now.saturating_duration_since(*started_at) < limit {
                        return None;
                    }
                    let fresh = beats.iter().any(|b| {
                        b.role == slot.spec.role.as_str()
                            && b.slot == slot.spec.slot
                            && Some(b.pid) == handle.pid()
                            && (wall_now - b.beat_at).num_seconds() <= limit.as_secs() as i64
                    });
                    (!fresh).then_some(slot.spec)
                }
                _ => None,
            })
            .collect()
    }

    /// Stops workers role by role in shutdown order
    ///
    /// Each group is asked to terminate and given `shutdown-grace-secs`;
    /// stragglers are killed.
    pub async fn shutdown(&mut self) {
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let mut ranks: Vec<u8> = self.slots.iter().map(|s| s.spec.role.shutdown_rank()).collect();
        ranks.sort_unstable();
        ranks.dedup();

        for rank in ranks {
            let group: Vec<usize> = (0..self.slots.len())
                .filter(|i| self.slots[*i].spec.role.shutdown_rank() == rank)
                .collect();
            self.stop_group(&group, grace).await;
        }
        tracing::info!("All workers stopped");
    }

    async fn stop_group(&mut self, group: &[usize], grace: Duration) {
        for &index in group {
            let spec = self.slots[index].spec;
            if let SlotState::Running { handle, .. } = &mut self.slots[index].state {
                tracing::info!(worker = %spec, "Stopping worker");
                handle.terminate();
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            let mut remaining = 0;
            for &index in group {
                let slot = &mut self.slots[index];
                if let SlotState::Running { handle, .. } = &mut slot.state {
                    match handle.try_exit() {
                        Ok(Some(_)) | Err(_) => slot.state = SlotState::Halted,
                        Ok(None) => remaining += 1,
                    }
                }
            }
            if remaining == 0 {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(STOP_POLL).await;
        }

        for &index in group {
            let slot = &mut self.slots[index];
            if let SlotState::Running { handle, .. } = &mut slot.state {
                tracing::warn!(worker = %slot.spec, "Grace period over, killing worker");
                handle.kill();
                slot.state = SlotState::Halted;
            }
        }
    }
}
