//! Restart policy for one worker slot
//!
//! Backoff doubles per consecutive failure, capped at `backoff-max-secs`.
//! Once `max-restarts` restarts fall inside `restart-window-secs`, the next
//! failure opens the slot's circuit and no further restart is scheduled.
//! A worker that stays up for `stable-uptime-secs` resets the failure streak.

use crate::config::SupervisorConfig;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub stable_uptime: Duration,
}

impl From<&SupervisorConfig> for RestartPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            backoff_max: Duration::from_secs(config.backoff_max_secs),
            max_restarts: config.max_restarts,
            restart_window: Duration::from_secs(config.restart_window_secs),
            stable_uptime: Duration::from_secs(config.stable_uptime_secs),
        }
    }
}

impl RestartPolicy {
    /// `min(base * 2^failures, max)`
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    RestartAfter(Duration),
    CircuitOpen,
}

/// Failure history of one slot
#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicy,
    failures: u32,
    restarts: VecDeque<Instant>,
    open: bool,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            restarts: VecDeque::new(),
            open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a crash at `now` and decides what happens next
    pub fn on_failure(&mut self, now: Instant) -> RestartDecision {
        if self.open {
            return RestartDecision::CircuitOpen;
        }

        while let Some(oldest) = self.restarts.front() {
            if now.saturating_duration_since(*oldest) > self.policy.restart_window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }

        if self.restarts.len() as u32 >= self.policy.max_restarts {
            self.open = true;
            return RestartDecision::CircuitOpen;
        }

        let delay = self.policy.backoff(self.failures);
        self.failures += 1;
        self.restarts.push_back(now);
        RestartDecision::RestartAfter(delay)
    }

    /// Resets the failure streak once a worker started at `started_at` has
    /// been up long enough
    pub fn on_running(&mut self, started_at: Instant, now: Instant) {
        if self.failures > 0
            && now.saturating_duration_since(started_at) >= self.policy.stable_uptime
        {
            tracing::debug!("Worker stable, resetting failure streak of {}", self.failures);
            self.failures = 0;
            self.restarts.clear();
        }
    }
}
