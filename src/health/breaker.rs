//! Per-dependency circuit breaker
//!
//! # State Machine
//!
//! ```text
//! Closed   --[failure_threshold consecutive failures]--> Open
//! Open     --[first success]-----------------------------> HalfOpen
//! HalfOpen --[success_threshold consecutive successes]---> Closed
//! HalfOpen --[any failure]-------------------------------> Open
//! ```
//!
//! The success that moves an open breaker to half-open counts toward the
//! closing streak.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Whether the dependency should hold dispatch paused
    pub fn blocks_dispatch(&self) -> bool {
        !matches!(self, BreakerState::Closed)
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        })
    }
}

/// Breaker fed with probe results
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Feeds one probe result and returns the new state
    pub fn record(&mut self, healthy: bool) -> BreakerState {
        if healthy {
            self.record_success()
        } else {
            self.record_failure()
        }
    }

    pub fn record_success(&mut self) -> BreakerState {
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;

        match self.state {
            BreakerState::Closed => {}
            BreakerState::Open => {
                self.state = BreakerState::HalfOpen;
                if self.consecutive_successes >= self.success_threshold {
                    self.close();
                }
            }
            BreakerState::HalfOpen => {
                if self.consecutive_successes >= self.success_threshold {
                    self.close();
                }
            }
        }
        self.state
    }

    pub fn record_failure(&mut self) -> BreakerState {
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;

        match self.state {
            BreakerState::Closed => {
                if self.consecutive_failures >= self.failure_threshold {
                    self.state = BreakerState::Open;
                }
            }
            BreakerState::HalfOpen => self.state = BreakerState::Open,
            BreakerState::Open => {}
        }
        self.state
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_successes = 0;
    }
}
