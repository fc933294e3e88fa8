//! Worker process supervision
//!
//! # Components
//!
//! - `RestartTracker`: per-role backoff, flap window and restart circuit
//! - `WorkerLauncher` / `ProcessLauncher`: starts role subcommands as child processes
//! - `Supervisor`: liveness ticks, restarts and ordered shutdown

mod launcher;
mod policy;
mod runner;

pub use launcher::{ExitInfo, ProcessLauncher, WorkerHandle, WorkerLauncher, WorkerSpec};
pub use policy::{RestartDecision, RestartPolicy, RestartTracker};
pub use runner::{Supervisor, SupervisorEvent};
