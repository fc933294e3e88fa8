//! Liveness beacon written by every worker process

use crate::state::WorkerRole;
use crate::storage::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Writes a heartbeat for `(role, slot)` every `interval` until cancelled
///
/// The first beat is written immediately. Store failures are logged and the
/// beacon keeps going; a stale heartbeat is how the supervisor notices.
pub fn spawn_heartbeat(
    store: Arc<dyn JobStore>,
    role: WorkerRole,
    slot: usize,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let pid = std::process::id();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = store.record_heartbeat(role.as_str(), slot, pid) {
                        tracing::warn!(role = %role, slot, "Failed to write heartbeat: {}", e);
                    }
                }
            }
        }
    })
}
