//! Fleet startup and shutdown
//!
//! Startup order:
//! 1. Verify the job store
//! 2. Verify the broker
//! 3. Launch the listener, extractors and monitor through the supervisor
//! 4. Supervise until shutdown
//!
//! Shutdown runs in reverse: dispatch is paused, the listener is stopped with
//! its grace period, then extractors and the monitor, then stragglers are
//! killed.

use crate::config::Config;
use crate::health::{BrokerProbe, HealthSink, Probe, StoreProbe};
use crate::queue::Broker;
use crate::storage::JobStore;
use crate::supervisor::{Supervisor, WorkerLauncher};
use crate::{FleetError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Gate reason written while the fleet stops
pub const SHUTDOWN_REASON: &str = "fleet shutting down";

pub struct Orchestrator {
    config: Arc<Config>,
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    launcher: Arc<dyn WorkerLauncher>,
    sink: Arc<dyn HealthSink>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        launcher: Arc<dyn WorkerLauncher>,
        sink: Arc<dyn HealthSink>,
    ) -> Self {
        Self {
            config,
            store,
            broker,
            launcher,
            sink,
        }
    }

    /// Checks both shared dependencies, store first
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Both answered
    /// * `Err(FleetError::DependencyUnavailable)` - Names the first one that did not
    pub async fn verify_dependencies(&self) -> Result<()> {
        let probes: [Box<dyn Probe>; 2] = [
            Box::new(StoreProbe::new(self.store.clone())),
            Box::new(BrokerProbe::new(self.broker.clone())),
        ];
        for probe in probes {
            probe
                .check()
                .await
                .map_err(|message| FleetError::DependencyUnavailable {
                    component: probe.component().to_string(),
                    message,
                })?;
            tracing::info!(component = probe.component(), "Dependency reachable");
        }
        Ok(())
    }

    /// Runs the fleet until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.verify_dependencies().await?;

        // both dependencies answered; a gate left by an earlier shutdown no longer applies
        let gate = self.store.dispatch_gate()?;
        if gate.paused && gate.reason.as_deref() == Some(SHUTDOWN_REASON) {
            self.store.set_dispatch_paused(false, None)?;
        }

        let mut supervisor = Supervisor::new(
            self.config.supervisor.clone(),
            self.launcher.clone(),
            Some(self.store.clone()),
            self.sink.clone(),
        );
        supervisor.start(Instant::now()).await;
        tracing::info!("Fleet started with {} workers", supervisor.running());

        let interval = Duration::from_secs(self.config.supervisor.tick_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    supervisor.tick(Instant::now()).await;
                }
            }
        }

        tracing::info!("Shutting down fleet");
        if let Err(e) = self.store.set_dispatch_paused(true, Some(SHUTDOWN_REASON)) {
            tracing::warn!("Could not pause dispatch before shutdown: {}", e);
        }
        supervisor.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StoreConfig, UserAgentConfig};
    use crate::health::MemorySink;
    use crate::queue::MemoryBroker;
    use crate::storage::SqliteStore;
    use crate::supervisor::{ExitInfo, WorkerHandle, WorkerSpec};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct IdleHandle;

    impl WorkerHandle for IdleHandle {
        fn pid(&self) -> Option<u32> {
            None
        }
        fn try_exit(&mut self) -> Result<Option<ExitInfo>> {
            Ok(None)
        }
        fn terminate(&mut self) {}
        fn kill(&mut self) {}
    }

    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<WorkerSpec>>,
    }

    #[async_trait]
    impl WorkerLauncher for RecordingLauncher {
        async fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerHandle>> {
            self.launched.lock().unwrap().push(*spec);
            Ok(Box::new(IdleHandle))
        }
    }

    fn create_test_config() -> Config {
        let mut config = Config {
            store: StoreConfig {
                database_path: ":memory:".to_string(),
                html_dir: "html".to_string(),
            },
            broker: Default::default(),
            frontier: Default::default(),
            fetch: Default::default(),
            user_agent: UserAgentConfig {
                crawler_name: "TestCrawler".to_string(),
                crawler_version: "1.0".to_string(),
                contact_url: "https://example.com/about".to_string(),
                contact_email: "admin@example.com".to_string(),
            },
            listener: Default::default(),
            supervisor: Default::default(),
            monitor: Default::default(),
        };
        config.supervisor.shutdown_grace_secs = 0;
        config
    }

    #[tokio::test]
    async fn test_unreachable_broker_stops_startup() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_available(false);
        let launcher = Arc::new(RecordingLauncher::default());
        let orchestrator = Orchestrator::new(
            Arc::new(create_test_config()),
            Arc::new(SqliteStore::new_in_memory().unwrap()),
            broker,
            launcher.clone(),
            Arc::new(MemorySink::new()),
        );

        let result = orchestrator.run(CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(FleetError::DependencyUnavailable { ref component, .. }) if component == "broker"
        ));
        assert!(launcher.launched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_launches_fleet_and_pauses_dispatch_on_shutdown() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        store.set_dispatch_paused(true, Some(SHUTDOWN_REASON)).unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let orchestrator = Orchestrator::new(
            Arc::new(create_test_config()),
            store.clone(),
            Arc::new(MemoryBroker::new()),
            launcher.clone(),
            Arc::new(MemorySink::new()),
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(orchestrator.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!store.dispatch_gate().unwrap().paused);
        let roles: Vec<String> = launcher
            .launched
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(roles, vec!["listener#0", "extractor#0", "extractor#1", "monitor#0"]);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        let gate = store.dispatch_gate().unwrap();
        assert!(gate.paused);
        assert_eq!(gate.reason.as_deref(), Some(SHUTDOWN_REASON));
    }
}
