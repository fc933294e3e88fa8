//! Dependency probes run by the health monitor

use crate::queue::Broker;
use crate::storage::JobStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on a single probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// One checkable dependency
#[async_trait]
pub trait Probe: Send + Sync {
    /// Component name used in reports and gate reasons
    fn component(&self) -> &str;

    /// `Err` carries a human-readable failure detail
    async fn check(&self) -> Result<(), String>;
}

/// Pings the job store
pub struct StoreProbe {
    store: Arc<dyn JobStore>,
}

impl StoreProbe {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Probe for StoreProbe {
    fn component(&self) -> &str {
        "store"
    }

    async fn check(&self) -> Result<(), String> {
        let store = self.store.clone();
        let ping = tokio::task::spawn_blocking(move || store.ping());
        match tokio::time::timeout(PROBE_TIMEOUT, ping).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(e)) => Err(format!("probe task failed: {}", e)),
            Err(_) => Err(format!("no answer within {:?}", PROBE_TIMEOUT)),
        }
    }
}

/// Pings the broker
pub struct BrokerProbe {
    broker: Arc<dyn Broker>,
}

impl BrokerProbe {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Probe for BrokerProbe {
    fn component(&self) -> &str {
        "broker"
    }

    async fn check(&self) -> Result<(), String> {
        match tokio::time::timeout(PROBE_TIMEOUT, self.broker.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no answer within {:?}", PROBE_TIMEOUT)),
        }
    }
}
