//! Dependency health and the dispatch gate
//!
//! # Components
//!
//! - `CircuitBreaker`: closed / open / half-open state per dependency
//! - `Probe`: store and broker reachability checks
//! - `HealthMonitor`: probe loop, gate toggling, stall recovery
//! - `HealthSink`: destination of health reports and fatal alerts

mod breaker;
mod monitor;
mod probes;
mod report;

pub use breaker::{BreakerState, CircuitBreaker};
pub use monitor::{CycleSummary, HealthMonitor};
pub use probes::{BrokerProbe, Probe, StoreProbe, PROBE_TIMEOUT};
pub use report::{HealthReport, HealthSink, HealthStatus, MemorySink, TracingSink};
