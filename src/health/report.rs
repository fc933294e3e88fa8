//! Health reports and where they go

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// Unrecoverable without an operator (e.g. a worker circuit opened)
    Fatal,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Fatal => "fatal",
        })
    }
}

/// One observation about one component
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub status: HealthStatus,
    pub detail: String,
}

impl HealthReport {
    pub fn new(component: impl Into<String>, status: HealthStatus, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            component: component.into(),
            status,
            detail: detail.into(),
        }
    }
}

/// Destination of health reports and alerts
pub trait HealthSink: Send + Sync {
    fn report(&self, report: &HealthReport);
}

/// Emits reports as structured tracing events
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl HealthSink for TracingSink {
    fn report(&self, report: &HealthReport) {
        let component = report.component.as_str();
        let detail = report.detail.as_str();
        match report.status {
            HealthStatus::Healthy => {
                tracing::info!(component, status = %report.status, detail, "Health report")
            }
            HealthStatus::Degraded => {
                tracing::warn!(component, status = %report.status, detail, "Health report")
            }
            HealthStatus::Unhealthy | HealthStatus::Fatal => {
                tracing::error!(component, status = %report.status, detail, "Health report")
            }
        }
    }
}

/// Keeps every report in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Mutex<Vec<HealthReport>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<HealthReport> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn with_status(&self, status: HealthStatus) -> Vec<HealthReport> {
        self.reports()
            .into_iter()
            .filter(|r| r.status == status)
            .collect()
    }
}

impl HealthSink for MemorySink {
    fn report(&self, report: &HealthReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report.clone());
        }
    }
}
