use std::fmt;

/// Kinds of worker process the supervisor keeps alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkerRole {
    /// Claims crawl jobs and runs them
    Listener,
    /// Consumes fetched pages
    Extractor,
    /// Health checks and stall recovery
    Monitor,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 3] = [
        WorkerRole::Listener,
        WorkerRole::Extractor,
        WorkerRole::Monitor,
    ];

    /// Name used in heartbeats, logs and as the CLI subcommand
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Listener => "listener",
            Self::Extractor => "extractor",
            Self::Monitor => "monitor",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "listener" => Some(Self::Listener),
            "extractor" => Some(Self::Extractor),
            "monitor" => Some(Self::Monitor),
            _ => None,
        }
    }

    /// Stop order on shutdown: the listener drains first
    pub fn shutdown_rank(&self) -> u8 {
        match self {
            Self::Listener => 0,
            Self::Extractor => 1,
            Self::Monitor => 2,
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
