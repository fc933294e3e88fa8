//! Work queue broker client
//!
//! The fleet talks to its broker through the [`Broker`] trait. Two tubes are
//! used: `crawl_jobs` (job requests, consumed by the listener) and
//! `page_fetched` (fetched pages, consumed by extractor workers).
//!
//! Delivery is at-least-once: a reserved message that is neither deleted nor
//! touched within its time-to-run is handed to the next reserver.

mod beanstalk;
mod memory;
mod message;

pub use beanstalk::BeanstalkBroker;
pub use memory::MemoryBroker;
pub use message::{CrawlJobMessage, PageFetchedMessage};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Default message priority (lower is more urgent)
pub const DEFAULT_PRIORITY: u32 = 1024;

/// Errors returned by broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Broker protocol error: {0}")]
    Protocol(String),

    #[error("Broker rejected {command}: {response}")]
    Rejected { command: String, response: String },

    #[error("Message {0} not found")]
    NotFound(u64),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// A message reserved from a tube
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reserved {
    pub id: u64,
    pub body: Vec<u8>,
}

/// Counters for one tube
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TubeStats {
    pub name: String,
    pub ready: u64,
    pub reserved: u64,
    pub delayed: u64,
    pub buried: u64,
}

/// Work queue broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Cheap round trip used by health probes and startup checks
    async fn ping(&self) -> BrokerResult<()>;

    /// Publishes a message and returns its id
    async fn put(&self, tube: &str, body: &[u8], priority: u32, ttr: Duration)
        -> BrokerResult<u64>;

    /// Waits up to `timeout` for a message on `tube`
    async fn reserve(&self, tube: &str, timeout: Duration) -> BrokerResult<Option<Reserved>>;

    /// Acknowledges a reserved message
    async fn delete(&self, id: u64) -> BrokerResult<()>;

    /// Returns a reserved message to the ready queue after `delay`
    async fn release(&self, id: u64, priority: u32, delay: Duration) -> BrokerResult<()>;

    /// Moves a reserved message to the dead-letter (buried) list
    async fn bury(&self, id: u64) -> BrokerResult<()>;

    /// Restarts the time-to-run of a reserved message
    async fn touch(&self, id: u64) -> BrokerResult<()>;

    async fn stats_tube(&self, tube: &str) -> BrokerResult<TubeStats>;
}
