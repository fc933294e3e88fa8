//! Configuration module for Sumi-Fleet
//!
//! This module handles loading, parsing, and validating the TOML configuration
//! file shared by the orchestrator and every worker process it spawns.
//!
//! # Example
//!
//! ```no_run
//! use sumi_fleet::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("fleet.toml")).unwrap();
//! println!("Listener runs up to {} jobs", config.listener.max_concurrent_crawlers);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    BrokerConfig, Config, FetchConfig, FrontierConfig, ListenerConfig, MonitorConfig,
    StoreConfig, SupervisorConfig, UserAgentConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
