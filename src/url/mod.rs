//! URL handling module for Sumi-Fleet
//!
//! This module provides URL normalization, domain keys, the allowed-domain
//! check used for BFS, and the deny rules applied to discovered links.

mod domain;
mod filter;
mod normalize;

// Re-export main functions
pub use domain::{domain_key, extract_domain, AllowedDomains};
pub use filter::{has_denied_extension, is_denied, is_tracking_param, matches_deny_pattern};
pub use normalize::{normalize_parsed, normalize_url};
