//! Robots.txt handling module
//!
//! Robots.txt is read once per job: its `Sitemap:` directives seed sitemap
//! discovery and, when `respect-robots` is enabled, its rules filter the
//! frontier.

mod parser;

pub use parser::ParsedRobots;

use url::Url;

/// Location of robots.txt for the origin of `url`
pub fn robots_url(url: &Url) -> Url {
    let mut robots = url.clone();
    robots.set_path("/robots.txt");
    robots.set_query(None);
    robots.set_fragment(None);
    robots
}
