//! Robots.txt parser implementation
//!
//! Wraps the robotstxt crate for allow/disallow checks and extracts the
//! `Sitemap:` directives that seed sitemap discovery.

use robotstxt::DefaultMatcher;
use url::Url;

/// Parsed robots.txt data
#[derive(Debug, Clone)]
pub struct ParsedRobots {
    /// Raw robots.txt content (empty string means allow all)
    content: String,
    allow_all: bool,
}

impl ParsedRobots {
    /// Creates a new ParsedRobots from raw robots.txt content
    pub fn from_content(content: &str) -> Self {
        Self {
            content: content.to_string(),
            allow_all: false,
        }
    }

    /// Creates a permissive ParsedRobots that allows everything
    ///
    /// This is used when robots.txt is missing or could not be fetched.
    pub fn allow_all() -> Self {
        Self {
            content: String::new(),
            allow_all: true,
        }
    }

    /// Checks if a URL is allowed for the given user agent
    ///
    /// # Arguments
    ///
    /// * `url` - The absolute URL to check
    /// * `user_agent` - The user agent product token
    pub fn is_allowed(&self, url: &str, user_agent: &str) -> bool {
        if self.allow_all || self.content.is_empty() {
            return true;
        }

        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&self.content, user_agent, url)
    }

    /// Sitemap URLs declared with `Sitemap:` lines, in file order
    ///
    /// The directive name is matched case-insensitively and applies outside of
    /// user-agent groups. Only absolute http(s) URLs are returned.
    pub fn sitemaps(&self) -> Vec<Url> {
        let mut found: Vec<Url> = Vec::new();

        for line in self.content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if !key.trim().eq_ignore_ascii_case("sitemap") {
                continue;
            }

            let candidate = value.split_whitespace().next().unwrap_or("");
            if let Ok(url) = Url::parse(candidate) {
                if matches!(url.scheme(), "http" | "https") && !found.contains(&url) {
                    found.push(url);
                }
            }
        }

        found
    }
}
