use url::Url;

/// Extracts the domain from a URL
///
/// Returns the lowercase host, or `None` if the URL has no host.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use sumi_fleet::url::extract_domain;
///
/// let url = Url::parse("https://Sub.Example.COM/path").unwrap();
/// assert_eq!(extract_domain(&url), Some("sub.example.com".to_string()));
/// ```
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_lowercase())
}

/// Key under which a domain's learned config is stored
///
/// The lowercase host with a leading `www.` removed, so `www.example.com`
/// and `example.com` share one record.
pub fn domain_key(url: &Url) -> Option<String> {
    extract_domain(url).map(|host| strip_www(&host).to_string())
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

/// Hosts a job may follow links into: the target host and its www twin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedDomains {
    bare: String,
}

impl AllowedDomains {
    /// Builds the allowed set for a job's start URL
    pub fn for_url(start: &Url) -> Option<Self> {
        domain_key(start).map(|bare| Self { bare })
    }

    /// Returns true if `url` is on the job's host, with or without `www.`
    pub fn allows(&self, url: &Url) -> bool {
        match extract_domain(url) {
            Some(host) => strip_www(&host) == self.bare,
            None => false,
        }
    }

    pub fn key(&self) -> &str {
        &self.bare
    }
}
