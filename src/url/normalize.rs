use crate::url::filter::is_tracking_param;
use crate::UrlError;
use url::Url;

/// Normalizes a URL into the form used as the frontier's dedup key
///
/// # Normalization Steps
///
/// 1. Parse the URL; reject if malformed or not http(s)
/// 2. Lowercase the host (the scheme and any `www.` prefix are kept, since
///    both can change what the server returns)
/// 3. Collapse repeated slashes in the path; empty path becomes `/`
/// 4. Remove fragment
/// 5. Remove tracking query parameters
/// 6. Sort remaining query parameters, drop an empty query string
///
/// # Arguments
///
/// * `url_str` - The URL string to normalize
///
/// # Returns
///
/// * `Ok(Url)` - Normalized URL
/// * `Err(UrlError)` - Failed to parse or normalize the URL
///
/// # Examples
///
/// ```
/// use sumi_fleet::url::normalize_url;
///
/// let url = normalize_url("https://EXAMPLE.com//docs/?utm_source=x&b=2&a=1#top").unwrap();
/// assert_eq!(url.as_str(), "https://example.com/docs/?a=1&b=2");
/// ```
pub fn normalize_url(url_str: &str) -> Result<Url, UrlError> {
    let url = Url::parse(url_str.trim()).map_err(|e| UrlError::Parse(e.to_string()))?;
    normalize_parsed(url)
}

/// Same as [`normalize_url`] for an already parsed URL
pub fn normalize_parsed(mut url: Url) -> Result<Url, UrlError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(url.scheme().to_string()));
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or(UrlError::MissingDomain)?
        .to_lowercase();
    url.set_host(Some(&host))
        .map_err(|e| UrlError::Parse(format!("Failed to set host: {}", e)))?;

    let normalized_path = normalize_path(url.path());
    url.set_path(&normalized_path);

    url.set_fragment(None);

    if url.query().is_some() {
        let params = filter_and_sort_query_params(&url);
        if params.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(params);
        }
    }

    Ok(url)
}

/// Collapses empty segments, keeping a trailing slash when present
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return "/".to_string();
    }

    let mut result = format!("/{}", segments.join("/"));
    if path.ends_with('/') {
        result.push('/');
    }
    result
}

/// Filters out tracking parameters and sorts remaining query parameters
fn filter_and_sort_query_params(url: &Url) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    params.sort();
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_and_www_are_kept() {
        let result = normalize_url("http://www.example.com/page").unwrap();
        assert_eq!(result.as_str(), "http://www.example.com/page");
    }

    #[test]
    fn test_host_lowercased() {
        let result = normalize_url("https://EXAMPLE.COM/Page").unwrap();
        // path case is significant
        assert_eq!(result.as_str(), "https://example.com/Page");
    }

    #[test]
    fn test_fragment_removed() {
        let result = normalize_url("https://example.com/page#section").unwrap();
        assert_eq!(result.as_str(), "https://example.com/page");
    }

    #[test]
    fn test_duplicate_slashes_collapsed() {
        let result = normalize_url("https://example.com//a///b/").unwrap();
        assert_eq!(result.as_str(), "https://example.com/a/b/");
    }

    #[test]
    fn test_dot_segments_resolved() {
        let result = normalize_url("https://example.com/a/./b/../c").unwrap();
        assert_eq!(result.as_str(), "https://example.com/a/c");
    }

    #[test]
    fn test_tracking_params_removed_and_sorted() {
        let result =
            normalize_url("https://example.com/p?utm_medium=x&z=1&fbclid=abc&a=2&gclid=q").unwrap();
        assert_eq!(result.as_str(), "https://example.com/p?a=2&z=1");
    }

    #[test]
    fn test_only_tracking_params_leaves_no_query() {
        let result = normalize_url("https://example.com/p?utm_source=news").unwrap();
        assert_eq!(result.as_str(), "https://example.com/p");
    }

    #[test]
    fn test_query_values_stay_encoded() {
        let result = normalize_url("https://example.com/s?q=a%20b&x=%26").unwrap();
        assert_eq!(result.as_str(), "https://example.com/s?q=a+b&x=%26");
    }

    #[test]
    fn test_invalid_scheme() {
        assert!(matches!(
            normalize_url("ftp://example.com/file"),
            Err(UrlError::InvalidScheme(_))
        ));
        assert!(matches!(
            normalize_url("mailto:ops@example.com"),
            Err(UrlError::InvalidScheme(_))
        ));
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(normalize_url("not a url"), Err(UrlError::Parse(_))));
    }

    #[test]
    fn test_idempotent() {
        let once = normalize_url("https://Example.com//a/?b=1&a=2#f").unwrap();
        let twice = normalize_url(once.as_str()).unwrap();
        assert_eq!(once, twice);
    }
}
