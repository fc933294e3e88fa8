//! Deny rules applied to discovered links
use url::Url;

/// Query parameters that identify a campaign or click, never content
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "msclkid", "dclid", "zanpid", "igshid", "mc_eid", "ref", "referrer",
];

/// File extensions that never lead to an HTML page
const DENIED_EXTENSIONS: &[&str] = &[
    // documents
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "csv", "odt", "ods", "odp", "rtf",
    // images
    "jpg", "jpeg", "png", "gif", "bmp", "svg", "webp", "ico", "tiff",
    // audio / video
    "mp3", "mp4", "wav", "avi", "mov", "flv", "wmv", "ogg", "mkv", "m4a", "m4v",
    // archives and binaries
    "zip", "rar", "gz", "tar", "7z", "bz2", "iso", "exe", "dmg", "apk", "deb", "rpm",
    // assets
    "css", "js", "json", "woff", "woff2", "ttf",
];

/// Path fragments of listing, feed, and utility pages
const DENIED_PATH_SEGMENTS: &[&str] = &[
    "/tag/",
    "/category/",
    "/author/",
    "/search/",
    "/feed/",
    "/rss/",
    "/print/",
    "/amp/",
    "/cdn-cgi/l/email-protection",
];

/// Checks if a query parameter is a tracking parameter
pub fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key)
}

/// Returns true if the URL's last path segment has a denylisted extension
pub fn has_denied_extension(url: &Url) -> bool {
    let last_segment = url.path().rsplit('/').next().unwrap_or("");
    match last_segment.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            DENIED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
        }
        _ => false,
    }
}

/// Returns true if the URL points at a sort, filter, pagination, taxonomy or
/// feed view rather than a content page
pub fn matches_deny_pattern(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    let path_with_slash = if path.ends_with('/') {
        path.clone()
    } else {
        format!("{}/", path)
    };
    if DENIED_PATH_SEGMENTS
        .iter()
        .any(|segment| path_with_slash.contains(segment))
    {
        return true;
    }

    // first query parameter only: `?sort=`, `?filter=`, `?page=<n>`
    let Some(query) = url.query() else {
        return false;
    };
    let first = query.split('&').next().unwrap_or("");
    match first.split_once('=') {
        Some(("sort", _)) | Some(("filter", _)) => true,
        Some(("page", value)) => value.chars().next().is_some_and(|c| c.is_ascii_digit()),
        _ => false,
    }
}

/// Combined link deny check used by the frontier
pub fn is_denied(url: &Url) -> bool {
    has_denied_extension(url) || matches_deny_pattern(url)
}
