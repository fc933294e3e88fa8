//! Response classification for the escalation protocol
//!
//! Every fetch attempt gets a [`Verdict`]; the verdict's [`Action`] decides
//! whether the controller accepts the page, retries the same stage, moves to
//! the next stage or gives the URL up.

use crate::crawler::fetcher::{FetchError, FetchResponse};
use crate::crawler::parser::{extract_title, visible_text_len};
use crate::state::FetchStage;
use scraper::{Html, Selector};
use std::fmt;

/// Statuses worth retrying on the same stage
const RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Statuses anti-bot services answer with when they serve a challenge
const CHALLENGE_STATUSES: &[u16] = &[403, 429, 503];

/// Lowercased `<title>` of well-known interstitials
const CHALLENGE_TITLES: &[&str] = &[
    "just a moment...",
    "attention required! | cloudflare",
    "pardon our interruption",
    "please verify you are a human",
    "are you a robot?",
];

/// Elements only present on challenge pages
const CHALLENGE_SELECTORS: &[&str] = &[
    "form#challenge-form",
    "#challenge-stage",
    "#cf-challenge-running",
    "#px-captcha",
    "iframe[src*='captcha-delivery.com']",
    "#distilCaptchaForm",
];

/// Notices served by pages that only work with JavaScript
const NOSCRIPT_MARKERS: &[&str] = &[
    "please enable javascript",
    "you need to enable javascript",
    "javascript is required",
    "javascript must be enabled",
];

/// Empty single-page-app mount points
const EMPTY_MOUNT_MARKERS: &[&str] = &[
    "<div id=\"root\"></div>",
    "<div id=\"app\"></div>",
    "<div id=\"__next\"></div>",
    "<div id='root'></div>",
    "<div id='app'></div>",
];

/// Pages with this much visible text are not considered shells
const SHELL_TEXT_THRESHOLD: usize = 200;

/// Outcome of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Usable page
    Success,
    /// Timeout or connection error
    Network,
    /// 408, 429 or a transient 5xx
    Retryable(u16),
    /// Any other non-success status
    Terminal(u16),
    /// Anti-bot interstitial
    Challenge,
    /// Client-rendered shell without content
    JsShell,
    /// 404 or 410
    Gone(u16),
    /// The stage has no backend configured
    Unsupported,
}

/// What the controller does with a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Accept,
    Retry,
    Escalate,
    Drop,
}

impl Verdict {
    pub fn action(&self) -> Action {
        match self {
            Verdict::Success => Action::Accept,
            Verdict::Network | Verdict::Retryable(_) => Action::Retry,
            Verdict::Terminal(_) | Verdict::Challenge | Verdict::JsShell | Verdict::Unsupported => {
                Action::Escalate
            }
            Verdict::Gone(_) => Action::Drop,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Success => write!(f, "success"),
            Verdict::Network => write!(f, "network error"),
            Verdict::Retryable(code) => write!(f, "retryable status {}", code),
            Verdict::Terminal(code) => write!(f, "status {}", code),
            Verdict::Challenge => write!(f, "challenge page"),
            Verdict::JsShell => write!(f, "javascript shell"),
            Verdict::Gone(code) => write!(f, "gone ({})", code),
            Verdict::Unsupported => write!(f, "stage unsupported"),
        }
    }
}

/// Classifies a response received at `stage`
pub fn classify_response(response: &FetchResponse, stage: FetchStage) -> Verdict {
    let status = response.status_code;

    if status == 404 || status == 410 {
        return Verdict::Gone(status);
    }
    if is_challenge(response) {
        return Verdict::Challenge;
    }
    if RETRYABLE_STATUSES.contains(&status) {
        return Verdict::Retryable(status);
    }
    if !(200..300).contains(&status) {
        return Verdict::Terminal(status);
    }

    // a rendered page is as good as it gets
    if !stage.uses_rendering() && response.is_html() && is_js_shell(&response.body) {
        return Verdict::JsShell;
    }

    Verdict::Success
}

/// Classifies a transport failure
pub fn classify_error(error: &FetchError) -> Verdict {
    if error.is_network() {
        Verdict::Network
    } else {
        Verdict::Unsupported
    }
}

/// A challenge needs both the blocking signal and the interstitial itself;
/// vendor scripts on an ordinary page are not enough
fn is_challenge(response: &FetchResponse) -> bool {
    let mitigated = response
        .headers
        .get("cf-mitigated")
        .is_some_and(|v| v.eq_ignore_ascii_case("challenge"));
    if mitigated {
        return true;
    }
    if !CHALLENGE_STATUSES.contains(&response.status_code) || response.body.is_empty() {
        return false;
    }

    let document = Html::parse_document(&response.body);
    let challenge_title = extract_title(&document).is_some_and(|title| {
        let title = title.to_lowercase();
        CHALLENGE_TITLES.contains(&title.as_str())
    });

    challenge_title
        || CHALLENGE_SELECTORS
            .iter()
            .filter_map(|s| Selector::parse(s).ok())
            .any(|selector| document.select(&selector).next().is_some())
}

fn is_js_shell(body: &str) -> bool {
    let document = Html::parse_document(body);
    if visible_text_len(&document) >= SHELL_TEXT_THRESHOLD {
        return false;
    }

    let lower_body = body.to_ascii_lowercase();
    let compact: String = lower_body.split_whitespace().collect::<Vec<_>>().join("");
    let empty_mount = EMPTY_MOUNT_MARKERS
        .iter()
        .any(|m| compact.contains(&m.replace(' ', "")));

    empty_mount || NOSCRIPT_MARKERS.iter().any(|m| lower_body.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use url::Url;

    fn response(status: u16, body: &str) -> FetchResponse {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/html".to_string());
        FetchResponse {
            final_url: Url::parse("https://example.com/").unwrap(),
            status_code: status,
            headers,
            body: body.to_string(),
        }
    }

    fn article() -> String {
        format!(
            "<html><body><h1>Hello</h1><p>{}</p></body></html>",
            "Plenty of server-rendered prose. ".repeat(20)
        )
    }

    #[test]
    fn test_status_classes() {
        let stage = FetchStage::Direct;
        assert_eq!(classify_response(&response(200, &article()), stage), Verdict::Success);
        assert_eq!(classify_response(&response(404, ""), stage), Verdict::Gone(404));
        assert_eq!(classify_response(&response(410, ""), stage), Verdict::Gone(410));
        for code in [408, 429, 500, 502, 503, 504] {
            assert_eq!(
                classify_response(&response(code, ""), stage),
                Verdict::Retryable(code)
            );
        }
        for code in [301, 401, 403, 451, 418, 501] {
            assert_eq!(
                classify_response(&response(code, ""), stage),
                Verdict::Terminal(code)
            );
        }
    }

    #[test]
    fn test_actions() {
        assert_eq!(Verdict::Success.action(), Action::Accept);
        assert_eq!(Verdict::Network.action(), Action::Retry);
        assert_eq!(Verdict::Retryable(503).action(), Action::Retry);
        assert_eq!(Verdict::Terminal(403).action(), Action::Escalate);
        assert_eq!(Verdict::Challenge.action(), Action::Escalate);
        assert_eq!(Verdict::JsShell.action(), Action::Escalate);
        assert_eq!(Verdict::Unsupported.action(), Action::Escalate);
        assert_eq!(Verdict::Gone(404).action(), Action::Drop);
    }

    fn with_header(mut response: FetchResponse, name: &str, value: &str) -> FetchResponse {
        response.headers.insert(name.to_string(), value.to_string());
        response
    }

    #[test]
    fn test_challenge_interstitial_escalates() {
        let body = "<html><head><title>Just a moment...</title></head>\
                    <body><div id=\"challenge-stage\"></div></body></html>";
        assert_eq!(
            classify_response(&response(403, body), FetchStage::Direct),
            Verdict::Challenge
        );
        // a challenge served as 503 escalates instead of retrying
        assert_eq!(
            classify_response(&response(503, body), FetchStage::Proxy),
            Verdict::Challenge
        );

        let captcha = r#"<html><body><iframe src="https://geo.captcha-delivery.com/captcha/?x=1"></iframe></body></html>"#;
        assert_eq!(
            classify_response(&response(403, captcha), FetchStage::Direct),
            Verdict::Challenge
        );
    }

    #[test]
    fn test_mitigated_header_marks_challenge() {
        let r = with_header(response(200, "<html></html>"), "cf-mitigated", "challenge");
        assert_eq!(classify_response(&r, FetchStage::Direct), Verdict::Challenge);
    }

    #[test]
    fn test_vendor_scripts_on_ordinary_page_are_not_challenges() {
        let body = format!(
            r#"<html><head><title>Shop</title>
                <script src="/cdn-cgi/challenge-platform/h/g/scripts/jsd/abc/main.js"></script>
                <script src="https://js.datadome.co/tags.js"></script>
                <script>window._pxAppId = 'PX123'; // perimeterx</script>
            </head>{}</html>"#,
            article()
        );
        for stage in [FetchStage::Direct, FetchStage::Proxy, FetchStage::ProxyRender] {
            assert_eq!(classify_response(&response(200, &body), stage), Verdict::Success);
        }
    }

    #[test]
    fn test_plain_forbidden_is_terminal() {
        assert_eq!(
            classify_response(&response(403, "Forbidden"), FetchStage::Direct),
            Verdict::Terminal(403)
        );
    }

    #[test]
    fn test_js_shell_detection() {
        let shell = r#"<html><head><script src="/bundle.js"></script></head>
            <body><div id="root"></div></body></html>"#;
        assert_eq!(
            classify_response(&response(200, shell), FetchStage::Direct),
            Verdict::JsShell
        );
        assert_eq!(
            classify_response(&response(200, shell), FetchStage::Proxy),
            Verdict::JsShell
        );
        // rendered output is accepted as is
        assert_eq!(
            classify_response(&response(200, shell), FetchStage::ProxyRender),
            Verdict::Success
        );

        let noscript = "<html><body><noscript>Please enable JavaScript to view this site.</noscript></body></html>";
        assert_eq!(
            classify_response(&response(200, noscript), FetchStage::Direct),
            Verdict::JsShell
        );
    }

    #[test]
    fn test_content_rich_page_with_noscript_is_success() {
        let body = format!(
            "{}<noscript>Please enable JavaScript for comments.</noscript>",
            article()
        );
        assert_eq!(
            classify_response(&response(200, &body), FetchStage::Direct),
            Verdict::Success
        );
    }

    #[test]
    fn test_long_noscript_fallback_is_still_a_shell() {
        let body = format!(
            r#"<html><body><div id="root"></div>
               <noscript>Please enable JavaScript. {}</noscript></body></html>"#,
            "This application needs scripts to display its content. ".repeat(10)
        );
        assert_eq!(
            classify_response(&response(200, &body), FetchStage::Direct),
            Verdict::JsShell
        );
    }

    #[test]
    fn test_error_classification() {
        let timeout = FetchError::Timeout {
            url: "https://example.com/".to_string(),
        };
        assert_eq!(classify_error(&timeout), Verdict::Network);
        let unsupported = FetchError::Unsupported {
            stage: FetchStage::ProxyRender,
        };
        assert_eq!(classify_error(&unsupported), Verdict::Unsupported);
    }
}
