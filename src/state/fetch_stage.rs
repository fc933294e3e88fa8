/// Escalation stages a single URL fetch moves through
use std::fmt;

/// One fetch strategy, ordered from cheapest to most expensive
///
/// The discriminant is the wire value carried as `fetch_stage` on
/// `page_fetched` messages and stored with every crawled page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FetchStage {
    /// Plain HTTP request from the worker
    Direct = 0,

    /// Request routed through the configured proxy
    Proxy = 1,

    /// Proxy plus a JavaScript rendering service
    ProxyRender = 2,
}

impl FetchStage {
    /// The next, more expensive stage. `None` after `ProxyRender`.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Direct => Some(Self::Proxy),
            Self::Proxy => Some(Self::ProxyRender),
            Self::ProxyRender => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Direct),
            1 => Some(Self::Proxy),
            2 => Some(Self::ProxyRender),
            _ => None,
        }
    }

    /// Starting stage implied by a job's resolved strategy flags
    pub fn from_flags(use_proxy: bool, use_js_rendering: bool) -> Self {
        if use_js_rendering {
            Self::ProxyRender
        } else if use_proxy {
            Self::Proxy
        } else {
            Self::Direct
        }
    }

    pub fn uses_proxy(self) -> bool {
        self >= Self::Proxy
    }

    pub fn uses_rendering(self) -> bool {
        self == Self::ProxyRender
    }
}

impl fmt::Display for FetchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Direct => "direct",
            Self::Proxy => "proxy",
            Self::ProxyRender => "proxy+render",
        };
        write!(f, "{}", name)
    }
}
