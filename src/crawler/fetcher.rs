//! HTTP fetch backends
//!
//! This module handles the raw requests behind each escalation stage:
//! - Direct: a plain reqwest client
//! - Proxy: a reqwest client routed through the configured proxy
//! - ProxyRender: a Splash-compatible `render.html` endpoint, given the proxy
//!
//! Response classification lives in [`crate::crawler::classify`]; a backend
//! only reports what came back over the wire.

use crate::config::{FetchConfig, UserAgentConfig};
use crate::state::FetchStage;
use async_trait::async_trait;
use reqwest::{redirect::Policy, Client, Proxy, Response};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Maximum redirect hops followed by a single request
const MAX_REDIRECTS: usize = 10;

/// What a backend received for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// Final URL after redirects
    pub final_url: Url,
    pub status_code: u16,
    /// Response headers, lowercased names
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl FetchResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    /// True when the response declares an HTML body, or declares nothing
    pub fn is_html(&self) -> bool {
        match self.content_type() {
            Some(ct) => {
                let ct = ct.to_ascii_lowercase();
                ct.contains("text/html") || ct.contains("application/xhtml")
            }
            None => true,
        }
    }
}

/// Transport-level fetch failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Request to {url} timed out")]
    Timeout { url: String },

    #[error("Connection to {url} failed: {message}")]
    Connect { url: String, message: String },

    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Fetch stage {stage} is not configured")]
    Unsupported { stage: FetchStage },
}

impl FetchError {
    /// Timeouts and connection errors, which are worth retrying on the same stage
    pub fn is_network(&self) -> bool {
        !matches!(self, FetchError::Unsupported { .. })
    }

    fn from_reqwest(url: &Url, error: reqwest::Error) -> Self {
        let url = url.to_string();
        if error.is_timeout() {
            FetchError::Timeout { url }
        } else if error.is_connect() {
            FetchError::Connect {
                url,
                message: error.to_string(),
            }
        } else {
            FetchError::Request {
                url,
                message: error.to_string(),
            }
        }
    }
}

/// Performs a single request at a given escalation stage
#[async_trait]
pub trait FetchBackend: Send + Sync {
    async fn fetch(&self, url: &Url, stage: FetchStage) -> Result<FetchResponse, FetchError>;
}

/// reqwest-backed [`FetchBackend`]
pub struct HttpFetcher {
    direct: Client,
    proxied: Option<Client>,
    render: Option<RenderEndpoint>,
}

struct RenderEndpoint {
    client: Client,
    endpoint: Url,
    proxy_url: Option<String>,
    wait_secs: f64,
    timeout_secs: u64,
}

impl HttpFetcher {
    /// Builds the per-stage clients
    ///
    /// # Arguments
    ///
    /// * `fetch` - Timeouts, proxy and render endpoint settings
    /// * `user_agent` - Identity sent with every request
    ///
    /// # Returns
    ///
    /// * `Ok(HttpFetcher)` - Clients built; unconfigured stages fail at fetch time
    /// * `Err(reqwest::Error)` - A client or the proxy could not be built
    pub fn new(fetch: &FetchConfig, user_agent: &UserAgentConfig) -> Result<Self, reqwest::Error> {
        let direct = build_http_client(fetch, user_agent, None)?;

        let proxied = match &fetch.proxy_url {
            Some(proxy_url) => Some(build_http_client(
                fetch,
                user_agent,
                Some(Proxy::all(proxy_url.as_str())?),
            )?),
            None => None,
        };

        let render = match &fetch.render_endpoint {
            Some(endpoint) => match Url::parse(endpoint) {
                Ok(endpoint) => Some(RenderEndpoint {
                    // rendering takes longer than a plain request
                    client: Client::builder()
                        .user_agent(user_agent.header_value())
                        .timeout(Duration::from_secs(
                            fetch.timeout_secs + fetch.render_wait_secs.ceil() as u64 + 30,
                        ))
                        .connect_timeout(Duration::from_secs(fetch.connect_timeout_secs))
                        .build()?,
                    endpoint,
                    proxy_url: fetch.proxy_url.clone(),
                    wait_secs: fetch.render_wait_secs,
                    timeout_secs: fetch.timeout_secs,
                }),
                Err(e) => {
                    tracing::warn!("Ignoring invalid render endpoint '{}': {}", endpoint, e);
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            direct,
            proxied,
            render,
        })
    }

    async fn fetch_with(client: &Client, url: &Url) -> Result<FetchResponse, FetchError> {
        let response = client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        read_response(url, response.url().clone(), response).await
    }

    async fn fetch_rendered(
        render: &RenderEndpoint,
        url: &Url,
    ) -> Result<FetchResponse, FetchError> {
        let mut request_url = render.endpoint.clone();
        {
            let mut query = request_url.query_pairs_mut();
            query.append_pair("url", url.as_str());
            query.append_pair("wait", &render.wait_secs.to_string());
            query.append_pair("timeout", &render.timeout_secs.to_string());
            if let Some(proxy) = &render.proxy_url {
                query.append_pair("proxy", proxy);
            }
        }

        let response = render
            .client
            .get(request_url.as_str())
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        // the renderer reports the page, not itself
        read_response(url, url.clone(), response).await
    }
}

#[async_trait]
impl FetchBackend for HttpFetcher {
    async fn fetch(&self, url: &Url, stage: FetchStage) -> Result<FetchResponse, FetchError> {
        match stage {
            FetchStage::Direct => Self::fetch_with(&self.direct, url).await,
            FetchStage::Proxy => match &self.proxied {
                Some(client) => Self::fetch_with(client, url).await,
                None => Err(FetchError::Unsupported { stage }),
            },
            FetchStage::ProxyRender => match &self.render {
                Some(render) => Self::fetch_rendered(render, url).await,
                None => Err(FetchError::Unsupported { stage }),
            },
        }
    }
}

/// Builds an HTTP client with the fleet's user agent and timeouts
pub fn build_http_client(
    fetch: &FetchConfig,
    user_agent: &UserAgentConfig,
    proxy: Option<Proxy>,
) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .user_agent(user_agent.header_value())
        .timeout(Duration::from_secs(fetch.timeout_secs))
        .connect_timeout(Duration::from_secs(fetch.connect_timeout_secs))
        .redirect(Policy::limited(MAX_REDIRECTS))
        .https_only(fetch.https_only)
        .gzip(true)
        .brotli(true);

    if let Some(proxy) = proxy {
        builder = builder.proxy(proxy);
    }

    builder.build()
}

async fn read_response(
    requested: &Url,
    final_url: Url,
    response: Response,
) -> Result<FetchResponse, FetchError> {
    let status_code = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    let body = response
        .text()
        .await
        .map_err(|e| FetchError::from_reqwest(requested, e))?;

    Ok(FetchResponse {
        final_url,
        status_code,
        headers,
        body,
    })
}
