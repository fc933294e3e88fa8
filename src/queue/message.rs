//! Payloads carried on the broker tubes
//!
//! Both messages are JSON documents. Field names are part of the wire
//! contract with producers and extractor workers outside this crate.

use crate::state::{CrawlJob, FetchStage, JobType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request to crawl, carried on the `crawl_jobs` tube
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlJobMessage {
    pub crawl_id: String,
    pub job_type: JobType,
    pub domain_or_url: String,
    pub max_pages: u32,
    pub use_sitemap: bool,
    pub use_proxy: Option<bool>,
    pub use_js_rendering: Option<bool>,
    pub submitted_at: DateTime<Utc>,
}

impl CrawlJobMessage {
    pub fn from_job(job: &CrawlJob) -> Self {
        Self {
            crawl_id: job.crawl_id.clone(),
            job_type: job.job_type,
            domain_or_url: job.domain_or_url.clone(),
            max_pages: job.max_pages,
            use_sitemap: job.use_sitemap,
            use_proxy: job.use_proxy,
            use_js_rendering: job.use_js_rendering,
            submitted_at: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }
}

/// A fetched page ready for extraction, carried on the `page_fetched` tube
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageFetchedMessage {
    pub crawl_id: String,
    pub url: String,
    pub html_ref: String,
    /// 0 = direct, 1 = proxy, 2 = proxy + render
    pub fetch_stage: u8,
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl PageFetchedMessage {
    pub fn stage(&self) -> Option<FetchStage> {
        FetchStage::from_u8(self.fetch_stage)
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::JobParams;

    #[test]
    fn test_crawl_job_wire_format() {
        let job = CrawlJob::new("c-1".to_string(), &JobParams::domain("example.com"), 25);
        let message = CrawlJobMessage::from_job(&job);
        let value: serde_json::Value = serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();

        assert_eq!(value["crawl_id"], "c-1");
        assert_eq!(value["job_type"], "domain");
        assert_eq!(value["max_pages"], 25);
        assert_eq!(value["use_sitemap"], true);
        assert!(value["use_proxy"].is_null());
        assert!(value["submitted_at"].is_string());
    }

    #[test]
    fn test_crawl_job_from_external_producer() {
        let body = br#"{
            "crawl_id": "ext-9",
            "job_type": "single_url",
            "domain_or_url": "https://example.com/a",
            "max_pages": 1,
            "use_sitemap": false,
            "use_proxy": true,
            "use_js_rendering": null,
            "submitted_at": "2026-01-02T03:04:05Z"
        }"#;
        let message = CrawlJobMessage::from_bytes(body).unwrap();
        assert_eq!(message.job_type, JobType::SingleUrl);
        assert_eq!(message.use_proxy, Some(true));
        assert_eq!(message.use_js_rendering, None);
    }

    #[test]
    fn test_malformed_body_rejected() {
        assert!(CrawlJobMessage::from_bytes(b"{\"crawl_id\": 5}").is_err());
        assert!(PageFetchedMessage::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_page_fetched_headers_optional() {
        let body = br#"{"crawl_id":"c","url":"https://e.com/","html_ref":"/x.html","fetch_stage":2,"status_code":200}"#;
        let message = PageFetchedMessage::from_bytes(body).unwrap();
        assert!(message.headers.is_empty());
        assert_eq!(message.stage(), Some(FetchStage::ProxyRender));
    }
}
