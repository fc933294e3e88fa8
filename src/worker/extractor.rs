//! Extractor worker: consumes fetched-page events
//!
//! Extraction itself is pluggable through [`PageExtractor`]. The worker owns
//! the queue plumbing around it:
//! - Reserve from the `page_fetched` tube
//! - Load the HTML body referenced by `html_ref`
//! - Run the extractor and log its record
//! - Delete on success, bury anything that cannot be extracted

use crate::queue::{Broker, PageFetchedMessage};
use crate::storage::HtmlStore;
use crate::Result;
use scraper::{Html, Selector};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Page has no usable content: {0}")]
    Empty(String),

    #[error("Extraction failed: {0}")]
    Failed(String),
}

/// Structured output of one extraction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedRecord {
    pub crawl_id: String,
    pub url: String,
    pub fetch_stage: u8,
    pub title: Option<String>,
    pub description: Option<String>,
    pub text_length: usize,
}

/// Turns one fetched page into a record
pub trait PageExtractor: Send + Sync {
    fn extract(&self, page: &PageFetchedMessage, html: &str) -> std::result::Result<ExtractedRecord, ExtractError>;
}

/// Extracts the title and meta description
#[derive(Debug, Default, Clone)]
pub struct TitleExtractor;

impl PageExtractor for TitleExtractor {
    fn extract(&self, page: &PageFetchedMessage, html: &str) -> std::result::Result<ExtractedRecord, ExtractError> {
        if html.trim().is_empty() {
            return Err(ExtractError::Empty(page.url.clone()));
        }

        let document = Html::parse_document(html);
        let title = crate::crawler::extract_title(&document);
        let description = meta_description(&document);
        let text_length = crate::crawler::visible_text_len(&document);

        Ok(ExtractedRecord {
            crawl_id: page.crawl_id.clone(),
            url: page.url.clone(),
            fetch_stage: page.fetch_stage,
            title,
            description,
            text_length,
        })
    }
}

fn meta_description(document: &Html) -> Option<String> {
    let selector = Selector::parse(r#"meta[name="description"]"#).ok()?;
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("content"))
        .map(|content| content.trim().to_string())
        .find(|content| !content.is_empty())
}

/// What happened to one page event
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Extracted(ExtractedRecord),
    Buried,
}

/// Reserve/extract/acknowledge loop for one extractor slot
pub struct ExtractorWorker {
    broker: Arc<dyn Broker>,
    html: HtmlStore,
    extractor: Arc<dyn PageExtractor>,
    tube: String,
    reserve_timeout: Duration,
    slot: usize,
}

impl ExtractorWorker {
    pub fn new(
        broker: Arc<dyn Broker>,
        html: HtmlStore,
        extractor: Arc<dyn PageExtractor>,
        tube: impl Into<String>,
        reserve_timeout: Duration,
        slot: usize,
    ) -> Self {
        Self {
            broker,
            html,
            extractor,
            tube: tube.into(),
            reserve_timeout,
            slot,
        }
    }

    /// Processes page events until `shutdown` is cancelled
    ///
    /// A page already reserved is finished before the loop exits.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(slot = self.slot, tube = %self.tube, "Extractor started");
        let mut processed = 0u64;

        loop {
            let reserved = tokio::select! {
                _ = shutdown.cancelled() => break,
                reserved = self.broker.reserve(&self.tube, self.reserve_timeout) => reserved,
            };

            match reserved {
                Ok(Some(message)) => {
                    self.process(message.id, &message.body).await;
                    processed += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(slot = self.slot, "Reserve failed: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.reserve_timeout) => {}
                    }
                }
            }
        }

        tracing::info!(slot = self.slot, processed, "Extractor stopped");
        Ok(())
    }

    /// Handles one reserved page event
    pub async fn process(&self, message_id: u64, body: &[u8]) -> PageOutcome {
        let page = match PageFetchedMessage::from_bytes(body) {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(message_id, "Burying malformed page message: {}", e);
                self.bury(message_id).await;
                return PageOutcome::Buried;
            }
        };

        let html = match self.html.load(&page.html_ref).await {
            Ok(html) => html,
            Err(e) => {
                tracing::warn!(url = %page.url, html_ref = %page.html_ref, "Cannot load page body: {}", e);
                self.bury(message_id).await;
                return PageOutcome::Buried;
            }
        };

        match self.extractor.extract(&page, &html) {
            Ok(record) => {
                match serde_json::to_string(&record) {
                    Ok(json) => tracing::info!(crawl_id = %record.crawl_id, record = %json, "Page extracted"),
                    Err(e) => tracing::warn!(url = %record.url, "Cannot serialize record: {}", e),
                }
                if let Err(e) = self.broker.delete(message_id).await {
                    tracing::warn!(message_id, "Failed to delete page message: {}", e);
                }
                PageOutcome::Extracted(record)
            }
            Err(e) => {
                tracing::warn!(url = %page.url, "Extraction failed: {}", e);
                self.bury(message_id).await;
                PageOutcome::Buried
            }
        }
    }

    async fn bury(&self, message_id: u64) {
        if let Err(e) = self.broker.bury(message_id).await {
            tracing::warn!(message_id, "Failed to bury page message: {}", e);
        }
    }
}
