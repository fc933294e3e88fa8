//! Fetch escalation controller
//!
//! Drives one URL through `Direct -> Proxy -> ProxyRender`, never moving
//! backwards. Each stage gets `1 + max_retries_per_stage` attempts for
//! retryable failures; anything that marks the stage itself as blocked moves
//! on immediately.

use crate::config::FetchConfig;
use crate::crawler::classify::{classify_error, classify_response, Action, Verdict};
use crate::crawler::fetcher::{FetchBackend, FetchResponse};
use crate::state::FetchStage;
use crate::storage::JobStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// One attempt and how it was judged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub stage: FetchStage,
    pub verdict: Verdict,
}

/// Final result of escalating one URL
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// A usable page, fetched at `stage`
    Fetched {
        response: FetchResponse,
        stage: FetchStage,
        attempts: Vec<Attempt>,
    },
    /// The resource does not exist
    Gone {
        status_code: u16,
        attempts: Vec<Attempt>,
    },
    /// Every stage failed
    Exhausted { attempts: Vec<Attempt> },
    /// The job was cancelled mid-escalation
    Cancelled { attempts: Vec<Attempt> },
}

impl FetchOutcome {
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            FetchOutcome::Fetched { attempts, .. }
            | FetchOutcome::Gone { attempts, .. }
            | FetchOutcome::Exhausted { attempts }
            | FetchOutcome::Cancelled { attempts } => attempts,
        }
    }
}

/// Per-job escalation controller
#[derive(Clone)]
pub struct EscalationController {
    backend: Arc<dyn FetchBackend>,
    store: Arc<dyn JobStore>,
    fetch: FetchConfig,
    /// Domain key whose learned strategy is upgraded on proxy/render wins
    domain: String,
}

impl EscalationController {
    pub fn new(
        backend: Arc<dyn FetchBackend>,
        store: Arc<dyn JobStore>,
        fetch: FetchConfig,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            store,
            fetch,
            domain: domain.into(),
        }
    }

    /// Fetches `url`, escalating from `start` as needed
    ///
    /// # Arguments
    ///
    /// * `url` - The page to fetch
    /// * `start` - First stage to try (from the job's resolved strategy)
    /// * `cancel` - Checked before every attempt and during retry delays
    ///
    /// # Returns
    ///
    /// The outcome with every attempt made, in order
    pub async fn fetch(
        &self,
        url: &Url,
        start: FetchStage,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        let mut attempts = Vec::new();
        let mut stage = start;

        loop {
            let mut retries = 0;

            // attempts at the current stage
            let action = loop {
                if cancel.is_cancelled() {
                    return FetchOutcome::Cancelled { attempts };
                }

                let verdict = match self.backend.fetch(url, stage).await {
                    Ok(response) => {
                        let verdict = classify_response(&response, stage);
                        match verdict.action() {
                            Action::Accept => {
                                attempts.push(Attempt { stage, verdict });
                                self.remember_stage(stage).await;
                                return FetchOutcome::Fetched {
                                    response,
                                    stage,
                                    attempts,
                                };
                            }
                            Action::Drop => {
                                attempts.push(Attempt { stage, verdict });
                                return FetchOutcome::Gone {
                                    status_code: response.status_code,
                                    attempts,
                                };
                            }
                            _ => verdict,
                        }
                    }
                    Err(e) => {
                        tracing::debug!("{} at stage {}: {}", url, stage, e);
                        classify_error(&e)
                    }
                };

                attempts.push(Attempt { stage, verdict });
                let action = verdict.action();

                if action != Action::Retry || retries >= self.fetch.max_retries_per_stage {
                    break action;
                }

                retries += 1;
                let delay = self.fetch.retry_delay(retries);
                tracing::debug!(
                    "Retrying {} at stage {} in {:?} ({}, retry {}/{})",
                    url,
                    stage,
                    delay,
                    verdict,
                    retries,
                    self.fetch.max_retries_per_stage
                );

                tokio::select! {
                    _ = cancel.cancelled() => return FetchOutcome::Cancelled { attempts },
                    _ = tokio::time::sleep(delay) => {}
                }
            };

            match stage.next() {
                Some(next) => {
                    tracing::info!(
                        url = %url,
                        "Escalating fetch from {} to {} ({:?})",
                        stage,
                        next,
                        action
                    );
                    stage = next;
                }
                None => {
                    tracing::warn!(url = %url, "All fetch stages exhausted");
                    return FetchOutcome::Exhausted { attempts };
                }
            }
        }
    }

    /// Upgrades the domain's learned strategy after a win above `Direct`
    async fn remember_stage(&self, stage: FetchStage) {
        if stage == FetchStage::Direct {
            return;
        }

        let store = self.store.clone();
        let domain = self.domain.clone();
        let result =
            tokio::task::spawn_blocking(move || store.record_winning_stage(&domain, stage)).await;

        match result {
            Ok(Ok(config)) => tracing::info!(
                domain = %config.domain,
                use_proxy = config.use_proxy,
                use_js_rendering = config.use_js_rendering,
                "Domain fetch strategy upgraded after success at {}",
                stage
            ),
            Ok(Err(e)) => tracing::warn!("Failed to record winning stage for {}: {}", self.domain, e),
            Err(e) => tracing::warn!("Winning stage task failed for {}: {}", self.domain, e),
        }
    }
}
