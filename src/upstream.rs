//! Upstream client.
//!
//! Fetches paginated record pages from the private collection-management
//! API. Supports incremental mode (records modified after the watermark,
//! via the `date_modified__gte` query parameter) and full mode (every
//! record). All requests go through the shared [`RetryPolicy`]; once
//! retries are exhausted the page fails with
//! [`SyncError::UpstreamUnavailable`] and the orchestrator aborts the run.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::error::SyncError;
use crate::models::{RawRecord, RecordPage};
use crate::retry::RetryPolicy;

/// Whether a sync pulls everything or only records newer than the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Incremental,
    Full,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Incremental => write!(f, "incremental"),
            Self::Full => write!(f, "full"),
        }
    }
}

/// A fetched page plus the parsed number of the next page, if any.
#[derive(Debug)]
pub struct FetchedPage {
    pub records: Vec<RawRecord>,
    pub next_page: Option<u32>,
}

/// Client for the private upstream API.
///
/// Constructed once per sync run and passed into the orchestrator; never
/// a process-wide global.
pub struct UpstreamClient {
    http: reqwest::Client,
    endpoint: String,
    page_size: u32,
    retry: RetryPolicy,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            page_size: config.page_size,
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.backoff_base_ms),
            ),
        })
    }

    /// Fetch one page of the works listing.
    ///
    /// `since` narrows the listing to records modified at or after the
    /// watermark (incremental mode); `None` fetches everything.
    pub async fn fetch_page(
        &self,
        page: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<FetchedPage, SyncError> {
        let url = format!("{}/works/", self.endpoint);
        let mut params: Vec<(String, String)> = vec![
            ("page".to_string(), page.to_string()),
            ("page_size".to_string(), self.page_size.to_string()),
        ];
        if let Some(watermark) = since {
            params.push(("date_modified__gte".to_string(), watermark.to_rfc3339()));
        }

        let body = self
            .retry
            .run("upstream page fetch", || {
                let url = url.clone();
                let params = params.clone();
                async move { self.get_json(&url, &params).await }
            })
            .await
            .map_err(SyncError::UpstreamUnavailable)?;

        let page_body: RecordPage = serde_json::from_value(body)
            .map_err(|e| SyncError::MalformedResponse(e.to_string()))?;

        debug!(
            page,
            records = page_body.results.len(),
            next = ?page_body.next,
            "fetched upstream page"
        );

        let next_page = page_body.next.as_deref().map(parse_next_page);
        Ok(FetchedPage {
            records: page_body.results,
            next_page: next_page.map(|n| n.unwrap_or(page + 1)),
        })
    }

    /// Fetch one record by identifier. Returns `None` on upstream 404.
    pub async fn fetch_record(&self, id: i64) -> Result<Option<RawRecord>, SyncError> {
        let url = format!("{}/works/{}/", self.endpoint, id);

        let response = self
            .retry
            .run("upstream record fetch", || {
                let url = url.clone();
                async move {
                    let resp = self
                        .http
                        .get(&url)
                        .send()
                        .await
                        .map_err(|e| e.to_string())?;
                    if resp.status() == reqwest::StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if !resp.status().is_success() {
                        return Err(format!("HTTP {} from {}", resp.status(), url));
                    }
                    let body: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;
                    Ok(Some(body))
                }
            })
            .await
            .map_err(SyncError::UpstreamUnavailable)?;

        match response {
            None => Ok(None),
            Some(body) => {
                let record: RawRecord = serde_json::from_value(body)
                    .map_err(|e| SyncError::MalformedResponse(e.to_string()))?;
                Ok(Some(record))
            }
        }
    }

    async fn get_json(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<serde_json::Value, String> {
        let resp = self
            .http
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            return Err(format!("HTTP {} from {}", resp.status(), url));
        }

        resp.json().await.map_err(|e| e.to_string())
    }
}

/// Parse the `page` query parameter out of an upstream `next` link.
///
/// The upstream may rewrite its own hostname between requests, so only
/// the page number is trusted.
fn parse_next_page(next_url: &str) -> Option<u32> {
    let query = next_url.split_once('?').map(|(_, q)| q)?;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("page=") {
            return value.parse().ok();
        }
    }
    None
}
