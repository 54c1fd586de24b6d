use std::time::{Duration, Instant};

use spider_client::shapes::request::{RequestType, ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::parser::listing::strip_images;

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;

/// Renders storefront pages to markdown through spider.cloud.
pub struct PageFetcher {
    spider: Spider,
    timeout: Duration,
}

impl PageFetcher {
    pub fn from_env(timeout: Duration) -> Result<Self, TaskError> {
        let api_key = std::env::var("SPIDER_API_KEY")
            .map_err(|_| TaskError::Invalid("SPIDER_API_KEY environment variable must be set".into()))?;
        let spider = Spider::new(Some(api_key))
            .map_err(|e| TaskError::Fetch(format!("Failed to create Spider client: {e}")))?;
        Ok(PageFetcher { spider, timeout })
    }

    /// Page markdown with images stripped.
    ///
    /// The rendered fetch is bounded by the timeout; on expiry one plain HTTP
    /// fetch is tried under the same bound before giving up.
    pub async fn fetch_markdown(&self, url: &str) -> Result<String, TaskError> {
        let rendered = tokio::time::timeout(self.timeout, self.scrape_with_retry(url, params(false)));
        match rendered.await {
            Ok(result) => result,
            Err(_) => {
                warn!(url, "Rendered fetch timed out after {}s, retrying plain", self.timeout.as_secs());
                tokio::time::timeout(self.timeout, self.scrape_once(url, params(true)))
                    .await
                    .map_err(|_| TaskError::Timeout(self.timeout.as_secs()))?
            }
        }
    }

    async fn scrape_with_retry(&self, url: &str, params: RequestParams) -> Result<String, TaskError> {
        let mut attempt = 0;
        loop {
            match self.scrape_once(url, params.clone()).await {
                Err(TaskError::Fetch(e)) if is_retryable(&e) && attempt < MAX_RETRIES => {
                    let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt));
                    warn!(
                        "Rate limited on {} (attempt {}/{}), backing off {:.1}s",
                        url,
                        attempt + 1,
                        MAX_RETRIES,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn scrape_once(&self, url: &str, params: RequestParams) -> Result<String, TaskError> {
        let start = Instant::now();
        let response = self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| TaskError::Fetch(e.to_string()))?;
        debug!(url, latency_ms = start.elapsed().as_millis() as u64, "Page scraped");

        extract_content(response)
    }
}

fn params(plain: bool) -> RequestParams {
    RequestParams {
        return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Markdown)),
        request: plain.then_some(RequestType::Http),
        ..Default::default()
    }
}

fn is_retryable(error: &str) -> bool {
    error.contains("429")
        || error.contains("rate")
        || error.contains("500")
        || error.contains("502")
        || error.contains("503")
}

/// Pull the first page's markdown out of a spider response.
fn extract_content(response: serde_json::Value) -> Result<String, TaskError> {
    let parsed: serde_json::Value = match response.as_str() {
        Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
        None => response,
    };
    let first = parsed.as_array().and_then(|arr| arr.first());

    if let Some(status) = first.and_then(|obj| obj.get("status")).and_then(|s| s.as_i64()) {
        if status >= 400 {
            return Err(TaskError::Fetch(format!("HTTP {status}")));
        }
    }

    first
        .and_then(|obj| obj.get("content"))
        .and_then(|c| c.as_str())
        .map(strip_images)
        .ok_or_else(|| TaskError::Fetch("No content in spider response".into()))
}
