use std::path::Path;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::redirect::Policy;
use tracing::{info, warn};

use crate::error::TaskError;
use crate::settings::Settings;

const BACKOFF_STEP_MS: u64 = 800;
const MAX_REDIRECTS: usize = 5;
const FEED_ACCEPT: &str = "application/rss+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.5";
const FEED_LANGUAGE: &str = "tr-TR,tr;q=0.9,en-US;q=0.8,en;q=0.7";
const FEED_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) pricewatch/0.1";

#[derive(Debug, Clone)]
pub struct FeedFetchOptions {
    /// Extra attempts after the first.
    pub retries: u32,
    pub timeout: Duration,
    /// A cached copy younger than this is reused.
    pub max_age: Duration,
    pub force: bool,
}

impl FeedFetchOptions {
    pub fn from_settings(settings: &Settings, force: bool) -> Self {
        FeedFetchOptions {
            retries: settings.feed_retries,
            timeout: Duration::from_secs(settings.feed_timeout_secs),
            max_age: Duration::from_secs(settings.feed_max_age_secs),
            force,
        }
    }
}

/// Download a feed into `cache`, or reuse the cached copy while it is fresh.
pub async fn fetch_feed(url: &str, cache: &Path, opts: &FeedFetchOptions) -> Result<String, TaskError> {
    if !opts.force {
        if let Some(xml) = fresh_cache(cache, opts.max_age) {
            info!(path = %cache.display(), "Using cached feed");
            return Ok(xml);
        }
    }

    let client = client(opts.timeout)?;
    let mut last_error = String::new();

    for attempt in 0..=opts.retries {
        match download(&client, url).await {
            Ok(xml) => {
                write_cache(cache, &xml)?;
                info!(url, bytes = xml.len(), "Feed downloaded");
                return Ok(xml);
            }
            Err(e) => {
                warn!(url, attempt = attempt + 1, "Feed download failed: {}", e);
                last_error = e;
                if attempt < opts.retries {
                    let backoff = Duration::from_millis(BACKOFF_STEP_MS * u64::from(attempt + 1));
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    Err(TaskError::Fetch(format!("{url}: {last_error}")))
}

fn client(timeout: Duration) -> Result<reqwest::Client, TaskError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(FEED_ACCEPT));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(FEED_LANGUAGE));
    headers.insert(USER_AGENT, HeaderValue::from_static(FEED_AGENT));

    reqwest::Client::builder()
        .timeout(timeout)
        .redirect(Policy::limited(MAX_REDIRECTS))
        .default_headers(headers)
        .build()
        .map_err(|e| TaskError::Fetch(format!("http client: {e}")))
}

async fn download(client: &reqwest::Client, url: &str) -> Result<String, String> {
    let response = client.get(url).send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("HTTP {status}"));
    }
    let body = response.text().await.map_err(|e| e.to_string())?;
    if !body.trim_start().starts_with('<') {
        return Err("response is not XML".to_string());
    }
    Ok(body)
}

/// Cached feed contents when the file exists and is younger than `max_age`.
fn fresh_cache(path: &Path, max_age: Duration) -> Option<String> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let age = modified.elapsed().unwrap_or_default();
    if age >= max_age {
        return None;
    }
    std::fs::read_to_string(path).ok()
}

fn write_cache(path: &Path, xml: &str) -> Result<(), TaskError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .map_err(|e| TaskError::Fetch(format!("create {}: {e}", dir.display())))?;
    }
    std::fs::write(path, xml).map_err(|e| TaskError::Fetch(format!("write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(max_age_secs: u64, force: bool) -> FeedFetchOptions {
        FeedFetchOptions {
            retries: 0,
            timeout: Duration::from_millis(200),
            max_age: Duration::from_secs(max_age_secs),
            force,
        }
    }

    #[test]
    fn fresh_cache_respects_age() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.xml");
        assert_eq!(fresh_cache(&path, Duration::from_secs(60)), None);

        write_cache(&path, "<rss/>").unwrap();
        assert_eq!(fresh_cache(&path, Duration::from_secs(60)).as_deref(), Some("<rss/>"));
        assert_eq!(fresh_cache(&path, Duration::ZERO), None);
    }

    #[test]
    fn write_cache_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feeds/dijipin.xml");
        write_cache(&path, "<rss/>").unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn fresh_cache_skips_the_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.xml");
        write_cache(&path, "<rss><channel/></rss>").unwrap();

        let xml = fetch_feed("http://127.0.0.1:9/feed.xml", &path, &opts(3600, false))
            .await
            .unwrap();
        assert_eq!(xml, "<rss><channel/></rss>");
    }

    #[tokio::test]
    async fn unreachable_feed_fails_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.xml");
        let err = fetch_feed("http://127.0.0.1:9/feed.xml", &path, &opts(3600, true))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Fetch(_)));
        assert!(!path.exists());
    }
}
