pub mod browser;
pub mod encoding;
pub mod heuristics;
pub mod http;
pub mod retry;

use std::path::PathBuf;
use std::time::Instant;

use tracing::debug;
use url::Url;

use deepharvest_core::config::FetchSettings;
use deepharvest_core::{Body, CrawlError, FetchMode, FetchResult, SiteRule};

pub use browser::{BrowserOptions, BrowserPage, BrowserPool};
pub use http::HttpFetcher;
pub use retry::{parse_retry_after, RetryPolicy};

/// Fetch front-end: HTTP with retry/backoff, plus the optional headless
/// browser. Mode selection is rule-first; the post-fetch SPA heuristic
/// (`heuristics::needs_browser_fallback`) is the caller's second chance.
pub struct Fetcher {
    http: HttpFetcher,
    browser: Option<BrowserPool>,
    retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(
        settings: &FetchSettings,
        user_agent: &str,
        spool_dir: PathBuf,
        browser: Option<BrowserPool>,
    ) -> Result<Self, CrawlError> {
        Ok(Self {
            http: HttpFetcher::new(settings, user_agent, spool_dir)?,
            browser,
            retry: RetryPolicy::from_settings(settings),
        })
    }

    pub fn browser_enabled(&self) -> bool {
        self.browser.is_some()
    }

    /// Fetch with rule-first mode selection: `use_browser_directly` or
    /// `require_js` route straight to the browser when one is available.
    pub async fn fetch(
        &self,
        url: &Url,
        rule: &SiteRule,
        hop_allowed: &(dyn Fn(&Url) -> bool + Send + Sync),
        screenshot: bool,
    ) -> FetchResult {
        if (rule.use_browser_directly || rule.require_js) && self.browser.is_some() {
            return self.fetch_browser(url, screenshot).await;
        }
        self.fetch_http(url, rule, hop_allowed).await
    }

    /// HTTP fetch with the full retry policy. Terminal failures come back
    /// as a `FetchResult` carrying the error kind, never as an Err.
    pub async fn fetch_http(
        &self,
        url: &Url,
        rule: &SiteRule,
        hop_allowed: &(dyn Fn(&Url) -> bool + Send + Sync),
    ) -> FetchResult {
        let started = Instant::now();
        let mut attempt = 0u32;
        let mut retries = 0u32;

        loop {
            match self.http.fetch(url, rule, hop_allowed).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    let mut result = FetchResult::success(
                        url.clone(),
                        response.final_url,
                        response.status,
                        response.headers,
                        response.body,
                        response.mime,
                        started.elapsed(),
                        FetchMode::Http,
                    );
                    result.retries = retries;
                    return result;
                }
                Ok(response) => {
                    let status = response.status;
                    if RetryPolicy::is_retryable_status(status)
                        && attempt < self.retry.max_retries
                    {
                        let after = if matches!(status, 429 | 503) {
                            response
                                .headers
                                .get("retry-after")
                                .and_then(|v| parse_retry_after(v))
                        } else {
                            None
                        };
                        let delay = self.retry.delay(attempt, after);
                        debug!(url = %url, status, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                        attempt += 1;
                        retries += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    let kind = CrawlError::HttpStatus(status).kind();
                    let mut result = FetchResult::failure(
                        url.clone(),
                        kind,
                        format!("http status {status}"),
                        Some(status),
                        started.elapsed(),
                        FetchMode::Http,
                    );
                    result.retries = retries;
                    return result;
                }
                Err(error) => {
                    let kind = error.kind();
                    if kind.is_retryable() && attempt < self.retry.max_retries {
                        let delay = self.retry.delay(attempt, None);
                        debug!(url = %url, %error, attempt, "transient failure, retrying");
                        attempt += 1;
                        retries += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    let mut result = FetchResult::failure(
                        url.clone(),
                        kind,
                        error.to_string(),
                        None,
                        started.elapsed(),
                        FetchMode::Http,
                    );
                    result.retries = retries;
                    return result;
                }
            }
        }
    }

    /// Browser fetch: rendered DOM as the body, synthetic 200 on success.
    pub async fn fetch_browser(&self, url: &Url, screenshot: bool) -> FetchResult {
        let started = Instant::now();
        let Some(pool) = &self.browser else {
            return FetchResult::failure(
                url.clone(),
                deepharvest_core::ErrorKind::NetworkPermanent,
                "browser fetch requested but browser is disabled".to_string(),
                None,
                started.elapsed(),
                FetchMode::Browser,
            );
        };

        match pool.fetch(url, screenshot).await {
            Ok(page) => {
                let mut result = FetchResult::success(
                    url.clone(),
                    page.final_url,
                    200,
                    std::collections::HashMap::new(),
                    Body::Bytes(page.html.into_bytes()),
                    Some("text/html".to_string()),
                    started.elapsed(),
                    FetchMode::Browser,
                );
                result.screenshot = page.screenshot;
                result
            }
            Err(error) => FetchResult::failure(
                url.clone(),
                error.kind(),
                error.to_string(),
                None,
                started.elapsed(),
                FetchMode::Browser,
            ),
        }
    }

    /// Plain one-shot text fetch (robots.txt).
    pub async fn fetch_text(&self, url: &Url) -> Result<Option<String>, CrawlError> {
        self.http.fetch_text(url).await
    }
}

/// Decode a successful result's body to text using the encoding chain.
pub fn result_text(result: &FetchResult) -> Result<String, CrawlError> {
    let Some(body) = &result.body else {
        return Err(CrawlError::Encoding("no body to decode".to_string()));
    };
    let bytes = body
        .load()
        .map_err(|e| CrawlError::Encoding(format!("spool read: {e}")))?;
    let content_type = result.headers.get("content-type").map(|s| s.as_str());
    let (text, _encoding) = encoding::decode_body(&bytes, content_type);
    Ok(text)
}
