use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;
use url::Url;

use deepharvest_core::plugin::CollectorPlugin;
use deepharvest_core::{CrawlError, FetchResult, RuleSet};
use deepharvest_fetch::{result_text, Fetcher};
use deepharvest_parser::parse_page;

/// Built-in single-page collector behind the plugin capability interface.
/// The `osint` command registers it and drives fetch → extract → export.
pub struct PageCollector {
    fetcher: Arc<Fetcher>,
    rules: Arc<RuleSet>,
    screenshot: bool,
}

impl PageCollector {
    pub fn new(fetcher: Arc<Fetcher>, rules: Arc<RuleSet>, screenshot: bool) -> Self {
        Self {
            fetcher,
            rules,
            screenshot,
        }
    }
}

#[async_trait]
impl CollectorPlugin for PageCollector {
    fn name(&self) -> &str {
        "page"
    }

    async fn fetch(&self, url: &Url) -> Result<FetchResult, CrawlError> {
        if self.screenshot && self.fetcher.browser_enabled() {
            return Ok(self.fetcher.fetch_browser(url, true).await);
        }
        let rule = self.rules.match_url(url.as_str());
        let allow_all = |_: &Url| true;
        Ok(self.fetcher.fetch(url, rule, &allow_all, false).await)
    }

    async fn extract(&self, result: &FetchResult) -> Result<Value, CrawlError> {
        if let Some(kind) = result.error {
            return Err(CrawlError::Network(format!(
                "fetch failed ({kind}): {}",
                result.error_detail.as_deref().unwrap_or("unknown")
            )));
        }
        let text = result_text(result)?;
        let page = parse_page(&text, &result.final_url);

        Ok(json!({
            "url": result.url.to_string(),
            "final_url": result.final_url.to_string(),
            "status": result.status,
            "mime": result.mime,
            "mode": result.mode.as_str(),
            "title": page.title,
            "description": page.meta_description,
            "language": page.language,
            "canonical": page.canonical,
            "headers": result.headers,
            "links": page.links.iter().map(|l| json!({
                "url": l.url,
                "anchor": l.anchor_text,
                "external": l.is_external,
            })).collect::<Vec<_>>(),
            "fetched_at": result.fetched_at,
            "duration_ms": result.duration.as_millis() as u64,
        }))
    }

    async fn export(&self, record: &Value, out_dir: &Path) -> Result<(), CrawlError> {
        std::fs::create_dir_all(out_dir).map_err(|e| CrawlError::Store(e.to_string()))?;
        let path = out_dir.join("osint.json");
        let pretty =
            serde_json::to_string_pretty(record).map_err(|e| CrawlError::Store(e.to_string()))?;
        std::fs::write(&path, pretty).map_err(|e| CrawlError::Store(e.to_string()))?;
        info!(path = %path.display(), "report written");
        Ok(())
    }
}
