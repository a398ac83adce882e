use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use url::Url;

use deepharvest_core::graph::LinkGraph;
use deepharvest_core::plugin::PluginRegistry;
use deepharvest_core::{AppConfig, CrawlError, RuleSet};
use deepharvest_fetch::{BrowserOptions, BrowserPool, Fetcher};

use crate::collector::PageCollector;

#[allow(clippy::too_many_arguments)]
pub async fn run(
    config: AppConfig,
    url: String,
    json: bool,
    graph: bool,
    screenshot: bool,
    output: Option<PathBuf>,
) -> Result<(), CrawlError> {
    let target =
        Url::parse(&url).map_err(|e| CrawlError::Config(format!("bad target URL {url:?}: {e}")))?;
    let out_dir = output.unwrap_or_else(|| PathBuf::from("osint"));

    let browser = if screenshot {
        match BrowserPool::new(
            1,
            BrowserOptions {
                wait_for_js_ms: config.wait_for_js_ms,
                handle_infinite_scroll: false,
            },
        ) {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!("browser unavailable, skipping screenshot: {e}");
                None
            }
        }
    } else {
        None
    };

    let fetcher = Arc::new(Fetcher::new(
        &config.fetch,
        &config.user_agent,
        out_dir.join(".spool"),
        browser,
    )?);
    let rules = Arc::new(RuleSet::compile(&config.site_rules)?);

    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(PageCollector::new(fetcher, rules, screenshot)));
    let collector = registry
        .get("page")
        .ok_or_else(|| CrawlError::Config("page collector not registered".to_string()))?;

    let result = collector.fetch(&target).await?;
    let record = collector.extract(&result).await?;
    collector.export(&record, &out_dir).await?;

    if screenshot {
        if let Some(bytes) = &result.screenshot {
            let path = out_dir.join("screenshot.png");
            std::fs::write(&path, bytes).map_err(|e| CrawlError::Store(e.to_string()))?;
            info!(path = %path.display(), "screenshot written");
        }
    }

    if graph {
        let mut link_graph = LinkGraph::new();
        if let Some(links) = record.get("links").and_then(|l| l.as_array()) {
            for link in links {
                if let Some(to) = link.get("url").and_then(|u| u.as_str()) {
                    link_graph.link(target.as_str(), 0, to);
                }
            }
        }
        let path = out_dir.join("graph.json");
        let encoded = serde_json::to_string_pretty(&link_graph)
            .map_err(|e| CrawlError::Store(e.to_string()))?;
        std::fs::write(&path, encoded).map_err(|e| CrawlError::Store(e.to_string()))?;
        info!(
            nodes = link_graph.node_count(),
            edges = link_graph.edge_count(),
            path = %path.display(),
            "link graph written"
        );
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&record).map_err(|e| CrawlError::Store(e.to_string()))?
        );
    }

    Ok(())
}
