use std::ffi::OsString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use headless_chrome::{Browser, Tab};
use tracing::{debug, warn};
use url::Url;

use deepharvest_core::CrawlError;

/// Bounded lazy-load scroll passes.
const SCROLL_PASSES: u32 = 3;

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub wait_for_js_ms: u64,
    pub handle_infinite_scroll: bool,
}

/// Final DOM captured from a rendered page.
pub struct BrowserPage {
    pub html: String,
    pub final_url: Url,
    pub screenshot: Option<Vec<u8>>,
}

/// A pool of shared browser instances. Browsers are shared across URLs;
/// every fetch opens its own tab and closes it on all exit paths.
pub struct BrowserPool {
    browsers: Vec<Browser>,
    counter: AtomicUsize,
    options: BrowserOptions,
}

impl BrowserPool {
    pub fn new(size: usize, options: BrowserOptions) -> Result<Self, CrawlError> {
        let mut browsers = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            browsers.push(launch_browser()?);
        }
        Ok(Self {
            browsers,
            counter: AtomicUsize::new(0),
            options,
        })
    }

    fn next_browser(&self) -> &Browser {
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % self.browsers.len();
        &self.browsers[idx]
    }

    pub async fn fetch(&self, url: &Url, screenshot: bool) -> Result<BrowserPage, CrawlError> {
        let browser = self.next_browser();
        let tab = browser
            .new_tab()
            .map_err(|e| CrawlError::Network(format!("browser tab: {e}")))?;

        let result = self.drive(&tab, url, screenshot).await;

        // One page per fetch; the tab goes away no matter how we leave.
        if let Err(e) = tab.close(true) {
            warn!(url = %url, "tab close failed: {e}");
        }
        result
    }

    async fn drive(
        &self,
        tab: &Arc<Tab>,
        url: &Url,
        screenshot: bool,
    ) -> Result<BrowserPage, CrawlError> {
        debug!(url = %url, "browser navigation");
        tab.navigate_to(url.as_str())
            .map_err(|e| CrawlError::Network(format!("navigate: {e}")))?;
        tab.wait_until_navigated()
            .map_err(|e| CrawlError::Network(format!("navigation wait: {e}")))?;

        self.wait_for_idle(tab).await?;

        if self.options.handle_infinite_scroll {
            self.scroll_passes(tab).await;
        }

        let html = tab
            .get_content()
            .map_err(|e| CrawlError::Parse(format!("dom capture: {e}")))?;

        let final_url = Url::parse(&tab.get_url()).unwrap_or_else(|_| url.clone());

        let shot = if screenshot {
            match tab.capture_screenshot(
                headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption::Png,
                None,
                None,
                true,
            ) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(url = %url, "screenshot failed: {e}");
                    None
                }
            }
        } else {
            None
        };

        Ok(BrowserPage {
            html,
            final_url,
            screenshot: shot,
        })
    }

    /// Approximate network-idle: the DOM stopped growing between polls, or
    /// the configured budget ran out.
    async fn wait_for_idle(&self, tab: &Arc<Tab>) -> Result<(), CrawlError> {
        let budget = Duration::from_millis(self.options.wait_for_js_ms);
        let started = Instant::now();
        let mut last_len = 0usize;

        loop {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let len = tab.get_content().map(|c| c.len()).unwrap_or(0);
            if len > 0 && len == last_len {
                return Ok(());
            }
            last_len = len;
            if started.elapsed() >= budget {
                debug!("js idle budget exhausted, capturing as-is");
                return Ok(());
            }
        }
    }

    async fn scroll_passes(&self, tab: &Arc<Tab>) {
        for pass in 0..SCROLL_PASSES {
            let script = format!(
                "window.scrollTo({{ top: document.body.scrollHeight * {} / {}, behavior: 'instant' }});",
                pass + 1,
                SCROLL_PASSES
            );
            if tab.evaluate(&script, false).is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
    }
}

fn launch_browser() -> Result<Browser, CrawlError> {
    let mut extra_args: Vec<OsString> = Vec::new();

    // Required for running in Docker containers
    extra_args.push(OsString::from("--no-sandbox"));
    extra_args.push(OsString::from("--disable-dev-shm-usage"));
    extra_args.push(OsString::from("--disable-gpu"));

    let mut builder = headless_chrome::LaunchOptionsBuilder::default();
    builder
        .headless(true)
        .window_size(Some((1920, 1080)))
        .args(extra_args.iter().map(|a| a.as_ref()).collect());

    // Use CHROME_PATH env var if set (for Docker/custom installs)
    if let Ok(chrome_path) = std::env::var("CHROME_PATH") {
        builder.path(Some(std::path::PathBuf::from(chrome_path)));
    }

    let launch_options = builder
        .build()
        .map_err(|e| CrawlError::Config(format!("browser launch options: {e}")))?;

    Browser::new(launch_options).map_err(|e| CrawlError::Config(format!("browser launch: {e}")))
}
