use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::CrawlError;
use crate::rules::SiteRuleConfig;

/// Frontier ordering strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Bfs,
    Dfs,
    Priority,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub seed_urls: Vec<String>,
    pub max_depth: u32,
    pub max_urls: Option<u64>,
    pub concurrent_requests: usize,
    pub per_host_concurrency: usize,
    pub enable_js: bool,
    pub wait_for_js_ms: u64,
    pub handle_infinite_scroll: bool,
    pub strategy: Strategy,
    pub distributed: bool,
    pub redis_url: String,
    pub checkpoint_interval: u64,
    pub shutdown_grace_secs: u64,
    pub user_agent: String,
    pub max_pages_per_domain: Option<u64>,
    pub allowed_domains: AllowedDomainsConfig,
    pub site_rules: Vec<SiteRuleConfig>,
    pub fetch: FetchSettings,
    pub politeness: PolitenessSettings,
    pub frontier: FrontierSettings,
    pub trap: TrapSettings,

    /// Digest of the raw config text this was loaded from.
    #[serde(skip)]
    pub raw_digest: Option<String>,

    /// Anything not recognized above lands here and is reported at startup.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, toml::Value>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            seed_urls: Vec::new(),
            max_depth: 5,
            max_urls: None,
            concurrent_requests: 16,
            per_host_concurrency: 2,
            enable_js: false,
            wait_for_js_ms: 5000,
            handle_infinite_scroll: false,
            strategy: Strategy::Bfs,
            distributed: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            checkpoint_interval: 100,
            shutdown_grace_secs: 30,
            user_agent: concat!(
                "Mozilla/5.0 (compatible; DeepHarvest/0.1; ",
                "+https://github.com/anajrajeev/deepharvest)"
            )
            .to_string(),
            max_pages_per_domain: None,
            allowed_domains: AllowedDomainsConfig::default(),
            site_rules: Vec::new(),
            fetch: FetchSettings::default(),
            politeness: PolitenessSettings::default(),
            frontier: FrontierSettings::default(),
            trap: TrapSettings::default(),
            raw_digest: None,
            unknown: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowedDomainsConfig {
    pub exact: Vec<String>,
    pub suffix: Vec<String>,
    pub regex: Vec<String>,
}

impl AllowedDomainsConfig {
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.suffix.is_empty() && self.regex.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_redirects: u32,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub max_body_bytes: u64,
    pub spool_threshold_bytes: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
            max_redirects: 10,
            max_retries: 3,
            retry_base_ms: 500,
            retry_cap_ms: 30_000,
            max_body_bytes: 10 * 1024 * 1024,
            spool_threshold_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolitenessSettings {
    pub min_gap_ms: u64,
    pub respect_robots: bool,
    pub park_secs: u64,
}

impl Default for PolitenessSettings {
    fn default() -> Self {
        Self {
            min_gap_ms: 1000,
            respect_robots: false,
            park_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FrontierSettings {
    pub shards: usize,
    pub soft_cap: usize,
    pub lease_timeout_secs: u64,
    pub max_retries: u32,
    pub max_url_len: usize,
    pub tracking_params: Vec<String>,
}

impl Default for FrontierSettings {
    fn default() -> Self {
        Self {
            shards: 16,
            soft_cap: 1_000_000,
            lease_timeout_secs: 120,
            max_retries: 3,
            max_url_len: 2048,
            tracking_params: [
                "utm_source",
                "utm_medium",
                "utm_campaign",
                "utm_term",
                "utm_content",
                "gclid",
                "fbclid",
                "msclkid",
                "mc_cid",
                "mc_eid",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrapSettings {
    pub enabled: bool,
    pub calendar_window_years: i32,
    pub pagination_cap: u64,
    pub pagination_window: usize,
    pub sibling_cap: u64,
}

impl Default for TrapSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            calendar_window_years: 2,
            pagination_cap: 50,
            pagination_window: 5,
            sibling_cap: 200,
        }
    }
}

impl AppConfig {
    pub fn from_toml(raw: &str) -> Result<Self, CrawlError> {
        let mut config: AppConfig =
            toml::from_str(raw).map_err(|e| CrawlError::Config(e.to_string()))?;
        for key in config.unknown.keys() {
            warn!(key, "unrecognized config option ignored");
        }
        config.validate()?;
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        config.raw_digest = Some(hex::encode(hasher.finalize()));
        Ok(config)
    }

    fn validate(&self) -> Result<(), CrawlError> {
        if self.concurrent_requests == 0 {
            return Err(CrawlError::Config("concurrent_requests must be > 0".into()));
        }
        if self.per_host_concurrency == 0 {
            return Err(CrawlError::Config("per_host_concurrency must be > 0".into()));
        }
        if self.frontier.shards == 0 {
            return Err(CrawlError::Config("frontier.shards must be > 0".into()));
        }
        for pattern in &self.allowed_domains.regex {
            Regex::new(pattern).map_err(|e| {
                CrawlError::Config(format!("bad allowed_domains regex {pattern:?}: {e}"))
            })?;
        }
        Ok(())
    }

    /// Digest over the options a checkpoint must agree on to be restorable:
    /// the host allow-list and the normalization rules. Everything else may
    /// differ between runs with only a warning.
    pub fn compat_digest(&self) -> String {
        let mut exact = self.allowed_domains.exact.clone();
        let mut suffix = self.allowed_domains.suffix.clone();
        let mut regex = self.allowed_domains.regex.clone();
        let mut tracking = self.frontier.tracking_params.clone();
        exact.sort();
        suffix.sort();
        regex.sort();
        tracking.sort();

        let mut hasher = Sha256::new();
        for part in [&exact, &suffix, &regex, &tracking] {
            for item in part {
                hasher.update(item.as_bytes());
                hasher.update([0]);
            }
            hasher.update([0xff]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Compiled allowed-domains policy: exact / suffix / regex, first hit wins.
#[derive(Debug, Clone, Default)]
pub struct DomainPolicy {
    exact: Vec<String>,
    suffix: Vec<String>,
    regex: Vec<Regex>,
}

impl DomainPolicy {
    pub fn compile(cfg: &AllowedDomainsConfig) -> Result<Self, CrawlError> {
        let mut regex = Vec::with_capacity(cfg.regex.len());
        for pattern in &cfg.regex {
            regex.push(Regex::new(pattern).map_err(|e| {
                CrawlError::Config(format!("bad allowed_domains regex {pattern:?}: {e}"))
            })?);
        }
        Ok(Self {
            exact: cfg.exact.iter().map(|h| h.to_lowercase()).collect(),
            suffix: cfg.suffix.iter().map(|h| h.to_lowercase()).collect(),
            regex,
        })
    }

    /// Seed hosts are always crawlable: they become exact entries, and their
    /// subdomain trees are admitted via suffix entries.
    pub fn allow_seed_host(&mut self, host: &str) {
        let host = host.to_lowercase();
        if !self.exact.contains(&host) {
            self.suffix.push(host.clone());
            self.exact.push(host);
        }
    }

    pub fn allows(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        if self.exact.iter().any(|h| *h == host) {
            return true;
        }
        if self
            .suffix
            .iter()
            .any(|s| host == *s || host.ends_with(&format!(".{s}")))
        {
            return true;
        }
        self.regex.iter().any(|r| r.is_match(&host))
    }
}
