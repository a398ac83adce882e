use std::collections::HashMap;

use regex::Regex;
use serde::Deserialize;

use crate::error::CrawlError;

/// One site rule as it appears in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteRuleConfig {
    pub pattern: String,
    pub priority: i32,
    pub use_browser_directly: bool,
    pub require_js: bool,
    pub user_agent: Option<String>,
    pub headers: HashMap<String, String>,
}

impl Default for SiteRuleConfig {
    fn default() -> Self {
        Self {
            pattern: ".*".to_string(),
            priority: 0,
            use_browser_directly: false,
            require_js: false,
            user_agent: None,
            headers: HashMap::new(),
        }
    }
}

/// A compiled site rule.
#[derive(Debug, Clone)]
pub struct SiteRule {
    pub pattern: Regex,
    pub priority: i32,
    pub use_browser_directly: bool,
    pub require_js: bool,
    pub user_agent: Option<String>,
    pub headers: HashMap<String, String>,
}

impl SiteRule {
    fn catch_all() -> Self {
        Self {
            pattern: Regex::new(".*").unwrap(),
            priority: 0,
            use_browser_directly: false,
            require_js: false,
            user_agent: None,
            headers: HashMap::new(),
        }
    }
}

/// Ordered rule list: matched highest-priority-first, first match wins.
/// A catch-all rule at priority 0 is always present as the last resort.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<SiteRule>,
}

impl RuleSet {
    pub fn compile(configs: &[SiteRuleConfig]) -> Result<Self, CrawlError> {
        let mut rules = Vec::with_capacity(configs.len() + 1);
        for cfg in configs {
            let pattern = Regex::new(&cfg.pattern).map_err(|e| {
                CrawlError::Config(format!("bad site rule pattern {:?}: {e}", cfg.pattern))
            })?;
            rules.push(SiteRule {
                pattern,
                priority: cfg.priority,
                use_browser_directly: cfg.use_browser_directly,
                require_js: cfg.require_js,
                user_agent: cfg.user_agent.clone(),
                headers: cfg.headers.clone(),
            });
        }
        // Stable sort keeps file order within equal priorities.
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
        rules.push(SiteRule::catch_all());
        Ok(Self { rules })
    }

    pub fn match_url(&self, url: &str) -> &SiteRule {
        for rule in &self.rules {
            if rule.pattern.is_match(url) {
                return rule;
            }
        }
        // The trailing catch-all matches any input.
        &self.rules[self.rules.len() - 1]
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            rules: vec![SiteRule::catch_all()],
        }
    }
}
