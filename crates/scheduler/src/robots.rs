use dashmap::DashMap;
use robotstxt::DefaultMatcher;
use url::Url;

/// Cached robots.txt verdicts per host. The fetch itself goes through the
/// normal fetcher; this only stores bodies and answers allow/deny.
pub struct RobotsCache {
    enabled: bool,
    agent: String,
    /// host -> robots body; None means unavailable (fetch failed or 4xx),
    /// which allows everything.
    entries: DashMap<String, Option<String>>,
}

impl RobotsCache {
    pub fn new(enabled: bool, agent: impl Into<String>) -> Self {
        Self {
            enabled,
            agent: agent.into(),
            entries: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// True when the host's robots.txt has not been collected yet.
    pub fn needs_fetch(&self, host: &str) -> bool {
        self.enabled && !self.entries.contains_key(host)
    }

    pub fn robots_url(url: &Url) -> Option<Url> {
        let mut robots = url.clone();
        robots.set_path("/robots.txt");
        robots.set_query(None);
        robots.set_fragment(None);
        Some(robots)
    }

    pub fn store(&self, host: &str, body: Option<String>) {
        self.entries.insert(host.to_string(), body);
    }

    /// Allow by default: disabled cache, unknown host, or missing robots.
    pub fn allows(&self, url: &Url) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(host) = url.host_str() else {
            return true;
        };
        let Some(entry) = self.entries.get(host) else {
            return true;
        };
        let Some(body) = entry.as_ref() else {
            return true;
        };
        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(body, &self.agent, url.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROBOTS: &str = "User-agent: *\nDisallow: /private/\n";

    #[test]
    fn test_disallowed_path_blocked() {
        let cache = RobotsCache::new(true, "deepharvest");
        cache.store("h", Some(ROBOTS.to_string()));
        assert!(!cache.allows(&Url::parse("http://h/private/x").unwrap()));
        assert!(cache.allows(&Url::parse("http://h/public").unwrap()));
    }

    #[test]
    fn test_missing_robots_allows_everything() {
        let cache = RobotsCache::new(true, "deepharvest");
        cache.store("h", None);
        assert!(cache.allows(&Url::parse("http://h/private/x").unwrap()));
    }

    #[test]
    fn test_disabled_cache_never_fetches() {
        let cache = RobotsCache::new(false, "deepharvest");
        assert!(!cache.needs_fetch("h"));
        assert!(cache.allows(&Url::parse("http://h/private/x").unwrap()));
    }

    #[test]
    fn test_needs_fetch_once_per_host() {
        let cache = RobotsCache::new(true, "deepharvest");
        assert!(cache.needs_fetch("h"));
        cache.store("h", Some(ROBOTS.to_string()));
        assert!(!cache.needs_fetch("h"));
    }

    #[test]
    fn test_robots_url_derivation() {
        let url = Url::parse("http://h:8080/a/b?q=1").unwrap();
        let robots = RobotsCache::robots_url(&url).unwrap();
        assert_eq!(robots.as_str(), "http://h:8080/robots.txt");
    }
}
