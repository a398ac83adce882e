use std::collections::HashMap;
use std::collections::VecDeque;

use chrono::{Datelike, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;
use url::Url;

use deepharvest_core::config::TrapSettings;

/// What to do with a URL that tripped a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapVerdict {
    /// Admission proceeds at half priority.
    Deprioritize,
    /// Admission is refused.
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapKind {
    Calendar,
    SessionId,
    Pagination,
    ParameterExplosion,
    RepeatedSegments,
    Scored,
}

impl TrapKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrapKind::Calendar => "calendar",
            TrapKind::SessionId => "session_id",
            TrapKind::Pagination => "pagination",
            TrapKind::ParameterExplosion => "parameter_explosion",
            TrapKind::RepeatedSegments => "repeated_segments",
            TrapKind::Scored => "scored",
        }
    }
}

/// Seam for an external ML model. The core treats it as an opaque judge;
/// its verdict combines with the rules via logical OR.
pub trait TrapScorer: Send + Sync + 'static {
    fn judge(&self, url: &Url, depth: u32) -> Option<TrapVerdict>;
}

static CALENDAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(\d{4})/(\d{1,2})(?:/(\d{1,2}))?(?:/|$)").unwrap());

const SESSION_KEYS: &[&str] = &["sid", "sessionid", "phpsessid", "jsessionid", "s"];
const PAGE_KEYS: &[&str] = &["page", "p", "start", "offset"];
const SESSION_ENTROPY_BITS: f64 = 4.0;

/// Rule-based trap detection, consulted before admission.
pub struct TrapDetector {
    settings: TrapSettings,
    scorer: Option<Box<dyn TrapScorer>>,
    /// host+path -> query-string siblings observed.
    siblings: DashMap<String, u64>,
    /// host+path of a pagination series -> novelty of the last K pages.
    novelty: DashMap<String, VecDeque<bool>>,
}

impl TrapDetector {
    pub fn new(settings: TrapSettings) -> Self {
        Self {
            settings,
            scorer: None,
            siblings: DashMap::new(),
            novelty: DashMap::new(),
        }
    }

    pub fn with_scorer(mut self, scorer: Box<dyn TrapScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Inspect a candidate URL. `None` means no detector fired.
    pub fn inspect(&self, url: &Url, depth: u32) -> Option<(TrapKind, TrapVerdict)> {
        if !self.settings.enabled {
            return None;
        }

        let rule_hit = self
            .check_calendar(url, depth)
            .or_else(|| self.check_session_id(url))
            .or_else(|| self.check_pagination(url))
            .or_else(|| self.check_parameter_explosion(url))
            .or_else(|| self.check_repeated_segments(url));

        if let Some(hit) = rule_hit {
            debug!(url = %url, kind = hit.0.as_str(), "trap rule fired");
            return Some(hit);
        }

        if let Some(scorer) = &self.scorer {
            if let Some(verdict) = scorer.judge(url, depth) {
                return Some((TrapKind::Scored, verdict));
            }
        }
        None
    }

    /// Feed back whether a fetched page contained novel content. Pagination
    /// series only go stale when their recent pages stopped producing
    /// anything new.
    pub fn record_content(&self, url: &Url, novel: bool) {
        let Some(series) = pagination_series_key(url) else {
            return;
        };
        let mut window = self.novelty.entry(series).or_default();
        window.push_back(novel);
        while window.len() > self.settings.pagination_window {
            window.pop_front();
        }
    }

    fn check_calendar(&self, url: &Url, depth: u32) -> Option<(TrapKind, TrapVerdict)> {
        if depth <= 2 {
            return None;
        }
        let caps = CALENDAR_RE.captures(url.path())?;
        let year: i32 = caps.get(1)?.as_str().parse().ok()?;
        let month: u32 = caps.get(2)?.as_str().parse().ok()?;
        if !(1..=12).contains(&month) {
            return None;
        }
        if let Some(day) = caps.get(3) {
            let day: u32 = day.as_str().parse().ok()?;
            if !(1..=31).contains(&day) {
                return None;
            }
        }
        let window = self.settings.calendar_window_years;
        if (year - Utc::now().year()).abs() <= window {
            return None;
        }
        Some((TrapKind::Calendar, TrapVerdict::Block))
    }

    fn check_session_id(&self, url: &Url) -> Option<(TrapKind, TrapVerdict)> {
        for (key, value) in url.query_pairs() {
            if SESSION_KEYS.contains(&key.to_ascii_lowercase().as_str())
                && shannon_entropy(&value) > SESSION_ENTROPY_BITS
            {
                return Some((TrapKind::SessionId, TrapVerdict::Block));
            }
        }
        None
    }

    fn check_pagination(&self, url: &Url) -> Option<(TrapKind, TrapVerdict)> {
        let mut page_value: Option<u64> = None;
        for (key, value) in url.query_pairs() {
            if PAGE_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
                if let Ok(n) = value.parse::<u64>() {
                    page_value = Some(page_value.map_or(n, |prev| prev.max(n)));
                }
            }
        }
        let page = page_value?;
        if page <= self.settings.pagination_cap {
            return None;
        }
        let series = pagination_series_key(url)?;
        let window = self.novelty.get(&series)?;
        if window.len() >= self.settings.pagination_window && window.iter().all(|novel| !novel) {
            return Some((TrapKind::Pagination, TrapVerdict::Block));
        }
        None
    }

    fn check_parameter_explosion(&self, url: &Url) -> Option<(TrapKind, TrapVerdict)> {
        url.query()?;
        let key = format!("{}{}", url.host_str().unwrap_or_default(), url.path());
        let mut count = self.siblings.entry(key).or_insert(0);
        *count += 1;
        if *count > self.settings.sibling_cap {
            return Some((TrapKind::ParameterExplosion, TrapVerdict::Block));
        }
        None
    }

    fn check_repeated_segments(&self, url: &Url) -> Option<(TrapKind, TrapVerdict)> {
        let mut counts: HashMap<&str, u32> = HashMap::new();
        for segment in url.path().split('/').filter(|s| !s.is_empty()) {
            let n = counts.entry(segment).or_insert(0);
            *n += 1;
            if *n >= 3 {
                return Some((TrapKind::RepeatedSegments, TrapVerdict::Block));
            }
        }
        None
    }
}

/// host+path with a trailing page-number segment removed, so `?page=51` and
/// `?page=52` land in the same series.
fn pagination_series_key(url: &Url) -> Option<String> {
    let has_page_key = url
        .query_pairs()
        .any(|(k, _)| PAGE_KEYS.contains(&k.to_ascii_lowercase().as_str()));
    if !has_page_key {
        return None;
    }
    Some(format!(
        "{}{}",
        url.host_str().unwrap_or_default(),
        url.path()
    ))
}

fn shannon_entropy(value: &str) -> f64 {
    if value.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<char, u32> = HashMap::new();
    let mut total = 0u32;
    for c in value.chars() {
        *counts.entry(c).or_insert(0) += 1;
        total += 1;
    }
    let total = total as f64;
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total;
            -p * p.log2()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> TrapDetector {
        TrapDetector::new(TrapSettings::default())
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_calendar_trap_beyond_window() {
        let d = detector();
        let hit = d.inspect(&url("http://h/archive/1999/01/05/post"), 3);
        assert_eq!(hit, Some((TrapKind::Calendar, TrapVerdict::Block)));
    }

    #[test]
    fn test_calendar_allowed_at_shallow_depth() {
        let d = detector();
        assert!(d.inspect(&url("http://h/archive/1999/01/05/post"), 2).is_none());
    }

    #[test]
    fn test_calendar_allowed_within_window() {
        let d = detector();
        let year = Utc::now().year();
        let u = url(&format!("http://h/archive/{year}/01/05/post"));
        assert!(d.inspect(&u, 5).is_none());
    }

    #[test]
    fn test_session_id_with_high_entropy_value() {
        let d = detector();
        let hit = d.inspect(&url("http://h/page?phpsessid=a8Bz3kQ9mN2xV7cR1pL5wY4t"), 1);
        assert_eq!(hit, Some((TrapKind::SessionId, TrapVerdict::Block)));
    }

    #[test]
    fn test_session_key_with_plain_value_allowed() {
        let d = detector();
        assert!(d.inspect(&url("http://h/search?s=rust"), 1).is_none());
    }

    #[test]
    fn test_pagination_needs_both_cap_and_stale_window() {
        let d = detector();
        let deep = url("http://h/list?page=90");

        // Over the cap but no novelty history yet: allowed.
        assert!(d.inspect(&deep, 1).is_none());

        // Five consecutive pages without new content: series goes stale.
        for page in 85..90 {
            d.record_content(&url(&format!("http://h/list?page={page}")), false);
        }
        assert_eq!(
            d.inspect(&deep, 1),
            Some((TrapKind::Pagination, TrapVerdict::Block))
        );

        // Under the cap stays admissible regardless.
        assert!(d.inspect(&url("http://h/list?page=3"), 1).is_none());
    }

    #[test]
    fn test_pagination_window_recovers_on_novel_content() {
        let d = detector();
        for page in 80..84 {
            d.record_content(&url(&format!("http://h/list?page={page}")), false);
        }
        d.record_content(&url("http://h/list?page=84"), true);
        assert!(d.inspect(&url("http://h/list?page=90"), 1).is_none());
    }

    #[test]
    fn test_parameter_explosion_after_sibling_cap() {
        let settings = TrapSettings {
            sibling_cap: 10,
            ..TrapSettings::default()
        };
        let d = TrapDetector::new(settings);
        for i in 0..10 {
            assert!(d.inspect(&url(&format!("http://h/items?q={i}")), 1).is_none());
        }
        assert_eq!(
            d.inspect(&url("http://h/items?q=next"), 1),
            Some((TrapKind::ParameterExplosion, TrapVerdict::Block))
        );
    }

    #[test]
    fn test_repeated_path_segments() {
        let d = detector();
        assert_eq!(
            d.inspect(&url("http://h/a/b/a/c/a"), 1),
            Some((TrapKind::RepeatedSegments, TrapVerdict::Block))
        );
        assert!(d.inspect(&url("http://h/a/b/a/c"), 1).is_none());
    }

    #[test]
    fn test_disabled_detector_fires_nothing() {
        let settings = TrapSettings {
            enabled: false,
            ..TrapSettings::default()
        };
        let d = TrapDetector::new(settings);
        assert!(d.inspect(&url("http://h/a/a/a/a"), 9).is_none());
    }

    #[test]
    fn test_scorer_combines_with_rules_via_or() {
        struct AlwaysDeprioritize;
        impl TrapScorer for AlwaysDeprioritize {
            fn judge(&self, _url: &Url, _depth: u32) -> Option<TrapVerdict> {
                Some(TrapVerdict::Deprioritize)
            }
        }
        let d = detector().with_scorer(Box::new(AlwaysDeprioritize));

        // Rules silent: the scorer's verdict stands.
        assert_eq!(
            d.inspect(&url("http://h/plain"), 1),
            Some((TrapKind::Scored, TrapVerdict::Deprioritize))
        );
        // A rule hit wins outright.
        assert_eq!(
            d.inspect(&url("http://h/a/a/a"), 1),
            Some((TrapKind::RepeatedSegments, TrapVerdict::Block))
        );
    }

    #[test]
    fn test_entropy_estimates() {
        assert!(shannon_entropy("aaaaaaaa") < 0.1);
        assert!(shannon_entropy("a8Bz3kQ9mN2xV7cR1pL5wY4t") > 4.0);
    }
}
