use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use url::Url;

use deepharvest_core::{
    CrawlError, CrawlMetrics, CrawlStats, DomainPolicy, UrlNormalizer, UrlRecord,
};
use deepharvest_frontier::{AdmitOutcome, Frontier};
use deepharvest_scheduler::HostScheduler;
use deepharvest_trap::{TrapDetector, TrapVerdict};

/// Why a candidate URL never made it into the frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Invalid,
    Scheme,
    UrlTooLong,
    Domain,
    Depth,
    Capacity,
    DomainCap,
    Trap,
    Backpressure,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Invalid => "invalid",
            DropReason::Scheme => "scheme",
            DropReason::UrlTooLong => "url_too_long",
            DropReason::Domain => "disallowed_by_policy",
            DropReason::Depth => "depth",
            DropReason::Capacity => "capacity",
            DropReason::DomainCap => "domain_cap",
            DropReason::Trap => "trap_detected",
            DropReason::Backpressure => "backpressure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admitted {
    Yes,
    Duplicate,
    Dropped(DropReason),
}

/// The admission pipeline of checks in front of the frontier, in order:
/// scheme, domain policy, depth, crawl-size caps, trap verdict, then the
/// atomic dedup-and-enqueue.
pub struct AdmissionPipeline {
    normalizer: UrlNormalizer,
    policy: Arc<DomainPolicy>,
    max_depth: u32,
    max_urls: Option<u64>,
    max_url_len: usize,
    max_pages_per_domain: Option<u64>,
    per_host_admits: DashMap<String, u64>,
    trap: Arc<TrapDetector>,
    frontier: Arc<dyn Frontier>,
    scheduler: Arc<HostScheduler>,
    stats: Arc<CrawlStats>,
    metrics: Arc<CrawlMetrics>,
}

impl AdmissionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        normalizer: UrlNormalizer,
        policy: Arc<DomainPolicy>,
        max_depth: u32,
        max_urls: Option<u64>,
        max_url_len: usize,
        max_pages_per_domain: Option<u64>,
        trap: Arc<TrapDetector>,
        frontier: Arc<dyn Frontier>,
        scheduler: Arc<HostScheduler>,
        stats: Arc<CrawlStats>,
        metrics: Arc<CrawlMetrics>,
    ) -> Self {
        Self {
            normalizer,
            policy,
            max_depth,
            max_urls,
            max_url_len,
            max_pages_per_domain,
            per_host_admits: DashMap::new(),
            trap,
            frontier,
            scheduler,
            stats,
            metrics,
        }
    }

    pub fn normalize(&self, raw: &str, base: Option<&Url>) -> Result<Url, CrawlError> {
        self.normalizer.normalize(raw, base)
    }

    /// Gate applied to every redirect hop: same scheme and domain policy as
    /// initial admission, without touching dedup state.
    pub fn hop_allowed(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
            && url
                .host_str()
                .is_some_and(|host| self.policy.allows(host))
    }

    pub async fn admit_seed(&self, raw: &str) -> Result<Admitted, CrawlError> {
        let url = match self.normalize(raw, None) {
            Ok(url) => url,
            Err(e) => {
                debug!(url = raw, "seed rejected: {e}");
                return Ok(self.dropped(raw, DropReason::Invalid));
            }
        };
        self.admit_record(UrlRecord::seed(url)).await
    }

    pub async fn admit_link(
        &self,
        raw: &str,
        parent: &UrlRecord,
    ) -> Result<Admitted, CrawlError> {
        let url = match self.normalize(raw, Some(&parent.url)) {
            Ok(url) => url,
            Err(_) => return Ok(self.dropped(raw, DropReason::Invalid)),
        };
        let priority = 1.0 / (parent.depth as f64 + 2.0);
        self.admit_record(UrlRecord::child(url, parent, priority)).await
    }

    async fn admit_record(&self, mut record: UrlRecord) -> Result<Admitted, CrawlError> {
        let canonical = record.url.to_string();

        if !matches!(record.url.scheme(), "http" | "https") {
            return Ok(self.dropped(&canonical, DropReason::Scheme));
        }
        if canonical.len() > self.max_url_len {
            return Ok(self.dropped(&canonical, DropReason::UrlTooLong));
        }
        if record.host.is_empty() || !self.policy.allows(&record.host) {
            return Ok(self.dropped(&canonical, DropReason::Domain));
        }
        if record.depth > self.max_depth {
            return Ok(self.dropped(&canonical, DropReason::Depth));
        }
        if let Some(max_urls) = self.max_urls {
            if self.stats.admitted.load(Ordering::Relaxed) >= max_urls {
                return Ok(self.dropped(&canonical, DropReason::Capacity));
            }
        }
        if let Some(cap) = self.max_pages_per_domain {
            let admitted_here = self
                .per_host_admits
                .get(&record.host)
                .map(|c| *c)
                .unwrap_or(0);
            if admitted_here >= cap {
                return Ok(self.dropped(&canonical, DropReason::DomainCap));
            }
        }

        match self.trap.inspect(&record.url, record.depth) {
            Some((kind, TrapVerdict::Block)) => {
                self.metrics
                    .traps_total
                    .with_label_values(&[kind.as_str()])
                    .inc();
                return Ok(self.dropped(&canonical, DropReason::Trap));
            }
            Some((kind, TrapVerdict::Deprioritize)) => {
                self.metrics
                    .traps_total
                    .with_label_values(&[kind.as_str()])
                    .inc();
                record.priority *= 0.5;
            }
            None => {}
        }

        match self.frontier.admit(record.clone()).await? {
            AdmitOutcome::Admitted => {
                self.stats.admitted.fetch_add(1, Ordering::Relaxed);
                self.metrics.urls_admitted_total.inc();
                if self.max_pages_per_domain.is_some() {
                    *self.per_host_admits.entry(record.host.clone()).or_insert(0) += 1;
                }
                self.scheduler.note_work(&record.host);
                Ok(Admitted::Yes)
            }
            AdmitOutcome::Duplicate => {
                self.metrics
                    .duplicates_total
                    .with_label_values(&["url"])
                    .inc();
                Ok(Admitted::Duplicate)
            }
            AdmitOutcome::Backpressure => {
                Ok(self.dropped(&canonical, DropReason::Backpressure))
            }
        }
    }

    fn dropped(&self, url: &str, reason: DropReason) -> Admitted {
        debug!(url, reason = reason.as_str(), "url dropped at admission");
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .urls_dropped_total
            .with_label_values(&[reason.as_str()])
            .inc();
        Admitted::Dropped(reason)
    }
}
