pub mod distributed;
pub mod local;
pub mod visited;

use async_trait::async_trait;

use deepharvest_core::{CompleteOutcome, CrawlError, UrlRecord};

pub use distributed::RedisFrontier;
pub use local::LocalFrontier;
pub use visited::VisitedSet;

/// What happened to an admission attempt that passed the outer checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Admitted,
    /// Canonical form already visited.
    Duplicate,
    /// Dropped because the frontier is over its soft cap.
    Backpressure,
}

/// A time-bounded claim on one frontier URL.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: u64,
    pub worker: usize,
    pub record: UrlRecord,
}

#[derive(Debug, Clone, Default)]
pub struct FrontierSnapshot {
    /// Canonical URLs that were admitted and are no longer pending.
    pub visited: Vec<String>,
    /// Records still waiting (queued or leased), priority-ordered.
    pub pending: Vec<UrlRecord>,
}

/// The frontier contract shared by local and distributed backends.
///
/// Dispatch is at-least-once: a lease that expires is re-admitted with an
/// incremented retry count, so workers must tolerate duplicate delivery
/// (the content deduper absorbs the duplicate work).
#[async_trait]
pub trait Frontier: Send + Sync {
    /// Atomic with respect to dedup: of two workers admitting the same
    /// canonical URL exactly one observes `Admitted`.
    async fn admit(&self, record: UrlRecord) -> Result<AdmitOutcome, CrawlError>;

    /// Lease one URL. `host` narrows the pop to a single host's queue
    /// (shard-aware); `None` lets the backend pick a shard.
    async fn lease(&self, host: Option<&str>, worker: usize)
        -> Result<Option<Lease>, CrawlError>;

    /// Settle a lease. Both outcomes are terminal for the URL; re-admission
    /// only happens through lease expiry (`reclaim_expired`).
    async fn complete(&self, lease: Lease, outcome: CompleteOutcome) -> Result<(), CrawlError>;

    /// Re-admit every lease whose deadline has passed. Returns the hosts of
    /// the re-admitted records so the scheduler can be re-armed.
    async fn reclaim_expired(&self) -> Result<Vec<String>, CrawlError>;

    async fn pending(&self) -> usize;

    async fn inflight(&self) -> usize;

    async fn is_visited(&self, canonical: &str) -> Result<bool, CrawlError>;

    async fn snapshot(&self) -> Result<FrontierSnapshot, CrawlError>;

    async fn restore(&self, snapshot: FrontierSnapshot) -> Result<(), CrawlError>;
}
