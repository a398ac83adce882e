use std::cmp::Ordering as CmpOrdering;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use priority_queue::PriorityQueue;
use tokio::sync::Mutex;
use tracing::debug;

use deepharvest_core::config::FrontierSettings;
use deepharvest_core::{CompleteOutcome, CrawlError, Strategy, UrlRecord};

use crate::visited::VisitedSet;
use crate::{AdmitOutcome, Frontier, FrontierSnapshot, Lease};

/// Ranking key: higher priority first, shallower first on ties, FIFO within.
#[derive(Debug, Clone)]
struct QueueKey {
    priority: f64,
    depth: u32,
    seq: u64,
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.priority.to_bits() == other.priority.to_bits()
            && self.depth == other.depth
            && self.seq == other.seq
    }
}

impl Eq for QueueKey {}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: greater key pops first.
        self.priority
            .partial_cmp(&other.priority)
            .unwrap_or(CmpOrdering::Equal)
            .then_with(|| other.depth.cmp(&self.depth))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// URL key for the priority queue (must be Hash + Eq)
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct UrlKey(String);

/// Per-host queue with its own record storage.
struct HostQueue {
    queue: PriorityQueue<UrlKey, QueueKey>,
    records: HashMap<String, UrlRecord>,
}

impl HostQueue {
    fn new() -> Self {
        Self {
            queue: PriorityQueue::new(),
            records: HashMap::new(),
        }
    }

    fn push(&mut self, canonical: String, key: QueueKey, record: UrlRecord) {
        self.records.insert(canonical.clone(), record);
        self.queue.push(UrlKey(canonical), key);
    }

    /// Pop the top record if it is dispatchable now.
    fn pop_ready(&mut self) -> Option<UrlRecord> {
        let (top, _) = self.queue.peek()?;
        let record = self.records.get(&top.0)?;
        if let Some(not_before) = record.not_before {
            if not_before > Utc::now() {
                return None;
            }
        }
        let (key, _) = self.queue.pop()?;
        self.records.remove(&key.0)
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

struct Shard {
    hosts: HashMap<String, HostQueue>,
}

struct LeaseEntry {
    record: UrlRecord,
    worker: usize,
    deadline: Instant,
}

/// In-process frontier: per-host priority queues striped into shards by
/// host hash, one lock per shard. Admission marks the visited set and
/// enqueues under the same call, so racing admits of one canonical URL
/// resolve to a single frontier entry.
pub struct LocalFrontier {
    shards: Vec<Mutex<Shard>>,
    visited: VisitedSet,
    leases: DashMap<u64, LeaseEntry>,
    lease_seq: AtomicU64,
    seq: AtomicU64,
    queued: AtomicUsize,
    cursor: AtomicUsize,
    strategy: Strategy,
    soft_cap: usize,
    lease_timeout: Duration,
    max_retries: u32,
    backpressure_drops: AtomicU64,
}

impl LocalFrontier {
    pub fn new(strategy: Strategy, settings: &FrontierSettings) -> Self {
        let shards = (0..settings.shards)
            .map(|_| {
                Mutex::new(Shard {
                    hosts: HashMap::new(),
                })
            })
            .collect();
        Self {
            shards,
            visited: VisitedSet::new(),
            leases: DashMap::new(),
            lease_seq: AtomicU64::new(1),
            seq: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
            strategy,
            soft_cap: settings.soft_cap,
            lease_timeout: Duration::from_secs(settings.lease_timeout_secs),
            max_retries: settings.max_retries,
            backpressure_drops: AtomicU64::new(0),
        }
    }

    pub fn backpressure_drops(&self) -> u64 {
        self.backpressure_drops.load(Ordering::Relaxed)
    }

    fn shard_index(&self, host: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        host.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn queue_priority(&self, record: &UrlRecord) -> f64 {
        match self.strategy {
            Strategy::Bfs => 0.0,
            // Deepest-first: depth dominates the key.
            Strategy::Dfs => record.depth as f64,
            Strategy::Priority => record.priority,
        }
    }

    async fn enqueue(&self, record: UrlRecord) {
        let canonical = record.url.to_string();
        let key = QueueKey {
            priority: self.queue_priority(&record),
            depth: record.depth,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        let shard = &self.shards[self.shard_index(&record.host)];
        let mut guard = shard.lock().await;
        guard
            .hosts
            .entry(record.host.clone())
            .or_insert_with(HostQueue::new)
            .push(canonical, key, record);
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    fn make_lease(&self, record: UrlRecord, worker: usize) -> Lease {
        let id = self.lease_seq.fetch_add(1, Ordering::Relaxed);
        self.leases.insert(
            id,
            LeaseEntry {
                record: record.clone(),
                worker,
                deadline: Instant::now() + self.lease_timeout,
            },
        );
        Lease { id, worker, record }
    }

    /// Retry re-admission for reclaimed leases. Bypasses the visited check:
    /// the URL stays a member, it just goes around again.
    async fn requeue_retry(&self, mut record: UrlRecord) -> bool {
        if record.retry_count >= self.max_retries {
            debug!(url = %record.url, retries = record.retry_count, "retry budget exhausted");
            return false;
        }
        record.retry_count += 1;
        record.priority *= 0.5;
        let delay_secs = 5i64 << record.retry_count.min(6);
        record.not_before = Some(Utc::now() + chrono::Duration::seconds(delay_secs));
        self.enqueue(record).await;
        true
    }
}

#[async_trait]
impl Frontier for LocalFrontier {
    async fn admit(&self, record: UrlRecord) -> Result<AdmitOutcome, CrawlError> {
        let canonical = record.url.to_string();

        if record.retry_count == 0 {
            if self.queued.load(Ordering::Relaxed) >= self.soft_cap && record.depth > 0 {
                self.backpressure_drops.fetch_add(1, Ordering::Relaxed);
                return Ok(AdmitOutcome::Backpressure);
            }
            if !self.visited.insert_if_new(&canonical) {
                return Ok(AdmitOutcome::Duplicate);
            }
        }

        self.enqueue(record).await;
        Ok(AdmitOutcome::Admitted)
    }

    async fn lease(
        &self,
        host: Option<&str>,
        worker: usize,
    ) -> Result<Option<Lease>, CrawlError> {
        if let Some(host) = host {
            let shard = &self.shards[self.shard_index(host)];
            let mut guard = shard.lock().await;
            let Some(queue) = guard.hosts.get_mut(host) else {
                return Ok(None);
            };
            let record = queue.pop_ready();
            if queue.is_empty() {
                guard.hosts.remove(host);
            }
            drop(guard);
            return Ok(record.map(|r| {
                self.queued.fetch_sub(1, Ordering::Relaxed);
                self.make_lease(r, worker)
            }));
        }

        // No host constraint: rotate across shards.
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.shards.len() {
            let index = (start + offset) % self.shards.len();
            let mut guard = self.shards[index].lock().await;
            let mut popped: Option<UrlRecord> = None;
            let mut drained: Option<String> = None;
            for (host, queue) in guard.hosts.iter_mut() {
                if let Some(record) = queue.pop_ready() {
                    if queue.is_empty() {
                        drained = Some(host.clone());
                    }
                    popped = Some(record);
                    break;
                }
            }
            if let Some(host) = drained {
                guard.hosts.remove(&host);
            }
            drop(guard);
            if let Some(record) = popped {
                self.queued.fetch_sub(1, Ordering::Relaxed);
                return Ok(Some(self.make_lease(record, worker)));
            }
        }
        Ok(None)
    }

    async fn complete(&self, lease: Lease, _outcome: CompleteOutcome) -> Result<(), CrawlError> {
        // Success and failure are both terminal here: visited membership was
        // set at admission, so the URL can never re-enter either way.
        self.leases.remove(&lease.id);
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<Vec<String>, CrawlError> {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .leases
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut reclaimed = Vec::new();
        for id in expired {
            if let Some((_, entry)) = self.leases.remove(&id) {
                debug!(url = %entry.record.url, worker = entry.worker, "lease expired");
                let host = entry.record.host.clone();
                if self.requeue_retry(entry.record).await {
                    reclaimed.push(host);
                }
            }
        }
        Ok(reclaimed)
    }

    async fn pending(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    async fn inflight(&self) -> usize {
        self.leases.len()
    }

    async fn is_visited(&self, canonical: &str) -> Result<bool, CrawlError> {
        Ok(self.visited.contains(canonical))
    }

    async fn snapshot(&self) -> Result<FrontierSnapshot, CrawlError> {
        // Hold every shard lock at once so the snapshot is one instant.
        let mut guards = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            guards.push(shard.lock().await);
        }

        let mut pending: Vec<UrlRecord> = Vec::new();
        for guard in &guards {
            for queue in guard.hosts.values() {
                pending.extend(queue.records.values().cloned());
            }
        }
        for entry in self.leases.iter() {
            pending.push(entry.record.clone());
        }
        drop(guards);

        pending.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| a.depth.cmp(&b.depth))
                .then_with(|| a.discovered_at.cmp(&b.discovered_at))
        });

        let pending_urls: HashSet<String> =
            pending.iter().map(|r| r.url.to_string()).collect();
        let mut visited: Vec<String> = self
            .visited
            .iter_urls()
            .into_iter()
            .filter(|u| !pending_urls.contains(u))
            .collect();
        visited.sort();

        Ok(FrontierSnapshot { visited, pending })
    }

    async fn restore(&self, snapshot: FrontierSnapshot) -> Result<(), CrawlError> {
        self.visited.mark_batch(&snapshot.visited);
        for record in snapshot.pending {
            let canonical = record.url.to_string();
            if self.visited.insert_if_new(&canonical) {
                self.enqueue(record).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn settings() -> FrontierSettings {
        FrontierSettings::default()
    }

    fn record(url: &str, depth: u32, priority: f64) -> UrlRecord {
        let url = Url::parse(url).unwrap();
        let host = url.host_str().unwrap_or_default().to_string();
        UrlRecord {
            url,
            host,
            depth,
            priority,
            parent: None,
            discovered_at: Utc::now(),
            retry_count: 0,
            not_before: None,
        }
    }

    #[tokio::test]
    async fn test_admit_deduplicates_canonical_urls() {
        let frontier = LocalFrontier::new(Strategy::Bfs, &settings());
        let first = frontier.admit(record("http://h/a", 0, 1.0)).await.unwrap();
        let second = frontier.admit(record("http://h/a", 1, 0.2)).await.unwrap();
        assert_eq!(first, AdmitOutcome::Admitted);
        assert_eq!(second, AdmitOutcome::Duplicate);
        assert_eq!(frontier.pending().await, 1);
    }

    #[tokio::test]
    async fn test_lease_is_host_scoped() {
        let frontier = LocalFrontier::new(Strategy::Bfs, &settings());
        frontier.admit(record("http://a/x", 0, 1.0)).await.unwrap();
        frontier.admit(record("http://b/y", 0, 1.0)).await.unwrap();

        assert!(frontier.lease(Some("c"), 0).await.unwrap().is_none());
        let lease = frontier.lease(Some("a"), 0).await.unwrap().unwrap();
        assert_eq!(lease.record.host, "a");
        assert_eq!(frontier.pending().await, 1);
        assert_eq!(frontier.inflight().await, 1);
    }

    #[tokio::test]
    async fn test_priority_then_depth_then_fifo() {
        let mut cfg = settings();
        cfg.shards = 1;
        let frontier = LocalFrontier::new(Strategy::Priority, &cfg);
        frontier.admit(record("http://h/low", 2, 0.1)).await.unwrap();
        frontier.admit(record("http://h/deep", 3, 0.9)).await.unwrap();
        frontier.admit(record("http://h/shallow", 1, 0.9)).await.unwrap();
        frontier.admit(record("http://h/first", 1, 0.9)).await.unwrap();

        let mut order = Vec::new();
        while let Some(lease) = frontier.lease(Some("h"), 0).await.unwrap() {
            order.push(lease.record.url.path().to_string());
        }
        // 0.9 before 0.1; within 0.9 depth 1 before 3; within (0.9, 1) FIFO.
        assert_eq!(order, vec!["/shallow", "/first", "/deep", "/low"]);
    }

    #[tokio::test]
    async fn test_bfs_strategy_orders_by_depth_only() {
        let mut cfg = settings();
        cfg.shards = 1;
        let frontier = LocalFrontier::new(Strategy::Bfs, &cfg);
        frontier.admit(record("http://h/d2", 2, 0.9)).await.unwrap();
        frontier.admit(record("http://h/d0", 0, 0.1)).await.unwrap();
        frontier.admit(record("http://h/d1", 1, 0.5)).await.unwrap();

        let mut order = Vec::new();
        while let Some(lease) = frontier.lease(Some("h"), 0).await.unwrap() {
            order.push(lease.record.depth);
        }
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_dfs_strategy_pops_deepest_first() {
        let mut cfg = settings();
        cfg.shards = 1;
        let frontier = LocalFrontier::new(Strategy::Dfs, &cfg);
        frontier.admit(record("http://h/d1", 1, 1.0)).await.unwrap();
        frontier.admit(record("http://h/d3", 3, 1.0)).await.unwrap();
        frontier.admit(record("http://h/d2", 2, 1.0)).await.unwrap();

        let lease = frontier.lease(Some("h"), 0).await.unwrap().unwrap();
        assert_eq!(lease.record.depth, 3);
    }

    #[tokio::test]
    async fn test_reclaim_budget_is_finite() {
        let mut cfg = settings();
        cfg.max_retries = 1;
        cfg.lease_timeout_secs = 0;
        let frontier = LocalFrontier::new(Strategy::Bfs, &cfg);
        let mut retried = record("http://h/a", 0, 1.0);
        retried.retry_count = 1;
        frontier.admit(retried).await.unwrap();

        let lease = frontier.lease(Some("h"), 0).await.unwrap().unwrap();
        assert_eq!(lease.record.retry_count, 1);

        // The retry budget is spent, so the expired lease is not re-admitted.
        let reclaimed = frontier.reclaim_expired().await.unwrap();
        assert!(reclaimed.is_empty());
        assert_eq!(frontier.pending().await, 0);
        assert_eq!(frontier.inflight().await, 0);
    }

    #[tokio::test]
    async fn test_terminal_failure_stays_visited() {
        let frontier = LocalFrontier::new(Strategy::Bfs, &settings());
        frontier.admit(record("http://h/a", 0, 1.0)).await.unwrap();
        let lease = frontier.lease(Some("h"), 0).await.unwrap().unwrap();
        frontier
            .complete(
                lease,
                CompleteOutcome::Failure(deepharvest_core::ErrorKind::NetworkPermanent),
            )
            .await
            .unwrap();

        // A failed URL never un-counts: re-admission is refused.
        let again = frontier.admit(record("http://h/a", 0, 1.0)).await.unwrap();
        assert_eq!(again, AdmitOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_expired_leases_are_reclaimed() {
        let mut cfg = settings();
        cfg.lease_timeout_secs = 0;
        let frontier = LocalFrontier::new(Strategy::Bfs, &cfg);
        frontier.admit(record("http://h/a", 0, 1.0)).await.unwrap();
        let lease = frontier.lease(Some("h"), 0).await.unwrap().unwrap();
        assert_eq!(lease.record.retry_count, 0);

        let reclaimed = frontier.reclaim_expired().await.unwrap();
        assert_eq!(reclaimed, vec!["h".to_string()]);
        assert_eq!(frontier.inflight().await, 0);
        assert_eq!(frontier.pending().await, 1);

        // The re-admitted record carries a dispatch delay, so the host has
        // pending work that is not leasable yet.
        assert!(frontier.lease(Some("h"), 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backpressure_drops_children_over_soft_cap() {
        let mut cfg = settings();
        cfg.soft_cap = 1;
        let frontier = LocalFrontier::new(Strategy::Bfs, &cfg);
        frontier.admit(record("http://h/a", 0, 1.0)).await.unwrap();

        let child = frontier.admit(record("http://h/b", 1, 0.2)).await.unwrap();
        assert_eq!(child, AdmitOutcome::Backpressure);
        assert_eq!(frontier.backpressure_drops(), 1);

        // Seeds are exempt from the soft cap.
        let seed = frontier.admit(record("http://h/c", 0, 1.0)).await.unwrap();
        assert_eq!(seed, AdmitOutcome::Admitted);
    }

    #[tokio::test]
    async fn test_snapshot_partitions_visited_and_pending() {
        let frontier = LocalFrontier::new(Strategy::Bfs, &settings());
        frontier.admit(record("http://h/done", 0, 1.0)).await.unwrap();
        frontier.admit(record("http://h/queued", 1, 0.5)).await.unwrap();
        frontier.admit(record("http://h/leased", 1, 0.9)).await.unwrap();

        let lease = frontier.lease(Some("h"), 0).await.unwrap().unwrap();
        assert_eq!(lease.record.url.path(), "/done");
        frontier
            .complete(lease, CompleteOutcome::Success)
            .await
            .unwrap();
        // Next lease stays open: leased records still count as pending.
        let leased = frontier.lease(Some("h"), 0).await.unwrap().unwrap();
        assert_eq!(leased.record.url.path(), "/queued");

        let snapshot = frontier.snapshot().await.unwrap();
        assert_eq!(snapshot.visited, vec!["http://h/done".to_string()]);
        let mut pending: Vec<String> =
            snapshot.pending.iter().map(|r| r.url.to_string()).collect();
        pending.sort();
        assert_eq!(pending, vec!["http://h/leased", "http://h/queued"]);
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let frontier = LocalFrontier::new(Strategy::Bfs, &settings());
        frontier.admit(record("http://h/a", 0, 1.0)).await.unwrap();
        frontier.admit(record("http://h/b", 1, 0.5)).await.unwrap();
        let lease = frontier.lease(Some("h"), 0).await.unwrap().unwrap();
        frontier
            .complete(lease, CompleteOutcome::Success)
            .await
            .unwrap();

        let snapshot = frontier.snapshot().await.unwrap();
        let restored = LocalFrontier::new(Strategy::Bfs, &settings());
        restored.restore(snapshot).await.unwrap();

        // Visited URLs are not re-admittable; pending ones are leasable.
        assert_eq!(
            restored.admit(record("http://h/a", 0, 1.0)).await.unwrap(),
            AdmitOutcome::Duplicate
        );
        let lease = restored.lease(Some("h"), 0).await.unwrap().unwrap();
        assert_eq!(lease.record.url.as_str(), "http://h/b");
        assert!(restored.lease(Some("h"), 0).await.unwrap().is_none());
    }
}
