use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Cumulative run statistics. One owned instance per crawl, shared by
/// reference; snapshots feed the checkpoint header and the end-of-run
/// summary.
#[derive(Debug, Default)]
pub struct CrawlStats {
    pub admitted: AtomicU64,
    pub processed: AtomicU64,
    pub succeeded: AtomicU64,
    pub errored: AtomicU64,
    pub dropped: AtomicU64,
    pub duplicates: AtomicU64,
    errors_by_kind: DashMap<ErrorKind, u64>,
}

impl CrawlStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a transient failure that was retried and absorbed. It shows in
    /// the per-kind table without counting as a terminal error.
    pub fn record_retry(&self, kind: ErrorKind) {
        *self.errors_by_kind.entry(kind).or_insert(0) += 1;
    }

    pub fn record_error(&self, kind: ErrorKind) {
        // Cancellation is not a failure.
        if kind == ErrorKind::Cancelled {
            return;
        }
        self.errored.fetch_add(1, Ordering::Relaxed);
        *self.errors_by_kind.entry(kind).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut errors_by_kind = BTreeMap::new();
        for entry in self.errors_by_kind.iter() {
            errors_by_kind.insert(entry.key().as_str().to_string(), *entry.value());
        }
        StatsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            errors_by_kind,
        }
    }

    /// Reload counters from a checkpoint snapshot.
    pub fn restore(&self, snapshot: &StatsSnapshot) {
        self.admitted.store(snapshot.admitted, Ordering::Relaxed);
        self.processed.store(snapshot.processed, Ordering::Relaxed);
        self.succeeded.store(snapshot.succeeded, Ordering::Relaxed);
        self.errored.store(snapshot.errored, Ordering::Relaxed);
        self.dropped.store(snapshot.dropped, Ordering::Relaxed);
        self.duplicates.store(snapshot.duplicates, Ordering::Relaxed);
        self.errors_by_kind.clear();
        for (name, count) in &snapshot.errors_by_kind {
            if let Ok(kind) = serde_json::from_value::<ErrorKind>(serde_json::json!(name)) {
                self.errors_by_kind.insert(kind, *count);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub admitted: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub errored: u64,
    pub dropped: u64,
    pub duplicates: u64,
    #[serde(default)]
    pub errors_by_kind: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_never_counted_as_failure() {
        let stats = CrawlStats::new();
        stats.record_error(ErrorKind::Cancelled);
        assert_eq!(stats.snapshot().errored, 0);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let stats = CrawlStats::new();
        stats.admitted.store(10, Ordering::Relaxed);
        stats.processed.store(8, Ordering::Relaxed);
        stats.record_error(ErrorKind::Timeout);
        stats.record_error(ErrorKind::Timeout);

        let snap = stats.snapshot();
        assert_eq!(snap.errored, 2);
        assert_eq!(snap.errors_by_kind.get("timeout"), Some(&2));

        let restored = CrawlStats::new();
        restored.restore(&snap);
        assert_eq!(restored.snapshot(), snap);
    }
}
