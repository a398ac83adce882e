use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, warn};

use deepharvest_core::config::FrontierSettings;
use deepharvest_core::{CompleteOutcome, CrawlError, Strategy, UrlRecord};

use crate::{AdmitOutcome, Frontier, FrontierSnapshot, Lease};

/// Key layout in the shared store:
///   frontier:shard:{i}  sorted set, score = -priority (ties by depth)
///   visited             set of canonical URLs (the admission CAS)
///   visited:bloom       bitmap fronting the visited set
///   lease:{id}          hash {record, worker, deadline}, expiring
///   stats               hash of counters
///   hoststate:{host}    hash, currently the adaptive backoff multiplier
const VISITED_KEY: &str = "visited";
const BLOOM_KEY: &str = "visited:bloom";
const STATS_KEY: &str = "stats";

const BLOOM_BITS: u64 = 1 << 25;
const BLOOM_HASHES: u64 = 4;

/// Retries sort behind everything fresh in their shard.
const RETRY_SCORE_PENALTY: f64 = 1_000.0;

fn fnv1a64(bytes: &[u8], salt: u64) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64 ^ salt;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn bloom_positions(canonical: &str) -> Vec<u64> {
    (0..BLOOM_HASHES)
        .map(|i| fnv1a64(canonical.as_bytes(), i.wrapping_mul(0x9e37_79b9_7f4a_7c15)) % BLOOM_BITS)
        .collect()
}

/// Redis-backed frontier for distributed crawls. Workers are stateless;
/// `SADD visited` is the admission compare-and-set, shard sorted-sets hold
/// the queue, and leases are reclaimed by deadline scan.
pub struct RedisFrontier {
    conn: MultiplexedConnection,
    shards: usize,
    strategy: Strategy,
    lease_timeout: Duration,
    max_retries: u32,
}

impl RedisFrontier {
    pub async fn connect(
        redis_url: &str,
        strategy: Strategy,
        settings: &FrontierSettings,
    ) -> Result<Self, CrawlError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| CrawlError::Store(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| CrawlError::Store(e.to_string()))?;
        Ok(Self {
            conn,
            shards: settings.shards,
            strategy,
            lease_timeout: Duration::from_secs(settings.lease_timeout_secs),
            max_retries: settings.max_retries,
        })
    }

    fn shard_key(&self, host: &str) -> String {
        let shard = fnv1a64(host.as_bytes(), 0) % self.shards as u64;
        format!("frontier:shard:{shard}")
    }

    fn score(&self, record: &UrlRecord) -> f64 {
        let priority = match self.strategy {
            Strategy::Bfs => 0.0,
            Strategy::Dfs => record.depth as f64,
            Strategy::Priority => record.priority,
        };
        let mut score = -priority + record.depth as f64 * 1e-6;
        if record.retry_count > 0 {
            score += RETRY_SCORE_PENALTY;
        }
        score
    }

    fn encode(record: &UrlRecord) -> Result<String, CrawlError> {
        serde_json::to_string(record).map_err(|e| CrawlError::Store(e.to_string()))
    }

    fn decode(raw: &str) -> Result<UrlRecord, CrawlError> {
        serde_json::from_str(raw).map_err(|e| CrawlError::Store(e.to_string()))
    }

    async fn push_record(&self, record: &UrlRecord) -> Result<(), CrawlError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(self.shard_key(&record.host), Self::encode(record)?, self.score(record))
            .await
            .map_err(|e| CrawlError::Store(e.to_string()))?;
        Ok(())
    }

    async fn register_lease(&self, record: UrlRecord, worker: usize) -> Result<Lease, CrawlError> {
        let mut conn = self.conn.clone();
        let id: u64 = conn
            .hincr(STATS_KEY, "lease_seq", 1)
            .await
            .map_err(|e| CrawlError::Store(e.to_string()))?;
        let deadline_ms = Utc::now().timestamp_millis() + self.lease_timeout.as_millis() as i64;
        let key = format!("lease:{id}");
        let mut pipe = redis::pipe();
        pipe.hset(&key, "record", Self::encode(&record)?)
            .hset(&key, "worker", worker as u64)
            .hset(&key, "deadline", deadline_ms)
            // GC backstop at twice the timeout; the reclaim scan runs first.
            .pexpire(&key, self.lease_timeout.as_millis() as i64 * 2)
            .hincr(STATS_KEY, "inflight", 1);
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| CrawlError::Store(e.to_string()))?;
        Ok(Lease { id, worker, record })
    }

    async fn requeue_retry(&self, mut record: UrlRecord) -> Result<bool, CrawlError> {
        if record.retry_count >= self.max_retries {
            debug!(url = %record.url, retries = record.retry_count, "retry budget exhausted");
            return Ok(false);
        }
        record.retry_count += 1;
        record.priority *= 0.5;
        record.not_before =
            Some(Utc::now() + chrono::Duration::seconds(5i64 << record.retry_count.min(6)));
        self.push_record(&record).await?;
        Ok(true)
    }

    async fn lease_keys(&self) -> Result<Vec<String>, CrawlError> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<'_, String> = conn
            .scan_match("lease:*")
            .await
            .map_err(|e| CrawlError::Store(e.to_string()))?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    /// Persist a host's adaptive backoff multiplier; the only piece of Host
    /// State that survives worker restarts.
    pub async fn save_host_backoff(&self, host: &str, multiplier: f64) -> Result<(), CrawlError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(format!("hoststate:{host}"), "backoff", multiplier)
            .await
            .map_err(|e| CrawlError::Store(e.to_string()))?;
        Ok(())
    }

    pub async fn load_host_backoff(&self, host: &str) -> Result<Option<f64>, CrawlError> {
        let mut conn = self.conn.clone();
        conn.hget(format!("hoststate:{host}"), "backoff")
            .await
            .map_err(|e| CrawlError::Store(e.to_string()))
    }
}

#[async_trait]
impl Frontier for RedisFrontier {
    async fn admit(&self, record: UrlRecord) -> Result<AdmitOutcome, CrawlError> {
        let canonical = record.url.to_string();
        let mut conn = self.conn.clone();

        if record.retry_count == 0 {
            // SADD is the compare-and-set: exactly one concurrent admitter
            // of a canonical URL sees 1 here.
            let added: u64 = conn
                .sadd(VISITED_KEY, &canonical)
                .await
                .map_err(|e| CrawlError::Store(e.to_string()))?;
            if added == 0 {
                return Ok(AdmitOutcome::Duplicate);
            }

            let mut pipe = redis::pipe();
            for position in bloom_positions(&canonical) {
                pipe.setbit(BLOOM_KEY, position as usize, true);
            }
            pipe.hincr(STATS_KEY, "admitted", 1);
            let _: () = pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| CrawlError::Store(e.to_string()))?;
        }

        self.push_record(&record).await?;
        Ok(AdmitOutcome::Admitted)
    }

    async fn lease(
        &self,
        host: Option<&str>,
        worker: usize,
    ) -> Result<Option<Lease>, CrawlError> {
        let mut conn = self.conn.clone();
        let shard_keys: Vec<String> = match host {
            Some(host) => vec![self.shard_key(host)],
            None => (0..self.shards).map(|i| format!("frontier:shard:{i}")).collect(),
        };

        for key in shard_keys {
            let popped: Vec<(String, f64)> = conn
                .zpopmin(&key, 1)
                .await
                .map_err(|e| CrawlError::Store(e.to_string()))?;
            let Some((raw, _score)) = popped.into_iter().next() else {
                continue;
            };
            let record = Self::decode(&raw)?;
            return Ok(Some(self.register_lease(record, worker).await?));
        }
        Ok(None)
    }

    async fn complete(&self, lease: Lease, outcome: CompleteOutcome) -> Result<(), CrawlError> {
        let mut conn = self.conn.clone();
        let counter = match outcome {
            CompleteOutcome::Success => "succeeded",
            CompleteOutcome::Failure(_) => "errored",
        };
        let mut pipe = redis::pipe();
        pipe.del(format!("lease:{}", lease.id))
            .hincr(STATS_KEY, "inflight", -1)
            .hincr(STATS_KEY, counter, 1);
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| CrawlError::Store(e.to_string()))?;
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<Vec<String>, CrawlError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut reclaimed = Vec::new();
        let mut conn = self.conn.clone();

        for key in self.lease_keys().await? {
            let fields: std::collections::HashMap<String, String> = conn
                .hgetall(&key)
                .await
                .map_err(|e| CrawlError::Store(e.to_string()))?;
            let Some(deadline) = fields.get("deadline").and_then(|d| d.parse::<i64>().ok())
            else {
                continue;
            };
            if deadline > now_ms {
                continue;
            }
            let Some(raw) = fields.get("record") else {
                continue;
            };
            let record = Self::decode(raw)?;
            warn!(url = %record.url, lease = %key, "reclaiming expired lease");
            let mut pipe = redis::pipe();
            pipe.del(&key).hincr(STATS_KEY, "inflight", -1);
            let _: () = pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| CrawlError::Store(e.to_string()))?;
            let host = record.host.clone();
            if self.requeue_retry(record).await? {
                reclaimed.push(host);
            }
        }
        Ok(reclaimed)
    }

    async fn pending(&self) -> usize {
        let mut conn = self.conn.clone();
        let mut total = 0usize;
        for i in 0..self.shards {
            let count: Result<usize, _> = conn.zcard(format!("frontier:shard:{i}")).await;
            total += count.unwrap_or(0);
        }
        total
    }

    async fn inflight(&self) -> usize {
        let mut conn = self.conn.clone();
        let count: Result<Option<i64>, _> = conn.hget(STATS_KEY, "inflight").await;
        count.ok().flatten().unwrap_or(0).max(0) as usize
    }

    async fn is_visited(&self, canonical: &str) -> Result<bool, CrawlError> {
        let mut conn = self.conn.clone();

        // Bloom first: a definite negative saves the exact-set round trip.
        let mut pipe = redis::pipe();
        for position in bloom_positions(canonical) {
            pipe.getbit(BLOOM_KEY, position as usize);
        }
        let bits: Vec<bool> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| CrawlError::Store(e.to_string()))?;
        if bits.iter().any(|bit| !bit) {
            return Ok(false);
        }

        // Bloom hit: consult the exact set to rule out a false positive.
        conn.sismember(VISITED_KEY, canonical)
            .await
            .map_err(|e| CrawlError::Store(e.to_string()))
    }

    async fn snapshot(&self) -> Result<FrontierSnapshot, CrawlError> {
        let mut conn = self.conn.clone();

        let mut pending: Vec<UrlRecord> = Vec::new();
        for i in 0..self.shards {
            let members: Vec<String> = conn
                .zrange(format!("frontier:shard:{i}"), 0, -1)
                .await
                .map_err(|e| CrawlError::Store(e.to_string()))?;
            for raw in members {
                pending.push(Self::decode(&raw)?);
            }
        }
        for key in self.lease_keys().await? {
            let raw: Option<String> = conn
                .hget(&key, "record")
                .await
                .map_err(|e| CrawlError::Store(e.to_string()))?;
            if let Some(raw) = raw {
                pending.push(Self::decode(&raw)?);
            }
        }

        let pending_urls: std::collections::HashSet<String> =
            pending.iter().map(|r| r.url.to_string()).collect();
        let mut visited: Vec<String> = conn
            .smembers::<_, Vec<String>>(VISITED_KEY)
            .await
            .map_err(|e| CrawlError::Store(e.to_string()))?
            .into_iter()
            .filter(|u| !pending_urls.contains(u))
            .collect();
        visited.sort();

        Ok(FrontierSnapshot { visited, pending })
    }

    async fn restore(&self, snapshot: FrontierSnapshot) -> Result<(), CrawlError> {
        let mut conn = self.conn.clone();
        for chunk in snapshot.visited.chunks(1000) {
            let _: () = conn
                .sadd(VISITED_KEY, chunk)
                .await
                .map_err(|e| CrawlError::Store(e.to_string()))?;
            let mut pipe = redis::pipe();
            for url in chunk {
                for position in bloom_positions(url) {
                    pipe.setbit(BLOOM_KEY, position as usize, true);
                }
            }
            let _: () = pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| CrawlError::Store(e.to_string()))?;
        }
        for record in snapshot.pending {
            let canonical = record.url.to_string();
            let added: u64 = conn
                .sadd(VISITED_KEY, &canonical)
                .await
                .map_err(|e| CrawlError::Store(e.to_string()))?;
            if added == 1 {
                self.push_record(&record).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn record(url: &str, depth: u32, priority: f64, retry: u32) -> UrlRecord {
        let url = Url::parse(url).unwrap();
        let host = url.host_str().unwrap_or_default().to_string();
        UrlRecord {
            url,
            host,
            depth,
            priority,
            parent: None,
            discovered_at: Utc::now(),
            retry_count: retry,
            not_before: None,
        }
    }

    #[test]
    fn test_bloom_positions_are_stable_and_bounded() {
        let a = bloom_positions("http://h/a");
        assert_eq!(a, bloom_positions("http://h/a"));
        assert_eq!(a.len(), BLOOM_HASHES as usize);
        assert!(a.iter().all(|&p| p < BLOOM_BITS));
        assert_ne!(a, bloom_positions("http://h/b"));
    }

    #[test]
    fn test_wire_codec_round_trip() {
        let original = record("http://h/a?x=1", 2, 0.25, 1);
        let encoded = RedisFrontier::encode(&original).unwrap();
        let decoded = RedisFrontier::decode(&encoded).unwrap();
        assert_eq!(decoded.url, original.url);
        assert_eq!(decoded.depth, 2);
        assert_eq!(decoded.retry_count, 1);
    }

    #[test]
    fn test_scores_order_priority_then_depth() {
        let frontier_score = |record: &UrlRecord| {
            // Mirror of score() without a live connection.
            -record.priority + record.depth as f64 * 1e-6
                + if record.retry_count > 0 {
                    RETRY_SCORE_PENALTY
                } else {
                    0.0
                }
        };
        let high = record("http://h/hi", 1, 0.9, 0);
        let low = record("http://h/lo", 1, 0.1, 0);
        let retry = record("http://h/re", 1, 0.9, 1);
        assert!(frontier_score(&high) < frontier_score(&low));
        assert!(frontier_score(&low) < frontier_score(&retry));
    }
}
