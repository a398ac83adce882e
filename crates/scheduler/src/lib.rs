pub mod robots;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

pub use robots::RobotsCache;

/// Backoff multiplier bounds and the rolling window for the circuit breaker.
const BACKOFF_GROWTH: f64 = 1.5;
const BACKOFF_DECAY: f64 = 0.9;
const BACKOFF_CAP: f64 = 30.0;
const BACKOFF_FLOOR: f64 = 1.0;
const ERROR_WINDOW: usize = 20;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub min_gap: Duration,
    pub park: Duration,
}

#[derive(Debug)]
struct HostState {
    inflight: usize,
    pending: usize,
    next_dispatch: Instant,
    backoff_multiplier: f64,
    /// Rolling outcome window, true = error.
    window: VecDeque<bool>,
    parked_until: Option<Instant>,
}

impl HostState {
    fn new() -> Self {
        Self {
            inflight: 0,
            pending: 0,
            next_dispatch: Instant::now(),
            backoff_multiplier: BACKOFF_FLOOR,
            window: VecDeque::with_capacity(ERROR_WINDOW),
            parked_until: None,
        }
    }
}

struct Inner {
    hosts: HashMap<String, HostState>,
    /// Dispatch deadlines, lazily invalidated on pop.
    heap: BinaryHeap<Reverse<(Instant, String)>>,
    closed: bool,
}

/// A granted dispatch slot for one host. The global-concurrency permit rides
/// along; host bookkeeping is released via `complete` / `release_unused`.
pub struct HostPermit {
    pub host: String,
    _permit: OwnedSemaphorePermit,
}

/// Politeness scheduler between frontier and fetcher.
///
/// Hosts sit in a heap keyed by `next_permitted_dispatch_time`. Acquiring
/// pops the earliest-ready host, bumps its in-flight count (never above the
/// per-host cap) and pushes its deadline forward by the minimum gap scaled
/// by the adaptive backoff multiplier. Workers with nothing ready sleep
/// until the earliest deadline or a completion wakes them.
pub struct HostScheduler {
    inner: std::sync::Mutex<Inner>,
    notify: Notify,
    global: Arc<Semaphore>,
    config: SchedulerConfig,
}

impl HostScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: std::sync::Mutex::new(Inner {
                hosts: HashMap::new(),
                heap: BinaryHeap::new(),
                closed: false,
            }),
            notify: Notify::new(),
            global: Arc::new(Semaphore::new(config.global_concurrency)),
            config,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Tell the scheduler a host gained queued work.
    pub fn note_work(&self, host: &str) {
        self.note_work_delayed(host, Duration::ZERO);
    }

    /// Same, but the work only becomes dispatchable after `delay`
    /// (retry re-admissions).
    pub fn note_work_delayed(&self, host: &str, delay: Duration) {
        let mut inner = self.lock();
        let state = inner
            .hosts
            .entry(host.to_string())
            .or_insert_with(HostState::new);
        state.pending += 1;
        let at = Instant::now() + delay;
        let at = state.next_dispatch.max(at);
        inner.heap.push(Reverse((at, host.to_string())));
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Refuse all further leases and wake every sleeper.
    pub fn close(&self) {
        self.lock().closed = true;
        self.global.close();
        self.notify.notify_waiters();
    }

    /// Wait for the earliest-ready host and claim a dispatch slot on it.
    /// Returns None once the scheduler is closed.
    pub async fn acquire(&self) -> Option<HostPermit> {
        loop {
            let permit = match self.global.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return None,
            };

            let wait_until = {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                match Self::pop_ready(&mut inner, &self.config) {
                    PopOutcome::Ready(host) => {
                        return Some(HostPermit {
                            host,
                            _permit: permit,
                        });
                    }
                    PopOutcome::WaitUntil(at) => Some(at),
                    PopOutcome::Idle => None,
                }
            };
            drop(permit);

            match wait_until {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
            if self.lock().closed {
                return None;
            }
        }
    }

    fn pop_ready(inner: &mut Inner, config: &SchedulerConfig) -> PopOutcome {
        let now = Instant::now();

        while let Some(Reverse((at, host))) = inner.heap.pop() {
            if at > now {
                // Heap order: every remaining entry is at least this late.
                inner.heap.push(Reverse((at, host)));
                return PopOutcome::WaitUntil(at);
            }
            let Some(state) = inner.hosts.get_mut(&host) else {
                continue;
            };
            if state.pending == 0 {
                continue;
            }
            if let Some(until) = state.parked_until {
                if until > now {
                    inner.heap.push(Reverse((until, host)));
                    continue;
                }
                state.parked_until = None;
            }
            if state.inflight >= config.per_host_concurrency {
                // Entry dropped; a completion re-arms this host.
                continue;
            }
            if state.next_dispatch > now {
                // Stale entry: the host's deadline moved since the push.
                let next = state.next_dispatch;
                inner.heap.push(Reverse((next, host)));
                continue;
            }

            state.inflight += 1;
            state.pending -= 1;
            state.next_dispatch = now + config.min_gap.mul_f64(state.backoff_multiplier);
            if state.pending > 0 {
                let next = state.next_dispatch;
                inner.heap.push(Reverse((next, host.clone())));
            }
            return PopOutcome::Ready(host);
        }

        PopOutcome::Idle
    }

    /// Politeness gate for pre-leased work (distributed mode): waits until
    /// the host's gap, cap, and circuit allow one more dispatch.
    pub async fn wait_turn(&self, host: &str) {
        loop {
            let wait = {
                let mut inner = self.lock();
                let state = inner
                    .hosts
                    .entry(host.to_string())
                    .or_insert_with(HostState::new);
                let now = Instant::now();
                if let Some(until) = state.parked_until {
                    if until > now {
                        Some(until)
                    } else {
                        state.parked_until = None;
                        None
                    }
                } else if state.inflight >= self.config.per_host_concurrency {
                    None
                } else if state.next_dispatch > now {
                    Some(state.next_dispatch)
                } else {
                    state.inflight += 1;
                    state.next_dispatch =
                        now + self.config.min_gap.mul_f64(state.backoff_multiplier);
                    return;
                }
            };
            match wait {
                Some(at) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Report a finished dispatch. Errors grow the host's backoff, successes
    /// decay it, and a >50% error rate over the last 20 requests parks the
    /// host.
    pub fn complete(&self, host: &str, success: bool) {
        let mut inner = self.lock();
        if let Some(state) = inner.hosts.get_mut(host) {
            state.inflight = state.inflight.saturating_sub(1);

            state.backoff_multiplier = if success {
                (state.backoff_multiplier * BACKOFF_DECAY).max(BACKOFF_FLOOR)
            } else {
                (state.backoff_multiplier * BACKOFF_GROWTH).min(BACKOFF_CAP)
            };

            state.window.push_back(!success);
            if state.window.len() > ERROR_WINDOW {
                state.window.pop_front();
            }
            if state.window.len() == ERROR_WINDOW {
                let errors = state.window.iter().filter(|&&e| e).count();
                if errors * 2 > ERROR_WINDOW {
                    debug!(host, errors, "circuit open, parking host");
                    state.parked_until = Some(Instant::now() + self.config.park);
                    state.window.clear();
                }
            }

            // Re-arm the host: entries may have been dropped while it was
            // at its concurrency cap.
            if state.pending > 0 {
                let at = state
                    .parked_until
                    .unwrap_or(state.next_dispatch)
                    .max(state.next_dispatch);
                inner.heap.push(Reverse((at, host.to_string())));
            }
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// The frontier had nothing for this host after all.
    pub fn release_unused(&self, host: &str) {
        let mut inner = self.lock();
        if let Some(state) = inner.hosts.get_mut(host) {
            state.inflight = state.inflight.saturating_sub(1);
            state.pending = 0;
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn inflight_total(&self) -> usize {
        self.lock().hosts.values().map(|h| h.inflight).sum()
    }

    pub fn parked_count(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .hosts
            .values()
            .filter(|h| h.parked_until.is_some_and(|until| until > now))
            .count()
    }

    pub fn backoff_of(&self, host: &str) -> Option<f64> {
        self.lock().hosts.get(host).map(|h| h.backoff_multiplier)
    }

    /// Seed a host's multiplier from persisted state.
    pub fn set_backoff(&self, host: &str, multiplier: f64) {
        let mut inner = self.lock();
        let state = inner
            .hosts
            .entry(host.to_string())
            .or_insert_with(HostState::new);
        state.backoff_multiplier = multiplier.clamp(BACKOFF_FLOOR, BACKOFF_CAP);
    }
}

enum PopOutcome {
    Ready(String),
    WaitUntil(Instant),
    Idle,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            global_concurrency: 8,
            per_host_concurrency: 2,
            min_gap: Duration::from_millis(10),
            park: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_acquire_returns_noted_host() {
        let scheduler = HostScheduler::new(config());
        scheduler.note_work("a");
        let permit = scheduler.acquire().await.unwrap();
        assert_eq!(permit.host, "a");
    }

    #[tokio::test]
    async fn test_per_host_cap_enforced() {
        let scheduler = HostScheduler::new(SchedulerConfig {
            min_gap: Duration::ZERO,
            ..config()
        });
        for _ in 0..5 {
            scheduler.note_work("a");
        }
        let first = scheduler.acquire().await.unwrap();
        let second = scheduler.acquire().await.unwrap();
        assert_eq!(first.host, "a");
        assert_eq!(second.host, "a");
        assert_eq!(scheduler.inflight_total(), 2);

        // Third dispatch for the same host must wait for a completion.
        let waited = tokio::time::timeout(Duration::from_millis(50), scheduler.acquire()).await;
        assert!(waited.is_err());

        scheduler.complete("a", true);
        let third = tokio::time::timeout(Duration::from_millis(200), scheduler.acquire())
            .await
            .expect("slot freed by completion");
        assert_eq!(third.unwrap().host, "a");
    }

    #[tokio::test]
    async fn test_min_gap_delays_same_host() {
        let scheduler = HostScheduler::new(SchedulerConfig {
            min_gap: Duration::from_millis(80),
            ..config()
        });
        scheduler.note_work("a");
        scheduler.note_work("a");

        let started = Instant::now();
        let _first = scheduler.acquire().await.unwrap();
        let _second = scheduler.acquire().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_earliest_ready_host_wins() {
        let scheduler = HostScheduler::new(SchedulerConfig {
            min_gap: Duration::from_millis(200),
            ..config()
        });
        scheduler.note_work("a");
        scheduler.note_work("a");
        scheduler.note_work("b");

        let first = scheduler.acquire().await.unwrap();
        assert_eq!(first.host, "a");
        // Host a is gapped out; b is ready immediately.
        let second = scheduler.acquire().await.unwrap();
        assert_eq!(second.host, "b");
    }

    #[tokio::test]
    async fn test_backoff_grows_and_decays() {
        let scheduler = HostScheduler::new(config());
        scheduler.note_work("a");
        let permit = scheduler.acquire().await.unwrap();

        scheduler.complete(&permit.host, false);
        assert_eq!(scheduler.backoff_of("a"), Some(1.5));
        scheduler.complete(&permit.host, false);
        assert_eq!(scheduler.backoff_of("a"), Some(2.25));
        scheduler.complete(&permit.host, true);
        assert!((scheduler.backoff_of("a").unwrap() - 2.025).abs() < 1e-9);

        // Decay floors at 1.0.
        for _ in 0..30 {
            scheduler.complete("a", true);
        }
        assert_eq!(scheduler.backoff_of("a"), Some(1.0));
    }

    #[tokio::test]
    async fn test_backoff_caps_at_thirty() {
        let scheduler = HostScheduler::new(config());
        scheduler.note_work("a");
        let _permit = scheduler.acquire().await.unwrap();
        for _ in 0..12 {
            scheduler.complete("a", false);
        }
        assert_eq!(scheduler.backoff_of("a"), Some(30.0));
    }

    #[tokio::test]
    async fn test_circuit_opens_after_error_burst() {
        let scheduler = HostScheduler::new(config());
        scheduler.note_work("a");
        let _permit = scheduler.acquire().await.unwrap();

        // 20-request window, more than half errors.
        for i in 0..ERROR_WINDOW {
            scheduler.complete("a", i % 3 == 0);
        }
        assert_eq!(scheduler.parked_count(), 1);

        // A parked host is withheld even with pending work.
        scheduler.note_work("a");
        let waited = tokio::time::timeout(Duration::from_millis(50), scheduler.acquire()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_close_wakes_and_refuses() {
        let scheduler = Arc::new(HostScheduler::new(config()));
        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.acquire().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.close();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_turn_respects_gap() {
        let scheduler = HostScheduler::new(SchedulerConfig {
            min_gap: Duration::from_millis(60),
            ..config()
        });
        let started = Instant::now();
        scheduler.wait_turn("a").await;
        scheduler.complete("a", true);
        scheduler.wait_turn("a").await;
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_persisted_backoff_seeds_host() {
        let scheduler = HostScheduler::new(config());
        scheduler.set_backoff("a", 12.0);
        assert_eq!(scheduler.backoff_of("a"), Some(12.0));
        scheduler.set_backoff("b", 99.0);
        assert_eq!(scheduler.backoff_of("b"), Some(30.0));
    }
}
