use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::signal;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use url::Url;

use deepharvest_checkpoint::{Checkpoint, FrontierEntry};
use deepharvest_core::{
    AppConfig, CompleteOutcome, CrawlError, CrawlMetrics, CrawlStats, DomainPolicy, ErrorKind,
    FetchMode, PageRecord, RuleSet, StatsSnapshot, UrlNormalizer, UrlRecord,
};
use deepharvest_dedup::{ContentDeduper, DedupVerdict};
use deepharvest_fetch::{heuristics, result_text, BrowserOptions, BrowserPool, Fetcher};
use deepharvest_frontier::{Frontier, FrontierSnapshot, Lease, LocalFrontier, RedisFrontier};
use deepharvest_parser::{parse_page, tokens::tokenize};
use deepharvest_scheduler::{HostScheduler, RobotsCache, SchedulerConfig};
use deepharvest_trap::TrapDetector;

use crate::admission::AdmissionPipeline;
use crate::output::{run_writer, FailureRecord, OutputEvent, OutputWriter};

pub struct CrawlOptions {
    pub seeds: Vec<String>,
    pub depth: Option<u32>,
    pub js: bool,
    pub output: PathBuf,
    pub distributed: bool,
    pub redis_url: Option<String>,
    pub workers: Option<usize>,
    /// Validated checkpoint to resume from.
    pub resume: Option<Checkpoint>,
}

pub struct CrawlSummary {
    pub stats: StatsSnapshot,
}

/// Everything a worker needs, shared by Arc. No process-wide globals.
struct CrawlContext {
    config: AppConfig,
    stats: Arc<CrawlStats>,
    metrics: Arc<CrawlMetrics>,
    frontier: Arc<dyn Frontier>,
    redis: Option<Arc<RedisFrontier>>,
    scheduler: Arc<HostScheduler>,
    robots: Arc<RobotsCache>,
    rules: Arc<RuleSet>,
    fetcher: Arc<Fetcher>,
    deduper: Arc<ContentDeduper>,
    trap: Arc<TrapDetector>,
    admission: Arc<AdmissionPipeline>,
    output_tx: mpsc::Sender<OutputEvent>,
    /// Hosts whose persisted backoff multiplier was already loaded.
    backoff_loaded: DashMap<String, ()>,
    /// Set when a worker halts on consecutive shared-store failures.
    store_fatal: AtomicBool,
}

enum Work {
    Done,
    Idle,
    Closed,
}

pub async fn run_crawl(
    mut config: AppConfig,
    opts: CrawlOptions,
) -> Result<CrawlSummary, CrawlError> {
    if let Some(depth) = opts.depth {
        config.max_depth = depth;
    }
    if opts.js {
        config.enable_js = true;
    }
    if opts.distributed {
        config.distributed = true;
    }
    if let Some(redis_url) = opts.redis_url.clone() {
        config.redis_url = redis_url;
    }
    if let Some(workers) = opts.workers {
        config.concurrent_requests = workers;
    }

    let seeds = if opts.seeds.is_empty() {
        config.seed_urls.clone()
    } else {
        expand_seed_args(&opts.seeds)
    };
    if seeds.is_empty() && opts.resume.is_none() {
        info!("no seed URLs; nothing to crawl");
        return Ok(CrawlSummary {
            stats: StatsSnapshot::default(),
        });
    }

    let stats = Arc::new(CrawlStats::new());
    let metrics =
        Arc::new(CrawlMetrics::new().map_err(|e| CrawlError::Config(e.to_string()))?);

    let normalizer = UrlNormalizer::new(config.frontier.tracking_params.clone());
    let mut policy = DomainPolicy::compile(&config.allowed_domains)?;
    for seed in &seeds {
        if let Ok(url) = normalizer.normalize(seed, None) {
            if let Some(host) = url.host_str() {
                policy.allow_seed_host(host);
            }
        }
    }
    let policy = Arc::new(policy);

    let rules = Arc::new(RuleSet::compile(&config.site_rules)?);
    let trap = Arc::new(TrapDetector::new(config.trap.clone()));
    let deduper = Arc::new(ContentDeduper::new());

    let scheduler = Arc::new(HostScheduler::new(SchedulerConfig {
        global_concurrency: config.concurrent_requests,
        per_host_concurrency: config.per_host_concurrency,
        min_gap: Duration::from_millis(config.politeness.min_gap_ms),
        park: Duration::from_secs(config.politeness.park_secs),
    }));
    let robots = Arc::new(RobotsCache::new(
        config.politeness.respect_robots,
        config.user_agent.clone(),
    ));

    let (frontier, redis): (Arc<dyn Frontier>, Option<Arc<RedisFrontier>>) =
        if config.distributed {
            let redis = Arc::new(
                RedisFrontier::connect(&config.redis_url, config.strategy, &config.frontier)
                    .await?,
            );
            (redis.clone() as Arc<dyn Frontier>, Some(redis))
        } else {
            (
                Arc::new(LocalFrontier::new(config.strategy, &config.frontier))
                    as Arc<dyn Frontier>,
                None,
            )
        };

    let wants_browser = config.enable_js
        || config
            .site_rules
            .iter()
            .any(|r| r.use_browser_directly || r.require_js);
    let browser = if wants_browser {
        let pool_size = config.concurrent_requests.clamp(1, 2);
        match BrowserPool::new(
            pool_size,
            BrowserOptions {
                wait_for_js_ms: config.wait_for_js_ms,
                handle_infinite_scroll: config.handle_infinite_scroll,
            },
        ) {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!("browser unavailable, continuing http-only: {e}");
                None
            }
        }
    } else {
        None
    };

    let fetcher = Arc::new(Fetcher::new(
        &config.fetch,
        &config.user_agent,
        opts.output.join(".spool"),
        browser,
    )?);

    let admission = Arc::new(AdmissionPipeline::new(
        normalizer,
        Arc::clone(&policy),
        config.max_depth,
        config.max_urls,
        config.frontier.max_url_len,
        config.max_pages_per_domain,
        Arc::clone(&trap),
        Arc::clone(&frontier),
        Arc::clone(&scheduler),
        Arc::clone(&stats),
        Arc::clone(&metrics),
    ));

    let writer = OutputWriter::create(&opts.output).map_err(|e| CrawlError::Store(e.to_string()))?;
    let (output_tx, output_rx) = mpsc::channel::<OutputEvent>(2000);
    let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(4);
    let writer_handle = tokio::spawn(run_writer(writer, output_rx, shutdown_tx.subscribe()));

    // Restore before seeding so checkpointed seeds dedupe away.
    if let Some(checkpoint) = opts.resume {
        stats.restore(&checkpoint.header.stats);
        let mut pending = Vec::new();
        for entry in checkpoint.frontier {
            match entry.into_record() {
                Ok(record) => pending.push(record),
                Err(e) => warn!("skipping unreadable checkpoint entry: {e}"),
            }
        }
        for record in &pending {
            scheduler.note_work(&record.host);
        }
        info!(
            visited = checkpoint.visited.len(),
            pending = pending.len(),
            "restoring from checkpoint"
        );
        frontier
            .restore(FrontierSnapshot {
                visited: checkpoint.visited,
                pending,
            })
            .await?;
    }

    for seed in &seeds {
        admission.admit_seed(seed).await?;
    }
    info!(count = seeds.len(), "seeds processed");

    let context = Arc::new(CrawlContext {
        config: config.clone(),
        stats: Arc::clone(&stats),
        metrics: Arc::clone(&metrics),
        frontier: Arc::clone(&frontier),
        redis,
        scheduler: Arc::clone(&scheduler),
        robots,
        rules,
        fetcher,
        deduper,
        trap,
        admission,
        output_tx: output_tx.clone(),
        backoff_loaded: DashMap::new(),
        store_fatal: AtomicBool::new(false),
    });
    drop(output_tx);

    let worker_count = config.concurrent_requests;
    info!(worker_count, distributed = config.distributed, "spawning crawl workers");
    let mut worker_handles = Vec::new();
    let mut abort_handles = Vec::new();
    for worker_id in 0..worker_count {
        let context = Arc::clone(&context);
        let shutdown = shutdown_tx.subscribe();
        let handle = tokio::spawn(worker_loop(worker_id, context, shutdown));
        abort_handles.push(handle.abort_handle());
        worker_handles.push(handle);
    }

    let state_file = opts.output.join("state.dh");
    let digests = (
        config.compat_digest(),
        config.raw_digest.clone(),
    );
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let maintenance_handle = tokio::spawn(maintenance_loop(
        Arc::clone(&context),
        shutdown_tx.subscribe(),
        done_tx,
        state_file.clone(),
        digests.clone(),
    ));

    tokio::select! {
        _ = signal::ctrl_c() => info!("shutdown signal received"),
        _ = done_rx => info!("frontier drained; crawl complete"),
    }
    // Cancellation is idempotent: repeated signals are harmless.
    let _ = shutdown_tx.send(());
    context.scheduler.close();

    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let drain = async {
        for handle in worker_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!(grace_secs = config.shutdown_grace_secs, "aborting workers past shutdown grace");
        for handle in &abort_handles {
            handle.abort();
        }
    }
    let _ = maintenance_handle.await;

    if !config.distributed {
        // Emergency/final checkpoint once the workers stopped moving state.
        if let Err(e) = write_checkpoint(&context, &state_file, &digests).await {
            error!("final checkpoint failed: {e}");
        } else {
            info!(path = %state_file.display(), "checkpoint written");
        }
    }

    let _ = writer_handle.await;

    if context.store_fatal.load(Ordering::Relaxed) {
        return Err(CrawlError::Store(
            "shared store unavailable after repeated failures".to_string(),
        ));
    }

    let snapshot = stats.snapshot();
    print_summary(&snapshot);
    Ok(CrawlSummary { stats: snapshot })
}

/// Seed arguments may be URLs, comma-separated lists, or a file path with
/// one URL per line.
fn expand_seed_args(args: &[String]) -> Vec<String> {
    let mut seeds = Vec::new();
    for arg in args {
        if Path::new(arg).exists() {
            if let Ok(content) = std::fs::read_to_string(arg) {
                seeds.extend(
                    content
                        .lines()
                        .map(|l| l.trim().to_string())
                        .filter(|l| !l.is_empty() && !l.starts_with('#')),
                );
                continue;
            }
        }
        seeds.extend(
            arg.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        );
    }
    seeds
}

async fn worker_loop(
    worker_id: usize,
    context: Arc<CrawlContext>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(worker_id, "worker started");
    let mut store_errors = 0u32;
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!(worker_id, "worker shutting down");
                break;
            }
            outcome = work_once(worker_id, &context) => {
                match outcome {
                    Ok(Work::Done) | Ok(Work::Idle) => store_errors = 0,
                    Ok(Work::Closed) => {
                        debug!(worker_id, "scheduler closed");
                        break;
                    }
                    Err(CrawlError::Store(e)) => {
                        store_errors += 1;
                        error!(worker_id, store_errors, "store error: {e}");
                        if store_errors >= 3 {
                            error!(worker_id, "halting worker: shared store unavailable");
                            context.store_fatal.store(true, Ordering::Relaxed);
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Err(e) => warn!(worker_id, "worker error: {e}"),
                }
            }
        }
    }
}

async fn work_once(worker_id: usize, context: &Arc<CrawlContext>) -> Result<Work, CrawlError> {
    if context.config.distributed {
        let Some(lease) = context.frontier.lease(None, worker_id).await? else {
            tokio::time::sleep(Duration::from_secs(2)).await;
            return Ok(Work::Idle);
        };
        let host = lease.record.host.clone();
        seed_backoff_from_store(context, &host).await;
        context.scheduler.wait_turn(&host).await;
        process_lease(worker_id, context, lease).await?;
        Ok(Work::Done)
    } else {
        let Some(permit) = context.scheduler.acquire().await else {
            return Ok(Work::Closed);
        };
        match context.frontier.lease(Some(&permit.host), worker_id).await? {
            Some(lease) => {
                let result = process_lease(worker_id, context, lease).await;
                drop(permit);
                result?;
                Ok(Work::Done)
            }
            None => {
                context.scheduler.release_unused(&permit.host);
                Ok(Work::Done)
            }
        }
    }
}

async fn process_lease(
    worker_id: usize,
    context: &Arc<CrawlContext>,
    lease: Lease,
) -> Result<(), CrawlError> {
    let record = lease.record.clone();
    let url = record.url.clone();
    let host = record.host.clone();
    info!(worker_id, url = %url, depth = record.depth, retry = record.retry_count, "fetching");

    if context.robots.enabled() {
        if context.robots.needs_fetch(&host) {
            let body = match RobotsCache::robots_url(&url) {
                Some(robots_url) => context
                    .fetcher
                    .fetch_text(&robots_url)
                    .await
                    .unwrap_or_default(),
                None => None,
            };
            context.robots.store(&host, body);
        }
        if !context.robots.allows(&url) {
            record_failure(
                context,
                &record,
                ErrorKind::DisallowedByPolicy,
                Some("blocked by robots.txt".to_string()),
                None,
                0,
            )
            .await;
            context.scheduler.complete(&host, true);
            context
                .frontier
                .complete(lease, CompleteOutcome::Failure(ErrorKind::DisallowedByPolicy))
                .await?;
            return Ok(());
        }
    }

    let rule = context.rules.match_url(url.as_str()).clone();
    let admission = Arc::clone(&context.admission);
    let hop_allowed = move |u: &Url| admission.hop_allowed(u);

    context.metrics.inflight.inc();
    let mut result = context.fetcher.fetch(&url, &rule, &hop_allowed, false).await;
    context.metrics.inflight.dec();

    observe_fetch(context, &result);
    context.stats.processed.fetch_add(1, Ordering::Relaxed);
    for _ in 0..result.retries {
        context.stats.record_retry(ErrorKind::NetworkTransient);
    }

    if let Some(kind) = result.error {
        record_failure(
            context,
            &record,
            kind,
            result.error_detail.clone(),
            result.status,
            result.retries,
        )
        .await;
        context.scheduler.complete(&host, false);
        persist_backoff(context, &host).await;
        context
            .frontier
            .complete(lease, CompleteOutcome::Failure(kind))
            .await?;
        return Ok(());
    }
    context.scheduler.complete(&host, true);
    persist_backoff(context, &host).await;

    let mut text = match result_text(&result) {
        Ok(text) => text,
        Err(e) => {
            record_failure(
                context,
                &record,
                ErrorKind::EncodingError,
                Some(e.to_string()),
                result.status,
                result.retries,
            )
            .await;
            context
                .frontier
                .complete(lease, CompleteOutcome::Failure(ErrorKind::EncodingError))
                .await?;
            return Ok(());
        }
    };

    let is_html = result
        .mime
        .as_deref()
        .map(|m| m.contains("html"))
        .unwrap_or(true);
    let mut page = is_html.then(|| parse_page(&text, &result.final_url));

    // Heuristic browser fallback; site-rule routing already happened in the
    // fetcher, so this only catches pages plain HTTP failed to render.
    if is_html
        && context.config.enable_js
        && result.mode == FetchMode::Http
        && context.fetcher.browser_enabled()
    {
        let link_count = page.as_ref().map(|p| p.links.len()).unwrap_or(0);
        if heuristics::needs_browser_fallback(&text, link_count) {
            debug!(url = %url, "re-fetching via browser");
            let browser_result = context.fetcher.fetch_browser(&url, false).await;
            if browser_result.is_success() {
                observe_fetch(context, &browser_result);
                if let Ok(browser_text) = result_text(&browser_result) {
                    page = Some(parse_page(&browser_text, &browser_result.final_url));
                    text = browser_text;
                    result = browser_result;
                }
            }
        }
    }

    let tokens = tokenize(&text);
    let fingerprint = context.deduper.fingerprint(text.as_bytes(), &tokens);
    let canonical = url.to_string();
    let verdict = context.deduper.classify(&canonical, &fingerprint);
    let novel = !verdict.is_duplicate();
    context.trap.record_content(&url, novel);

    let (duplicate_of, near_duplicate_of) = match &verdict {
        DedupVerdict::Unique => (None, None),
        DedupVerdict::ExactDuplicate { of } => {
            context
                .metrics
                .duplicates_total
                .with_label_values(&["exact"])
                .inc();
            context.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            (Some(of.clone()), None)
        }
        DedupVerdict::NearDuplicate { of, .. } => {
            context
                .metrics
                .duplicates_total
                .with_label_values(&["near"])
                .inc();
            context.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            (None, Some(of.clone()))
        }
    };

    // Exact duplicates skip all downstream processing, including link
    // extraction; near-duplicates still contribute links.
    let exact_dup = duplicate_of.is_some();
    if !exact_dup && record.depth < context.config.max_depth {
        if let Some(page) = &page {
            for link in &page.links {
                context.admission.admit_link(&link.url, &record).await?;
            }
        }
    }

    let page_record = PageRecord {
        url: canonical,
        final_url: result.final_url.to_string(),
        status: result.status.unwrap_or(200),
        mime: result.mime.clone(),
        title: page.as_ref().and_then(|p| p.title.clone()),
        depth: record.depth,
        text_len: text.len(),
        link_count: page.as_ref().map(|p| p.links.len()).unwrap_or(0),
        sha256: fingerprint.sha256_hex(),
        simhash: fingerprint.simhash,
        duplicate_of,
        near_duplicate_of,
        mode: result.mode,
        duration_ms: result.duration.as_millis() as u64,
        fetched_at: result.fetched_at,
    };
    if context
        .output_tx
        .send(OutputEvent::Page(page_record))
        .await
        .is_err()
    {
        error!(worker_id, "output channel closed");
    }

    context.stats.succeeded.fetch_add(1, Ordering::Relaxed);
    context
        .frontier
        .complete(lease, CompleteOutcome::Success)
        .await?;
    Ok(())
}

fn observe_fetch(context: &CrawlContext, result: &deepharvest_core::FetchResult) {
    let status = result
        .status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "error".to_string());
    context
        .metrics
        .fetches_total
        .with_label_values(&[&status, result.mode.as_str()])
        .inc();
    context
        .metrics
        .fetch_duration_seconds
        .with_label_values(&[result.mode.as_str()])
        .observe(result.duration.as_secs_f64());
}

async fn record_failure(
    context: &CrawlContext,
    record: &UrlRecord,
    kind: ErrorKind,
    detail: Option<String>,
    status: Option<u16>,
    retries: u32,
) {
    context.stats.record_error(kind);
    let failure = FailureRecord {
        url: record.url.to_string(),
        kind,
        detail,
        status,
        retries,
        failed_at: chrono::Utc::now(),
    };
    if context
        .output_tx
        .send(OutputEvent::Failure(failure))
        .await
        .is_err()
    {
        error!("output channel closed while logging failure");
    }
}

async fn seed_backoff_from_store(context: &Arc<CrawlContext>, host: &str) {
    let Some(redis) = &context.redis else { return };
    if context
        .backoff_loaded
        .insert(host.to_string(), ())
        .is_some()
    {
        return;
    }
    match redis.load_host_backoff(host).await {
        Ok(Some(multiplier)) => context.scheduler.set_backoff(host, multiplier),
        Ok(None) => {}
        Err(e) => debug!(host, "backoff load failed: {e}"),
    }
}

async fn persist_backoff(context: &Arc<CrawlContext>, host: &str) {
    let Some(redis) = &context.redis else { return };
    if let Some(multiplier) = context.scheduler.backoff_of(host) {
        if let Err(e) = redis.save_host_backoff(host, multiplier).await {
            debug!(host, "backoff save failed: {e}");
        }
    }
}

async fn maintenance_loop(
    context: Arc<CrawlContext>,
    mut shutdown: broadcast::Receiver<()>,
    done_tx: oneshot::Sender<()>,
    state_file: PathBuf,
    digests: (String, Option<String>),
) {
    let mut interval = tokio::time::interval(Duration::from_secs(2));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_checkpoint = context.stats.admitted.load(Ordering::Relaxed);
    let mut drained_ticks = 0u32;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {}
        }

        match context.frontier.reclaim_expired().await {
            Ok(hosts) => {
                for host in hosts {
                    context
                        .scheduler
                        .note_work_delayed(&host, Duration::from_secs(10));
                }
            }
            Err(e) => warn!("lease reclaim failed: {e}"),
        }

        context
            .metrics
            .hosts_parked
            .set(context.scheduler.parked_count() as i64);
        let pending = context.frontier.pending().await;
        context.metrics.queue_depth.observe(pending as f64);

        if !context.config.distributed {
            let admitted = context.stats.admitted.load(Ordering::Relaxed);
            if admitted.saturating_sub(last_checkpoint) >= context.config.checkpoint_interval {
                match write_checkpoint(&context, &state_file, &digests).await {
                    Ok(()) => {
                        last_checkpoint = admitted;
                        debug!(admitted, "periodic checkpoint written");
                    }
                    Err(e) => warn!("periodic checkpoint failed: {e}"),
                }
            }
        }

        let inflight = context.frontier.inflight().await;
        if pending == 0 && inflight == 0 {
            drained_ticks += 1;
            if drained_ticks >= 2 {
                let _ = done_tx.send(());
                return;
            }
        } else {
            drained_ticks = 0;
        }
    }
}

async fn write_checkpoint(
    context: &Arc<CrawlContext>,
    state_file: &Path,
    digests: &(String, Option<String>),
) -> Result<(), CrawlError> {
    let snapshot = context.frontier.snapshot().await?;
    let entries: Vec<FrontierEntry> = snapshot.pending.iter().map(FrontierEntry::from).collect();
    let checkpoint = Checkpoint::new(
        digests.0.clone(),
        digests.1.clone(),
        context.stats.snapshot(),
        snapshot.visited,
        entries,
    );
    let path = state_file.to_path_buf();
    tokio::task::spawn_blocking(move || checkpoint.write_atomic(&path))
        .await
        .map_err(|e| CrawlError::Store(format!("checkpoint task: {e}")))??;
    Ok(())
}

fn print_summary(stats: &StatsSnapshot) {
    println!("\ncrawl summary");
    println!("  admitted:   {}", stats.admitted);
    println!("  processed:  {}", stats.processed);
    println!("  succeeded:  {}", stats.succeeded);
    println!("  errored:    {}", stats.errored);
    println!("  duplicates: {}", stats.duplicates);
    println!("  dropped:    {}", stats.dropped);
    if !stats.errors_by_kind.is_empty() {
        println!("  by error kind:");
        for (kind, count) in &stats.errors_by_kind {
            println!("    {kind:<22} {count}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_seed_args_comma_list() {
        let seeds = expand_seed_args(&["http://a/,http://b/".to_string()]);
        assert_eq!(seeds, vec!["http://a/", "http://b/"]);
    }

    #[test]
    fn test_expand_seed_args_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeds.txt");
        std::fs::write(&path, "http://a/\n\n# comment\nhttp://b/\n").unwrap();
        let seeds = expand_seed_args(&[path.to_string_lossy().to_string()]);
        assert_eq!(seeds, vec!["http://a/", "http://b/"]);
    }

    #[test]
    fn test_expand_seed_args_plain_urls() {
        let seeds = expand_seed_args(&["http://a/".to_string(), "http://b/".to_string()]);
        assert_eq!(seeds.len(), 2);
    }
}
