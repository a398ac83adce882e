use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// All crawl metrics, registered against one owned registry. The struct is
/// created once and passed by reference; there is no global registry.
pub struct CrawlMetrics {
    registry: Registry,
    pub fetches_total: IntCounterVec,
    pub urls_admitted_total: IntCounter,
    pub urls_dropped_total: IntCounterVec,
    pub duplicates_total: IntCounterVec,
    pub traps_total: IntCounterVec,
    pub fetch_duration_seconds: HistogramVec,
    pub queue_depth: Histogram,
    pub inflight: IntGauge,
    pub hosts_parked: IntGauge,
}

impl CrawlMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let fetches_total = IntCounterVec::new(
            Opts::new("fetches_total", "Fetch attempts by status and mode"),
            &["status", "mode"],
        )?;
        let urls_admitted_total = IntCounter::new(
            "urls_admitted_total",
            "URLs admitted to the frontier",
        )?;
        let urls_dropped_total = IntCounterVec::new(
            Opts::new("urls_dropped_total", "URLs rejected at admission, by reason"),
            &["reason"],
        )?;
        let duplicates_total = IntCounterVec::new(
            Opts::new("duplicates_total", "Duplicate documents, by dedup tier"),
            &["tier"],
        )?;
        let traps_total = IntCounterVec::new(
            Opts::new("traps_total", "Trap verdicts, by detector kind"),
            &["kind"],
        )?;
        let fetch_duration_seconds = HistogramVec::new(
            HistogramOpts::new("fetch_duration_seconds", "Fetch latency by mode"),
            &["mode"],
        )?;
        let queue_depth = Histogram::with_opts(
            HistogramOpts::new("queue_depth", "Frontier size sampled at checkpoint intervals")
                .buckets(prometheus::exponential_buckets(1.0, 4.0, 12)?),
        )?;
        let inflight = IntGauge::new("inflight", "Fetches currently in flight")?;
        let hosts_parked = IntGauge::new("hosts_parked", "Hosts in circuit-open parking")?;

        registry.register(Box::new(fetches_total.clone()))?;
        registry.register(Box::new(urls_admitted_total.clone()))?;
        registry.register(Box::new(urls_dropped_total.clone()))?;
        registry.register(Box::new(duplicates_total.clone()))?;
        registry.register(Box::new(traps_total.clone()))?;
        registry.register(Box::new(fetch_duration_seconds.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(inflight.clone()))?;
        registry.register(Box::new(hosts_parked.clone()))?;

        Ok(Self {
            registry,
            fetches_total,
            urls_admitted_total,
            urls_dropped_total,
            duplicates_total,
            traps_total,
            fetch_duration_seconds,
            queue_depth,
            inflight,
            hosts_parked,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of the current values, for logs and debugging.
    /// An HTTP exporter endpoint is a downstream concern.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}
