use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};

/// Prometheus collectors for capture runs and locate queries.
///
/// Wrapped in an `Arc` and shared by the capture pipeline and the HTTP handlers.
pub struct Metrics {
    pub registry: Registry,
    /// Tiles the provider returned successfully.
    pub tiles_fetched_total: IntCounter,
    /// Tiles that passed the sentinel check and entered the manifest.
    pub tiles_accepted_total: IntCounter,
    /// Tiles discarded as "no imagery".
    pub tiles_sentinel_total: IntCounter,
    /// Transport, status, timeout and decode failures.
    pub fetch_errors_total: IntCounter,
    pub fetch_latency_seconds: Histogram,
    pub points_processed_total: IntCounter,
    pub capture_runs_total: IntCounter,
    pub capture_failures_total: IntCounter,
    pub index_rebuilds_total: IntCounter,
    /// Share of the current run's sample points already processed (0.0 to 1.0).
    pub capture_progress_ratio: Gauge,
    pub manifest_entries: IntGauge,
    pub locate_requests_total: IntCounter,
    pub locate_matches_total: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("svlocate".into()), None)?;

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric?;
                registry.register(Box::new(collector.clone()))?;
                collector
            }};
        }

        Ok(Self {
            tiles_fetched_total: reg!(IntCounter::new(
                "tiles_fetched_total",
                "Tiles returned by the imagery provider"
            )),
            tiles_accepted_total: reg!(IntCounter::new(
                "tiles_accepted_total",
                "Tiles accepted into the corpus"
            )),
            tiles_sentinel_total: reg!(IntCounter::new(
                "tiles_sentinel_total",
                "Tiles discarded because the provider had no imagery"
            )),
            fetch_errors_total: reg!(IntCounter::new(
                "fetch_errors_total",
                "Tile fetches that failed or timed out"
            )),
            fetch_latency_seconds: reg!(Histogram::with_opts(
                HistogramOpts::new("fetch_latency_seconds", "Imagery provider round-trip time")
                    .buckets(prometheus::exponential_buckets(0.01, 2.0, 12)?)
            )),
            points_processed_total: reg!(IntCounter::new(
                "points_processed_total",
                "Sample points whose sweep finished"
            )),
            capture_runs_total: reg!(IntCounter::new(
                "capture_runs_total",
                "Capture runs started"
            )),
            capture_failures_total: reg!(IntCounter::new(
                "capture_failures_total",
                "Capture runs that ended in failure"
            )),
            index_rebuilds_total: reg!(IntCounter::new(
                "index_rebuilds_total",
                "Completed feature index rebuilds"
            )),
            capture_progress_ratio: reg!(Gauge::new(
                "capture_progress_ratio",
                "Fraction of the current run's sample points processed"
            )),
            manifest_entries: reg!(IntGauge::new(
                "manifest_entries",
                "Lines in the most recently closed manifest"
            )),
            locate_requests_total: reg!(IntCounter::new(
                "locate_requests_total",
                "Locate queries received"
            )),
            locate_matches_total: reg!(IntCounter::new(
                "locate_matches_total",
                "Locate queries that produced a coordinate"
            )),
            registry,
        })
    }

    /// Text exposition of every registered collector.
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
