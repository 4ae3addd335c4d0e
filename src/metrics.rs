//! Prometheus-based metrics module
//!
//! Provides metrics collection using Prometheus client library.
//! All metrics are exposed via the stats API's /metrics endpoint.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Dial Metrics ===

    /// Dial attempts per path (direct/proxy)
    pub static ref DIAL_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("detour_dial_attempts_total", "Dial attempts per path"),
        &["path"]
    ).unwrap();

    /// Failed dials per path
    pub static ref DIAL_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("detour_dial_failures_total", "Failed dials per path"),
        &["path"]
    ).unwrap();

    /// Direct attempts that fell back to the proxy path
    pub static ref DIAL_FALLBACKS_TOTAL: IntCounter = IntCounter::new(
        "detour_dial_fallbacks_total",
        "Direct dials that fell back to the proxy path"
    ).unwrap();

    // === Learning Metrics ===

    /// Read errors captured inside the early signal window
    pub static ref EARLY_SIGNALS_TOTAL: IntCounter = IntCounter::new(
        "detour_early_signals_total",
        "Read errors recorded inside the early signal window"
    ).unwrap();

    /// Close-time feedback per path and outcome (success/withheld)
    pub static ref FEEDBACK_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("detour_feedback_total", "Close-time feedback per path and outcome"),
        &["path", "outcome"]
    ).unwrap();

    /// Hosts currently held in the statistics table
    pub static ref HOSTS_TRACKED: IntGauge = IntGauge::new(
        "detour_hosts_tracked",
        "Number of hosts in the site statistics table"
    ).unwrap();

    // === Persistence Metrics ===

    pub static ref STAT_SAVES_TOTAL: IntCounter = IntCounter::new(
        "detour_stat_saves_total",
        "Successful statistics snapshots written to disk"
    ).unwrap();

    pub static ref STAT_SAVE_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "detour_stat_save_failures_total",
        "Statistics snapshots that failed to write"
    ).unwrap();

    // === Relay Metrics ===

    /// Currently relayed connections
    pub static ref CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "detour_connections_active",
        "Number of currently relayed connections"
    ).unwrap();

    /// Bytes uploaded per path
    pub static ref BYTES_UPLOADED: IntCounterVec = IntCounterVec::new(
        Opts::new("detour_bytes_uploaded_total", "Bytes uploaded per path"),
        &["path"]
    ).unwrap();

    /// Bytes downloaded per path
    pub static ref BYTES_DOWNLOADED: IntCounterVec = IntCounterVec::new(
        Opts::new("detour_bytes_downloaded_total", "Bytes downloaded per path"),
        &["path"]
    ).unwrap();

    /// Connection duration histogram
    pub static ref CONNECTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "detour_connection_duration_seconds",
            "Connection duration in seconds"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]),
        &["path"]
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    // Dial metrics
    REGISTRY.register(Box::new(DIAL_ATTEMPTS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(DIAL_FAILURES_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(DIAL_FALLBACKS_TOTAL.clone())).ok();

    // Learning metrics
    REGISTRY.register(Box::new(EARLY_SIGNALS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(FEEDBACK_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(HOSTS_TRACKED.clone())).ok();

    // Persistence metrics
    REGISTRY.register(Box::new(STAT_SAVES_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(STAT_SAVE_FAILURES_TOTAL.clone())).ok();

    // Relay metrics
    REGISTRY.register(Box::new(CONNECTIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(BYTES_UPLOADED.clone())).ok();
    REGISTRY.register(Box::new(BYTES_DOWNLOADED.clone())).ok();
    REGISTRY.register(Box::new(CONNECTION_DURATION_SECONDS.clone())).ok();
}

/// Helper struct for tracking a single relayed connection's metrics
pub struct ConnectionMetrics {
    path: &'static str,
    start_time: std::time::Instant,
}

impl ConnectionMetrics {
    pub fn new(path: &'static str) -> Self {
        CONNECTIONS_ACTIVE.inc();
        Self {
            path,
            start_time: std::time::Instant::now(),
        }
    }

    /// Record connection completion with duration
    pub fn record_completion(&self, uploaded: u64, downloaded: u64) {
        BYTES_UPLOADED.with_label_values(&[self.path]).inc_by(uploaded);
        BYTES_DOWNLOADED.with_label_values(&[self.path]).inc_by(downloaded);
        CONNECTION_DURATION_SECONDS
            .with_label_values(&[self.path])
            .observe(self.start_time.elapsed().as_secs_f64());
    }
}

impl Drop for ConnectionMetrics {
    fn drop(&mut self) {
        CONNECTIONS_ACTIVE.dec();
    }
}
