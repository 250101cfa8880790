//! Prometheus metrics for the classgate controller
//!
//! Exposes reconciliation activity and fault counts:
//! - Reconciliation outcomes and apply durations
//! - Owned resource count
//! - Watch events and reported faults by kind

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Controller metrics registry
///
/// Thread-safe container for all Prometheus metrics.
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    /// Total reconciliations by result (applied, unchanged, failed)
    pub reconciliations_total: IntCounterVec,
    /// Data-plane apply duration in seconds
    pub apply_duration_seconds: Histogram,
    /// Resources currently owned by this instance
    pub owned_resources: IntGauge,
    /// Watch events consumed, by kind (create, update, delete, resync)
    pub events_total: IntCounterVec,
    /// Reported faults by kind
    pub faults_total: IntCounterVec,
}

impl ControllerMetrics {
    /// Create a new metrics registry with all classgate metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = IntCounterVec::new(
            Opts::new(
                "classgate_reconciliations_total",
                "Total number of reconciliation cycles",
            ),
            &["result"], // applied, unchanged, failed
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let apply_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "classgate_apply_duration_seconds",
                "Duration of data-plane configuration applies in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        registry.register(Box::new(apply_duration_seconds.clone()))?;

        let owned_resources = IntGauge::with_opts(Opts::new(
            "classgate_owned_resources",
            "Number of routing resources owned by this controller",
        ))?;
        registry.register(Box::new(owned_resources.clone()))?;

        let events_total = IntCounterVec::new(
            Opts::new("classgate_events_total", "Total number of watch events consumed"),
            &["kind"],
        )?;
        registry.register(Box::new(events_total.clone()))?;

        let faults_total = IntCounterVec::new(
            Opts::new("classgate_faults_total", "Total number of reported faults"),
            &["kind"],
        )?;
        registry.register(Box::new(faults_total.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            apply_duration_seconds,
            owned_resources,
            events_total,
            faults_total,
        })
    }

    /// Record a successful apply
    pub fn record_apply_success(&self, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&["applied"])
            .inc();
        self.apply_duration_seconds.observe(duration_secs);
    }

    /// Record a failed apply attempt
    pub fn record_apply_failure(&self, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&["failed"])
            .inc();
        self.apply_duration_seconds.observe(duration_secs);
    }

    /// Record a reconcile that produced the already-applied artifact
    pub fn record_unchanged(&self) {
        self.reconciliations_total
            .with_label_values(&["unchanged"])
            .inc();
    }

    pub fn record_event(&self, kind: &str) {
        self.events_total.with_label_values(&[kind]).inc();
    }

    pub fn record_fault(&self, kind: &str) {
        self.faults_total.with_label_values(&[kind]).inc();
    }

    pub fn set_owned_resources(&self, count: usize) {
        self.owned_resources.set(count as i64);
    }

    /// Encode all metrics to Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
        })
    }
}

/// Shared metrics handle for use across the controller
pub type SharedMetrics = Arc<ControllerMetrics>;

/// Create a new shared metrics instance
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
