//! Controller metrics
//!
//! Recorded into a dedicated registry. Nothing serves them over HTTP;
//! `gather_controller_metrics` renders the text format for tests and
//! embedders.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;

use crate::reconcile::configurator::IngressCounts;

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    /// Task sync duration by task kind
    static ref SYNC_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "ingress_controller_sync_duration_seconds",
            "Task sync duration in seconds",
        );
        let histogram = HistogramVec::new(opts, &["kind"])
            .expect("Failed to create histogram");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// Task syncs by kind and result
    static ref SYNCS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "ingress_controller_syncs_total",
            "Total number of task syncs",
        );
        let counter = IntCounterVec::new(opts, &["kind", "result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    static ref RELOADS_TOTAL: IntCounter = {
        let counter = IntCounter::new(
            "nginx_reloads_total",
            "Number of successful proxy reloads",
        )
        .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    static ref RELOAD_ERRORS_TOTAL: IntCounter = {
        let counter = IntCounter::new(
            "nginx_reload_errors_total",
            "Number of failed proxy reloads",
        )
        .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    static ref LAST_RELOAD_SECONDS: Gauge = {
        let gauge = Gauge::new(
            "nginx_last_reload_seconds",
            "Duration of the last successful reload in seconds",
        )
        .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };

    /// Live Ingresses by role
    static ref INGRESS_RESOURCES: IntGaugeVec = {
        let opts = Opts::new(
            "ingress_controller_ingress_resources_total",
            "Number of handled Ingress resources",
        );
        let gauge = IntGaugeVec::new(opts, &["type"])
            .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };
}

/// Record one task sync
pub fn record_sync(kind: &str, duration_secs: f64, result: &str) {
    SYNC_DURATION
        .with_label_values(&[kind])
        .observe(duration_secs);

    SYNCS_TOTAL.with_label_values(&[kind, result]).inc();
}

pub fn record_reload(duration: Duration) {
    RELOADS_TOTAL.inc();
    LAST_RELOAD_SECONDS.set(duration.as_secs_f64());
}

pub fn record_reload_error() {
    RELOAD_ERRORS_TOTAL.inc();
}

pub fn set_ingress_counts(counts: IngressCounts) {
    INGRESS_RESOURCES
        .with_label_values(&["master"])
        .set(counts.master as i64);
    INGRESS_RESOURCES
        .with_label_values(&["regular"])
        .set(counts.regular as i64);
    INGRESS_RESOURCES
        .with_label_values(&["minion"])
        .set(counts.minion as i64);
}

/// Gather controller metrics
pub fn gather_controller_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}
