//! Prometheus metrics for gateway-service.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{Mutex, OnceLock};

pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// Stream metrics
pub static STREAMS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static STREAM_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static STREAMS_IN_FLIGHT: OnceLock<IntGauge> = OnceLock::new();
pub static HEARTBEATS_TOTAL: OnceLock<IntCounter> = OnceLock::new();

// Gatekeeping metrics
pub static QUOTA_REJECTIONS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
pub static AUTH_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static USAGE_STORE_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup; later calls keep the first registry.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    static INIT_LOCK: Mutex<()> = Mutex::new(());
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let streams_total = IntCounterVec::new(
        Opts::new("gateway_streams_total", "Relayed streams by terminal outcome"),
        &["outcome"],
    )?;

    let stream_duration = HistogramVec::new(
        HistogramOpts::new(
            "gateway_stream_duration_seconds",
            "Wall time from stream open to terminal event",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["outcome"],
    )?;

    let in_flight = IntGauge::new(
        "gateway_streams_in_flight",
        "Number of streams currently being relayed",
    )?;

    let heartbeats = IntCounter::new(
        "gateway_heartbeats_total",
        "Heartbeat events injected during idle gaps",
    )?;

    let quota_rejections = IntCounter::new(
        "gateway_quota_rejections_total",
        "Requests refused because the daily allowance was used up",
    )?;

    let auth_failures = IntCounterVec::new(
        Opts::new("gateway_auth_failures_total", "Rejected credentials by reason"),
        &["reason"],
    )?;

    let store_errors = IntCounterVec::new(
        Opts::new(
            "gateway_usage_store_errors_total",
            "Usage store failures by operation",
        ),
        &["operation"],
    )?;

    registry.register(Box::new(streams_total.clone()))?;
    registry.register(Box::new(stream_duration.clone()))?;
    registry.register(Box::new(in_flight.clone()))?;
    registry.register(Box::new(heartbeats.clone()))?;
    registry.register(Box::new(quota_rejections.clone()))?;
    registry.register(Box::new(auth_failures.clone()))?;
    registry.register(Box::new(store_errors.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = STREAMS_TOTAL.set(streams_total);
    let _ = STREAM_DURATION_SECONDS.set(stream_duration);
    let _ = STREAMS_IN_FLIGHT.set(in_flight);
    let _ = HEARTBEATS_TOTAL.set(heartbeats);
    let _ = QUOTA_REJECTIONS_TOTAL.set(quota_rejections);
    let _ = AUTH_FAILURES_TOTAL.set(auth_failures);
    let _ = USAGE_STORE_ERRORS_TOTAL.set(store_errors);

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return format!("# Failed to encode metrics: {}\n", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to convert metrics to UTF-8");
        format!("# Failed to convert metrics to UTF-8: {}\n", e)
    })
}

pub fn record_stream(outcome: &str, duration_secs: f64) {
    if let Some(counter) = STREAMS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
    if let Some(histogram) = STREAM_DURATION_SECONDS.get() {
        histogram.with_label_values(&[outcome]).observe(duration_secs);
    }
}

pub fn inc_streams_in_flight() {
    if let Some(gauge) = STREAMS_IN_FLIGHT.get() {
        gauge.inc();
    }
}

pub fn dec_streams_in_flight() {
    if let Some(gauge) = STREAMS_IN_FLIGHT.get() {
        gauge.dec();
    }
}

pub fn record_heartbeat() {
    if let Some(counter) = HEARTBEATS_TOTAL.get() {
        counter.inc();
    }
}

pub fn record_quota_rejection() {
    if let Some(counter) = QUOTA_REJECTIONS_TOTAL.get() {
        counter.inc();
    }
}

pub fn record_auth_failure(reason: &str) {
    if let Some(counter) = AUTH_FAILURES_TOTAL.get() {
        counter.with_label_values(&[reason]).inc();
    }
}

pub fn record_store_error(operation: &str) {
    if let Some(counter) = USAGE_STORE_ERRORS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}
