//! Prometheus metrics for ledger-sync-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Counter for reconciliation passes by kind (`accounts`, `transactions`) and status.
pub static SYNC_PASSES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_sync_passes_total",
        "Total number of reconciliation passes",
        &["kind", "status"]
    )
    .expect("Failed to register SYNC_PASSES")
});

/// Counter for records applied from provider pages, by outcome.
pub static SYNC_RECORDS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_sync_records_total",
        "Provider records processed by outcome",
        &["outcome"]
    )
    .expect("Failed to register SYNC_RECORDS")
});

/// Histogram for upstream provider request duration by endpoint.
pub static PROVIDER_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ledger_sync_provider_request_duration_seconds",
        "Provider request duration in seconds",
        &["endpoint", "status"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register PROVIDER_REQUEST_DURATION")
});

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ledger_sync_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_sync_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&SYNC_PASSES);
    Lazy::force(&SYNC_RECORDS);
    Lazy::force(&PROVIDER_REQUEST_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a finished pass.
pub fn record_sync_pass(kind: &str, status: &str) {
    SYNC_PASSES.with_label_values(&[kind, status]).inc();
}

/// Record processed provider records.
pub fn record_sync_records(outcome: &str, count: usize) {
    if count > 0 {
        SYNC_RECORDS
            .with_label_values(&[outcome])
            .inc_by(count as f64);
    }
}

/// Record a provider round trip.
pub fn record_provider_request(endpoint: &str, status: &str, duration_secs: f64) {
    PROVIDER_REQUEST_DURATION
        .with_label_values(&[endpoint, status])
        .observe(duration_secs);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
