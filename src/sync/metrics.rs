//! Prometheus metrics for the sync engine
//!
//! Exposed by the trigger server on `GET /metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    /// Counter: outbound attempts by endpoint and outcome
    pub static ref API_CALLS: CounterVec = register_counter_vec!(
        "dealersync_api_calls_total",
        "Outbound remote CRM attempts by endpoint and outcome",
        &["endpoint", "outcome"]
    )
    .expect("Failed to create api_calls metric");

    /// Histogram: outbound attempt duration (seconds)
    pub static ref API_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "dealersync_api_call_duration_seconds",
        "Duration of outbound remote CRM attempts",
        &["method"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to create api_call_duration metric");

    /// Counter: OAuth refreshes by outcome
    pub static ref TOKEN_REFRESHES: CounterVec = register_counter_vec!(
        "dealersync_token_refreshes_total",
        "OAuth token refreshes by outcome",
        &["outcome"]
    )
    .expect("Failed to create token_refreshes metric");

    /// Counter: reconciliations by entity and outcome
    pub static ref RECONCILE: CounterVec = register_counter_vec!(
        "dealersync_reconcile_total",
        "Reconciliations by entity and outcome",
        &["entity", "outcome"]
    )
    .expect("Failed to create reconcile metric");

    /// Histogram: orchestrator batch duration per tenant (seconds)
    pub static ref BATCH_DURATION: HistogramVec = register_histogram_vec!(
        "dealersync_batch_duration_seconds",
        "Duration of orchestrator batch runs",
        &["tenant"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .expect("Failed to create batch_duration metric");

    /// Gauge: pending ledger rows per tenant and entity
    pub static ref PENDING_ROWS: GaugeVec = register_gauge_vec!(
        "dealersync_pending_rows",
        "Ledger rows waiting for reconciliation",
        &["tenant", "entity"]
    )
    .expect("Failed to create pending_rows metric");

    /// Gauge: daemon health status (1 = healthy, 0 = unhealthy)
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "dealersync_health_status",
        "Daemon health status (1 = healthy, 0 = unhealthy)"
    )
    .expect("Failed to create health_status metric");
}

/// Record one outbound attempt
pub fn record_api_call(endpoint: &str, method: &str, outcome: &str, duration_secs: f64) {
    API_CALLS.with_label_values(&[endpoint, outcome]).inc();
    API_CALL_DURATION
        .with_label_values(&[method])
        .observe(duration_secs);
}

pub fn record_token_refresh(outcome: &str) {
    TOKEN_REFRESHES.with_label_values(&[outcome]).inc();
}

/// Record a reconciliation outcome (`synced`, `skipped`, or an error code)
pub fn record_reconcile(entity: &str, outcome: &str) {
    RECONCILE.with_label_values(&[entity, outcome]).inc();
}

pub fn record_batch_duration(tenant: &str, duration_secs: f64) {
    BATCH_DURATION
        .with_label_values(&[tenant])
        .observe(duration_secs);
}

pub fn set_pending_rows(tenant: &str, entity: &str, count: u64) {
    PENDING_ROWS
        .with_label_values(&[tenant, entity])
        .set(count as f64);
}

pub fn set_health_status(healthy: bool) {
    HEALTH_STATUS.set(if healthy { 1.0 } else { 0.0 });
}

/// Encode all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        record_api_call("/contacts/search", "POST", "200", 0.12);
        record_token_refresh("success");
        record_reconcile("contact", "synced");
        record_batch_duration("test-tenant", 1.5);
        set_pending_rows("test-tenant", "contact", 4);
        set_health_status(true);

        let output = gather_metrics();
        assert!(output.contains("dealersync_api_calls_total"));
        assert!(output.contains("dealersync_reconcile_total"));
        assert!(output.contains("dealersync_pending_rows"));
    }
}
