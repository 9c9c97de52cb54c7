//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase using the `metrics`
//! crate's macros. This module installs the Prometheus exporter and
//! registers human-readable descriptions for each metric.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests
/// where multiple gateways share a process). Metric recording still
/// works; the macros route to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    // -- Request path --
    describe_counter!("llamagate_requests_total", "Requests forwarded per model");
    describe_counter!(
        "llamagate_transport_errors_total",
        "Forwards that failed between gateway and backend"
    );
    describe_gauge!("llamagate_in_flight", "Current in-flight forwards per model");

    // -- Queueing --
    describe_gauge!(
        "llamagate_queue_depth",
        "Requests waiting for a model to become ready"
    );
    describe_histogram!(
        "llamagate_queue_wait_seconds",
        "Time a request spent queued before the model was ready"
    );
    describe_counter!(
        "llamagate_queue_timeouts_total",
        "Queued requests resolved with 504 by the timeout sweep"
    );

    // -- Lifecycle --
    describe_gauge!("llamagate_model_up", "1 while a model is ready, else 0");
    describe_counter!("llamagate_model_starts_total", "Successful backend starts");
    describe_counter!("llamagate_start_failures_total", "Backend start failures");
    describe_counter!("llamagate_model_stops_total", "Backend stops");
    describe_counter!("llamagate_model_reloads_total", "Successful backend reloads");
    describe_histogram!(
        "llamagate_start_duration_seconds",
        "Wall-clock time from spawn to readiness"
    );
    describe_counter!(
        "llamagate_evictions_total",
        "Models evicted to admit a higher-priority start"
    );
    describe_counter!(
        "llamagate_admission_denied_total",
        "Starts rejected because no slot was free and nothing was evictable"
    );
    describe_counter!(
        "llamagate_reaped_total",
        "Models stopped by the idle reaper"
    );
}
