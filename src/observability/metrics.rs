//! Metrics collection and exposition.
//!
//! # Metrics
//! - `edge_requests_total` (counter): client-facing requests by outcome and status
//! - `edge_request_duration_seconds` (histogram): end-to-end latency
//! - `edge_backend_attempts_total` / `edge_backend_failures_total` (counter): per backend
//! - `edge_healthy_backends` (gauge): routable backends in the current snapshot
//! - `edge_backend_health` (gauge): 1=routable, 0=not routable
//! - `edge_health_transitions_total` (counter): state machine transitions
//! - `edge_rate_limit_buckets` (gauge): tracked rate limit clients
//! - `edge_probes_total` (counter): health probes by result
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until a recorder is installed
//! - The Prometheus recorder is installed at most once per process
//! - Recording never fails the request path

use std::sync::OnceLock;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::health::state::HealthStatus;
use crate::load_balancer::pool::PoolSnapshot;

pub const REQUESTS_TOTAL: &str = "edge_requests_total";
pub const REQUEST_DURATION: &str = "edge_request_duration_seconds";
pub const BACKEND_ATTEMPTS: &str = "edge_backend_attempts_total";
pub const BACKEND_FAILURES: &str = "edge_backend_failures_total";
pub const HEALTHY_BACKENDS: &str = "edge_healthy_backends";
pub const BACKEND_HEALTH: &str = "edge_backend_health";
pub const HEALTH_TRANSITIONS: &str = "edge_health_transitions_total";
pub const RATE_LIMIT_BUCKETS: &str = "edge_rate_limit_buckets";
pub const PROBES_TOTAL: &str = "edge_probes_total";

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the Prometheus recorder. Later calls return the first result.
pub fn init_metrics() -> Option<PrometheusHandle> {
    HANDLE
        .get_or_init(|| {
            let builder = match PrometheusBuilder::new()
                .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), LATENCY_BUCKETS)
            {
                Ok(builder) => builder,
                Err(e) => {
                    tracing::error!(error = %e, "Invalid histogram buckets");
                    return None;
                }
            };

            match builder.install_recorder() {
                Ok(handle) => {
                    describe();
                    tracing::info!("Prometheus recorder installed");
                    Some(handle)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install Prometheus recorder");
                    None
                }
            }
        })
        .clone()
}

/// Text exposition of everything recorded so far.
pub fn render() -> Option<String> {
    HANDLE.get().and_then(|h| h.as_ref()).map(PrometheusHandle::render)
}

fn describe() {
    describe_counter!(REQUESTS_TOTAL, "Client-facing requests by outcome and status");
    describe_histogram!(
        REQUEST_DURATION,
        metrics::Unit::Seconds,
        "End-to-end request latency"
    );
    describe_counter!(BACKEND_ATTEMPTS, "Forwarding attempts per backend");
    describe_counter!(BACKEND_FAILURES, "Failed forwarding attempts per backend");
    describe_gauge!(HEALTHY_BACKENDS, "Routable backends in the current pool snapshot");
    describe_gauge!(BACKEND_HEALTH, "1 if the backend is routable, 0 otherwise");
    describe_counter!(HEALTH_TRANSITIONS, "Health state machine transitions");
    describe_gauge!(RATE_LIMIT_BUCKETS, "Clients tracked by the rate limiter");
    describe_counter!(PROBES_TOTAL, "Health probes by result");
}

/// One observation per client-facing request.
pub fn record_request(outcome: &'static str, status: u16, start: Instant) {
    counter!(REQUESTS_TOTAL, "outcome" => outcome, "status" => status.to_string()).increment(1);
    histogram!(REQUEST_DURATION).record(start.elapsed().as_secs_f64());
}

pub fn record_attempt(backend: &str) {
    counter!(BACKEND_ATTEMPTS, "backend" => backend.to_string()).increment(1);
}

pub fn record_backend_failure(backend: &str) {
    counter!(BACKEND_FAILURES, "backend" => backend.to_string()).increment(1);
}

pub fn record_pool(snapshot: &PoolSnapshot) {
    gauge!(HEALTHY_BACKENDS).set(snapshot.routable_count() as f64);
    for backend in snapshot.backends() {
        let value = if backend.is_routable() { 1.0 } else { 0.0 };
        gauge!(BACKEND_HEALTH, "backend" => backend.id.clone()).set(value);
    }
}

pub fn record_transition(backend: &str, from: HealthStatus, to: HealthStatus) {
    counter!(HEALTH_TRANSITIONS, "from" => from.as_str(), "to" => to.as_str()).increment(1);
    tracing::trace!(backend = %backend, from = %from, to = %to, "Recorded health transition");
}

pub fn record_probe(backend: &str, result: &'static str) {
    counter!(PROBES_TOTAL, "result" => result).increment(1);
    tracing::trace!(backend = %backend, result, "Recorded probe");
}

pub fn record_bucket_count(tracked: usize) {
    gauge!(RATE_LIMIT_BUCKETS).set(tracked as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_harmless() {
        record_request("success", 200, Instant::now());
        record_attempt("b1");
        record_backend_failure("b1");
        record_transition("b1", HealthStatus::Healthy, HealthStatus::Suspect);
        record_probe("b1", "timeout");
        record_bucket_count(3);
    }

    #[test]
    fn exposition_contains_recorded_series() {
        let Some(_) = init_metrics() else {
            // another recorder already owns this process
            return;
        };
        assert!(init_metrics().is_some());

        record_request("rate_limited", 429, Instant::now());
        record_transition("b1", HealthStatus::Suspect, HealthStatus::Unhealthy);

        let text = render().unwrap();
        assert!(text.contains("edge_requests_total{"));
        assert!(text.contains("outcome=\"rate_limited\""));
        assert!(text.contains("to=\"unhealthy\""));
        assert!(text.contains("edge_request_duration_seconds_bucket"));
    }
}
