//! Metrics collection and exposition.
//!
//! # Metrics
//! - `kernel_breaker_state` (gauge): 0=closed, 1=half-open, 2=open, by breaker
//! - `kernel_breaker_transitions_total` (counter): by breaker, from, to
//! - `kernel_health_score` (gauge): aggregate score in [0, 1]
//! - `kernel_health_status` (gauge): 0=healthy, 1=degraded, 2=critical, 3=unknown
//! - `kernel_health_polls_total` (counter)
//! - `kernel_health_callbacks_total` (counter): by outcome
//! - `kernel_recovery_attempts_total` (counter): by service, outcome
//! - `kernel_recovery_queue_depth` (gauge)
//! - `kernel_chaos_active_scenarios` (gauge)
//! - `kernel_chaos_injections_total` (counter): by kind
//! - `kernel_chaos_emergency_stops_total` (counter)

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::health::HealthStatus;
use crate::resilience::circuit_breaker::CircuitState;

/// Install the Prometheus exporter and its scrape listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

fn state_value(state: CircuitState) -> f64 {
    match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    }
}

pub fn record_breaker_state(breaker: &str, state: CircuitState) {
    gauge!("kernel_breaker_state", "breaker" => breaker.to_string()).set(state_value(state));
}

pub fn record_breaker_transition(breaker: &str, from: CircuitState, to: CircuitState) {
    counter!(
        "kernel_breaker_transitions_total",
        "breaker" => breaker.to_string(),
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
    record_breaker_state(breaker, to);
}

pub fn record_health_poll(score: f64, status: HealthStatus) {
    counter!("kernel_health_polls_total").increment(1);
    gauge!("kernel_health_score").set(score);
    let status_value = match status {
        HealthStatus::Healthy => 0.0,
        HealthStatus::Degraded => 1.0,
        HealthStatus::Critical => 2.0,
        HealthStatus::Unknown => 3.0,
    };
    gauge!("kernel_health_status").set(status_value);
}

pub fn record_health_callback(outcome: &'static str) {
    counter!("kernel_health_callbacks_total", "outcome" => outcome).increment(1);
}

pub fn record_recovery_attempt(service: &str, outcome: &'static str) {
    counter!(
        "kernel_recovery_attempts_total",
        "service" => service.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_recovery_queue_depth(depth: usize) {
    gauge!("kernel_recovery_queue_depth").set(depth as f64);
}

pub fn record_chaos_active(count: usize) {
    gauge!("kernel_chaos_active_scenarios").set(count as f64);
}

pub fn record_chaos_injection(kind: &'static str) {
    counter!("kernel_chaos_injections_total", "kind" => kind).increment(1);
}

pub fn record_emergency_stop() {
    counter!("kernel_chaos_emergency_stops_total").increment(1);
}
