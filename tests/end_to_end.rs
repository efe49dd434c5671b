//! Chaos → degraded health → recovery, through the whole kernel.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resilience_kernel::health::HealthStatus;
use resilience_kernel::recovery::{RecoveryPolicy, RecoveryState, RecoveryStrategy};
use resilience_kernel::resilience::CircuitState;

mod common;

#[tokio::test]
async fn test_forced_open_degrades_then_recovers() {
    let kernel = common::fast_kernel(&["policy_registry", "audit_log"], false);
    kernel.start();

    let scenario = kernel
        .chaos()
        .force_circuit_open("policy_registry", Duration::from_secs(5), &[])
        .unwrap();
    assert_eq!(scenario.duration(), Duration::from_secs(5));

    // One of two breakers open: score 0.5, which is DEGRADED under the default thresholds.
    let snapshot = kernel.aggregator().poll_now();
    assert_eq!(snapshot.breaker_states["policy_registry"], CircuitState::Open);
    assert_eq!(snapshot.status, HealthStatus::Degraded);

    let policy = kernel
        .orchestrator()
        .get_recovery_policy("policy_registry")
        .with_health_check(|| async { true });
    kernel
        .orchestrator()
        .schedule_recovery("policy_registry", RecoveryStrategy::ExponentialBackoff, 0, Some(policy))
        .unwrap();

    let recovered = common::wait_until(Duration::from_secs(2), || {
        kernel
            .orchestrator()
            .get_recovery_history(None)
            .iter()
            .any(|r| r.service_name == "policy_registry" && r.state == RecoveryState::Succeeded)
    })
    .await;
    assert!(recovered, "recovery did not succeed before the forced window expired");

    let breaker = kernel.registry().get("policy_registry").unwrap();
    assert_eq!(breaker.current_state(), CircuitState::Closed);
    assert!(!breaker.is_forced_open());

    let healthy = common::wait_until(Duration::from_secs(1), || {
        kernel
            .aggregator()
            .get_health_history(None)
            .last()
            .is_some_and(|s| s.status == HealthStatus::Healthy)
    })
    .await;
    assert!(healthy);

    kernel.shutdown().await;
    assert!(kernel.chaos().get_active_scenarios().is_empty());
}

#[tokio::test]
async fn test_critical_with_single_breaker() {
    let kernel = common::fast_kernel(&["policy_registry"], false);
    kernel
        .chaos()
        .force_circuit_open("policy_registry", Duration::from_secs(5), &[])
        .unwrap();

    let report = kernel.aggregator().get_system_health();
    assert_eq!(report.status, HealthStatus::Critical);
    assert_eq!(report.critical_services, vec!["policy_registry".to_string()]);
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_auto_recovery_follows_health_change() {
    let kernel = common::fast_kernel(&["policy_registry", "audit_log", "signer"], true);
    kernel.start();
    kernel
        .chaos()
        .force_circuit_open("signer", Duration::from_secs(5), &[])
        .unwrap();

    let recovered = common::wait_until(Duration::from_secs(2), || {
        kernel.registry().get("signer").unwrap().current_state() == CircuitState::Closed
    })
    .await;
    assert!(recovered);

    let history = kernel.orchestrator().get_recovery_history(None);
    let result = history.iter().find(|r| r.service_name == "signer").unwrap();
    assert_eq!(result.strategy, RecoveryStrategy::ExponentialBackoff);
    assert!(result.success);
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_health_changes_reach_subscribers() {
    let kernel = common::fast_kernel(&["a", "b"], false);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    kernel.aggregator().on_health_change(move |change| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((change.previous, change.current));
            Ok::<(), resilience_kernel::error::BoxError>(())
        }
    });
    kernel.start();

    let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, (HealthStatus::Unknown, HealthStatus::Healthy));

    let breaker = kernel.registry().get("a").unwrap();
    breaker.record_failure();
    breaker.record_failure();

    let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(second, (HealthStatus::Healthy, HealthStatus::Degraded));
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_kernel_metrics_report_round_trip() {
    let kernel = common::fast_kernel(&["a"], false);
    kernel.aggregator().poll_now();
    let metrics = kernel.get_metrics();

    let json = serde_json::to_string(&metrics).unwrap();
    let parsed: resilience_kernel::kernel::KernelMetrics = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.system_health.status, metrics.system_health.status);
    assert_eq!(parsed.system_health.score, metrics.system_health.score);
    assert_eq!(parsed.health.polls_total, 1);
}

#[tokio::test]
async fn test_flaky_dependency_recovers_on_third_attempt() {
    let kernel = common::fast_kernel(&["ledger"], false);
    kernel.start();
    let breaker = kernel.registry().get("ledger").unwrap();
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.current_state(), CircuitState::Open);

    let calls = Arc::new(AtomicU32::new(0));
    let policy = RecoveryPolicy::new(5, 1.0, Duration::from_millis(5), Duration::from_millis(40))
        .with_health_check(common::flaky_check(2, calls.clone()));
    kernel
        .orchestrator()
        .schedule_recovery("ledger", RecoveryStrategy::LinearBackoff, 3, Some(policy))
        .unwrap();

    let done = common::wait_until(Duration::from_secs(2), || {
        !kernel.orchestrator().get_recovery_history(None).is_empty()
    })
    .await;
    assert!(done);

    let history = kernel.orchestrator().get_recovery_history(None);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, RecoveryState::Succeeded);
    assert_eq!(history[0].attempt_number, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(breaker.current_state(), CircuitState::Closed);

    let json = serde_json::to_string(&history[0]).unwrap();
    let parsed: resilience_kernel::recovery::RecoveryResult = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, history[0]);
    kernel.shutdown().await;
}
