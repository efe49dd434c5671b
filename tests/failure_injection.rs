//! Failure injection tests for the resilience kernel.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use resilience_kernel::chaos::{guarded_call, ChaosError, WILDCARD_TARGET};
use resilience_kernel::error::BoxError;
use resilience_kernel::health::HealthStatus;
use resilience_kernel::recovery::{RecoveryPolicy, RecoveryState, RecoveryStrategy};
use resilience_kernel::resilience::{CallError, CircuitState};
use resilience_kernel::ResilienceKernel;

mod common;

#[tokio::test]
async fn test_chaos_duration_clamped_and_expires() {
    let mut config = common::fast_config(&["db"]);
    config.chaos.max_duration_secs = 0.05;
    let kernel = ResilienceKernel::from_config(&config).unwrap();

    let scenario = kernel
        .chaos()
        .inject_latency("db", 20, Duration::from_secs(3600), &[])
        .unwrap();
    assert_eq!(scenario.duration_ms, 50);
    assert_eq!(scenario.requested_duration_ms, 3_600_000);
    assert_eq!(kernel.chaos().should_inject_latency("db"), Duration::from_millis(20));

    let expired = common::wait_until(Duration::from_secs(1), || kernel.chaos().get_active_scenarios().is_empty()).await;
    assert!(expired);
    assert_eq!(kernel.chaos().should_inject_latency("db"), Duration::ZERO);

    let archived = kernel.chaos().get_scenario(&scenario.name).unwrap();
    assert!(!archived.active);
    assert!(archived.deactivated_at.is_some());
}

#[tokio::test]
async fn test_blast_radius_limits_wildcard() {
    let kernel = common::fast_kernel(&["db", "cache", "queue"], false);
    kernel
        .chaos()
        .inject_errors(WILDCARD_TARGET, 1.0, Duration::from_secs(10), &["db", "cache"])
        .unwrap();

    assert!(kernel.chaos().should_inject_error("db").is_some());
    assert!(kernel.chaos().should_inject_error("cache").is_some());
    assert!(kernel.chaos().should_inject_error("queue").is_none());

    let outside = kernel
        .chaos()
        .inject_errors("queue", 1.0, Duration::from_secs(10), &["db"]);
    assert!(matches!(outside, Err(ChaosError::Validation(_))));
    assert_eq!(kernel.chaos().get_active_scenarios().len(), 1);
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_emergency_stop_blocks_until_reset() {
    let kernel = common::fast_kernel(&["db"], false);
    kernel.chaos().force_circuit_open("db", Duration::from_secs(30), &[]).unwrap();
    kernel.chaos().inject_latency("db", 100, Duration::from_secs(30), &[]).unwrap();

    assert_eq!(kernel.chaos().emergency_stop(), 2);
    assert!(kernel.chaos().is_stopped());
    assert_eq!(kernel.registry().get("db").unwrap().current_state(), CircuitState::Closed);
    assert_eq!(kernel.chaos().should_inject_latency("db"), Duration::ZERO);

    let blocked = kernel.chaos().inject_latency("db", 100, Duration::from_secs(1), &[]);
    assert!(matches!(blocked, Err(ChaosError::EmergencyStopped)));

    kernel.chaos().reset();
    assert!(!kernel.chaos().is_stopped());
    assert!(kernel.chaos().inject_latency("db", 100, Duration::from_secs(1), &[]).is_ok());
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_breaker_failures_drive_health_status() {
    let kernel = common::fast_kernel(&["a", "b", "c", "d"], false);
    assert_eq!(kernel.aggregator().poll_now().status, HealthStatus::Healthy);

    // 3 of 4 closed: 0.75 stays above the degraded threshold.
    let a = kernel.registry().get("a").unwrap();
    a.record_failure();
    a.record_failure();
    assert_eq!(kernel.aggregator().poll_now().status, HealthStatus::Healthy);

    let b = kernel.registry().get("b").unwrap();
    b.record_failure();
    b.record_failure();
    assert_eq!(kernel.aggregator().poll_now().status, HealthStatus::Degraded);

    let c = kernel.registry().get("c").unwrap();
    c.record_failure();
    c.record_failure();
    let snapshot = kernel.aggregator().poll_now();
    assert_eq!(snapshot.status, HealthStatus::Critical);
    assert_eq!(snapshot.counts.open, 3);

    let report = kernel.aggregator().get_system_health();
    assert_eq!(report.critical_services.len(), 3);
    assert!(report.last_status_change.is_some());
}

#[tokio::test]
async fn test_retry_exhaustion_makes_exact_attempts() {
    let kernel = common::fast_kernel(&["db"], false);
    kernel.start();

    let calls = Arc::new(AtomicU32::new(0));
    let policy = RecoveryPolicy::new(3, 2.0, Duration::from_millis(5), Duration::from_millis(20))
        .with_health_check(common::flaky_check(u32::MAX, calls.clone()));
    kernel
        .orchestrator()
        .schedule_recovery("db", RecoveryStrategy::ExponentialBackoff, 0, Some(policy))
        .unwrap();

    let finished = common::wait_until(Duration::from_secs(2), || {
        !kernel.orchestrator().get_recovery_history(None).is_empty()
    })
    .await;
    assert!(finished);

    let result = kernel.orchestrator().get_recovery_history(None).remove(0);
    assert_eq!(result.state, RecoveryState::Failed);
    assert!(!result.success);
    assert_eq!(result.attempt_number, 3);

    // No further attempts after the terminal state.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(kernel.orchestrator().get_recovery_status().is_empty());
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_injected_errors_open_guarded_breaker() {
    let kernel = common::fast_kernel(&["db"], false);
    let breaker = kernel.registry().get("db").unwrap();
    kernel.chaos().inject_errors("db", 1.0, Duration::from_secs(10), &[]).unwrap();

    let reached = Arc::new(AtomicU32::new(0));
    for _ in 0..2 {
        let reached = reached.clone();
        let result = guarded_call(kernel.chaos(), &breaker, || async move {
            reached.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        })
        .await;
        assert!(matches!(result, Err(CallError::Injected(_))));
    }
    assert_eq!(reached.load(Ordering::SeqCst), 0);
    assert_eq!(breaker.current_state(), CircuitState::Open);

    let rejected = guarded_call(kernel.chaos(), &breaker, || async { Ok::<_, String>(()) }).await;
    assert!(matches!(rejected, Err(CallError::Open(_))));
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_latency_injection_slows_guarded_call() {
    let kernel = common::fast_kernel(&["db"], false);
    let breaker = kernel.registry().get("db").unwrap();
    kernel.chaos().inject_latency("db", 30, Duration::from_secs(10), &[]).unwrap();

    let start = Instant::now();
    let value = guarded_call(kernel.chaos(), &breaker, || async { Ok::<_, String>(7) })
        .await
        .unwrap();
    assert_eq!(value, 7);
    assert!(start.elapsed() >= Duration::from_millis(30));
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_panicking_subscriber_does_not_stop_polling() {
    let kernel = common::fast_kernel(&["a", "b"], false);
    let delivered = Arc::new(AtomicU32::new(0));

    kernel.aggregator().on_health_change(|_change| async {
        if true {
            panic!("subscriber failure");
        }
        Ok::<(), BoxError>(())
    });
    let d = delivered.clone();
    kernel.aggregator().on_health_change(move |_change| {
        let d = d.clone();
        async move {
            d.fetch_add(1, Ordering::SeqCst);
            Ok::<(), BoxError>(())
        }
    });
    kernel.start();

    let a = kernel.registry().get("a").unwrap();
    a.record_failure();
    a.record_failure();

    // Unknown -> Healthy/Degraded, then possibly Healthy -> Degraded.
    let got = common::wait_until(Duration::from_secs(1), || delivered.load(Ordering::SeqCst) >= 1).await;
    assert!(got);

    let polls_before = kernel.aggregator().get_metrics().polls_total;
    let still_polling = common::wait_until(Duration::from_secs(1), || {
        kernel.aggregator().get_metrics().polls_total > polls_before + 2
    })
    .await;
    assert!(still_polling);
    assert!(kernel.aggregator().is_running());
    kernel.shutdown().await;
}
