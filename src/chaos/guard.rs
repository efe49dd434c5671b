//! The protected-side call path.
//!
//! Every outbound call into a dependency goes through [`guarded_call`], which
//! applies injected latency and faults inside the breaker so chaos looks to
//! the breaker exactly like a misbehaving dependency.

use std::future::Future;

use crate::chaos::engine::ChaosEngine;
use crate::chaos::scenario::InjectedFault;
use crate::resilience::{CallError, CircuitBreaker};

enum Outcome<E> {
    Injected(InjectedFault),
    Failed(E),
}

/// Run `operation` against `breaker`, consulting `engine` first.
pub async fn guarded_call<F, Fut, T, E>(
    engine: &ChaosEngine,
    breaker: &CircuitBreaker,
    operation: F,
) -> Result<T, CallError<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let target = breaker.name();
    let result = breaker
        .call(|| async move {
            let delay = engine.should_inject_latency(target);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(fault) = engine.should_inject_error(target) {
                tracing::debug!(target_service = target, fault = %fault, "Injected fault");
                return Err(Outcome::Injected(fault));
            }
            operation().await.map_err(Outcome::Failed)
        })
        .await;

    result.map_err(|e| match e {
        CallError::Open(name) => CallError::Open(name),
        CallError::Injected(fault) | CallError::Failed(Outcome::Injected(fault)) => CallError::Injected(fault),
        CallError::Failed(Outcome::Failed(e)) => CallError::Failed(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn setup() -> (Arc<CircuitBreaker>, ChaosEngine) {
        let registry = Arc::new(CircuitBreakerRegistry::default());
        let breaker = registry
            .get_or_create("db", Some(CircuitBreakerConfig::new(2, Duration::from_secs(60))))
            .unwrap();
        let engine = ChaosEngine::new(registry, Default::default()).unwrap();
        (breaker, engine)
    }

    #[tokio::test]
    async fn test_passes_through_without_scenarios() {
        let (breaker, engine) = setup();
        let value = guarded_call(&engine, &breaker, || async { Ok::<_, String>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_injected_errors_trip_breaker() {
        let (breaker, engine) = setup();
        engine.inject_errors("db", 1.0, Duration::from_secs(10), &[]).unwrap();

        for _ in 0..2 {
            let result = guarded_call(&engine, &breaker, || async { Ok::<_, String>(()) }).await;
            assert!(matches!(result, Err(CallError::Injected(InjectedFault::Error { .. }))));
        }
        assert_eq!(breaker.current_state(), CircuitState::Open);

        let result = guarded_call(&engine, &breaker, || async { Ok::<_, String>(()) }).await;
        assert!(result.unwrap_err().is_rejected());
    }

    #[tokio::test]
    async fn test_latency_is_applied() {
        let (breaker, engine) = setup();
        engine.inject_latency("db", 40, Duration::from_secs(10), &[]).unwrap();

        let started = Instant::now();
        guarded_call(&engine, &breaker, || async { Ok::<_, String>(()) })
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
