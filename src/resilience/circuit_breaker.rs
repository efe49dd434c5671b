//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: testing if the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= fail_max
//! Open → Half-Open: after reset_timeout (lazily, on the next state read)
//! Half-Open → Closed: trial call succeeds
//! Half-Open → Open: trial call fails
//! any → Closed: explicit reset()
//! ```
//!
//! # Design Decisions
//! - One breaker per named dependency, owned by the registry
//! - Fail fast in Open state (the wrapped operation is never polled)
//! - Single trial call in Half-Open
//! - A forced-open window (chaos) pins the breaker Open until it expires or
//!   the breaker is reset

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chaos::InjectedFault;
use crate::error::ConfigurationError;
use crate::observability::metrics;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    /// Contribution of a breaker in this state to the health score.
    pub fn health_weight(&self) -> f64 {
        match self {
            CircuitState::Closed => 1.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Open => 0.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub fail_max: u32,
    /// Time spent Open before a trial call is allowed.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            fail_max: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(fail_max: u32, reset_timeout: Duration) -> Self {
        Self {
            fail_max,
            reset_timeout,
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigurationError> {
        if self.fail_max == 0 {
            return Err(ConfigurationError::InvalidBreakerConfig {
                name: name.to_string(),
                reason: "fail_max must be at least 1".to_string(),
            });
        }
        if self.reset_timeout.is_zero() {
            return Err(ConfigurationError::InvalidBreakerConfig {
                name: name.to_string(),
                reason: "reset_timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Error returned by a guarded call.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The breaker rejected the call without running it.
    #[error("circuit breaker '{0}' is open")]
    Open(String),

    /// Chaos injection replaced the call with a fault.
    #[error("injected fault: {0}")]
    Injected(InjectedFault),

    /// The wrapped operation ran and failed.
    #[error("guarded call failed: {0}")]
    Failed(E),
}

impl<E> CallError<E> {
    /// True if the wrapped operation was never executed.
    pub fn is_rejected(&self) -> bool {
        matches!(self, CallError::Open(_))
    }
}

/// The view of a breaker that monitoring and recovery depend on.
pub trait BreakerHandle: Send + Sync {
    fn name(&self) -> &str;
    fn current_state(&self) -> CircuitState;
    fn reset(&self);
}

/// Serializable point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub fail_max: u32,
    pub reset_timeout_ms: u64,
    pub forced_open: bool,
    pub successes_total: u64,
    pub failures_total: u64,
    pub rejected_total: u64,
    pub last_transition_at: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    forced_until: Option<Instant>,
    trial_in_flight: bool,
    last_transition_at: DateTime<Utc>,
    successes_total: u64,
    failures_total: u64,
    rejected_total: u64,
}

/// A tri-state guard around one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a Closed breaker after validating its settings.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self, ConfigurationError> {
        let name = name.into();
        config.validate(&name)?;
        metrics::record_breaker_state(&name, CircuitState::Closed);

        Ok(Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                forced_until: None,
                trial_in_flight: false,
                last_transition_at: Utc::now(),
                successes_total: 0,
                failures_total: 0,
                rejected_total: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, applying the Open → Half-Open timeout if it has elapsed.
    pub fn current_state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// True while a chaos-forced open window is in effect.
    pub fn is_forced_open(&self) -> bool {
        let inner = self.lock();
        inner.forced_until.is_some_and(|until| Instant::now() < until)
    }

    fn refresh(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        if inner.forced_until.is_some_and(|until| now < until) {
            return;
        }
        let elapsed = inner
            .opened_at
            .map(|opened| now.saturating_duration_since(opened))
            .unwrap_or_default();
        if elapsed >= self.config.reset_timeout {
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.last_transition_at = Utc::now();
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                tracing::warn!(
                    breaker = %self.name,
                    from = %from,
                    consecutive_failures = inner.consecutive_failures,
                    "Circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                tracing::info!(breaker = %self.name, "Circuit half-open, allowing trial call");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.consecutive_failures = 0;
                inner.trial_in_flight = false;
                tracing::info!(breaker = %self.name, from = %from, "Circuit closed");
            }
        }
        metrics::record_breaker_transition(&self.name, from, to);
    }

    /// Ask for permission to run a call. `Some(true)` marks a half-open trial.
    fn acquire(&self) -> Option<bool> {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Some(true)
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                inner.rejected_total += 1;
                None
            }
        }
    }

    /// Report a successful call made outside [`CircuitBreaker::call`].
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.successes_total += 1;
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.forced_until = None;
                self.transition(&mut inner, CircuitState::Closed);
            }
            // Late completion of a call admitted before the breaker opened.
            CircuitState::Open => {}
        }
    }

    /// Report a failed call made outside [`CircuitBreaker::call`].
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failures_total += 1;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.config.fail_max {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Run `operation` under the breaker.
    ///
    /// While Open the operation is not executed and [`CallError::Open`] is
    /// returned immediately.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(trial) = self.acquire() else {
            tracing::debug!(breaker = %self.name, "Circuit open, call rejected");
            return Err(CallError::Open(self.name.clone()));
        };
        let mut guard = TrialGuard {
            breaker: self,
            armed: trial,
        };

        let outcome = operation().await;
        guard.armed = false;
        match outcome {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CallError::Failed(err))
            }
        }
    }

    /// Force the breaker to Closed and clear all counters and forced windows.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.forced_until = None;
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    /// Pin the breaker Open for `duration`.
    pub fn force_open(&self, duration: Duration) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.forced_until = Some(now + duration);
        if inner.state == CircuitState::Open {
            inner.opened_at = Some(now);
        } else {
            self.transition(&mut inner, CircuitState::Open);
        }
        tracing::warn!(
            breaker = %self.name,
            duration_ms = duration.as_millis() as u64,
            "Circuit forced open"
        );
    }

    /// Undo [`CircuitBreaker::force_open`]. Returns false if the breaker was
    /// not forced (for example because it was reset in the meantime).
    pub fn clear_forced_open(&self) -> bool {
        let mut inner = self.lock();
        if inner.forced_until.take().is_none() {
            return false;
        }
        inner.consecutive_failures = 0;
        self.transition(&mut inner, CircuitState::Closed);
        true
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        let now = Instant::now();
        self.refresh(&mut inner, now);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            fail_max: self.config.fail_max,
            reset_timeout_ms: self.config.reset_timeout.as_millis() as u64,
            forced_open: inner.forced_until.is_some_and(|until| now < until),
            successes_total: inner.successes_total,
            failures_total: inner.failures_total,
            rejected_total: inner.rejected_total,
            last_transition_at: inner.last_transition_at,
        }
    }
}

impl BreakerHandle for CircuitBreaker {
    fn name(&self) -> &str {
        CircuitBreaker::name(self)
    }

    fn current_state(&self) -> CircuitState {
        CircuitBreaker::current_state(self)
    }

    fn reset(&self) {
        CircuitBreaker::reset(self)
    }
}

/// Releases the half-open trial slot if a guarded future is dropped mid-call.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(fail_max: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new("svc", CircuitBreakerConfig::new(fail_max, Duration::from_millis(reset_ms))).unwrap()
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), CallError<&'static str>> {
        b.call(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32, CallError<&'static str>> {
        b.call(|| async { Ok::<_, &'static str>(7) }).await
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(CircuitBreaker::new("x", CircuitBreakerConfig::new(0, Duration::from_secs(1))).is_err());
        assert!(CircuitBreaker::new("x", CircuitBreakerConfig::new(1, Duration::ZERO)).is_err());
    }

    #[tokio::test]
    async fn test_opens_after_fail_max() {
        let b = breaker(3, 10_000);
        for _ in 0..2 {
            assert!(matches!(fail(&b).await, Err(CallError::Failed("boom"))));
            assert_eq!(b.current_state(), CircuitState::Closed);
        }
        assert!(fail(&b).await.is_err());
        assert_eq!(b.current_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let b = breaker(2, 10_000);
        let _ = fail(&b).await;
        assert_eq!(succeed(&b).await.unwrap(), 7);
        let _ = fail(&b).await;
        assert_eq!(b.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_fails_fast_without_running_operation() {
        let b = breaker(1, 10_000);
        let _ = fail(&b).await;

        let mut ran = false;
        let result = b
            .call(|| {
                ran = true;
                async { Ok::<_, &'static str>(()) }
            })
            .await;
        assert!(matches!(result, Err(CallError::Open(ref name)) if name == "svc"));
        assert!(!ran);
        assert_eq!(b.snapshot().rejected_total, 1);
    }

    #[tokio::test]
    async fn test_half_open_trial_outcomes() {
        let b = breaker(1, 20);
        let _ = fail(&b).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(b.current_state(), CircuitState::HalfOpen);

        // Failed trial goes straight back to Open.
        let _ = fail(&b).await;
        assert_eq!(b.current_state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.current_state(), CircuitState::Closed);
    }

    #[test]
    fn test_reset_forces_closed() {
        let b = breaker(1, 10_000);
        b.record_failure();
        assert_eq!(b.current_state(), CircuitState::Open);
        b.reset();
        assert_eq!(b.current_state(), CircuitState::Closed);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_forced_open_ignores_reset_timeout() {
        let b = breaker(5, 10);
        b.force_open(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(b.current_state(), CircuitState::Open);
        assert!(b.is_forced_open());

        assert!(b.clear_forced_open());
        assert_eq!(b.current_state(), CircuitState::Closed);
        assert!(!b.clear_forced_open());
    }

    #[test]
    fn test_reset_clears_forced_window() {
        let b = breaker(5, 10_000);
        b.force_open(Duration::from_secs(60));
        b.reset();
        assert!(!b.is_forced_open());
        assert!(!b.clear_forced_open());
        assert_eq!(b.current_state(), CircuitState::Closed);
    }

    #[test]
    fn test_state_serializes_screaming_case() {
        let json = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(json, "\"HALF_OPEN\"");
        let back: CircuitState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CircuitState::HalfOpen);
    }
}
