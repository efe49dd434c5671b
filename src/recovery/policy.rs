//! Recovery policies and backoff strategies.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use crate::error::{BoxError, ValidationError};
use crate::resilience::backoff;

/// Delay used to park MANUAL tasks until an operator decides.
pub const MANUAL_PARK_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Caller-supplied probe run after a breaker reset. `Ok(true)` means healthy.
pub type HealthCheck = Arc<dyn Fn() -> BoxFuture<'static, Result<bool, BoxError>> + Send + Sync>;

/// How the delay before the next attempt is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    Immediate,
    LinearBackoff,
    ExponentialBackoff,
    Manual,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Immediate => "IMMEDIATE",
            RecoveryStrategy::LinearBackoff => "LINEAR_BACKOFF",
            RecoveryStrategy::ExponentialBackoff => "EXPONENTIAL_BACKOFF",
            RecoveryStrategy::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryStrategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "immediate" => Ok(RecoveryStrategy::Immediate),
            "linear" | "linear_backoff" => Ok(RecoveryStrategy::LinearBackoff),
            "exponential" | "exponential_backoff" => Ok(RecoveryStrategy::ExponentialBackoff),
            "manual" => Ok(RecoveryStrategy::Manual),
            other => Err(ValidationError::new("strategy", format!("unknown recovery strategy '{other}'"))),
        }
    }
}

/// Retry limits and backoff parameters for one service.
#[derive(Clone, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    pub max_retry_attempts: u32,
    pub backoff_multiplier: f64,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    #[serde(skip)]
    pub health_check: Option<HealthCheck>,
}

impl fmt::Debug for RecoveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryPolicy")
            .field("max_retry_attempts", &self.max_retry_attempts)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("health_check", &self.health_check.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new(3, 2.0, Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl RecoveryPolicy {
    pub fn new(max_retry_attempts: u32, backoff_multiplier: f64, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retry_attempts,
            backoff_multiplier,
            initial_delay,
            max_delay,
            health_check: None,
        }
    }

    /// Attach an infallible health check.
    pub fn with_health_check<F, Fut>(self, check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.with_fallible_health_check(move || check().map(Ok::<bool, BoxError>))
    }

    /// Attach a health check that can itself fail. Errors count as unhealthy.
    pub fn with_fallible_health_check<F, Fut>(mut self, check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, BoxError>> + Send + 'static,
    {
        self.health_check = Some(Arc::new(move || check().boxed()));
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_retry_attempts == 0 {
            return Err(ValidationError::new("max_retry_attempts", "must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ValidationError::new(
                "backoff_multiplier",
                format!("must be a finite number >= 1.0, got {}", self.backoff_multiplier),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(ValidationError::new(
                "initial_delay",
                format!(
                    "must not exceed max_delay ({}ms > {}ms)",
                    self.initial_delay.as_millis(),
                    self.max_delay.as_millis()
                ),
            ));
        }
        Ok(())
    }

    /// Delay before the attempt following `attempt_count` completed attempts.
    pub fn delay_for(&self, strategy: RecoveryStrategy, attempt_count: u32) -> Duration {
        compute_delay(strategy, self, attempt_count)
    }
}

/// Backoff delay for a strategy after `attempt_count` attempts.
pub fn compute_delay(strategy: RecoveryStrategy, policy: &RecoveryPolicy, attempt_count: u32) -> Duration {
    match strategy {
        RecoveryStrategy::Immediate => Duration::ZERO,
        RecoveryStrategy::LinearBackoff => backoff::linear(policy.initial_delay, attempt_count),
        RecoveryStrategy::ExponentialBackoff => {
            backoff::exponential(policy.initial_delay, policy.backoff_multiplier, attempt_count, policy.max_delay)
        }
        RecoveryStrategy::Manual => MANUAL_PARK_DELAY,
    }
}
