//! Error categories shared across the kernel.
//!
//! # Taxonomy
//! - [`ValidationError`]: malformed policy or scenario input, rejected before
//!   any state is touched.
//! - [`ConfigurationError`]: setup-time mistakes (conflicting breaker
//!   registration, invalid thresholds).
//! - [`AttemptError`]: something went wrong inside a single recovery attempt.
//!   Recorded on the task, never returned to a caller.

use thiserror::Error;

/// A rejected input value.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    /// Name of the offending field.
    pub field: &'static str,
    /// Human-readable explanation.
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors detected while wiring components together.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    /// A breaker with this name already exists with different settings.
    #[error("circuit breaker '{name}' already registered with a different configuration")]
    ConflictingBreakerConfig { name: String },

    /// Breaker parameters out of range.
    #[error("invalid circuit breaker configuration for '{name}': {reason}")]
    InvalidBreakerConfig { name: String, reason: String },

    /// Health thresholds must satisfy `0 <= critical <= degraded <= 1`.
    #[error("invalid health thresholds: degraded={degraded}, critical={critical}")]
    InvalidThresholds { degraded: f64, critical: f64 },

    /// Any other out-of-range setting.
    #[error("invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

/// Failure inside a recovery attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AttemptError {
    /// The health check ran and reported the service unhealthy.
    #[error("health check reported '{0}' unhealthy")]
    Unhealthy(String),

    /// The health check itself returned an error.
    #[error("health check for '{service}' errored: {message}")]
    HealthCheckErrored { service: String, message: String },

    /// The health check panicked.
    #[error("health check for '{0}' panicked")]
    HealthCheckPanicked(String),
}

/// Boxed error used at callback boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ValidationError::new("error_rate", "must be within [0, 1], got 1.5");
        assert_eq!(err.to_string(), "invalid error_rate: must be within [0, 1], got 1.5");

        let err = ConfigurationError::ConflictingBreakerConfig {
            name: "policy_registry".into(),
        };
        assert!(err.to_string().contains("policy_registry"));

        let err = AttemptError::HealthCheckPanicked("audit".into());
        assert_eq!(err.to_string(), "health check for 'audit' panicked");
    }
}
