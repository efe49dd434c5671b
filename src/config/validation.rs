//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (intervals > 0, thresholds ordered within [0, 1])
//! - Detect duplicate breaker registrations
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: KernelConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

pub use crate::error::ValidationError;
use crate::config::schema::KernelConfig;
use crate::health::HealthThresholds;

/// Check every semantic rule and collect all violations.
pub fn validate_config(config: &KernelConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let health = &config.health;
    if health.check_interval_ms == 0 {
        errors.push(ValidationError::new("health.check_interval_ms", "must be greater than zero"));
    }
    if let Err(e) = HealthThresholds::new(health.degraded_threshold, health.critical_threshold) {
        errors.push(ValidationError::new("health.thresholds", e.to_string()));
    }
    if health.history_max_size == 0 {
        errors.push(ValidationError::new("health.history_max_size", "must be greater than zero"));
    }
    if health.history_max_age_secs == 0 {
        errors.push(ValidationError::new("health.history_max_age_secs", "must be greater than zero"));
    }

    let recovery = &config.recovery;
    if let Err(e) = recovery.default_policy().validate() {
        errors.push(ValidationError::new("recovery", e.to_string()));
    }
    if recovery.tick_ms == 0 {
        errors.push(ValidationError::new("recovery.tick_ms", "must be greater than zero"));
    }
    if recovery.history_size == 0 {
        errors.push(ValidationError::new("recovery.history_size", "must be greater than zero"));
    }

    let breakers = &config.breakers;
    if let Err(e) = breakers.default_breaker_config().validate("<default>") {
        errors.push(ValidationError::new("breakers", e.to_string()));
    }
    let mut seen = HashSet::new();
    for service in &breakers.services {
        if service.name.trim().is_empty() {
            errors.push(ValidationError::new("breakers.services.name", "must not be empty"));
            continue;
        }
        if !seen.insert(service.name.as_str()) {
            errors.push(ValidationError::new(
                "breakers.services.name",
                format!("duplicate breaker '{}'", service.name),
            ));
        }
        if let Err(e) = service.breaker_config(breakers).validate(&service.name) {
            errors.push(ValidationError::new("breakers.services", e.to_string()));
        }
    }

    let chaos = &config.chaos;
    if !(chaos.max_duration_secs.is_finite() && chaos.max_duration_secs > 0.0) {
        errors.push(ValidationError::new(
            "chaos.max_duration_secs",
            format!("must be a positive number of seconds, got {}", chaos.max_duration_secs),
        ));
    }
    if chaos.history_size == 0 {
        errors.push(ValidationError::new("chaos.history_size", "must be greater than zero"));
    }

    let observability = &config.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::BreakerServiceConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&KernelConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = KernelConfig::default();
        config.health.check_interval_ms = 0;
        config.health.degraded_threshold = 0.4;
        config.health.critical_threshold = 0.6;
        config.recovery.max_retry_attempts = 0;
        config.chaos.max_duration_secs = 0.0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field).collect();
        assert!(fields.contains(&"health.check_interval_ms"));
        assert!(fields.contains(&"health.thresholds"));
        assert!(fields.contains(&"recovery"));
        assert!(fields.contains(&"chaos.max_duration_secs"));
    }

    #[test]
    fn test_duplicate_breakers() {
        let mut config = KernelConfig::default();
        for _ in 0..2 {
            config.breakers.services.push(BreakerServiceConfig {
                name: "audit_ledger".into(),
                fail_max: None,
                reset_timeout_ms: None,
            });
        }
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].reason.contains("audit_ledger"));
    }

    #[test]
    fn test_metrics_address_checked_only_when_enabled() {
        let mut config = KernelConfig::default();
        config.observability.metrics_address = "not-an-address".into();
        assert!(validate_config(&config).is_ok());
        config.observability.metrics_enabled = true;
        assert!(validate_config(&config).is_err());
    }
}
