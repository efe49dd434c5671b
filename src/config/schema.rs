//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the kernel.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::recovery::RecoveryPolicy;
use crate::resilience::CircuitBreakerConfig;

/// Root configuration for the resilience kernel.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    /// Health aggregation settings.
    pub health: HealthConfig,

    /// Recovery orchestration settings and the default policy.
    pub recovery: RecoveryConfig,

    /// Circuit breaker defaults and pre-registered breakers.
    pub breakers: BreakersConfig,

    /// Chaos engine safety rails.
    pub chaos: ChaosConfig,

    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,
}

/// Health aggregation configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Poll interval in milliseconds.
    pub check_interval_ms: u64,

    /// Score at or above which the system is HEALTHY.
    pub degraded_threshold: f64,

    /// Score below which the system is CRITICAL.
    pub critical_threshold: f64,

    /// Maximum number of snapshots kept in history.
    pub history_max_size: usize,

    /// Maximum age of a snapshot in history, in seconds.
    pub history_max_age_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 1000,
            degraded_threshold: 0.7,
            critical_threshold: 0.5,
            history_max_size: 1000,
            history_max_age_secs: 3600,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn history_max_age(&self) -> Duration {
        Duration::from_secs(self.history_max_age_secs)
    }
}

/// Recovery orchestration configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Attempts before a non-manual task is declared FAILED.
    pub max_retry_attempts: u32,

    /// Growth factor for exponential backoff.
    pub backoff_multiplier: f64,

    /// First backoff delay in milliseconds.
    pub initial_delay_ms: u64,

    /// Backoff cap in milliseconds.
    pub max_delay_ms: u64,

    /// Idle wake-up period of the recovery loop in milliseconds.
    pub tick_ms: u64,

    /// Terminal results kept in history.
    pub history_size: usize,

    /// Schedule recovery for open breakers when health degrades.
    pub auto_recover: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            tick_ms: 100,
            history_size: 100,
            auto_recover: true,
        }
    }
}

impl RecoveryConfig {
    /// The default policy described by this section, without a health check.
    pub fn default_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy::new(
            self.max_retry_attempts,
            self.backoff_multiplier,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BreakersConfig {
    /// Default consecutive-failure threshold.
    pub fail_max: u32,

    /// Default Open → Half-Open timeout in milliseconds.
    pub reset_timeout_ms: u64,

    /// Breakers registered at startup, optionally with their own settings.
    pub services: Vec<BreakerServiceConfig>,
}

impl Default for BreakersConfig {
    fn default() -> Self {
        Self {
            fail_max: 5,
            reset_timeout_ms: 30_000,
            services: Vec::new(),
        }
    }
}

impl BreakersConfig {
    pub fn default_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(self.fail_max, Duration::from_millis(self.reset_timeout_ms))
    }
}

/// A breaker registered at startup.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BreakerServiceConfig {
    /// Dependency name.
    pub name: String,

    /// Override for the default `fail_max`.
    #[serde(default)]
    pub fail_max: Option<u32>,

    /// Override for the default `reset_timeout_ms`.
    #[serde(default)]
    pub reset_timeout_ms: Option<u64>,
}

impl BreakerServiceConfig {
    pub fn breaker_config(&self, defaults: &BreakersConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(
            self.fail_max.unwrap_or(defaults.fail_max),
            Duration::from_millis(self.reset_timeout_ms.unwrap_or(defaults.reset_timeout_ms)),
        )
    }
}

/// Chaos engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ChaosConfig {
    /// Allow fault injection at all.
    pub enabled: bool,

    /// Upper bound on any scenario's lifetime, in seconds.
    pub max_duration_secs: f64,

    /// Deactivated scenarios kept for inspection.
    pub history_size: usize,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_duration_secs: 300.0,
            history_size: 100,
        }
    }
}

impl ChaosConfig {
    /// The configured cap, or zero if it is not a usable number.
    pub fn max_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_duration_secs).unwrap_or(Duration::ZERO)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
