//! Composition root.
//!
//! [`ResilienceKernel`] owns one registry and the three components built on
//! it, wires automatic recovery to health changes, and applies reloaded
//! configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chaos::{ChaosEngine, ChaosError, ChaosMetrics, ChaosSettings};
use crate::config::schema::KernelConfig;
use crate::config::validation::{validate_config, ValidationError};
use crate::error::{BoxError, ConfigurationError};
use crate::health::{
    AggregatorMetrics, AggregatorSettings, HealthAggregator, HealthChange, HealthStatus, SystemHealthReport,
};
use crate::recovery::{OrchestratorMetrics, OrchestratorSettings, RecoveryError, RecoveryOrchestrator, RecoveryStrategy};
use crate::resilience::{CircuitBreaker, CircuitBreakerRegistry, CircuitState, RegistryMetrics};

static DEFAULT_KERNEL: OnceLock<ResilienceKernel> = OnceLock::new();

/// Errors raised while building or reconfiguring the kernel.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("invalid configuration: {}", format_errors(.0))]
    Invalid(Vec<ValidationError>),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Chaos(#[from] ChaosError),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Combined monitoring view of every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelMetrics {
    pub system_health: SystemHealthReport,
    pub breakers: RegistryMetrics,
    pub health: AggregatorMetrics,
    pub recovery: OrchestratorMetrics,
    pub chaos: ChaosMetrics,
}

/// Registry, health aggregator, recovery orchestrator and chaos engine,
/// wired together.
pub struct ResilienceKernel {
    registry: Arc<CircuitBreakerRegistry>,
    aggregator: HealthAggregator,
    orchestrator: RecoveryOrchestrator,
    chaos: ChaosEngine,
    auto_recover: Arc<AtomicBool>,
}

impl ResilienceKernel {
    /// Validate `config` and build every component from it. Nothing is started.
    pub fn from_config(config: &KernelConfig) -> Result<Self, KernelError> {
        validate_config(config).map_err(KernelError::Invalid)?;

        let registry = Arc::new(CircuitBreakerRegistry::new(config.breakers.default_breaker_config())?);
        for service in &config.breakers.services {
            registry.get_or_create(&service.name, Some(service.breaker_config(&config.breakers)))?;
        }

        let aggregator = HealthAggregator::new(registry.clone(), AggregatorSettings::from_config(&config.health)?)?;
        let orchestrator = RecoveryOrchestrator::new(registry.clone(), OrchestratorSettings::from_config(&config.recovery))?;
        let chaos = ChaosEngine::new(registry.clone(), ChaosSettings::from_config(&config.chaos))?;

        let kernel = Self {
            registry,
            aggregator,
            orchestrator,
            chaos,
            auto_recover: Arc::new(AtomicBool::new(config.recovery.auto_recover)),
        };
        kernel.wire_auto_recovery();

        tracing::info!(
            breakers = kernel.registry.len(),
            auto_recover = config.recovery.auto_recover,
            chaos_enabled = config.chaos.enabled,
            "Resilience kernel built"
        );
        Ok(kernel)
    }

    /// On DEGRADED/CRITICAL, schedule recovery for every open registry breaker.
    fn wire_auto_recovery(&self) {
        let enabled = self.auto_recover.clone();
        let orchestrator = self.orchestrator.clone();
        let registry = self.registry.clone();

        self.aggregator.on_health_change(move |change: HealthChange| {
            let enabled = enabled.load(Ordering::Relaxed);
            let orchestrator = orchestrator.clone();
            let registry = registry.clone();
            async move {
                let priority = match change.current {
                    HealthStatus::Critical => 0,
                    HealthStatus::Degraded => 1,
                    HealthStatus::Healthy | HealthStatus::Unknown => return Ok(()),
                };
                if !enabled {
                    return Ok(());
                }

                let open = change
                    .snapshot
                    .breaker_states
                    .iter()
                    .filter(|(name, state)| **state == CircuitState::Open && registry.get(name).is_some());
                for (name, _) in open {
                    orchestrator
                        .schedule_recovery(name, RecoveryStrategy::ExponentialBackoff, priority, None)
                        .map_err(|e| Box::new(e) as BoxError)?;
                }
                Ok::<(), BoxError>(())
            }
        });
    }

    /// Start the health and recovery loops.
    pub fn start(&self) {
        self.aggregator.start();
        self.orchestrator.start();
        tracing::info!("Resilience kernel started");
    }

    /// Stop both loops and withdraw every chaos scenario.
    pub async fn shutdown(&self) {
        let withdrawn = self.chaos.deactivate_all();
        self.aggregator.stop().await;
        self.orchestrator.stop().await;
        tracing::info!(chaos_scenarios_withdrawn = withdrawn, "Resilience kernel stopped");
    }

    /// Apply a reloaded configuration to the running components.
    ///
    /// Existing breakers keep their settings; new services are registered.
    /// Observability settings only take effect on restart.
    pub fn apply_config(&self, config: &KernelConfig) -> Result<(), KernelError> {
        validate_config(config).map_err(KernelError::Invalid)?;

        self.aggregator
            .apply_settings(AggregatorSettings::from_config(&config.health)?)?;
        self.orchestrator
            .apply_settings(OrchestratorSettings::from_config(&config.recovery))?;
        self.chaos.apply_settings(ChaosSettings::from_config(&config.chaos))?;
        self.auto_recover
            .store(config.recovery.auto_recover, Ordering::Relaxed);

        for service in &config.breakers.services {
            let breaker_config = service.breaker_config(&config.breakers);
            if let Err(e) = self.registry.get_or_create(&service.name, Some(breaker_config)) {
                tracing::warn!(breaker = %service.name, error = %e, "Breaker settings unchanged until restart");
            }
        }

        tracing::info!("Configuration applied");
        Ok(())
    }

    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    pub fn aggregator(&self) -> &HealthAggregator {
        &self.aggregator
    }

    pub fn orchestrator(&self) -> &RecoveryOrchestrator {
        &self.orchestrator
    }

    pub fn chaos(&self) -> &ChaosEngine {
        &self.chaos
    }

    /// Get or lazily create the breaker guarding `service`.
    pub fn breaker(&self, service: &str) -> Result<Arc<CircuitBreaker>, ConfigurationError> {
        self.registry.get_or_create(service, None)
    }

    pub fn get_metrics(&self) -> KernelMetrics {
        KernelMetrics {
            system_health: self.aggregator.get_system_health(),
            breakers: self.registry.get_metrics(),
            health: self.aggregator.get_metrics(),
            recovery: self.orchestrator.get_metrics(),
            chaos: self.chaos.get_metrics(),
        }
    }
}

/// The process-wide kernel built from default settings, created on first use.
///
/// Embedding code that builds its own [`ResilienceKernel`] should pass that
/// around instead.
pub fn default_kernel() -> Result<&'static ResilienceKernel, KernelError> {
    if let Some(kernel) = DEFAULT_KERNEL.get() {
        return Ok(kernel);
    }
    let kernel = ResilienceKernel::from_config(&KernelConfig::default())?;
    Ok(DEFAULT_KERNEL.get_or_init(|| kernel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::BreakerServiceConfig;
    use crate::recovery::RecoveryState;
    use std::time::Duration;

    fn fast_config() -> KernelConfig {
        let mut config = KernelConfig::default();
        config.health.check_interval_ms = 10;
        config.recovery.tick_ms = 5;
        config.recovery.initial_delay_ms = 5;
        config.recovery.max_delay_ms = 20;
        config.breakers.services = ["policy_registry", "audit_log"]
            .into_iter()
            .map(|name| BreakerServiceConfig {
                name: name.to_string(),
                fail_max: Some(1),
                reset_timeout_ms: None,
            })
            .collect();
        config
    }

    #[test]
    fn test_from_config_registers_services() {
        let kernel = ResilienceKernel::from_config(&fast_config()).unwrap();
        assert_eq!(kernel.registry().names(), vec!["audit_log", "policy_registry"]);
        assert_eq!(kernel.registry().get("audit_log").unwrap().config().fail_max, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = fast_config();
        config.health.degraded_threshold = 0.3;
        config.recovery.max_retry_attempts = 0;
        match ResilienceKernel::from_config(&config) {
            Err(KernelError::Invalid(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected validation errors, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_auto_recovery_closes_open_breakers() {
        let kernel = ResilienceKernel::from_config(&fast_config()).unwrap();
        kernel.registry().get("policy_registry").unwrap().record_failure();
        kernel.start();

        let mut recovered = false;
        for _ in 0..200 {
            let history = kernel.orchestrator().get_recovery_history(None);
            if history.iter().any(|r| r.service_name == "policy_registry" && r.state == RecoveryState::Succeeded) {
                recovered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        kernel.shutdown().await;

        assert!(recovered);
        assert_eq!(
            kernel.registry().get("policy_registry").unwrap().current_state(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_auto_recovery_can_be_disabled_live() {
        let kernel = ResilienceKernel::from_config(&fast_config()).unwrap();
        let mut config = fast_config();
        config.recovery.auto_recover = false;
        kernel.apply_config(&config).unwrap();

        kernel.registry().get("policy_registry").unwrap().record_failure();
        kernel.start();
        tokio::time::sleep(Duration::from_millis(80)).await;
        kernel.shutdown().await;

        assert!(kernel.orchestrator().get_recovery_status().is_empty());
        assert_eq!(kernel.aggregator().get_system_health().status, HealthStatus::Degraded);
    }

    #[test]
    fn test_apply_config_updates_thresholds_and_adds_breakers() {
        let kernel = ResilienceKernel::from_config(&fast_config()).unwrap();
        let mut config = fast_config();
        config.health.degraded_threshold = 0.9;
        config.breakers.services.push(BreakerServiceConfig {
            name: "signer".into(),
            fail_max: None,
            reset_timeout_ms: None,
        });
        kernel.apply_config(&config).unwrap();

        assert_eq!(kernel.aggregator().settings().thresholds.degraded, 0.9);
        assert!(kernel.registry().get("signer").is_some());
    }

    #[tokio::test]
    async fn test_metrics_serialize() {
        let kernel = ResilienceKernel::from_config(&fast_config()).unwrap();
        let json = serde_json::to_value(kernel.get_metrics()).unwrap();
        assert_eq!(json["system_health"]["status"], "HEALTHY");
        assert_eq!(json["breakers"]["breaker_count"], 2);
        assert_eq!(json["chaos"]["stopped"], false);
    }

    #[test]
    fn test_default_kernel_is_shared() {
        let a = default_kernel().unwrap() as *const ResilienceKernel;
        let b = default_kernel().unwrap() as *const ResilienceKernel;
        assert_eq!(a, b);
    }
}
