//! Circuit breaker registry.
//!
//! # Responsibilities
//! - Create breakers lazily by name and hand out shared handles
//! - Reject re-registration of a name with conflicting settings
//! - Bulk reset and bulk state reads for recovery and monitoring

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::resilience::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};

/// Registry-level counters and per-breaker detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryMetrics {
    pub breaker_count: usize,
    pub breakers: Vec<BreakerSnapshot>,
}

/// Owns every breaker in the process, keyed by dependency name.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self {
            breakers: DashMap::new(),
            default_config: CircuitBreakerConfig::default(),
        }
    }
}

impl CircuitBreakerRegistry {
    /// Create a registry whose lazily created breakers use `default_config`.
    pub fn new(default_config: CircuitBreakerConfig) -> Result<Self, ConfigurationError> {
        default_config.validate("<default>")?;
        Ok(Self {
            breakers: DashMap::new(),
            default_config,
        })
    }

    pub fn default_config(&self) -> CircuitBreakerConfig {
        self.default_config
    }

    /// Look up `name`, creating it if needed.
    ///
    /// Passing `Some(config)` for an existing breaker whose settings differ
    /// is a configuration error. `None` accepts whatever is registered, or the
    /// registry default for a new breaker.
    pub fn get_or_create(
        &self,
        name: &str,
        config: Option<CircuitBreakerConfig>,
    ) -> Result<Arc<CircuitBreaker>, ConfigurationError> {
        if let Some(existing) = self.breakers.get(name) {
            return Self::check_existing(existing.value(), config);
        }

        match self.breakers.entry(name.to_string()) {
            // Lost a creation race; apply the same conflict rule.
            Entry::Occupied(entry) => Self::check_existing(entry.get(), config),
            Entry::Vacant(entry) => {
                let breaker = Arc::new(CircuitBreaker::new(name, config.unwrap_or(self.default_config))?);
                tracing::debug!(
                    breaker = %name,
                    fail_max = breaker.config().fail_max,
                    reset_timeout_ms = breaker.config().reset_timeout.as_millis() as u64,
                    "Circuit breaker registered"
                );
                entry.insert(breaker.clone());
                Ok(breaker)
            }
        }
    }

    fn check_existing(
        existing: &Arc<CircuitBreaker>,
        config: Option<CircuitBreakerConfig>,
    ) -> Result<Arc<CircuitBreaker>, ConfigurationError> {
        match config {
            Some(requested) if requested != *existing.config() => {
                Err(ConfigurationError::ConflictingBreakerConfig {
                    name: existing.name().to_string(),
                })
            }
            _ => Ok(existing.clone()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|r| r.value().clone())
    }

    /// Force one breaker Closed. Returns false for an unknown name.
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Force every breaker Closed.
    pub fn reset_all(&self) {
        for breaker in self.breakers() {
            breaker.reset();
        }
        tracing::info!(count = self.len(), "All circuit breakers reset");
    }

    /// Current state of every breaker, ordered by name.
    pub fn get_all_states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers()
            .into_iter()
            .map(|b| (b.name().to_string(), b.current_state()))
            .collect()
    }

    /// Shared handles to every breaker. The map is not locked while callers
    /// use the returned handles.
    pub fn breakers(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.iter().map(|r| r.value().clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn get_metrics(&self) -> RegistryMetrics {
        let mut breakers: Vec<BreakerSnapshot> = self.breakers().iter().map(|b| b.snapshot()).collect();
        breakers.sort_by(|a, b| a.name.cmp(&b.name));
        RegistryMetrics {
            breaker_count: breakers.len(),
            breakers,
        }
    }
}
