//! Chaos engine: scenario lifecycle and the injection hot path.
//!
//! # Responsibilities
//! - Validate and activate scenarios, clamping their lifetime
//! - Deactivate each scenario after its lifetime via a cleanup task
//! - Answer `should_inject_*` for the protected call path
//! - Provide the emergency stop latch

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::chaos::scenario::{ChaosScenario, InjectedFault, ScenarioKind, ScenarioParams, WILDCARD_TARGET};
use crate::config::schema::ChaosConfig;
use crate::error::ValidationError;
use crate::observability::metrics;
use crate::resilience::CircuitBreakerRegistry;

/// Errors returned by scenario injection.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChaosError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("chaos engine is disabled")]
    Disabled,

    #[error("chaos engine is emergency-stopped; call reset() to re-arm")]
    EmergencyStopped,

    #[error("no circuit breaker named '{0}'")]
    UnknownTarget(String),

    #[error("chaos scenarios require a running Tokio runtime")]
    NoRuntime,
}

/// Live chaos engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ChaosSettings {
    pub enabled: bool,
    pub max_duration: Duration,
    pub history_size: usize,
}

impl Default for ChaosSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_duration: Duration::from_secs(300),
            history_size: 100,
        }
    }
}

impl ChaosSettings {
    pub fn from_config(config: &ChaosConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_duration: config.max_duration(),
            history_size: config.history_size,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.max_duration.is_zero() {
            return Err(ValidationError::new("max_duration", "must be greater than zero"));
        }
        if self.history_size == 0 {
            return Err(ValidationError::new("history_size", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Chaos engine counters for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosMetrics {
    pub enabled: bool,
    pub stopped: bool,
    pub active_scenarios: usize,
    pub pending_cleanups: usize,
    pub scenarios_activated_total: u64,
    pub latency_injections_total: u64,
    pub error_injections_total: u64,
    pub emergency_stops_total: u64,
    pub history_len: usize,
}

#[derive(Debug, Default)]
struct Counters {
    activated: AtomicU64,
    latency: AtomicU64,
    errors: AtomicU64,
    emergency_stops: AtomicU64,
}

struct EngineInner {
    registry: Arc<CircuitBreakerRegistry>,
    settings: ArcSwap<ChaosSettings>,
    active: DashMap<String, ChaosScenario>,
    cleanups: DashMap<String, JoinHandle<()>>,
    history: Mutex<VecDeque<ChaosScenario>>,
    stopped: AtomicBool,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Controlled fault injection against named dependencies.
#[derive(Clone)]
pub struct ChaosEngine {
    inner: Arc<EngineInner>,
}

impl ChaosEngine {
    pub fn new(registry: Arc<CircuitBreakerRegistry>, settings: ChaosSettings) -> Result<Self, ChaosError> {
        settings.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                registry,
                settings: ArcSwap::from_pointee(settings),
                active: DashMap::new(),
                cleanups: DashMap::new(),
                history: Mutex::new(VecDeque::new()),
                stopped: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        })
    }

    /// Add `delay_ms` of latency to calls into `target`.
    pub fn inject_latency(
        &self,
        target: &str,
        delay_ms: u64,
        duration: Duration,
        blast_radius: &[&str],
    ) -> Result<ChaosScenario, ChaosError> {
        self.activate(ScenarioKind::Latency, target, ScenarioParams::latency(delay_ms), duration, blast_radius)
    }

    /// Fail a fraction `error_rate` of calls into `target`.
    pub fn inject_errors(
        &self,
        target: &str,
        error_rate: f64,
        duration: Duration,
        blast_radius: &[&str],
    ) -> Result<ChaosScenario, ChaosError> {
        self.activate(ScenarioKind::Error, target, ScenarioParams::errors(error_rate), duration, blast_radius)
    }

    /// Pin `target`'s breaker Open for the scenario's lifetime.
    pub fn force_circuit_open(
        &self,
        target: &str,
        duration: Duration,
        blast_radius: &[&str],
    ) -> Result<ChaosScenario, ChaosError> {
        self.activate(ScenarioKind::CircuitOpen, target, ScenarioParams::default(), duration, blast_radius)
    }

    /// Reject calls into `target` with probability `resource_level`.
    pub fn simulate_resource_exhaustion(
        &self,
        target: &str,
        resource_level: f64,
        duration: Duration,
        blast_radius: &[&str],
    ) -> Result<ChaosScenario, ChaosError> {
        self.activate(
            ScenarioKind::ResourceExhaustion,
            target,
            ScenarioParams::resource_exhaustion(resource_level),
            duration,
            blast_radius,
        )
    }

    fn activate(
        &self,
        kind: ScenarioKind,
        target: &str,
        params: ScenarioParams,
        duration: Duration,
        blast_radius: &[&str],
    ) -> Result<ChaosScenario, ChaosError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(ChaosError::EmergencyStopped);
        }
        let settings = self.inner.settings.load();
        if !settings.enabled {
            return Err(ChaosError::Disabled);
        }

        let target = target.trim();
        if target.is_empty() {
            return Err(ValidationError::new("target", "must not be empty").into());
        }
        if duration.is_zero() {
            return Err(ValidationError::new("duration", "must be greater than zero").into());
        }
        params.validate()?;

        let blast_radius: BTreeSet<String> = blast_radius.iter().map(|s| s.to_string()).collect();
        if target != WILDCARD_TARGET && !blast_radius.is_empty() && !blast_radius.contains(target) {
            return Err(ValidationError::new(
                "blast_radius",
                format!("target '{target}' is outside the blast radius"),
            )
            .into());
        }

        let breaker = match kind {
            ScenarioKind::CircuitOpen => {
                if target == WILDCARD_TARGET {
                    return Err(ValidationError::new("target", "forcing circuits open needs a concrete target").into());
                }
                let breaker = self
                    .inner
                    .registry
                    .get(target)
                    .ok_or_else(|| ChaosError::UnknownTarget(target.to_string()))?;
                Some(breaker)
            }
            _ => None,
        };

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ChaosError::NoRuntime)?;

        let effective = duration.min(settings.max_duration);
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(effective)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        let id = Uuid::new_v4().simple().to_string();
        let label = if target == WILDCARD_TARGET { "all" } else { target };
        let scenario = ChaosScenario {
            name: format!("{}_{}_{}", kind.as_str(), label, &id[..8]),
            kind,
            target: target.to_string(),
            params,
            blast_radius,
            duration_ms: millis(effective),
            requested_duration_ms: millis(duration),
            max_duration_ms: millis(settings.max_duration),
            active: true,
            activated_at: now,
            expires_at,
            deactivated_at: None,
        };

        self.inner.active.insert(scenario.name.clone(), scenario.clone());
        if let Some(breaker) = breaker {
            // Overlapping scenarios keep the breaker pinned for the longest window.
            breaker.force_open(self.inner.forced_window(&scenario.target).unwrap_or(effective));
        }

        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let name = scenario.name.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(effective).await;
            if let Some(inner) = weak.upgrade() {
                inner.deactivate(&name, "expired", false);
            }
        });
        self.inner.cleanups.insert(scenario.name.clone(), handle);
        // The cleanup may already have run for very short lifetimes.
        if !self.inner.active.contains_key(&scenario.name) {
            self.inner.cleanups.remove(&scenario.name);
        }
        // An emergency stop may have swept the map before this insert landed.
        if self.inner.stopped.load(Ordering::SeqCst) {
            self.inner.deactivate(&scenario.name, "emergency_stop", true);
            return Err(ChaosError::EmergencyStopped);
        }

        self.inner.counters.activated.fetch_add(1, Ordering::Relaxed);
        metrics::record_chaos_active(self.inner.active.len());
        tracing::warn!(
            scenario = %scenario.name,
            kind = %kind,
            target = %scenario.target,
            duration_ms = scenario.duration_ms,
            requested_ms = scenario.requested_duration_ms,
            "Chaos scenario activated"
        );
        Ok(scenario)
    }

    /// Deactivate one scenario ahead of its expiry.
    pub fn deactivate_scenario(&self, name: &str) -> bool {
        self.inner.deactivate(name, "manual", true)
    }

    /// Injected delay for a call into `target`; zero when nothing applies.
    pub fn should_inject_latency(&self, target: &str) -> Duration {
        if !self.inner.armed() {
            return Duration::ZERO;
        }
        let now = Utc::now();
        let delay_ms = self
            .inner
            .active
            .iter()
            .filter(|s| s.kind == ScenarioKind::Latency && s.applies_to(target, now))
            .map(|s| s.params.delay_ms)
            .max()
            .unwrap_or(0);

        if delay_ms > 0 {
            self.inner.counters.latency.fetch_add(1, Ordering::Relaxed);
            metrics::record_chaos_injection(ScenarioKind::Latency.as_str());
        }
        Duration::from_millis(delay_ms)
    }

    /// A fault to raise instead of calling `target`, if any scenario fires.
    pub fn should_inject_error(&self, target: &str) -> Option<InjectedFault> {
        if !self.inner.armed() {
            return None;
        }
        let now = Utc::now();
        let candidates: Vec<(String, ScenarioKind, f64)> = self
            .inner
            .active
            .iter()
            .filter(|s| s.applies_to(target, now))
            .filter_map(|s| match s.kind {
                ScenarioKind::Error => Some((s.name.clone(), s.kind, s.params.error_rate)),
                ScenarioKind::ResourceExhaustion => Some((s.name.clone(), s.kind, s.params.resource_level)),
                ScenarioKind::Latency | ScenarioKind::CircuitOpen => None,
            })
            .collect();

        let mut rng = rand::thread_rng();
        let (scenario, kind, level) = candidates
            .into_iter()
            .find(|(_, _, probability)| rng.gen::<f64>() < *probability)?;

        self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
        metrics::record_chaos_injection(kind.as_str());
        let target = target.to_string();
        Some(match kind {
            ScenarioKind::ResourceExhaustion => InjectedFault::ResourceExhausted { scenario, target, level },
            _ => InjectedFault::Error { scenario, target },
        })
    }

    /// Active scenarios, oldest first.
    pub fn get_active_scenarios(&self) -> Vec<ChaosScenario> {
        let mut scenarios: Vec<ChaosScenario> = self.inner.active.iter().map(|s| s.value().clone()).collect();
        scenarios.sort_by(|a, b| a.activated_at.cmp(&b.activated_at).then_with(|| a.name.cmp(&b.name)));
        scenarios
    }

    /// Look up a scenario whether active or already deactivated.
    pub fn get_scenario(&self, name: &str) -> Option<ChaosScenario> {
        if let Some(scenario) = self.inner.active.get(name) {
            return Some(scenario.value().clone());
        }
        lock(&self.inner.history).iter().rev().find(|s| s.name == name).cloned()
    }

    /// Deactivated scenarios, oldest first.
    pub fn get_scenario_history(&self) -> Vec<ChaosScenario> {
        lock(&self.inner.history).iter().cloned().collect()
    }

    /// Deactivate everything and refuse further injection until [`ChaosEngine::reset`].
    pub fn emergency_stop(&self) -> usize {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let stopped = self.inner.deactivate_all("emergency_stop");
        self.inner.counters.emergency_stops.fetch_add(1, Ordering::Relaxed);
        metrics::record_emergency_stop();
        tracing::error!(scenarios = stopped, "Chaos emergency stop engaged");
        stopped
    }

    /// Deactivate every scenario without latching the stop flag.
    pub fn deactivate_all(&self) -> usize {
        self.inner.deactivate_all("shutdown")
    }

    /// Clear all scenarios and history, and release the emergency stop.
    pub fn reset(&self) {
        let cleared = self.inner.deactivate_all("reset");
        lock(&self.inner.history).clear();
        self.inner.stopped.store(false, Ordering::SeqCst);
        tracing::info!(scenarios = cleared, "Chaos engine reset");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.settings.load().enabled
    }

    pub fn settings(&self) -> ChaosSettings {
        self.inner.settings.load().as_ref().clone()
    }

    /// Swap in new settings. Disabling does not deactivate running scenarios,
    /// but makes every `should_inject_*` neutral.
    pub fn apply_settings(&self, settings: ChaosSettings) -> Result<(), ChaosError> {
        settings.validate()?;
        let history_size = settings.history_size;
        self.inner.settings.store(Arc::new(settings));
        let mut history = lock(&self.inner.history);
        while history.len() > history_size {
            history.pop_front();
        }
        Ok(())
    }

    pub fn get_metrics(&self) -> ChaosMetrics {
        let counters = &self.inner.counters;
        ChaosMetrics {
            enabled: self.is_enabled(),
            stopped: self.is_stopped(),
            active_scenarios: self.inner.active.len(),
            pending_cleanups: self.inner.cleanups.len(),
            scenarios_activated_total: counters.activated.load(Ordering::Relaxed),
            latency_injections_total: counters.latency.load(Ordering::Relaxed),
            error_injections_total: counters.errors.load(Ordering::Relaxed),
            emergency_stops_total: counters.emergency_stops.load(Ordering::Relaxed),
            history_len: lock(&self.inner.history).len(),
        }
    }
}

impl EngineInner {
    fn armed(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && self.settings.load().enabled
    }

    /// Longest remaining lifetime among active CircuitOpen scenarios on `target`.
    fn forced_window(&self, target: &str) -> Option<Duration> {
        let now = Utc::now();
        self.active
            .iter()
            .filter(|s| s.kind == ScenarioKind::CircuitOpen && s.active && s.target == target)
            .filter_map(|s| (s.expires_at - now).to_std().ok())
            .filter(|remaining| !remaining.is_zero())
            .max()
    }

    fn deactivate(&self, name: &str, reason: &str, abort_cleanup: bool) -> bool {
        let cleanup = self.cleanups.remove(name).map(|(_, handle)| handle);
        if abort_cleanup {
            if let Some(handle) = cleanup {
                handle.abort();
            }
        }

        let Some((_, mut scenario)) = self.active.remove(name) else {
            return false;
        };
        if scenario.kind == ScenarioKind::CircuitOpen {
            if let Some(breaker) = self.registry.get(&scenario.target) {
                match self.forced_window(&scenario.target) {
                    Some(remaining) => breaker.force_open(remaining),
                    None => {
                        breaker.clear_forced_open();
                    }
                }
            }
        }
        scenario.active = false;
        scenario.deactivated_at = Some(Utc::now());

        tracing::info!(scenario = %scenario.name, kind = %scenario.kind, reason, "Chaos scenario deactivated");
        let history_size = self.settings.load().history_size;
        {
            let mut history = lock(&self.history);
            history.push_back(scenario);
            while history.len() > history_size {
                history.pop_front();
            }
        }
        metrics::record_chaos_active(self.active.len());
        true
    }

    fn deactivate_all(&self, reason: &str) -> usize {
        let names: Vec<String> = self.active.iter().map(|s| s.key().clone()).collect();
        let count = names
            .iter()
            .filter(|name| self.deactivate(name, reason, true))
            .count();
        // Drop any cleanup whose scenario was already gone.
        let stale: Vec<String> = self.cleanups.iter().map(|c| c.key().clone()).collect();
        for name in stale {
            if let Some((_, handle)) = self.cleanups.remove(&name) {
                handle.abort();
            }
        }
        count
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
