//! System-wide health aggregation.
//!
//! # Responsibilities
//! - Periodically read every breaker's state (registry + ad-hoc)
//! - Compute score/status and append a snapshot to bounded history
//! - Notify subscribers of status changes without waiting on them

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time;

use crate::config::schema::HealthConfig;
use crate::error::{BoxError, ConfigurationError};
use crate::health::report::{HealthChange, HealthSnapshot, HealthStatus, HealthThresholds, SystemHealthReport};
use crate::lifecycle::BackgroundTask;
use crate::observability::metrics;
use crate::resilience::{BreakerHandle, CircuitBreakerRegistry, CircuitState};

/// Subscriber invoked on every status change.
pub type HealthCallback = Arc<dyn Fn(HealthChange) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Live aggregator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorSettings {
    pub check_interval: Duration,
    pub thresholds: HealthThresholds,
    pub history_max_size: usize,
    pub history_max_age: Duration,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            thresholds: HealthThresholds::default(),
            history_max_size: 1000,
            history_max_age: Duration::from_secs(3600),
        }
    }
}

impl AggregatorSettings {
    pub fn from_config(config: &HealthConfig) -> Result<Self, ConfigurationError> {
        let settings = Self {
            check_interval: config.check_interval(),
            thresholds: HealthThresholds::new(config.degraded_threshold, config.critical_threshold)?,
            history_max_size: config.history_max_size,
            history_max_age: config.history_max_age(),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        HealthThresholds::new(self.thresholds.degraded, self.thresholds.critical)?;
        if self.check_interval.is_zero() {
            return Err(ConfigurationError::InvalidSetting {
                field: "check_interval",
                reason: "must be greater than zero".into(),
            });
        }
        if self.history_max_size == 0 {
            return Err(ConfigurationError::InvalidSetting {
                field: "history_max_size",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Aggregator counters for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorMetrics {
    pub running: bool,
    pub polls_total: u64,
    pub status_changes_total: u64,
    pub callbacks_registered: usize,
    pub callbacks_dispatched_total: u64,
    pub callbacks_succeeded_total: u64,
    pub callbacks_failed_total: u64,
    pub history_len: usize,
    pub adhoc_breakers: usize,
    pub last_status: HealthStatus,
    pub last_poll_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct CallbackCounters {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug)]
struct LastStatus {
    status: HealthStatus,
    changed_at: Option<DateTime<Utc>>,
    polled_at: Option<DateTime<Utc>>,
}

struct AggregatorInner {
    registry: Arc<CircuitBreakerRegistry>,
    adhoc: DashMap<String, Arc<dyn BreakerHandle>>,
    settings: ArcSwap<AggregatorSettings>,
    history: Mutex<VecDeque<HealthSnapshot>>,
    callbacks: RwLock<Vec<HealthCallback>>,
    last: Mutex<LastStatus>,
    polls_total: AtomicU64,
    status_changes_total: AtomicU64,
    callback_counters: Arc<CallbackCounters>,
    task: Mutex<Option<BackgroundTask>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Polls breakers and maintains the system health view.
#[derive(Clone)]
pub struct HealthAggregator {
    inner: Arc<AggregatorInner>,
}

impl HealthAggregator {
    pub fn new(registry: Arc<CircuitBreakerRegistry>, settings: AggregatorSettings) -> Result<Self, ConfigurationError> {
        settings.validate()?;
        Ok(Self {
            inner: Arc::new(AggregatorInner {
                registry,
                adhoc: DashMap::new(),
                settings: ArcSwap::from_pointee(settings),
                history: Mutex::new(VecDeque::new()),
                callbacks: RwLock::new(Vec::new()),
                last: Mutex::new(LastStatus {
                    status: HealthStatus::Unknown,
                    changed_at: None,
                    polled_at: None,
                }),
                polls_total: AtomicU64::new(0),
                status_changes_total: AtomicU64::new(0),
                callback_counters: Arc::new(CallbackCounters::default()),
                task: Mutex::new(None),
            }),
        })
    }

    /// Start the polling loop. Returns false if it is already running.
    pub fn start(&self) -> bool {
        let mut slot = lock(&self.inner.task);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }
        let inner = self.inner.clone();
        *slot = Some(BackgroundTask::spawn("health-aggregator", move |shutdown| {
            run(inner, shutdown)
        }));
        tracing::info!(
            interval_ms = self.inner.settings.load().check_interval.as_millis() as u64,
            "Health aggregator started"
        );
        true
    }

    /// Stop the polling loop and wait for it to exit.
    pub async fn stop(&self) {
        let task = lock(&self.inner.task).take();
        if let Some(task) = task {
            task.stop().await;
            tracing::info!("Health aggregator stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.task).as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Track a breaker that does not live in the central registry.
    pub fn register_circuit_breaker(&self, name: impl Into<String>, breaker: Arc<dyn BreakerHandle>) {
        let name = name.into();
        tracing::debug!(breaker = %name, "Ad-hoc breaker registered for health polling");
        self.inner.adhoc.insert(name, breaker);
    }

    pub fn unregister_circuit_breaker(&self, name: &str) -> bool {
        self.inner.adhoc.remove(name).is_some()
    }

    /// Register a raw callback.
    pub fn on_health_change_boxed(&self, callback: HealthCallback) {
        self.inner
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Register an async callback for status changes.
    ///
    /// Callbacks run on their own task; an `Err` or a panic is logged and
    /// counted but never reaches the polling loop.
    pub fn on_health_change<F, Fut>(&self, callback: F)
    where
        F: Fn(HealthChange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_health_change_boxed(Arc::new(move |change| callback(change).boxed()));
    }

    /// Recompute the aggregate view from current breaker states.
    pub fn get_system_health(&self) -> SystemHealthReport {
        let thresholds = self.inner.settings.load().thresholds;
        let changed_at = lock(&self.inner.last).changed_at;
        SystemHealthReport::from_states(self.inner.collect_states(), thresholds, changed_at)
    }

    /// Snapshots newer than `window` (all retained snapshots if `None`), oldest first.
    pub fn get_health_history(&self, window: Option<Duration>) -> Vec<HealthSnapshot> {
        let max_age = self.inner.settings.load().history_max_age;
        let window = window.map_or(max_age, |w| w.min(max_age));
        let cutoff = cutoff_for(window);

        lock(&self.inner.history)
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Poll immediately, outside the regular schedule.
    pub fn poll_now(&self) -> HealthSnapshot {
        self.inner.poll()
    }

    pub fn settings(&self) -> AggregatorSettings {
        self.inner.settings.load().as_ref().clone()
    }

    /// Swap in new settings; takes effect on the next poll.
    pub fn apply_settings(&self, settings: AggregatorSettings) -> Result<(), ConfigurationError> {
        settings.validate()?;
        self.inner.settings.store(Arc::new(settings));
        let settings = self.inner.settings.load();
        prune(&mut lock(&self.inner.history), &settings);
        tracing::info!(
            degraded = settings.thresholds.degraded,
            critical = settings.thresholds.critical,
            interval_ms = settings.check_interval.as_millis() as u64,
            "Health aggregator settings updated"
        );
        Ok(())
    }

    pub fn get_metrics(&self) -> AggregatorMetrics {
        let inner = &self.inner;
        let (last_status, last_poll_at) = {
            let last = lock(&inner.last);
            (last.status, last.polled_at)
        };
        AggregatorMetrics {
            running: self.is_running(),
            polls_total: inner.polls_total.load(Ordering::Relaxed),
            status_changes_total: inner.status_changes_total.load(Ordering::Relaxed),
            callbacks_registered: inner.callbacks.read().unwrap_or_else(PoisonError::into_inner).len(),
            callbacks_dispatched_total: inner.callback_counters.dispatched.load(Ordering::Relaxed),
            callbacks_succeeded_total: inner.callback_counters.succeeded.load(Ordering::Relaxed),
            callbacks_failed_total: inner.callback_counters.failed.load(Ordering::Relaxed),
            history_len: lock(&inner.history).len(),
            adhoc_breakers: inner.adhoc.len(),
            last_status,
            last_poll_at,
        }
    }
}

async fn run(inner: Arc<AggregatorInner>, mut shutdown: broadcast::Receiver<()>) {
    inner.poll();
    loop {
        let interval = inner.settings.load().check_interval;
        tokio::select! {
            _ = time::sleep(interval) => {
                inner.poll();
            }
            _ = shutdown.recv() => {
                tracing::debug!("Health aggregator received shutdown signal, exiting loop");
                break;
            }
        }
    }
}

impl AggregatorInner {
    fn collect_states(&self) -> BTreeMap<String, CircuitState> {
        let mut states = self.registry.get_all_states();
        let adhoc: Vec<Arc<dyn BreakerHandle>> = self.adhoc.iter().map(|r| r.value().clone()).collect();
        for breaker in adhoc {
            states.insert(breaker.name().to_string(), breaker.current_state());
        }
        states
    }

    fn poll(&self) -> HealthSnapshot {
        let settings = self.settings.load();
        let snapshot = HealthSnapshot::from_states(self.collect_states(), &settings.thresholds);

        self.polls_total.fetch_add(1, Ordering::Relaxed);
        metrics::record_health_poll(snapshot.score, snapshot.status);

        {
            let mut history = lock(&self.history);
            history.push_back(snapshot.clone());
            prune(&mut history, &settings);
        }

        let previous = {
            let mut last = lock(&self.last);
            let previous = last.status;
            last.polled_at = Some(snapshot.timestamp);
            if previous != snapshot.status {
                last.status = snapshot.status;
                last.changed_at = Some(snapshot.timestamp);
            }
            previous
        };

        if previous != snapshot.status {
            self.status_changes_total.fetch_add(1, Ordering::Relaxed);
            match snapshot.status {
                HealthStatus::Healthy | HealthStatus::Unknown => tracing::info!(
                    from = %previous, to = %snapshot.status, score = snapshot.score, "System health changed"
                ),
                HealthStatus::Degraded | HealthStatus::Critical => tracing::warn!(
                    from = %previous,
                    to = %snapshot.status,
                    score = snapshot.score,
                    open = snapshot.counts.open,
                    half_open = snapshot.counts.half_open,
                    "System health changed"
                ),
            }
            self.dispatch(HealthChange {
                previous,
                current: snapshot.status,
                snapshot: snapshot.clone(),
            });
        }

        snapshot
    }

    fn dispatch(&self, change: HealthChange) {
        let callbacks: Vec<HealthCallback> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if callbacks.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime available, health change callbacks skipped");
            return;
        };

        for callback in callbacks {
            let change = change.clone();
            let counters = self.callback_counters.clone();
            counters.dispatched.fetch_add(1, Ordering::Relaxed);
            runtime.spawn(async move {
                let outcome = AssertUnwindSafe(async move { callback(change).await })
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {
                        counters.succeeded.fetch_add(1, Ordering::Relaxed);
                        metrics::record_health_callback("ok");
                    }
                    Ok(Err(e)) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        metrics::record_health_callback("error");
                        tracing::warn!(error = %e, "Health change callback failed");
                    }
                    Err(_) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        metrics::record_health_callback("panic");
                        tracing::error!("Health change callback panicked");
                    }
                }
            });
        }
    }
}

fn cutoff_for(age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn prune(history: &mut VecDeque<HealthSnapshot>, settings: &AggregatorSettings) {
    while history.len() > settings.history_max_size {
        history.pop_front();
    }
    let cutoff = cutoff_for(settings.history_max_age);
    while history.front().is_some_and(|s| s.timestamp < cutoff) {
        history.pop_front();
    }
}
