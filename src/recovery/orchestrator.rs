//! Recovery orchestration loop.
//!
//! # Responsibilities
//! - Keep at most one pending task per service in a priority heap
//! - Run due attempts: reset the breaker, probe health, classify
//! - Reschedule with backoff, park MANUAL tasks, record terminal results

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::time;
use uuid::Uuid;

use crate::config::schema::RecoveryConfig;
use crate::error::{AttemptError, ValidationError};
use crate::lifecycle::BackgroundTask;
use crate::observability::metrics;
use crate::recovery::policy::{compute_delay, RecoveryPolicy, RecoveryStrategy, MANUAL_PARK_DELAY};
use crate::recovery::task::{HeapEntry, RecoveryResult, RecoveryState, RecoveryTask, RecoveryTaskStatus};
use crate::resilience::{CircuitBreakerRegistry, CircuitState};

/// Priority used when callers have no preference.
pub const DEFAULT_PRIORITY: u32 = 5;

/// Errors returned to callers of the orchestrator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no recovery task for service '{0}'")]
    NotFound(String),

    #[error("recovery for '{service}' is {state}")]
    InvalidState { service: String, state: RecoveryState },
}

/// Live orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Longest idle sleep between heap checks.
    pub tick: Duration,
    /// Terminal results kept in history.
    pub history_size: usize,
    /// Policy for services without an override.
    pub default_policy: RecoveryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            history_size: 100,
            default_policy: RecoveryPolicy::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            tick: config.tick(),
            history_size: config.history_size,
            default_policy: config.default_policy(),
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.tick.is_zero() {
            return Err(ValidationError::new("tick", "must be greater than zero"));
        }
        if self.history_size == 0 {
            return Err(ValidationError::new("history_size", "must be greater than zero"));
        }
        self.default_policy.validate()
    }
}

/// Orchestrator counters for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorMetrics {
    pub running: bool,
    pub queue_depth: usize,
    pub pending_tasks: usize,
    pub awaiting_manual: usize,
    pub attempts_total: u64,
    pub attempt_errors_total: u64,
    pub succeeded_total: u64,
    pub failed_total: u64,
    pub cancelled_total: u64,
    pub history_len: usize,
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    tasks: HashMap<String, RecoveryTask>,
    next_seq: u64,
}

impl Queue {
    /// Replace the service's heap entry with a fresh one.
    fn enqueue(&mut self, service: &str) {
        self.dequeue(service);
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(task) = self.tasks.get_mut(service) {
            task.seq = seq;
            self.heap.push(Reverse(HeapEntry {
                priority: task.priority,
                seq,
                service_name: service.to_string(),
            }));
        }
    }

    fn dequeue(&mut self, service: &str) {
        self.heap.retain(|Reverse(entry)| entry.service_name != service);
    }

    /// Pop every due entry in priority order; not-yet-due entries go back.
    fn take_due(&mut self, now: Instant) -> Vec<(String, Uuid)> {
        let mut due = Vec::new();
        let mut later = Vec::new();
        while let Some(Reverse(entry)) = self.heap.pop() {
            let Some(task) = self.tasks.get(&entry.service_name) else {
                continue;
            };
            if task.seq != entry.seq || task.state != RecoveryState::Scheduled {
                continue;
            }
            if task.due <= now {
                due.push((entry.service_name, task.id));
            } else {
                later.push(Reverse(entry));
            }
        }
        self.heap.extend(later);
        due
    }

    fn next_due(&self) -> Option<Instant> {
        self.tasks
            .values()
            .filter(|t| t.state == RecoveryState::Scheduled)
            .map(|t| t.due)
            .min()
    }
}

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    attempt_errors: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

struct OrchestratorInner {
    registry: Arc<CircuitBreakerRegistry>,
    settings: ArcSwap<OrchestratorSettings>,
    policies: DashMap<String, RecoveryPolicy>,
    queue: Mutex<Queue>,
    history: Mutex<VecDeque<RecoveryResult>>,
    wake: Notify,
    counters: Counters,
    task: Mutex<Option<BackgroundTask>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which state an attempt may start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Scheduled,
    Approval,
}

/// Drives breaker-reset-and-verify attempts for failing services.
#[derive(Clone)]
pub struct RecoveryOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl RecoveryOrchestrator {
    pub fn new(registry: Arc<CircuitBreakerRegistry>, settings: OrchestratorSettings) -> Result<Self, RecoveryError> {
        settings.validate()?;
        Ok(Self {
            inner: Arc::new(OrchestratorInner {
                registry,
                settings: ArcSwap::from_pointee(settings),
                policies: DashMap::new(),
                queue: Mutex::new(Queue::default()),
                history: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                counters: Counters::default(),
                task: Mutex::new(None),
            }),
        })
    }

    /// Start the recovery loop. Returns false if it is already running.
    pub fn start(&self) -> bool {
        let mut slot = lock(&self.inner.task);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }
        let inner = self.inner.clone();
        *slot = Some(BackgroundTask::spawn("recovery-orchestrator", move |shutdown| {
            run(inner, shutdown)
        }));
        tracing::info!("Recovery orchestrator started");
        true
    }

    /// Stop the loop and wait for it to exit. Pending tasks are kept.
    pub async fn stop(&self) {
        let task = lock(&self.inner.task).take();
        if let Some(task) = task {
            task.stop().await;
            tracing::info!("Recovery orchestrator stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.task).as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Schedule recovery for `service`, merging into any pending task.
    ///
    /// A merge takes the new strategy and priority and replaces the policy
    /// only when one is supplied. The attempt count is kept but never left
    /// above the merged policy's limit. A task parked in AWAITING_MANUAL
    /// stays parked; only its priority and policy change.
    pub fn schedule_recovery(
        &self,
        service: &str,
        strategy: RecoveryStrategy,
        priority: u32,
        policy: Option<RecoveryPolicy>,
    ) -> Result<RecoveryTaskStatus, RecoveryError> {
        if service.trim().is_empty() {
            return Err(ValidationError::new("service", "must not be empty").into());
        }
        if let Some(policy) = &policy {
            policy.validate()?;
        }

        let status = {
            let mut queue = lock(&self.inner.queue);
            let existing = queue.tasks.get(service).map(|t| t.state);
            match existing {
                Some(RecoveryState::AwaitingManual) => {
                    // Parked tasks resume only through approve or reject.
                    if let Some(task) = queue.tasks.get_mut(service) {
                        task.priority = priority;
                        if let Some(policy) = policy {
                            task.policy = policy;
                        }
                    }
                    tracing::debug!(service, priority, "Recovery awaiting manual approval, kept parked");
                }
                Some(state) if state.is_pending() => {
                    let mut requeue = false;
                    if let Some(task) = queue.tasks.get_mut(service) {
                        requeue = state == RecoveryState::Scheduled && task.priority != priority;
                        task.strategy = strategy;
                        task.priority = priority;
                        if let Some(policy) = policy {
                            task.policy = policy;
                        }
                        clamp_attempts(task);
                    }
                    if requeue {
                        queue.enqueue(service);
                    }
                    tracing::debug!(service, strategy = %strategy, priority, "Merged recovery into pending task");
                }
                _ => {
                    let policy = policy.unwrap_or_else(|| self.get_recovery_policy(service));
                    let task = RecoveryTask::new(service.to_string(), strategy, priority, policy);
                    queue.tasks.insert(service.to_string(), task);
                    queue.enqueue(service);
                    tracing::info!(service, strategy = %strategy, priority, "Recovery scheduled");
                }
            }
            metrics::record_recovery_queue_depth(queue.heap.len());
            queue.tasks.get(service).map(RecoveryTask::status)
        };

        self.inner.wake.notify_one();
        status.ok_or_else(|| RecoveryError::NotFound(service.to_string()))
    }

    /// Run one attempt for a SCHEDULED task now, ahead of its backoff.
    pub async fn execute_recovery(&self, service: &str) -> Result<RecoveryResult, RecoveryError> {
        self.inner.attempt(service, None, Trigger::Scheduled).await
    }

    /// Remove a pending task. Returns false if nothing was pending.
    ///
    /// An attempt already running is not interrupted; its outcome is
    /// recorded as CANCELLED and it is not rescheduled.
    pub fn cancel_recovery(&self, service: &str) -> bool {
        let removed = {
            let mut queue = lock(&self.inner.queue);
            match queue.tasks.get(service).map(|t| t.state) {
                Some(state) if state.is_pending() => {
                    queue.dequeue(service);
                    metrics::record_recovery_queue_depth(queue.heap.len());
                    queue.tasks.remove(service)
                }
                _ => None,
            }
        };

        let Some(task) = removed else {
            return false;
        };
        tracing::info!(service, state = %task.state, "Recovery cancelled");
        // The running attempt records its own result when it completes.
        if task.state != RecoveryState::InProgress {
            let result = cancelled_result(&task, Duration::ZERO, "cancelled by operator");
            self.inner.record_terminal(&result);
        }
        true
    }

    /// Resume a parked MANUAL task with an immediate attempt.
    pub async fn approve_manual_recovery(&self, service: &str) -> Result<RecoveryResult, RecoveryError> {
        tracing::info!(service, "Manual recovery approved");
        self.inner.attempt(service, None, Trigger::Approval).await
    }

    /// Resolve a parked MANUAL task as CANCELLED.
    pub fn reject_manual_recovery(&self, service: &str) -> Result<RecoveryResult, RecoveryError> {
        let task = {
            let mut queue = lock(&self.inner.queue);
            match queue.tasks.get(service).map(|t| t.state) {
                None => return Err(RecoveryError::NotFound(service.to_string())),
                Some(RecoveryState::AwaitingManual) => queue.tasks.remove(service),
                Some(state) => {
                    return Err(RecoveryError::InvalidState {
                        service: service.to_string(),
                        state,
                    })
                }
            }
        };
        let task = task.ok_or_else(|| RecoveryError::NotFound(service.to_string()))?;

        tracing::info!(service, "Manual recovery rejected");
        let result = cancelled_result(&task, Duration::ZERO, "rejected by operator");
        self.inner.record_terminal(&result);
        Ok(result)
    }

    /// Override the policy used for future tasks of `service`.
    pub fn set_recovery_policy(&self, service: &str, policy: RecoveryPolicy) -> Result<(), RecoveryError> {
        policy.validate()?;
        tracing::debug!(service, ?policy, "Recovery policy set");
        self.inner.policies.insert(service.to_string(), policy);
        Ok(())
    }

    /// The override for `service`, or the default policy.
    pub fn get_recovery_policy(&self, service: &str) -> RecoveryPolicy {
        self.inner
            .policies
            .get(service)
            .map(|p| p.value().clone())
            .unwrap_or_else(|| self.inner.settings.load().default_policy.clone())
    }

    pub fn remove_recovery_policy(&self, service: &str) -> bool {
        self.inner.policies.remove(service).is_some()
    }

    /// Pending tasks by service.
    pub fn get_recovery_status(&self) -> BTreeMap<String, RecoveryTaskStatus> {
        lock(&self.inner.queue)
            .tasks
            .iter()
            .map(|(name, task)| (name.clone(), task.status()))
            .collect()
    }

    /// Most recent terminal results, oldest first.
    pub fn get_recovery_history(&self, limit: Option<usize>) -> Vec<RecoveryResult> {
        let history = lock(&self.inner.history);
        let skip = limit.map_or(0, |limit| history.len().saturating_sub(limit));
        history.iter().skip(skip).cloned().collect()
    }

    pub fn settings(&self) -> OrchestratorSettings {
        self.inner.settings.load().as_ref().clone()
    }

    /// Swap in new settings. Pending tasks keep the policy they were given.
    pub fn apply_settings(&self, settings: OrchestratorSettings) -> Result<(), RecoveryError> {
        settings.validate()?;
        let history_size = settings.history_size;
        self.inner.settings.store(Arc::new(settings));
        {
            let mut history = lock(&self.inner.history);
            while history.len() > history_size {
                history.pop_front();
            }
        }
        self.inner.wake.notify_one();
        tracing::info!(history_size, "Recovery orchestrator settings updated");
        Ok(())
    }

    pub fn get_metrics(&self) -> OrchestratorMetrics {
        let (queue_depth, pending_tasks, awaiting_manual) = {
            let queue = lock(&self.inner.queue);
            let awaiting = queue
                .tasks
                .values()
                .filter(|t| t.state == RecoveryState::AwaitingManual)
                .count();
            (queue.heap.len(), queue.tasks.len(), awaiting)
        };
        let counters = &self.inner.counters;
        OrchestratorMetrics {
            running: self.is_running(),
            queue_depth,
            pending_tasks,
            awaiting_manual,
            attempts_total: counters.attempts.load(Ordering::Relaxed),
            attempt_errors_total: counters.attempt_errors.load(Ordering::Relaxed),
            succeeded_total: counters.succeeded.load(Ordering::Relaxed),
            failed_total: counters.failed.load(Ordering::Relaxed),
            cancelled_total: counters.cancelled.load(Ordering::Relaxed),
            history_len: lock(&self.inner.history).len(),
        }
    }
}

async fn run(inner: Arc<OrchestratorInner>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        let due = lock(&inner.queue).take_due(Instant::now());
        for (service, id) in due {
            // Failures are recorded on the task; the loop always moves on.
            if let Err(e) = inner.attempt(&service, Some(id), Trigger::Scheduled).await {
                tracing::debug!(service = %service, error = %e, "Skipped stale recovery entry");
            }
        }

        let wait = {
            let tick = inner.settings.load().tick;
            let queue = lock(&inner.queue);
            metrics::record_recovery_queue_depth(queue.heap.len());
            queue
                .next_due()
                .map_or(tick, |due| due.saturating_duration_since(Instant::now()).min(tick))
        };

        tokio::select! {
            _ = time::sleep(wait) => {}
            _ = inner.wake.notified() => {}
            _ = shutdown.recv() => {
                tracing::debug!("Recovery orchestrator received shutdown signal, exiting loop");
                break;
            }
        }
    }
}

impl OrchestratorInner {
    async fn attempt(&self, service: &str, expected: Option<Uuid>, trigger: Trigger) -> Result<RecoveryResult, RecoveryError> {
        let (task_id, attempt_number, strategy, policy) = {
            let mut queue = lock(&self.queue);
            let task = queue
                .tasks
                .get_mut(service)
                .filter(|t| expected.map_or(true, |id| t.id == id))
                .ok_or_else(|| RecoveryError::NotFound(service.to_string()))?;

            let allowed = match trigger {
                Trigger::Scheduled => RecoveryState::Scheduled,
                Trigger::Approval => RecoveryState::AwaitingManual,
            };
            if task.state != allowed {
                return Err(RecoveryError::InvalidState {
                    service: service.to_string(),
                    state: task.state,
                });
            }
            task.state = RecoveryState::InProgress;
            task.attempt_count = task.attempt_count.saturating_add(1);
            let snapshot = (task.id, task.attempt_count, task.strategy, task.policy.clone());
            queue.dequeue(service);
            snapshot
        };

        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(service, attempt = attempt_number, strategy = %strategy, "Recovery attempt started");
        let started = Instant::now();
        let outcome = self.probe(service, &policy).await;
        let elapsed = started.elapsed();

        let result = {
            let mut queue = lock(&self.queue);
            let current = queue.tasks.get_mut(service).filter(|t| t.id == task_id);
            let Some(task) = current else {
                drop(queue);
                let result = RecoveryResult {
                    task_id,
                    service_name: service.to_string(),
                    success: false,
                    attempt_number,
                    elapsed_ms: millis(elapsed),
                    state: RecoveryState::Cancelled,
                    strategy,
                    error_message: Some("cancelled while attempt was in progress".to_string()),
                    completed_at: Utc::now(),
                };
                self.record_terminal(&result);
                return Ok(result);
            };

            let error_message = outcome.as_ref().err().map(ToString::to_string);
            let state = match &outcome {
                Ok(()) => RecoveryState::Succeeded,
                Err(_) if task.strategy == RecoveryStrategy::Manual => RecoveryState::AwaitingManual,
                Err(_) if task.attempt_count >= task.policy.max_retry_attempts => RecoveryState::Failed,
                Err(_) => RecoveryState::Scheduled,
            };

            task.state = state;
            task.last_error = error_message.clone();
            let result = RecoveryResult {
                task_id,
                service_name: service.to_string(),
                success: state == RecoveryState::Succeeded,
                attempt_number: task.attempt_count,
                elapsed_ms: millis(elapsed),
                state,
                strategy: task.strategy,
                error_message,
                completed_at: Utc::now(),
            };

            match state {
                RecoveryState::Scheduled => {
                    let delay = compute_delay(task.strategy, &task.policy, task.attempt_count);
                    schedule_after(task, delay);
                    queue.enqueue(service);
                    tracing::warn!(
                        service,
                        attempt = result.attempt_number,
                        retry_in_ms = millis(delay),
                        error = result.error_message.as_deref().unwrap_or_default(),
                        "Recovery attempt failed, retrying"
                    );
                }
                RecoveryState::AwaitingManual => {
                    schedule_after(task, MANUAL_PARK_DELAY);
                    tracing::warn!(service, attempt = result.attempt_number, "Recovery awaiting manual approval");
                }
                _ => {
                    queue.tasks.remove(service);
                }
            }
            metrics::record_recovery_queue_depth(queue.heap.len());
            result
        };

        match result.state {
            RecoveryState::Succeeded => {
                tracing::info!(service, attempt = result.attempt_number, elapsed_ms = result.elapsed_ms, "Recovery succeeded");
            }
            RecoveryState::Failed => {
                tracing::error!(
                    service,
                    attempts = result.attempt_number,
                    error = result.error_message.as_deref().unwrap_or_default(),
                    "Recovery failed, retries exhausted"
                );
            }
            _ => {}
        }
        metrics::record_recovery_attempt(service, outcome_label(result.state));
        if result.state.is_terminal() {
            self.record_terminal(&result);
        }
        Ok(result)
    }

    /// Reset the breaker, then verify health.
    async fn probe(&self, service: &str, policy: &RecoveryPolicy) -> Result<(), AttemptError> {
        let breaker = self.registry.get(service);
        if let Some(breaker) = &breaker {
            breaker.reset();
        }

        let outcome = match &policy.health_check {
            Some(check) => {
                let check = check.clone();
                match AssertUnwindSafe(async move { check().await }).catch_unwind().await {
                    Ok(Ok(true)) => Ok(()),
                    Ok(Ok(false)) => Err(AttemptError::Unhealthy(service.to_string())),
                    Ok(Err(e)) => Err(AttemptError::HealthCheckErrored {
                        service: service.to_string(),
                        message: e.to_string(),
                    }),
                    Err(_) => Err(AttemptError::HealthCheckPanicked(service.to_string())),
                }
            }
            None => match &breaker {
                Some(b) if b.current_state() == CircuitState::Open => Err(AttemptError::Unhealthy(service.to_string())),
                _ => Ok(()),
            },
        };

        match &outcome {
            // Hold the breaker closed once the dependency checks out.
            Ok(()) => {
                if let Some(breaker) = &breaker {
                    breaker.reset();
                }
            }
            Err(e @ (AttemptError::HealthCheckErrored { .. } | AttemptError::HealthCheckPanicked(_))) => {
                self.counters.attempt_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(service, error = %e, "Health check raised during recovery attempt");
            }
            Err(_) => {}
        }
        outcome
    }

    fn record_terminal(&self, result: &RecoveryResult) {
        match result.state {
            RecoveryState::Succeeded => self.counters.succeeded.fetch_add(1, Ordering::Relaxed),
            RecoveryState::Failed => self.counters.failed.fetch_add(1, Ordering::Relaxed),
            _ => self.counters.cancelled.fetch_add(1, Ordering::Relaxed),
        };
        let history_size = self.settings.load().history_size;
        let mut history = lock(&self.history);
        history.push_back(result.clone());
        while history.len() > history_size {
            history.pop_front();
        }
    }
}

fn schedule_after(task: &mut RecoveryTask, delay: Duration) {
    let now = Instant::now();
    task.due = now.checked_add(delay).unwrap_or(now);
    task.next_attempt_at = chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or_else(Utc::now);
}

/// Keep a non-MANUAL task within its policy's attempt limit. A SCHEDULED
/// task keeps room for its one pending attempt.
fn clamp_attempts(task: &mut RecoveryTask) {
    if task.strategy == RecoveryStrategy::Manual {
        return;
    }
    let max = task.policy.max_retry_attempts;
    let limit = match task.state {
        RecoveryState::Scheduled => max.saturating_sub(1),
        _ => max,
    };
    task.attempt_count = task.attempt_count.min(limit);
}

fn cancelled_result(task: &RecoveryTask, elapsed: Duration, reason: &str) -> RecoveryResult {
    RecoveryResult {
        task_id: task.id,
        service_name: task.service_name.clone(),
        success: false,
        attempt_number: task.attempt_count,
        elapsed_ms: millis(elapsed),
        state: RecoveryState::Cancelled,
        strategy: task.strategy,
        error_message: Some(reason.to_string()),
        completed_at: Utc::now(),
    }
}

fn outcome_label(state: RecoveryState) -> &'static str {
    match state {
        RecoveryState::Succeeded => "succeeded",
        RecoveryState::Failed => "failed",
        RecoveryState::Scheduled => "retry",
        RecoveryState::AwaitingManual => "awaiting_manual",
        _ => "cancelled",
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
