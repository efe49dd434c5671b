//! Recovery task bookkeeping.

use std::cmp::Ordering;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::recovery::policy::{RecoveryPolicy, RecoveryStrategy};

/// Lifecycle of one service's recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryState {
    Idle,
    Scheduled,
    InProgress,
    Succeeded,
    Failed,
    AwaitingManual,
    Cancelled,
}

impl RecoveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryState::Idle => "IDLE",
            RecoveryState::Scheduled => "SCHEDULED",
            RecoveryState::InProgress => "IN_PROGRESS",
            RecoveryState::Succeeded => "SUCCEEDED",
            RecoveryState::Failed => "FAILED",
            RecoveryState::AwaitingManual => "AWAITING_MANUAL",
            RecoveryState::Cancelled => "CANCELLED",
        }
    }

    /// Terminal states end a task and are recorded in history.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecoveryState::Succeeded | RecoveryState::Failed | RecoveryState::Cancelled
        )
    }

    /// States in which a task still occupies its service slot.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            RecoveryState::Scheduled | RecoveryState::InProgress | RecoveryState::AwaitingManual
        )
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending recovery for one service.
#[derive(Debug, Clone)]
pub struct RecoveryTask {
    pub id: Uuid,
    pub service_name: String,
    pub strategy: RecoveryStrategy,
    /// Lower is more urgent.
    pub priority: u32,
    pub policy: RecoveryPolicy,
    pub attempt_count: u32,
    pub scheduled_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub state: RecoveryState,
    pub last_error: Option<String>,
    /// Sequence number of this task's live heap entry.
    pub(crate) seq: u64,
    pub(crate) due: Instant,
}

impl RecoveryTask {
    pub(crate) fn new(service_name: String, strategy: RecoveryStrategy, priority: u32, policy: RecoveryPolicy) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            service_name,
            strategy,
            priority,
            policy,
            attempt_count: 0,
            scheduled_at: now,
            next_attempt_at: now,
            state: RecoveryState::Scheduled,
            last_error: None,
            seq: 0,
            due: Instant::now(),
        }
    }

    pub fn status(&self) -> RecoveryTaskStatus {
        RecoveryTaskStatus {
            task_id: self.id,
            service_name: self.service_name.clone(),
            state: self.state,
            strategy: self.strategy,
            priority: self.priority,
            attempt_count: self.attempt_count,
            max_retry_attempts: self.policy.max_retry_attempts,
            scheduled_at: self.scheduled_at,
            next_attempt_at: self.next_attempt_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Serializable view of a pending task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryTaskStatus {
    pub task_id: Uuid,
    pub service_name: String,
    pub state: RecoveryState,
    pub strategy: RecoveryStrategy,
    pub priority: u32,
    pub attempt_count: u32,
    pub max_retry_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Outcome of one recovery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub task_id: Uuid,
    pub service_name: String,
    pub success: bool,
    pub attempt_number: u32,
    pub elapsed_ms: u64,
    pub state: RecoveryState,
    pub strategy: RecoveryStrategy,
    pub error_message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Heap key ordered by `(priority, seq)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeapEntry {
    pub priority: u32,
    pub seq: u64,
    pub service_name: String,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    fn entry(priority: u32, seq: u64, name: &str) -> Reverse<HeapEntry> {
        Reverse(HeapEntry {
            priority,
            seq,
            service_name: name.to_string(),
        })
    }

    #[test]
    fn test_heap_orders_by_priority_then_sequence() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(1, 1, "b"));
        heap.push(entry(0, 3, "c"));
        heap.push(entry(1, 0, "a"));
        heap.push(entry(0, 2, "d"));

        let order: Vec<_> = std::iter::from_fn(|| heap.pop().map(|Reverse(e)| e.service_name)).collect();
        assert_eq!(order, vec!["d", "c", "a", "b"]);
    }

    #[test]
    fn test_terminal_states() {
        assert!(RecoveryState::Succeeded.is_terminal());
        assert!(RecoveryState::Cancelled.is_terminal());
        assert!(!RecoveryState::AwaitingManual.is_terminal());
        assert!(RecoveryState::AwaitingManual.is_pending());
        assert!(!RecoveryState::Idle.is_pending());
    }

    #[test]
    fn test_result_serialization_round_trip() {
        let result = RecoveryResult {
            task_id: Uuid::new_v4(),
            service_name: "policy_registry".into(),
            success: false,
            attempt_number: 3,
            elapsed_ms: 12,
            state: RecoveryState::Failed,
            strategy: RecoveryStrategy::ExponentialBackoff,
            error_message: Some("health check reported 'policy_registry' unhealthy".into()),
            completed_at: Utc::now(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["state"], "FAILED");
        let parsed: RecoveryResult = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, result);
    }
}
