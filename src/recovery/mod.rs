//! Automated recovery of failing dependencies.
//!
//! # Data Flow
//! ```text
//! schedule_recovery(service, strategy, priority, policy?)
//!     → merge into pending task or create one
//!     → push (priority, seq) onto the heap, wake the loop
//!
//! Recovery loop (orchestrator.rs):
//!     Wake on tick, on new work, or at the nearest due time
//!     → Pop due tasks in priority order
//!     → Reset breaker → run health check
//!     → SUCCEEDED | retry with backoff | FAILED | AWAITING_MANUAL
//! ```
//!
//! # Design Decisions
//! - One pending task per service; re-scheduling merges
//! - Every strategy except MANUAL terminates after `max_retry_attempts`
//! - MANUAL tasks park until an operator approves or rejects them

pub mod orchestrator;
pub mod policy;
pub mod task;

pub use orchestrator::{
    OrchestratorMetrics, OrchestratorSettings, RecoveryError, RecoveryOrchestrator, DEFAULT_PRIORITY,
};
pub use policy::{compute_delay, HealthCheck, RecoveryPolicy, RecoveryStrategy, MANUAL_PARK_DELAY};
pub use task::{RecoveryResult, RecoveryState, RecoveryTask, RecoveryTaskStatus};
