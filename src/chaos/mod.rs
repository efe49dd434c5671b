//! Controlled fault injection.
//!
//! # Data Flow
//! ```text
//! inject_* / force_circuit_open
//!     → validate params, blast radius, engine state
//!     → clamp duration to max_duration
//!     → activate scenario, spawn cleanup(sleep(duration) → deactivate)
//!
//! Protected call (guard.rs):
//!     should_inject_latency(target) → sleep
//!     should_inject_error(target)   → fault instead of the call
//!     → circuit breaker sees the outcome
//!
//! emergency_stop():
//!     latch stopped → deactivate all → abort cleanups
//! ```
//!
//! # Design Decisions
//! - Every scenario expires on its own; nothing outlives `max_duration`
//! - The stop latch makes all injection neutral until `reset()`

pub mod engine;
pub mod guard;
pub mod scenario;

pub use engine::{ChaosEngine, ChaosError, ChaosMetrics, ChaosSettings};
pub use guard::guarded_call;
pub use scenario::{ChaosScenario, InjectedFault, ScenarioKind, ScenarioParams, WILDCARD_TARGET};
