//! System health aggregation.
//!
//! # Data Flow
//! ```text
//! Polling loop (aggregator.rs):
//!     Periodic timer
//!     → Read current_state of every breaker (registry + ad-hoc)
//!     → Score and classify (report.rs)
//!     → Append snapshot to bounded history
//!     → On status change: spawn every callback, never await them
//!
//! On demand (aggregator.rs):
//!     get_system_health() → recompute from live breaker states
//! ```
//!
//! # Design Decisions
//! - Breakers are polled, never subscribed to; scoring is a pure function of
//!   a set of states
//! - Callback failures are logged and counted, never propagated

pub mod aggregator;
pub mod report;

pub use aggregator::{AggregatorMetrics, AggregatorSettings, HealthAggregator, HealthCallback};
pub use report::{BreakerCounts, HealthChange, HealthSnapshot, HealthStatus, HealthThresholds, SystemHealthReport};
