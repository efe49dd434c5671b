//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a protected dependency:
//!     → registry.rs (look up the breaker for the dependency name)
//!     → circuit_breaker.rs (fail fast if Open, track consecutive failures)
//!
//! Recovery and monitoring:
//!     → BreakerHandle::current_state() read by the health aggregator
//!     → BreakerHandle::reset() driven by the recovery orchestrator
//!     → backoff.rs computes delays between recovery attempts
//! ```
//!
//! # Design Decisions
//! - Breakers are created lazily and live for the process lifetime
//! - Transitions for one breaker happen under that breaker's own lock
//! - Observers only read state; they never subscribe to breaker internals

pub mod backoff;
pub mod circuit_breaker;
pub mod registry;

pub use circuit_breaker::{BreakerHandle, BreakerSnapshot, CallError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use registry::{CircuitBreakerRegistry, RegistryMetrics};
