//! Resilience kernel: circuit breakers, health aggregation, automated
//! recovery and controlled chaos for a service's outbound dependencies.
//!
//! # Architecture Overview
//!
//! ```text
//!   protected call ──▶ chaos::guarded_call ──▶ CircuitBreaker ──▶ dependency
//!                            │                       ▲
//!                            │ should_inject_*       │ current_state / reset
//!                            ▼                       │
//!                       ChaosEngine          CircuitBreakerRegistry
//!                                             ▲              ▲
//!                                     poll    │              │ reset + health check
//!                              HealthAggregator ──callback──▶ RecoveryOrchestrator
//! ```
//!
//! [`kernel::ResilienceKernel`] owns one of each and wires them together.

// Core subsystems
pub mod config;
pub mod error;
pub mod resilience;

// Resilience layers
pub mod chaos;
pub mod health;
pub mod recovery;

// Composition and cross-cutting concerns
pub mod kernel;
pub mod lifecycle;
pub mod observability;

pub use config::schema::KernelConfig;
pub use kernel::{default_kernel, ResilienceKernel};
pub use lifecycle::Shutdown;
