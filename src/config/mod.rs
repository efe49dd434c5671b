//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → KernelConfig (validated, immutable)
//!     → handed to each component at construction
//!
//! On change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → ResilienceKernel::apply_config swaps live settings
//! ```
//!
//! # Design Decisions
//! - Config is plain values; no network calls at this layer
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BreakerServiceConfig, BreakersConfig, ChaosConfig, HealthConfig, KernelConfig, LogFormat,
    ObservabilityConfig, RecoveryConfig,
};
