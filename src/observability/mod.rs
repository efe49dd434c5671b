//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters and gauges via the `metrics` facade)
//!
//! Consumers:
//!     → Log aggregation (stdout, JSON or pretty)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Without an installed exporter the metrics facade is a no-op
//! - Components keep their own atomic counters for `get_metrics()` so the
//!   in-process view never depends on the exporter

pub mod logging;
pub mod metrics;
