//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Logging/metrics → Build kernel → Start loops
//!
//! Shutdown (shutdown.rs):
//!     stop() → broadcast shutdown → loop exits → JoinHandle awaited
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     SIGHUP → Trigger config reload
//! ```
//!
//! # Design Decisions
//! - Background loops are owned by the component that starts them
//! - stop() returns only after the loop has exited
//! - Shutdown has timeout: forced exit after deadline

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{BackgroundTask, Shutdown};
pub use signals::{wait_for_signal, SignalEvent};
