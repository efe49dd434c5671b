//! Daemon startup and run loop.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Initialize logging and metrics, then build and start the kernel
//! - Apply config reloads (file watcher or SIGHUP) until a shutdown signal
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Invalid reloads are logged and ignored; the running config stays
//! - Shutdown has a deadline

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::config::watcher::ConfigWatcher;
use crate::config::{load_config, ConfigError, KernelConfig};
use crate::kernel::{KernelError, ResilienceKernel};
use crate::lifecycle::signals::{wait_for_signal, SignalEvent};
use crate::observability::{logging, metrics};

/// Upper bound on graceful shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("config watcher failed: {0}")]
    Watch(#[from] notify::Error),

    #[error("signal handling failed: {0}")]
    Signal(#[from] std::io::Error),
}

/// Load the config at `path`, or defaults when no path is given.
pub fn load_or_default(path: Option<&Path>) -> Result<KernelConfig, ConfigError> {
    match path {
        Some(path) => load_config(path),
        None => Ok(KernelConfig::default()),
    }
}

/// Run the kernel as a daemon until SIGINT/SIGTERM.
pub async fn run(config_path: Option<PathBuf>) -> Result<(), StartupError> {
    let config = load_or_default(config_path.as_deref())?;
    logging::init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config_path,
        "resilience-kernel starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let kernel = ResilienceKernel::from_config(&config)?;
    kernel.start();

    let (mut updates, _watcher) = match &config_path {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path, config.clone());
            (Some(updates), Some(watcher.run()?))
        }
        None => (None, None),
    };

    loop {
        tokio::select! {
            signal = wait_for_signal() => match signal? {
                SignalEvent::Shutdown => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
                SignalEvent::Reload => reload(&kernel, config_path.as_deref()),
            },
            Some(new_config) = recv(&mut updates) => {
                if let Err(e) = kernel.apply_config(&new_config) {
                    tracing::error!(error = %e, "Failed to apply reloaded configuration");
                }
            }
        }
    }

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, kernel.shutdown()).await.is_err() {
        tracing::warn!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "Shutdown deadline exceeded");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn recv(updates: &mut Option<tokio::sync::mpsc::UnboundedReceiver<KernelConfig>>) -> Option<KernelConfig> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn reload(kernel: &ResilienceKernel, path: Option<&Path>) {
    let Some(path) = path else {
        tracing::info!("Reload requested but no config file is in use");
        return;
    };
    match load_config(path) {
        Ok(config) => match kernel.apply_config(&config) {
            Ok(()) => tracing::info!(path = ?path, "Configuration reloaded"),
            Err(e) => tracing::error!(error = %e, "Failed to apply reloaded configuration"),
        },
        Err(e) => tracing::error!(error = %e, "Rejected config reload, keeping current configuration"),
    }
}
