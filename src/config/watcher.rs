//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::KernelConfig;

/// Watches the kernel config file and publishes every valid, changed version.
pub struct ConfigWatcher {
    path: PathBuf,
    current: KernelConfig,
    update_tx: mpsc::UnboundedSender<KernelConfig>,
}

impl ConfigWatcher {
    /// Create a watcher for `path`, starting from the already-applied `current`.
    ///
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path, current: KernelConfig) -> (Self, mpsc::UnboundedReceiver<KernelConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                current,
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. The returned handle must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self {
            path,
            mut current,
            update_tx,
        } = self;
        let watched = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(error = %e, "Config watch error");
                        return;
                    }
                };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }

                match load_config(&watched) {
                    // Editors often emit several events per save.
                    Ok(new_config) if new_config == current => {}
                    Ok(new_config) => {
                        tracing::info!(path = ?watched, "Config file changed, publishing reload");
                        current = new_config.clone();
                        if update_tx.send(new_config).is_err() {
                            tracing::debug!("Config update receiver dropped");
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Rejected config reload, keeping current configuration");
                    }
                }
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}
