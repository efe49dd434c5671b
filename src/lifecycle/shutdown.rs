//! Shutdown coordination for background loops.

use std::future::Future;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
#[derive(Debug)]
pub struct Shutdown {
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// A spawned loop together with the signal that ends it.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    shutdown: Shutdown,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `body` with a shutdown receiver. Requires a Tokio runtime.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(body(shutdown.subscribe()));
        tracing::debug!(task = name, "Background task started");
        Self {
            name,
            shutdown,
            handle,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the loop and wait for it to exit.
    pub async fn stop(self) {
        self.shutdown.trigger();
        match self.handle.await {
            Ok(()) => tracing::debug!(task = self.name, "Background task stopped"),
            Err(e) if e.is_panic() => tracing::error!(task = self.name, "Background task panicked"),
            Err(_) => tracing::debug!(task = self.name, "Background task cancelled"),
        }
    }
}
