//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for SIGTERM/SIGINT (shutdown) and SIGHUP (config reload)
//! - Translate them into [`SignalEvent`]s for the daemon loop

/// What the daemon should do in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Reload,
}

/// Wait for the next relevant signal.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<SignalEvent> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => res.map(|_| SignalEvent::Shutdown),
        _ = terminate.recv() => Ok(SignalEvent::Shutdown),
        _ = hangup.recv() => Ok(SignalEvent::Reload),
    }
}

/// Wait for the next relevant signal.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<SignalEvent> {
    tokio::signal::ctrl_c().await?;
    Ok(SignalEvent::Shutdown)
}
