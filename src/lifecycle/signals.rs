//! OS signal handling.
//!
//! SIGINT and SIGTERM start a graceful shutdown; a second one while draining
//! exits immediately. SIGHUP asks for a configuration reload.

use tokio::sync::mpsc;

use crate::lifecycle::Shutdown;

/// Something the operator asked for through a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Reload,
}

/// Listen for signals until the process exits. Reload requests are sent on `actions`.
#[cfg(unix)]
pub async fn listen(shutdown: Shutdown, actions: mpsc::UnboundedSender<SignalAction>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = terminate.recv() => stop(&shutdown, "SIGTERM"),
            _ = interrupt.recv() => stop(&shutdown, "SIGINT"),
            _ = hangup.recv() => {
                tracing::info!("SIGHUP received, reloading configuration");
                if actions.send(SignalAction::Reload).is_err() {
                    tracing::warn!("Reload requested but nothing is listening");
                }
            }
        }
    }
}

#[cfg(not(unix))]
pub async fn listen(shutdown: Shutdown, _actions: mpsc::UnboundedSender<SignalAction>) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        stop(&shutdown, "ctrl-c");
    }
}

fn stop(shutdown: &Shutdown, signal: &'static str) {
    if shutdown.is_triggered() {
        tracing::warn!(signal, "Second shutdown signal, exiting immediately");
        std::process::exit(1);
    }
    tracing::info!(signal, "Shutdown signal received, draining");
    shutdown.trigger();
}
