//! stream-gateway
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────────┐
//!                 │                      STREAM GATEWAY                      │
//!                 │                                                          │
//!   inbound ──────┼─▶ listener ─▶ dispatch ─▶ router ─▶ load balancer        │
//!                 │      (permit)    │          (pool)      (backend)        │
//!                 │                  ▼                         │             │
//!                 │        blind splice | unary | stream       ▼             │
//!                 │                  │                   connection pool ────┼──▶ backend
//!                 │                  ▼                         ▲             │
//!                 │        replay buffer, idempotency          │             │
//!                 │                                      health prober       │
//!                 │                                                          │
//!                 │  config + watcher │ admin API │ signals │ tracing/metrics │
//!                 └──────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use stream_gateway::admin::{setup_admin_router, AdminState};
use stream_gateway::config::watcher::ConfigWatcher;
use stream_gateway::config::{load_config, ListenerMode};
use stream_gateway::lifecycle::{signals, SignalAction, Shutdown};
use stream_gateway::net::{FrameCodec, TcpConnector, TcpInboundListener};
use stream_gateway::observability::{logging, metrics, SharedSink, TracingSink};
use stream_gateway::Gateway;

#[derive(Parser)]
#[command(name = "stream-gateway", version, about = "Protocol-aware reverse proxy for long-lived streams")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = ?args.config, "stream-gateway starting");
    tracing::info!(
        listeners = config.listeners.len(),
        backends = config.backends.len(),
        routes = config.routes.len(),
        max_sessions = config.sessions.max_sessions,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let events: SharedSink = Arc::new(TracingSink);
    let gateway = Arc::new(Gateway::new(&config, Arc::new(TcpConnector), events)?);
    let shutdown = Shutdown::new();
    let background = gateway.spawn_background(&shutdown);

    // listeners start last: traffic only once everything behind them runs
    let codec = FrameCodec::new(config.sessions.max_frame_bytes);
    let mut accept_loops = Vec::new();
    for listener_config in &config.listeners {
        let listener = TcpInboundListener::bind(listener_config, codec).await?;
        if listener_config.mode == ListenerMode::Transport {
            if let Some(pool) = &listener_config.pool {
                gateway.router().bind_port(listener.local_addr()?.port(), pool.clone());
            }
        }
        accept_loops.push(tokio::spawn(gateway.clone().serve(listener, shutdown.clone())));
    }

    if config.admin.enabled {
        let state = AdminState::new(gateway.clone(), &config.admin.api_key, Some(args.config.clone()));
        let app = setup_admin_router(state);
        let listener = tokio::net::TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %listener.local_addr()?, "Admin API listening");
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.recv().await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin API stopped");
            }
        });
    }

    let (watcher, mut updates) = ConfigWatcher::new(&args.config);
    let reloader = watcher.reloader();
    let _watch_guard = match watcher.run() {
        Ok(guard) => Some(guard),
        Err(e) => {
            tracing::warn!(error = %e, "Config watcher unavailable, reload via SIGHUP or admin API only");
            None
        }
    };

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = signals::listen(shutdown, signal_tx).await {
                tracing::error!(error = %e, "Signal handlers could not be installed");
            }
        });
    }

    let mut stop = shutdown.subscribe();
    loop {
        tokio::select! {
            Some(updated) = updates.recv() => {
                if let Err(e) = gateway.apply_config(&updated) {
                    tracing::error!(error = %e, "Reloaded configuration rejected, keeping current");
                }
            }
            Some(SignalAction::Reload) = signal_rx.recv() => {
                reloader.reload();
            }
            _ = stop.recv() => break,
        }
    }

    for accept_loop in accept_loops {
        let _ = accept_loop.await;
    }
    gateway
        .drain(Duration::from_secs(config.lifecycle.drain_timeout_secs))
        .await;
    for task in background {
        let _ = task.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
