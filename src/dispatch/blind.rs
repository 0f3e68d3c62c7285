//! Transport-level forwarding: bytes in both directions, never inspected.

use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use crate::load_balancer::RoutingHint;
use crate::net::InboundConnection;
use crate::observability::GatewayEvent;
use crate::pool::{AcquirePolicy, ReleaseOutcome};
use crate::routing::Classification;
use crate::session::{EndStatus, SessionContext, SessionKind};

/// Splice `conn` onto a backend of `class.pool` until either side closes.
pub async fn forward_blind(
    ctx: &SessionContext,
    conn: InboundConnection,
    class: &Classification,
    mut shutdown: broadcast::Receiver<()>,
) -> EndStatus {
    let session = conn.id.to_string();
    let InboundConnection {
        stream: mut inbound,
        buffered,
        ..
    } = conn;
    ctx.events.emit(GatewayEvent::SessionStarted {
        session: session.clone(),
        kind: SessionKind::Stream,
        pool: class.pool.clone(),
    });

    let end = |status: EndStatus| {
        ctx.events.emit(GatewayEvent::SessionEnded {
            session: session.clone(),
            kind: SessionKind::Stream,
            status,
        });
        status
    };

    let mut upstream = match ctx
        .connect_upstream(&class.pool, &RoutingHint::None, AcquirePolicy::FailFast)
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!(session = %session, pool = %class.pool, error = %e, "No backend for blind connection");
            let _ = inbound.shutdown().await;
            return end(EndStatus::Failed);
        }
    };

    let status = match upstream.stream_mut() {
        Some(backend) => {
            if let Err(e) = backend.write_all(&buffered).await {
                tracing::debug!(session = %session, error = %e, "Backend closed before read-ahead bytes were sent");
                ctx.pools.release(upstream, ReleaseOutcome::NotReusable);
                let _ = inbound.shutdown().await;
                return end(EndStatus::Failed);
            }
            tokio::select! {
                copied = tokio::io::copy_bidirectional(&mut inbound, backend) => match copied {
                    Ok((up, down)) => {
                        tracing::debug!(session = %session, bytes_up = up, bytes_down = down, "Blind connection closed");
                        EndStatus::Clean
                    }
                    Err(e) => {
                        // either side may have reset; the backend is not charged
                        tracing::debug!(session = %session, error = %e, "Blind connection aborted");
                        EndStatus::Failed
                    }
                },
                _ = shutdown.recv() => EndStatus::Clean,
            }
        }
        None => EndStatus::Failed,
    };

    ctx.pools.release(upstream, ReleaseOutcome::NotReusable);
    let _ = inbound.shutdown().await;
    end(status)
}
