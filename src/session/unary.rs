//! Unary request/response sessions.

use bytes::Bytes;
use futures_util::SinkExt;
use std::time::Instant;
use tokio::sync::broadcast;

use crate::error::GatewayError;
use crate::load_balancer::RoutingHint;
use crate::net::{next_frame, InboundConnection};
use crate::observability::{metrics, GatewayEvent};
use crate::pool::{AcquirePolicy, ReleaseOutcome};
use crate::resilience::timeouts::with_deadline;
use crate::routing::Classification;
use crate::session::{ClientFrame, EndStatus, SessionContext, SessionKind};

/// Outcome of one unary exchange, as recorded for idempotent replays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnaryReply {
    Response(Bytes),
    Unavailable(&'static str),
}

impl UnaryReply {
    pub fn is_success(&self) -> bool {
        matches!(self, UnaryReply::Response(_))
    }

    pub fn into_frame(self) -> ClientFrame {
        match self {
            UnaryReply::Response(body) => ClientFrame::Response(body),
            UnaryReply::Unavailable(code) => ClientFrame::Unavailable { code: code.to_string() },
        }
    }
}

/// Serve request frames on `conn` until it closes, or after one request
/// unless keep-alive was negotiated.
pub async fn serve_unary(
    ctx: &SessionContext,
    conn: InboundConnection,
    class: &Classification,
    mut shutdown: broadcast::Receiver<()>,
) -> EndStatus {
    let session = conn.id.to_string();
    let InboundConnection {
        metadata,
        stream,
        buffered,
        ..
    } = conn;
    let mut inbound = ctx.codec.framed_with(stream, buffered);

    ctx.events.emit(GatewayEvent::SessionStarted {
        session: session.clone(),
        kind: SessionKind::Unary,
        pool: class.pool.clone(),
    });

    let hint = RoutingHint::affinity(metadata.header(&ctx.config.affinity_header));
    let idempotency_key = metadata
        .header(&ctx.idempotency_config.header)
        .filter(|_| ctx.idempotency_config.enabled)
        .map(str::to_string);
    // a keyed connection carries exactly one request
    let keep_alive = metadata.keep_alive && idempotency_key.is_none();

    let mut status = EndStatus::Clean;
    loop {
        let request = tokio::select! {
            read = next_frame(&mut inbound) => read,
            _ = shutdown.recv() => break,
        };
        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(session = %session, error = %e, "Bad request frame");
                status = EndStatus::Failed;
                break;
            }
        };

        let reply = match &idempotency_key {
            Some(key) => {
                let (reply, resolution) = ctx
                    .idempotency
                    .execute(key, UnaryReply::is_success, || {
                        forward_once(ctx, &class.pool, &hint, request)
                    })
                    .await;
                tracing::debug!(session = %session, key = %key, resolution = ?resolution, "Idempotent request");
                reply
            }
            None => forward_once(ctx, &class.pool, &hint, request).await,
        };

        if !reply.is_success() {
            status = EndStatus::Failed;
        }
        if let Err(e) = inbound.send(reply.into_frame().encode()).await {
            tracing::debug!(session = %session, error = %e, "Client went away before the reply");
            status = EndStatus::Failed;
            break;
        }
        if !keep_alive {
            break;
        }
    }

    let _ = inbound.close().await;
    ctx.events.emit(GatewayEvent::SessionEnded {
        session,
        kind: SessionKind::Unary,
        status,
    });
    status
}

/// Forward one request and wait for its response frame.
pub async fn forward_once(ctx: &SessionContext, pool: &str, hint: &RoutingHint, request: Bytes) -> UnaryReply {
    let start = Instant::now();
    let mut conn = match ctx.connect_upstream(pool, hint, AcquirePolicy::FailFast).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(pool, error = %e, "No backend for unary request");
            metrics::record_unary(pool, "unavailable", start);
            return UnaryReply::Unavailable(e.code());
        }
    };

    let codec = ctx.codec;
    let exchange = async {
        let backend = conn.stream_mut().ok_or_else(|| GatewayError::Codec("connection has no stream".into()))?;
        let mut frames = codec.framed(backend);
        frames.send(request).await?;
        let response = next_frame(&mut frames).await?;
        // bytes past the response would poison the next exchange
        let reusable = frames.read_buffer().is_empty();
        drop(frames);
        match response {
            Some(response) => Ok((response, reusable)),
            None => Err(GatewayError::BackendUnavailable {
                backend: conn.backend_id().clone(),
                reason: "closed before responding".to_string(),
            }),
        }
    };

    let result = with_deadline("backend response", ctx.config.request_timeout(), exchange).await;
    match result {
        Ok((response, reusable)) => {
            let outcome = if reusable {
                ReleaseOutcome::Reusable
            } else {
                ReleaseOutcome::NotReusable
            };
            ctx.pools.release(conn, outcome);
            metrics::record_unary(pool, "ok", start);
            UnaryReply::Response(response)
        }
        Err(e) => {
            tracing::warn!(pool, backend = %conn.backend_id(), error = %e, "Unary exchange failed");
            ctx.pools.release(conn, ReleaseOutcome::Failed);
            metrics::record_unary(pool, "failed", start);
            UnaryReply::Unavailable(e.code())
        }
    }
}
