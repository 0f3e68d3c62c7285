//! Streaming sessions: event-stream push, long-poll and multiplexed streams.
//!
//! # Lifecycle
//! ```text
//! opening frame ─▶ attach (session id) ─▶ resume parked link ─▶ replay or Resync
//!     ─▶ connect backend (unless resumed)
//!     ─▶ relay: backend frame → Data{seq}; inbound frame → backend
//!     ─▶ backend failure: one reselect, re-send opening frame
//!     ─▶ End(Clean) | End(Failed) | silent close (cancel, idle, long-poll batch)
//! ```
//!
//! A resumable session (one that names its session id) parks its backend
//! link when the client leaves without an ending, so frames keep being
//! sequenced for the next reconnect.

use bytes::Bytes;
use futures_util::SinkExt;
use std::sync::Arc;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant};

use crate::error::GatewayError;
use crate::load_balancer::{BackendId, RoutingHint};
use crate::net::{next_frame, BoxedStream, FrameReader, FrameWriter, InboundConnection, ProtocolKind};
use crate::observability::{metrics, GatewayEvent};
use crate::pool::{AcquirePolicy, ReleaseOutcome};
use crate::routing::Classification;
use crate::session::link::{BackendEvent, BackendLink, ParkedLink};
use crate::session::{CancelFlag, ClientFrame, EndStatus, Replay, SessionContext, SessionKind, SessionState};

const INBOUND_QUEUE: usize = 16;

type InboundWriter = FrameWriter<WriteHalf<BoxedStream>>;

async fn read_inbound(
    mut reader: FrameReader<ReadHalf<BoxedStream>>,
    tx: mpsc::Sender<Bytes>,
    cancel: Arc<CancelFlag>,
) {
    while let Ok(Some(frame)) = next_frame(&mut reader).await {
        if tx.send(frame).await.is_err() {
            return;
        }
    }
    cancel.cancel();
}

/// Why the relay loop stopped.
#[derive(Debug)]
enum Exit {
    BackendEnded,
    Failed(GatewayError),
    Cancelled,
    Idle,
    Shutdown,
    /// Long-poll batch delivered; the client will come back.
    Detached,
}

/// Run a stream session on `conn` until it ends.
pub async fn serve_stream(
    ctx: &SessionContext,
    conn: InboundConnection,
    class: &Classification,
    mut shutdown: broadcast::Receiver<()>,
) -> EndStatus {
    let InboundConnection {
        id,
        metadata,
        stream,
        buffered,
        ..
    } = conn;
    let (mut inbound_reader, mut inbound) = ctx.codec.split(stream, buffered);
    let long_poll = metadata.kind == ProtocolKind::LongPoll;

    let opening = match next_frame(&mut inbound_reader).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return EndStatus::Clean,
        Err(e) => {
            tracing::debug!(connection = %id, error = %e, "No opening frame");
            return EndStatus::Failed;
        }
    };

    let session_id = metadata
        .header(&ctx.config.session_header)
        .filter(|s| !s.is_empty());
    let resumable = session_id.is_some();
    let attachment = ctx.directory.attach(session_id);
    let session = attachment.state().clone();
    ctx.events.emit(GatewayEvent::SessionStarted {
        session: session.id().to_string(),
        kind: SessionKind::Stream,
        pool: class.pool.clone(),
    });

    // take the parked link before replaying so nothing is recorded in between
    let mut link = match session.take_parked() {
        Some(parked) => parked.resume().await,
        None => None,
    };
    tracing::debug!(
        session = %session.id(),
        connection = %id,
        resumed = attachment.is_resumed(),
        live_backend = link.is_some(),
        "Stream session attached"
    );

    let end = |status: EndStatus| {
        ctx.events.emit(GatewayEvent::SessionEnded {
            session: session.id().to_string(),
            kind: SessionKind::Stream,
            status,
        });
        status
    };

    let mut delivered = 0usize;
    if let Some(last_seen) = metadata
        .header(&ctx.config.last_sequence_header)
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        let frames: Vec<ClientFrame> = match session.replay_since(last_seen) {
            Replay::Frames(frames) => frames
                .into_iter()
                .map(|(seq, payload)| ClientFrame::Data { seq, payload })
                .collect(),
            Replay::Resync { next_seq } => vec![ClientFrame::Resync { next_seq }],
        };
        for frame in frames {
            if matches!(frame, ClientFrame::Data { .. }) {
                delivered += 1;
            }
            if inbound.send(frame.encode()).await.is_err() {
                if let Some(link) = link.take() {
                    park(ctx, &session, link, &shutdown);
                }
                return end(EndStatus::Clean);
            }
        }
    }

    if session.is_ended() {
        ctx.directory.finish(session.id());
        let _ = inbound.send(ClientFrame::End(EndStatus::Clean).encode()).await;
        let _ = inbound.close().await;
        return end(EndStatus::Clean);
    }
    if long_poll && delivered > 0 {
        if let Some(link) = link.take() {
            park(ctx, &session, link, &shutdown);
        }
        let _ = inbound.close().await;
        return end(EndStatus::Clean);
    }

    let hint = RoutingHint::affinity(
        metadata
            .header(&ctx.config.affinity_header)
            .or(Some(session.id())),
    );
    let mut reselected = false;
    if link.is_none() {
        let wait = AcquirePolicy::Wait(ctx.pools.config().stream_acquire_timeout());
        let first = match ctx.connect_upstream(&class.pool, &hint, wait).await {
            Ok(conn) => BackendLink::open(ctx, conn, &opening).await,
            Err(e) => {
                tracing::warn!(session = %session.id(), pool = %class.pool, error = %e, "No backend for stream");
                let frame = ClientFrame::Unavailable { code: e.code().to_string() };
                let _ = inbound.send(frame.encode()).await;
                ctx.events.emit(GatewayEvent::SessionFailed {
                    session: session.id().to_string(),
                    reason: e.to_string(),
                });
                return end(EndStatus::Failed);
            }
        };
        // a rejected opening frame spends the session's one reselect
        link = match first {
            Ok(link) => Some(link),
            Err((conn, e)) => {
                tracing::warn!(session = %session.id(), backend = %conn.backend_id(), error = %e, "Backend rejected opening frame");
                let failed = conn.backend_id().clone();
                ctx.pools.release(conn, ReleaseOutcome::Failed);
                reselected = true;
                reconnect(ctx, &class.pool, &hint, &failed, &opening).await
            }
        };
    }

    let cancel = Arc::new(CancelFlag::new());
    let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let inbound_task = tokio::spawn(read_inbound(inbound_reader, inbound_tx, cancel.clone()));

    let idle = ctx.config.stream_idle_timeout();
    let mut deadline = Instant::now() + idle;

    let exit = loop {
        let Some(current) = link.as_mut() else {
            break Exit::Failed(GatewayError::StreamFailed {
                reason: "no backend after reselect".to_string(),
            });
        };
        if cancel.is_cancelled() {
            break Exit::Cancelled;
        }

        tokio::select! {
            biased;
            _ = shutdown.recv() => break Exit::Shutdown,
            _ = cancel.cancelled() => break Exit::Cancelled,
            _ = time::sleep_until(deadline) => break Exit::Idle,
            frame = inbound_rx.recv() => {
                let Some(frame) = frame else {
                    cancel.cancel();
                    continue;
                };
                deadline = Instant::now() + idle;
                if let Err(e) = current.send(frame).await {
                    tracing::debug!(session = %session.id(), error = %e, "Forwarding inbound frame failed");
                    match failover(ctx, &class.pool, &hint, &opening, &mut link, &mut reselected, e.to_string()).await {
                        Some(exit) => break exit,
                        None => continue,
                    }
                }
            }
            event = current.events.recv() => {
                let event = event.unwrap_or_else(|| BackendEvent::Failed("backend reader stopped".to_string()));
                match event {
                    BackendEvent::Frame(payload) => {
                        deadline = Instant::now() + idle;
                        if !relay(&session, &mut inbound, payload, &class.pool).await {
                            cancel.cancel();
                            continue;
                        }
                        delivered += 1;
                        if long_poll {
                            break drain_batch(&session, &mut inbound, current, &class.pool, &mut delivered).await;
                        }
                    }
                    BackendEvent::End => break Exit::BackendEnded,
                    BackendEvent::Failed(reason) => {
                        match failover(ctx, &class.pool, &hint, &opening, &mut link, &mut reselected, reason).await {
                            Some(exit) => break exit,
                            None => continue,
                        }
                    }
                }
            }
        }
    };

    inbound_task.abort();
    if let Some(link) = link.take() {
        if resumable && matches!(exit, Exit::Detached | Exit::Cancelled) {
            park(ctx, &session, link, &shutdown);
        } else {
            link.close(&ctx.pools, ReleaseOutcome::NotReusable);
        }
    }

    let status = match exit {
        Exit::BackendEnded => {
            ctx.directory.finish(session.id());
            let _ = inbound.send(ClientFrame::End(EndStatus::Clean).encode()).await;
            EndStatus::Clean
        }
        Exit::Shutdown => {
            let _ = inbound.send(ClientFrame::End(EndStatus::Clean).encode()).await;
            EndStatus::Clean
        }
        Exit::Failed(err) => {
            tracing::warn!(session = %session.id(), error = %err, "Stream failed");
            ctx.events.emit(GatewayEvent::SessionFailed {
                session: session.id().to_string(),
                reason: err.to_string(),
            });
            let _ = inbound.send(ClientFrame::End(EndStatus::Failed).encode()).await;
            EndStatus::Failed
        }
        Exit::Idle => {
            tracing::debug!(session = %session.id(), "Stream idle timeout");
            EndStatus::Clean
        }
        Exit::Cancelled | Exit::Detached => EndStatus::Clean,
    };

    let _ = inbound.close().await;
    tracing::debug!(session = %session.id(), delivered, status = status.as_str(), "Stream session closed");
    drop(attachment);
    end(status)
}

/// Keep `link` recording into `session` until a client resumes it.
fn park(ctx: &SessionContext, session: &Arc<SessionState>, link: BackendLink, shutdown: &broadcast::Receiver<()>) {
    let linger = ctx.config.stream_idle_timeout().min(ctx.config.retention());
    tracing::debug!(session = %session.id(), backend = %link.backend_id(), "Parking stream backend");
    session.park(ParkedLink::spawn(
        session.clone(),
        ctx.pools.clone(),
        link,
        linger,
        shutdown.resubscribe(),
    ));
}

/// Sequence, buffer and deliver one backend frame. False if the client is gone.
async fn relay(
    session: &SessionState,
    inbound: &mut InboundWriter,
    payload: Bytes,
    pool: &str,
) -> bool {
    let seq = session.record(payload.clone());
    match inbound.send(ClientFrame::Data { seq, payload }.encode()).await {
        Ok(()) => {
            metrics::record_frame_forwarded(pool);
            true
        }
        Err(_) => false,
    }
}

/// Relay what the backend has already queued, closing out a long-poll batch.
async fn drain_batch(
    session: &SessionState,
    inbound: &mut InboundWriter,
    link: &mut BackendLink,
    pool: &str,
    delivered: &mut usize,
) -> Exit {
    loop {
        match link.events.try_recv() {
            Ok(BackendEvent::Frame(payload)) => {
                if !relay(session, inbound, payload, pool).await {
                    return Exit::Cancelled;
                }
                *delivered += 1;
            }
            Ok(BackendEvent::End) => return Exit::BackendEnded,
            // a failed link is parked anyway; its recorder sees the closed channel
            Ok(BackendEvent::Failed(_)) | Err(_) => return Exit::Detached,
        }
    }
}

/// Handle a backend failure: release the link as failed and, once per
/// session, reselect. Returns the exit if the session cannot continue.
async fn failover(
    ctx: &SessionContext,
    pool: &str,
    hint: &RoutingHint,
    opening: &Bytes,
    link: &mut Option<BackendLink>,
    reselected: &mut bool,
    reason: String,
) -> Option<Exit> {
    let failed = link.take()?;
    let failed_id = failed.backend_id().clone();
    tracing::warn!(backend = %failed_id, reason = %reason, "Stream backend failed");
    failed.close(&ctx.pools, ReleaseOutcome::Failed);

    if *reselected {
        return Some(Exit::Failed(GatewayError::StreamFailed { reason }));
    }
    *reselected = true;
    *link = reconnect(ctx, pool, hint, &failed_id, opening).await;
    match link {
        Some(_) => None,
        None => Some(Exit::Failed(GatewayError::StreamFailed { reason })),
    }
}

/// The single reselect-and-reconnect of a stream session.
async fn reconnect(
    ctx: &SessionContext,
    pool: &str,
    hint: &RoutingHint,
    failed: &BackendId,
    opening: &Bytes,
) -> Option<BackendLink> {
    let wait = AcquirePolicy::Wait(ctx.pools.config().stream_acquire_timeout());
    let conn = match ctx.try_upstream(pool, hint, wait, Some(failed)).await {
        Ok(conn) => conn,
        Err((e, _)) => {
            tracing::warn!(pool, error = %e, "Stream reselect found no backend");
            return None;
        }
    };
    let backend = conn.backend_id().clone();
    match BackendLink::open(ctx, conn, opening).await {
        Ok(link) => {
            tracing::info!(pool, backend = %backend, "Stream moved to new backend");
            Some(link)
        }
        Err((conn, e)) => {
            tracing::warn!(pool, backend = %backend, error = %e, "Stream reselect failed");
            ctx.pools.release(conn, ReleaseOutcome::Failed);
            None
        }
    }
}
