//! Backend side of a stream session.
//!
//! A [`BackendLink`] owns one pooled connection while a client is attached.
//! When the client leaves a resumable session early (long-poll batch,
//! dropped connection) the link is parked: a recorder task keeps sequencing
//! backend frames into the session's replay buffer until the client comes
//! back, the backend finishes, or the link lingers past its deadline.

use bytes::{Bytes, BytesMut};
use futures_util::SinkExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::error::GatewayError;
use crate::load_balancer::BackendId;
use crate::net::{next_frame, BoxedStream, FrameReader, FrameWriter};
use crate::pool::{ConnectionPoolManager, PooledConnection, ReleaseOutcome};
use crate::session::{SessionContext, SessionState};

const BACKEND_QUEUE: usize = 16;

#[derive(Debug)]
pub(crate) enum BackendEvent {
    Frame(Bytes),
    /// Zero-length frame: the backend finished the stream.
    End,
    Failed(String),
}

/// One live backend connection of a stream session.
pub(crate) struct BackendLink {
    conn: PooledConnection,
    writer: FrameWriter<WriteHalf<BoxedStream>>,
    pub(crate) events: mpsc::Receiver<BackendEvent>,
    reader: JoinHandle<()>,
}

impl BackendLink {
    /// Take over `conn`, send the opening frame and start reading.
    pub(crate) async fn open(
        ctx: &SessionContext,
        mut conn: PooledConnection,
        opening: &Bytes,
    ) -> Result<Self, (PooledConnection, GatewayError)> {
        let Some(stream) = conn.take_stream() else {
            let err = GatewayError::Codec("connection has no stream".into());
            return Err((conn, err));
        };
        let (reader, mut writer) = ctx.codec.split(stream, BytesMut::new());
        if let Err(e) = writer.send(opening.clone()).await {
            return Err((conn, e.into()));
        }

        let (tx, events) = mpsc::channel(BACKEND_QUEUE);
        let reader = tokio::spawn(read_backend(reader, tx));
        Ok(Self {
            conn,
            writer,
            events,
            reader,
        })
    }

    pub(crate) fn backend_id(&self) -> &BackendId {
        self.conn.backend_id()
    }

    /// Forward one inbound frame to the backend.
    pub(crate) async fn send(&mut self, frame: Bytes) -> Result<(), GatewayError> {
        self.writer.send(frame).await.map_err(GatewayError::from)
    }

    pub(crate) fn close(self, pools: &ConnectionPoolManager, outcome: ReleaseOutcome) {
        self.reader.abort();
        pools.release(self.conn, outcome);
    }
}

async fn read_backend(mut reader: FrameReader<ReadHalf<BoxedStream>>, tx: mpsc::Sender<BackendEvent>) {
    loop {
        let event = match next_frame(&mut reader).await {
            Ok(Some(frame)) if frame.is_empty() => BackendEvent::End,
            Ok(Some(frame)) => BackendEvent::Frame(frame),
            Ok(None) => BackendEvent::Failed("backend closed the stream".to_string()),
            Err(e) => BackendEvent::Failed(e.to_string()),
        };
        let last = !matches!(event, BackendEvent::Frame(_));
        if tx.send(event).await.is_err() || last {
            break;
        }
    }
}

/// A link kept recording while its session has no client.
///
/// Dropping it (session swept) makes the recorder release the connection.
pub struct ParkedLink {
    resume: oneshot::Sender<()>,
    task: JoinHandle<Option<BackendLink>>,
}

impl ParkedLink {
    pub(crate) fn spawn(
        session: Arc<SessionState>,
        pools: Arc<ConnectionPoolManager>,
        link: BackendLink,
        linger: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let (resume, resumed) = oneshot::channel();
        let task = tokio::spawn(record_while_parked(session, pools, link, linger, resumed, shutdown));
        Self { resume, task }
    }

    /// Stop recording and hand the link back, if it is still alive.
    pub(crate) async fn resume(self) -> Option<BackendLink> {
        let _ = self.resume.send(());
        self.task.await.ok().flatten()
    }
}

impl std::fmt::Debug for ParkedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParkedLink")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

async fn record_while_parked(
    session: Arc<SessionState>,
    pools: Arc<ConnectionPoolManager>,
    mut link: BackendLink,
    linger: Duration,
    mut resumed: oneshot::Receiver<()>,
    mut shutdown: broadcast::Receiver<()>,
) -> Option<BackendLink> {
    let mut deadline = Instant::now() + linger;
    let outcome = loop {
        tokio::select! {
            biased;
            resume = &mut resumed => match resume {
                Ok(()) => return Some(link),
                Err(_) => break ReleaseOutcome::NotReusable,
            },
            _ = shutdown.recv() => break ReleaseOutcome::NotReusable,
            _ = time::sleep_until(deadline) => {
                tracing::debug!(session = %session.id(), "Parked stream lingered too long");
                break ReleaseOutcome::NotReusable;
            }
            event = link.events.recv() => match event {
                Some(BackendEvent::Frame(payload)) => {
                    session.record(payload);
                    deadline = Instant::now() + linger;
                }
                Some(BackendEvent::End) => {
                    session.mark_ended();
                    break ReleaseOutcome::NotReusable;
                }
                Some(BackendEvent::Failed(reason)) => {
                    tracing::warn!(session = %session.id(), backend = %link.backend_id(), reason = %reason, "Parked stream backend failed");
                    break ReleaseOutcome::Failed;
                }
                None => break ReleaseOutcome::Failed,
            },
        }
    };
    link.close(&pools, outcome);
    None
}
