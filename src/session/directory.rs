//! Stream session directory.
//!
//! Keeps each stream session's sequence counter and replay buffer alive
//! across inbound reconnects, for `retention` after the last connection
//! detaches. A detached session may also hold its parked backend link.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::session::link::ParkedLink;
use crate::session::replay::{Replay, ReplayBuffer};

/// Shared state of one logical stream session.
#[derive(Debug)]
pub struct SessionState {
    id: String,
    replay: Mutex<ReplayBuffer>,
    attached: AtomicUsize,
    last_detached: Mutex<Instant>,
    parked: Mutex<Option<ParkedLink>>,
    /// The backend finished the stream while no client was attached.
    ended: AtomicBool,
}

impl SessionState {
    fn new(id: String, replay_capacity: usize) -> Self {
        Self {
            id,
            replay: Mutex::new(ReplayBuffer::new(replay_capacity)),
            attached: AtomicUsize::new(0),
            last_detached: Mutex::new(Instant::now()),
            parked: Mutex::new(None),
            ended: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sequence and buffer one outgoing frame.
    pub fn record(&self, payload: Bytes) -> u64 {
        self.replay.lock().expect("replay buffer mutex poisoned").push(payload)
    }

    pub fn replay_since(&self, last_seen: u64) -> Replay {
        self.replay.lock().expect("replay buffer mutex poisoned").since(last_seen)
    }

    pub fn next_seq(&self) -> u64 {
        self.replay.lock().expect("replay buffer mutex poisoned").next_seq()
    }

    pub(crate) fn park(&self, link: ParkedLink) {
        *self.parked.lock().expect("session mutex poisoned") = Some(link);
    }

    pub(crate) fn take_parked(&self) -> Option<ParkedLink> {
        self.parked.lock().expect("session mutex poisoned").take()
    }

    pub fn mark_ended(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    fn is_expired(&self, retention: Duration) -> bool {
        self.attached.load(Ordering::SeqCst) == 0
            && self
                .last_detached
                .lock()
                .expect("session mutex poisoned")
                .elapsed()
                >= retention
    }
}

/// One inbound connection's hold on a session. Detaches on drop.
#[derive(Debug)]
pub struct Attachment {
    state: Arc<SessionState>,
    resumed: bool,
}

impl Attachment {
    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    /// Whether the session existed before this connection arrived.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        *self.state.last_detached.lock().expect("session mutex poisoned") = Instant::now();
        self.state.attached.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Session id → retained stream state.
pub struct SessionDirectory {
    sessions: DashMap<String, Arc<SessionState>>,
    replay_capacity: usize,
    retention: Duration,
}

impl SessionDirectory {
    pub fn new(replay_capacity: usize, retention: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            replay_capacity,
            retention,
        }
    }

    /// Attach to the session named `id`, creating it if needed. Without an id
    /// a fresh session with a generated id is created.
    pub fn attach(&self, id: Option<&str>) -> Attachment {
        let id = match id.filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };

        let mut resumed = true;
        let state = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| {
                resumed = false;
                Arc::new(SessionState::new(id, self.replay_capacity))
            })
            .clone();
        state.attached.fetch_add(1, Ordering::SeqCst);
        Attachment { state, resumed }
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionState>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Forget a session that ended for good.
    pub fn finish(&self, id: &str) {
        self.sessions.remove(id);
    }

    /// Drop detached sessions past retention. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.sessions.len();
        let retention = self.retention;
        self.sessions.retain(|_, state| !state.is_expired(retention));
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
