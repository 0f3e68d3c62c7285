//! Idempotency records.
//!
//! # Responsibilities
//! - At most one forwarding attempt in flight per key
//! - Concurrent arrivals with the same key wait for that attempt's outcome
//! - Retain successful outcomes for a bounded TTL
//!
//! # Design Decisions
//! - Failed outcomes are handed to concurrent waiters but not retained, so a
//!   later retry forwards again
//! - If the leading attempt is abandoned (its future dropped) one waiter takes over

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug)]
enum Record<T> {
    InFlight(watch::Receiver<Option<T>>),
    Done { value: T, at: Instant },
}

enum Claim<T> {
    Lead(watch::Sender<Option<T>>),
    Wait(watch::Receiver<Option<T>>),
    Cached(T),
}

/// Key → outcome store shared by all sessions.
pub struct IdempotencyStore<T> {
    records: Arc<DashMap<String, Record<T>>>,
    ttl: Duration,
}

impl<T> Clone for IdempotencyStore<T> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            ttl: self.ttl,
        }
    }
}

/// How an outcome was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// This caller ran the operation.
    Executed,
    /// Another in-flight caller ran it.
    Joined,
    /// A retained outcome was returned.
    Cached,
}

impl<T> IdempotencyStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            ttl,
        }
    }

    fn claim(&self, key: &str) -> Claim<T> {
        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let reuse = match occupied.get() {
                    Record::InFlight(rx) => Some(Claim::Wait(rx.clone())),
                    Record::Done { value, at } if at.elapsed() < self.ttl => Some(Claim::Cached(value.clone())),
                    Record::Done { .. } => None,
                };
                reuse.unwrap_or_else(|| {
                    let (tx, rx) = watch::channel(None);
                    occupied.insert(Record::InFlight(rx));
                    Claim::Lead(tx)
                })
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(Record::InFlight(rx));
                Claim::Lead(tx)
            }
        }
    }

    /// Run `op` under `key` unless an outcome is in flight or retained.
    /// `retain` decides whether a fresh outcome is kept for later arrivals.
    pub async fn execute<F, Fut>(&self, key: &str, retain: impl Fn(&T) -> bool, op: F) -> (T, Resolution)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut op = Some(op);
        loop {
            match self.claim(key) {
                Claim::Cached(value) => return (value, Resolution::Cached),
                Claim::Wait(mut rx) => {
                    let outcome = rx.wait_for(|v| v.is_some()).await.map(|v| v.clone());
                    match outcome {
                        Ok(Some(value)) => return (value, Resolution::Joined),
                        // leader abandoned; its guard already cleared the record
                        _ => continue,
                    }
                }
                Claim::Lead(tx) => {
                    let guard = LeadGuard {
                        records: &self.records,
                        key,
                        armed: true,
                    };
                    let Some(op) = op.take() else {
                        drop(guard);
                        continue;
                    };
                    let value = op().await;
                    guard.settle(&value, retain(&value));
                    let _ = tx.send(Some(value.clone()));
                    return (value, Resolution::Executed);
                }
            }
        }
    }

    /// Drop retained outcomes past the TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.records.len();
        let ttl = self.ttl;
        self.records.retain(|_, record| match record {
            Record::Done { at, .. } => at.elapsed() < ttl,
            Record::InFlight(_) => true,
        });
        before.saturating_sub(self.records.len())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Clears the in-flight record if the leading attempt never settles.
struct LeadGuard<'a, T> {
    records: &'a DashMap<String, Record<T>>,
    key: &'a str,
    armed: bool,
}

impl<T: Clone> LeadGuard<'_, T> {
    fn settle(mut self, value: &T, retain: bool) {
        self.armed = false;
        if retain {
            self.records.insert(
                self.key.to_string(),
                Record::Done {
                    value: value.clone(),
                    at: Instant::now(),
                },
            );
        } else {
            self.records.remove(self.key);
        }
    }
}

impl<T> Drop for LeadGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.records
                .remove_if(self.key, |_, record| matches!(record, Record::InFlight(_)));
        }
    }
}
