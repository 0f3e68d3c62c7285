//! Sticky routing table.
//!
//! Maps `(pool, affinity key)` to the backend that served it last. Entries
//! idle longer than the TTL are swept.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::load_balancer::backend::BackendId;

#[derive(Debug)]
pub struct AffinityTable {
    entries: DashMap<(String, String), (BackendId, Instant)>,
    ttl: Duration,
}

impl AffinityTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Pinned backend for `key`, refreshing its timestamp.
    pub fn lookup(&self, pool: &str, key: &str) -> Option<BackendId> {
        let mut entry = self.entries.get_mut(&(pool.to_string(), key.to_string()))?;
        entry.1 = Instant::now();
        Some(entry.0.clone())
    }

    pub fn pin(&self, pool: &str, key: &str, backend: BackendId) {
        self.entries
            .insert((pool.to_string(), key.to_string()), (backend, Instant::now()));
    }

    /// Remove entries idle past the TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, (_, seen)| seen.elapsed() < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_and_lookup() {
        let table = AffinityTable::new(Duration::from_secs(60));
        table.pin("api", "user-1", BackendId::from("a"));
        assert_eq!(table.lookup("api", "user-1"), Some(BackendId::from("a")));
        assert_eq!(table.lookup("other", "user-1"), None);
    }

    #[test]
    fn sweep_drops_expired() {
        let table = AffinityTable::new(Duration::ZERO);
        table.pin("api", "k", BackendId::from("a"));
        assert_eq!(table.sweep(), 1);
        assert!(table.is_empty());
    }
}
