//! Backend selection.
//!
//! # Responsibilities
//! - Restrict candidates to HEALTHY (else DEGRADED) members of a pool
//! - Apply weighted least connections with per-pool rotation
//! - Honor affinity hints while the pinned backend stays eligible

use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::load_balancer::affinity::AffinityTable;
use crate::load_balancer::backend::{BackendId, BackendSnapshot};
use crate::load_balancer::least_conn;
use crate::load_balancer::registry::BackendRegistry;

/// Caller-provided routing preference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RoutingHint {
    #[default]
    None,
    /// Sticky key (session id, user token, ...).
    Affinity(String),
}

impl RoutingHint {
    pub fn affinity(key: Option<&str>) -> Self {
        match key {
            Some(k) if !k.is_empty() => RoutingHint::Affinity(k.to_string()),
            _ => RoutingHint::None,
        }
    }
}

/// Picks backends from the registry's current snapshot.
pub struct LoadBalancer {
    registry: Arc<BackendRegistry>,
    rotation: DashMap<String, usize>,
    affinity: AffinityTable,
}

impl LoadBalancer {
    pub fn new(registry: Arc<BackendRegistry>, affinity: AffinityTable) -> Self {
        Self {
            registry,
            rotation: DashMap::new(),
            affinity,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn affinity(&self) -> &AffinityTable {
        &self.affinity
    }

    /// Select a backend for `pool`.
    pub fn select(&self, pool: &str, hint: &RoutingHint) -> Result<BackendSnapshot> {
        self.select_inner(pool, hint, None)
    }

    /// Like [`select`](Self::select) but avoids `exclude` when any other
    /// backend is eligible.
    pub fn select_excluding(&self, pool: &str, hint: &RoutingHint, exclude: &BackendId) -> Result<BackendSnapshot> {
        self.select_inner(pool, hint, Some(exclude))
    }

    fn select_inner(&self, pool: &str, hint: &RoutingHint, exclude: Option<&BackendId>) -> Result<BackendSnapshot> {
        let snapshot = self.registry.list(pool);

        if let RoutingHint::Affinity(key) = hint {
            if let Some(pinned) = self.affinity.lookup(pool, key) {
                if exclude != Some(&pinned) {
                    if let Some(b) = snapshot.iter().find(|b| b.id == pinned && b.state.is_eligible()) {
                        return Ok(b.clone());
                    }
                }
            }
        }

        let mut candidates = least_conn::eligible(&snapshot);
        if let Some(exclude) = exclude {
            let others: Vec<_> = candidates.iter().copied().filter(|b| &b.id != exclude).collect();
            if !others.is_empty() {
                candidates = others;
            }
        }

        let rotation = {
            let mut counter = self.rotation.entry(pool.to_string()).or_insert(0);
            let current = *counter;
            *counter = counter.wrapping_add(1);
            current
        };

        let chosen = least_conn::pick(&candidates, rotation)
            .cloned()
            .ok_or_else(|| {
                tracing::debug!(pool = %pool, backend_count = snapshot.len(), "No eligible backend");
                GatewayError::NoHealthyBackend { pool: pool.to_string() }
            })?;

        if let RoutingHint::Affinity(key) = hint {
            self.affinity.pin(pool, key, chosen.id.clone());
        }
        Ok(chosen)
    }
}
