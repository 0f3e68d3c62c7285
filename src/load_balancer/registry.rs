//! Backend registry.
//!
//! # Responsibilities
//! - Own the set of known backends, in registration order
//! - Apply health reports through the state machine
//! - Hand out immutable snapshots for selection
//! - Drain deregistered backends instead of cutting them off
//!
//! # Design Decisions
//! - One `RwLock` over the membership list; per-backend health behind its own mutex
//! - Draining backends vanish from `list` immediately and from the registry
//!   once their last connection is released

use std::sync::{Arc, RwLock};

use crate::config::BackendConfig;
use crate::health::state::{transition, HealthThresholds, Outcome, ReportSource};
use crate::load_balancer::backend::{AddressError, Backend, BackendId, BackendSnapshot, HealthState};
use crate::observability::{GatewayEvent, SharedSink};

/// Error for registry mutations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("backend '{0}' is already registered")]
    Duplicate(BackendId),
    #[error(transparent)]
    Address(#[from] AddressError),
}

/// Live set of backends with their health and capacity state.
pub struct BackendRegistry {
    backends: RwLock<Vec<Arc<Backend>>>,
    thresholds: HealthThresholds,
    /// State given to newly registered backends.
    initial_state: HealthState,
    events: SharedSink,
}

impl BackendRegistry {
    pub fn new(thresholds: HealthThresholds, events: SharedSink) -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            thresholds,
            initial_state: HealthState::Unknown,
            events,
        }
    }

    /// Registry whose backends start HEALTHY (used when active probing is off).
    pub fn assume_healthy(mut self) -> Self {
        self.initial_state = HealthState::Healthy;
        self
    }

    pub fn thresholds(&self) -> HealthThresholds {
        self.thresholds
    }

    /// Register every configured backend.
    pub fn register_all(&self, configs: &[BackendConfig]) -> Result<(), RegistryError> {
        for config in configs {
            self.register(Backend::from_config(config)?)?;
        }
        Ok(())
    }

    /// Add a backend. A draining backend with the same id is replaced.
    pub fn register(&self, backend: Backend) -> Result<Arc<Backend>, RegistryError> {
        let backend = Arc::new(backend);
        if self.initial_state != HealthState::Unknown {
            let initial = self.initial_state;
            backend.update_record(|mut r| {
                r.state = initial;
                r
            });
        }

        {
            let mut backends = self.backends.write().expect("registry lock poisoned");
            if let Some(pos) = backends.iter().position(|b| b.id() == backend.id()) {
                if !backends[pos].is_draining() {
                    return Err(RegistryError::Duplicate(backend.id().clone()));
                }
                backends.remove(pos);
            }
            backends.push(backend.clone());
        }

        self.events.emit(GatewayEvent::BackendRegistered {
            backend: backend.id().clone(),
            pool: backend.pool().to_string(),
        });
        Ok(backend)
    }

    /// Mark a backend for drain. Returns false if it was unknown.
    pub fn deregister(&self, id: &BackendId) -> bool {
        let found = {
            let mut backends = self.backends.write().expect("registry lock poisoned");
            match backends.iter().position(|b| b.id() == id && !b.is_draining()) {
                Some(pos) => {
                    let backend = backends[pos].clone();
                    backend.mark_draining();
                    if backend.active_connections() == 0 {
                        backends.remove(pos);
                    }
                    true
                }
                None => false,
            }
        };
        if found {
            self.events.emit(GatewayEvent::BackendDeregistered { backend: id.clone() });
        }
        found
    }

    /// Snapshot of the selectable members of `pool`, in registration order.
    pub fn list(&self, pool: &str) -> Vec<BackendSnapshot> {
        self.backends
            .read()
            .expect("registry lock poisoned")
            .iter()
            .filter(|b| b.pool() == pool && !b.is_draining())
            .map(|b| b.snapshot())
            .collect()
    }

    /// Snapshot of every backend, draining ones included.
    pub fn all(&self) -> Vec<BackendSnapshot> {
        self.backends
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|b| b.snapshot())
            .collect()
    }

    /// Live handle for a non-draining backend.
    pub fn get(&self, id: &BackendId) -> Option<Arc<Backend>> {
        self.backends
            .read()
            .expect("registry lock poisoned")
            .iter()
            .find(|b| b.id() == id && !b.is_draining())
            .cloned()
    }

    pub fn snapshot(&self, id: &BackendId) -> Option<BackendSnapshot> {
        self.get(id).map(|b| b.snapshot())
    }

    /// Apply a success/failure observation. Returns the resulting state.
    pub fn report(&self, id: &BackendId, outcome: Outcome, source: ReportSource) -> Option<HealthState> {
        let backend = self.get(id)?;
        Some(self.report_on(&backend, outcome, source))
    }

    pub(crate) fn report_on(&self, backend: &Backend, outcome: Outcome, source: ReportSource) -> HealthState {
        let thresholds = self.thresholds;
        let (before, after) = backend.update_record(|mut r| {
            let (state, failures) = transition(r.state, r.consecutive_failures, outcome, source, thresholds);
            r.state = state;
            r.consecutive_failures = failures;
            r
        });

        if before.state != after.state {
            self.events.emit(GatewayEvent::BackendStateChanged {
                backend: backend.id().clone(),
                from: before.state,
                to: after.state,
            });
        }
        after.state
    }

    /// Apply a reloaded backend list: add new, drain removed, update weights.
    pub fn reconcile(&self, configs: &[BackendConfig]) -> Result<(), RegistryError> {
        let current: Vec<Arc<Backend>> = self
            .backends
            .read()
            .expect("registry lock poisoned")
            .iter()
            .filter(|b| !b.is_draining())
            .cloned()
            .collect();

        for backend in &current {
            match configs.iter().find(|c| c.name == backend.id().as_str()) {
                Some(config) if backend.matches_config(config) => backend.set_weight(config.weight),
                _ => {
                    self.deregister(backend.id());
                }
            }
        }

        for config in configs {
            let unchanged = current.iter().any(|b| b.matches_config(config));
            if !unchanged {
                self.register(Backend::from_config(config)?)?;
            }
        }
        Ok(())
    }

    pub(crate) fn connection_opened(&self, backend: &Backend) {
        backend.inc_connections();
    }

    /// Drop the active count; forget a drained backend once it reaches zero.
    ///
    /// The draining flag and the count are both sequentially consistent, so
    /// either this call or `deregister` observes the other's write.
    pub(crate) fn connection_closed(&self, backend: &Arc<Backend>) {
        if backend.dec_connections() == 0 && backend.is_draining() {
            let mut backends = self.backends.write().expect("registry lock poisoned");
            if backend.active_connections() == 0 {
                backends.retain(|b| !Arc::ptr_eq(b, backend));
            }
        }
    }
}
