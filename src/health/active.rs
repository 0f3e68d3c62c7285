//! Active health checking.
//!
//! # Responsibilities
//! - Probe every registered backend on its own schedule, independent of traffic
//! - Feed probe outcomes into the registry's state machine
//! - Back off geometrically (capped) while a backend stays UNHEALTHY

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time;

use crate::config::HealthCheckConfig;
use crate::health::state::{Outcome, ReportSource};
use crate::load_balancer::{Backend, BackendId, BackendRegistry, HealthState};
use crate::observability::metrics;
use crate::pool::ConnectionPoolManager;
use crate::resilience::backoff::probe_interval;

#[derive(Debug, Clone, Copy)]
struct ProbeSchedule {
    next_due: Instant,
    interval: Duration,
    /// Failed probes in a row while UNHEALTHY.
    failed_unhealthy: u32,
}

pub struct HealthProber {
    registry: Arc<BackendRegistry>,
    pools: Arc<ConnectionPoolManager>,
    config: HealthCheckConfig,
    schedule: Mutex<HashMap<BackendId, ProbeSchedule>>,
}

impl HealthProber {
    pub fn new(registry: Arc<BackendRegistry>, pools: Arc<ConnectionPoolManager>, config: HealthCheckConfig) -> Self {
        Self {
            registry,
            pools,
            config,
            schedule: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Active health checks disabled");
            return;
        }

        tracing::info!(
            interval_ms = self.config.interval_ms,
            max_interval_ms = self.config.max_interval_ms,
            kind = ?self.config.kind,
            "Health prober starting"
        );

        let mut ticker = time::interval(self.config.interval().min(Duration::from_millis(250)));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_due().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health prober received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every backend whose interval has elapsed. Returns how many were probed.
    pub async fn probe_due(&self) -> usize {
        let now = Instant::now();
        let live: Vec<Arc<Backend>> = self
            .registry
            .all()
            .into_iter()
            .filter_map(|snapshot| self.registry.get(&snapshot.id))
            .collect();

        let due: Vec<Arc<Backend>> = {
            let mut schedule = self.schedule.lock().expect("probe schedule mutex poisoned");
            schedule.retain(|id, _| live.iter().any(|b| b.id() == id));
            live.into_iter()
                .filter(|b| schedule.get(b.id()).map_or(true, |s| s.next_due <= now))
                .collect()
        };

        let probed = due.len();
        join_all(due.iter().map(|backend| self.probe_once(backend))).await;
        probed
    }

    /// Probe one backend now and reschedule it.
    pub async fn probe_once(&self, backend: &Backend) -> HealthState {
        let outcome = match self
            .pools
            .probe(backend, self.config.kind, &self.config.path, self.config.timeout())
            .await
        {
            Ok(()) => Outcome::Success,
            Err(e) => {
                tracing::warn!(backend = %backend.id(), error = %e, "Health probe failed");
                Outcome::Failure
            }
        };

        let state = self.registry.report_on(backend, outcome, ReportSource::Probe);
        metrics::record_backend_health(backend.id().as_str(), state);

        let mut schedule = self.schedule.lock().expect("probe schedule mutex poisoned");
        let entry = schedule.entry(backend.id().clone()).or_insert(ProbeSchedule {
            next_due: Instant::now(),
            interval: self.config.interval(),
            failed_unhealthy: 0,
        });
        entry.failed_unhealthy = match (outcome, state) {
            (Outcome::Failure, HealthState::Unhealthy) => entry.failed_unhealthy.saturating_add(1),
            _ => 0,
        };
        entry.interval = probe_interval(entry.failed_unhealthy, self.config.interval(), self.config.max_interval());
        entry.next_due = Instant::now() + entry.interval;
        if entry.failed_unhealthy > 0 {
            tracing::debug!(
                backend = %backend.id(),
                next_probe_ms = entry.interval.as_millis() as u64,
                "Backing off probes of unhealthy backend"
            );
        }
        state
    }

    /// Current probe interval for a backend, once it has been probed.
    pub fn current_interval(&self, id: &BackendId) -> Option<Duration> {
        self.schedule
            .lock()
            .expect("probe schedule mutex poisoned")
            .get(id)
            .map(|s| s.interval)
    }
}
