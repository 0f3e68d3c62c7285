//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active probes (active.rs):
//!     Per-backend schedule
//!     → ConnectionPoolManager::probe (dedicated connection)
//!     → BackendRegistry::report (source = probe)
//!
//! Passive observations:
//!     Pool manager sees a connect or forwarding error / clean exchange
//!     → BackendRegistry::report (source = traffic)
//!
//! State machine (state.rs):
//!     UNKNOWN → HEALTHY ⇄ DEGRADED → UNHEALTHY → HEALTHY (probe only)
//! ```
//!
//! # Design Decisions
//! - Traffic can degrade and fail a backend but only a probe revives it
//! - Health state is per-backend, not per-pool

pub mod active;
pub mod state;

pub use active::HealthProber;
pub use state::{HealthThresholds, Outcome, ReportSource};
