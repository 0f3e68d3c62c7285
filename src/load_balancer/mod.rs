//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Router picks a pool
//!     → registry.rs (immutable snapshot of the pool's backends)
//!     → balancer.rs (affinity hint, exclusion)
//!     → least_conn.rs (HEALTHY else DEGRADED, weighted least connections,
//!                      rotating tie-break)
//!     → BackendSnapshot handed to the connection pool
//! ```
//!
//! # Design Decisions
//! - The registry is the only owner of backend state; selection works on copies
//! - Unhealthy and unknown backends are never selected
//! - Active connection counts are maintained by the connection pool

pub mod affinity;
pub mod backend;
pub mod balancer;
pub mod least_conn;
pub mod registry;

pub use affinity::AffinityTable;
pub use backend::{Backend, BackendId, BackendSnapshot, BackendTarget, HealthState, ProtocolClass};
pub use balancer::{LoadBalancer, RoutingHint};
pub use registry::{BackendRegistry, RegistryError};
