//! Resilience helpers.
//!
//! # Data Flow
//! ```text
//! Backend work:
//!     → timeouts.rs (every acquire, exchange and probe has a deadline)
//!     → On NoCapacity: backoff.rs (jittered pause before the one reselect)
//!     → Unhealthy backends: backoff.rs (probe interval doubling, capped)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Retries are bounded to a single reselect; there is no retry budget

pub mod backoff;
pub mod timeouts;
