//! Outbound connection pooling.
//!
//! # Data Flow
//! ```text
//! Session
//!     → manager.rs acquire (permit, idle reuse or fresh connect)
//!     → connection.rs PooledConnection (IN_USE, one owner)
//!     → manager.rs release (IDLE, or CLOSING on error)
//!
//! Health prober
//!     → manager.rs probe → probe.rs (dedicated connection, no counters)
//! ```

pub mod connection;
pub mod manager;
mod probe;

pub use connection::PooledConnection;
pub use manager::{AcquirePolicy, ConnectionPoolManager, ReleaseOutcome};
