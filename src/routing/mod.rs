//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound metadata (port, host, path, headers, protocol kind)
//!     → router.rs classify
//!         Opaque → port map → BLIND
//!         framed → rule set (matcher.rs) → CONTENT_AWARE
//!     → Classification { pool, mode, kind }
//!
//! Rule set compilation (startup and reload):
//!     RouteConfig[] + default pool
//!     → Sort by priority (stable)
//!     → Compile matchers
//!     → Swap atomically
//! ```
//!
//! # Design Decisions
//! - No regex in hot path (prefix and exact matching only)
//! - Deterministic: same input always matches same route
//! - Never silently drop: unmatched traffic goes to the default pool

pub mod matcher;
pub mod router;

pub use router::{Classification, Router, RoutingMode, RuleSet};
