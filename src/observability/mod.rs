//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Registry / pool / sessions produce GatewayEvent
//!     → events.rs (EventSink)
//!         → TracingSink: structured log event + metrics.rs update
//!         → MemorySink: collected for inspection
//!
//! logging.rs installs the tracing subscriber (pretty or JSON)
//! metrics.rs exposes Prometheus counters/gauges when enabled
//! ```
//!
//! # Design Decisions
//! - The core emits events; it does not decide how they are persisted
//! - Metrics are cheap (atomic increments) and no-ops without an exporter

pub mod events;
pub mod logging;
pub mod metrics;

pub use events::{EventSink, GatewayEvent, MemorySink, SharedSink, TracingSink};
