//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! On reload (file change, SIGHUP, admin API):
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → gateway applies it: rule set swapped, backends registered/drained
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, BackendConfig, ConnectionPoolConfig, GatewayConfig, HeaderMatchConfig,
    HealthCheckConfig, IdempotencyConfig, LifecycleConfig, ListenerConfig, ListenerMode,
    LogFormat, ObservabilityConfig, ProbeKind, RouteConfig, RoutingConfig, SessionConfig,
};
