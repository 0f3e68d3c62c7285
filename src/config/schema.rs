//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Inbound listeners.
    pub listeners: Vec<ListenerConfig>,

    /// Backend server definitions, grouped into pools by `group`.
    pub backends: Vec<BackendConfig>,

    /// Default pool for content-aware routing.
    pub routing: RoutingConfig,

    /// Content-aware routing rules.
    pub routes: Vec<RouteConfig>,

    /// Active health check settings.
    pub health_check: HealthCheckConfig,

    /// Outbound connection pool settings.
    pub connection_pool: ConnectionPoolConfig,

    /// Session multiplexer settings.
    pub sessions: SessionConfig,

    /// Idempotency key handling.
    pub idempotency: IdempotencyConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API.
    pub admin: AdminConfig,

    /// Startup/shutdown behavior.
    pub lifecycle: LifecycleConfig,
}

impl GatewayConfig {
    /// Names of every pool that has at least one backend.
    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.iter().map(|b| b.group.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

/// How a listener's connections are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerMode {
    /// Opaque byte stream, routed by listening port only.
    Transport,
    /// Framed connections carrying a metadata preamble.
    Application,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Listener identifier for logging.
    pub name: String,

    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    pub mode: ListenerMode,

    /// Pool for transport-mode listeners.
    #[serde(default)]
    pub pool: Option<String>,
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BackendConfig {
    /// Unique backend identifier.
    pub name: String,

    /// Pool this server belongs to.
    pub group: String,

    /// Backend address: "tcp://host:port", "http://host:port" or "host:port".
    pub address: String,

    /// Weight for weighted least-connections (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Content-aware routing defaults.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RoutingConfig {
    /// Pool used when no route matches. Required.
    pub default_pool: Option<String>,
}

/// Header equality condition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaderMatchConfig {
    pub name: String,
    /// Exact value; when absent the header only has to be present.
    #[serde(default)]
    pub value: Option<String>,
}

/// Route configuration mapping inbound metadata to a pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host to match (exact match, case-insensitive).
    #[serde(default)]
    pub host: Option<String>,

    /// Path prefix to match.
    #[serde(default)]
    pub path_prefix: Option<String>,

    /// Header condition.
    #[serde(default)]
    pub header: Option<HeaderMatchConfig>,

    /// Pool to forward to.
    pub pool: String,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,
}

/// Active probe flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// A TCP connect is enough.
    Connect,
    /// HTTP/1.1 GET on `path` must return 2xx. Falls back to `connect`
    /// for backends declared as plain TCP.
    Http,
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks. When disabled, backends start HEALTHY.
    pub enabled: bool,

    pub kind: ProbeKind,

    /// Path to probe for HTTP health checks.
    pub path: String,

    /// Base probe interval in milliseconds.
    pub interval_ms: u64,

    /// Ceiling for the unhealthy backoff in milliseconds.
    pub max_interval_ms: u64,

    /// Probe deadline in milliseconds.
    pub timeout_ms: u64,

    /// Consecutive failures before HEALTHY becomes DEGRADED.
    pub soft_failure_threshold: u32,

    /// Consecutive failures before a backend becomes UNHEALTHY.
    pub hard_failure_threshold: u32,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: ProbeKind::Connect,
            path: "/health".to_string(),
            interval_ms: 5_000,
            max_interval_ms: 60_000,
            timeout_ms: 2_000,
            soft_failure_threshold: 1,
            hard_failure_threshold: 3,
        }
    }
}

/// Outbound connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    /// Maximum IN_USE connections per backend.
    pub max_size: usize,

    /// Maximum IDLE connections kept per backend.
    pub max_idle: usize,

    /// Idle connections older than this are closed.
    pub idle_timeout_secs: u64,

    /// Backend connect deadline in milliseconds.
    pub connect_timeout_ms: u64,

    /// How long a stream session may wait for pool capacity.
    pub stream_acquire_timeout_ms: u64,

    /// How often the idle reaper runs.
    pub reap_interval_secs: u64,
}

impl ConnectionPoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stream_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_acquire_timeout_ms)
    }
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_size: 64,
            max_idle: 16,
            idle_timeout_secs: 60,
            connect_timeout_ms: 2_000,
            stream_acquire_timeout_ms: 1_000,
            reap_interval_secs: 10,
        }
    }
}

/// Session multiplexer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on concurrently supervised inbound connections.
    pub max_sessions: usize,

    /// Deadline for a unary backend response in milliseconds.
    pub request_timeout_ms: u64,

    /// Stream sessions with no backend frame for this long are torn down.
    pub stream_idle_timeout_secs: u64,

    /// Frames retained per stream for resumption.
    pub replay_buffer_size: usize,

    /// How long a finished stream's replay state is kept for reconnects.
    pub retention_secs: u64,

    /// Largest accepted frame in bytes.
    pub max_frame_bytes: usize,

    /// Header carrying the stream session id.
    pub session_header: String,

    /// Header carrying the last sequence number a client has seen.
    pub last_sequence_header: String,

    /// Header used as a sticky routing key.
    pub affinity_header: String,
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10_000,
            request_timeout_ms: 30_000,
            stream_idle_timeout_secs: 120,
            replay_buffer_size: 256,
            retention_secs: 300,
            max_frame_bytes: 4 * 1024 * 1024,
            session_header: "x-session-id".to_string(),
            last_sequence_header: "last-event-id".to_string(),
            affinity_header: "x-affinity-key".to_string(),
        }
    }
}

/// Idempotency key configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub enabled: bool,

    /// Header carrying the client's idempotency key.
    pub header: String,

    /// How long a recorded outcome is replayed.
    pub ttl_secs: u64,
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            header: "idempotency-key".to_string(),
            ttl_secs: 600,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long in-flight sessions may drain after shutdown starts.
    pub drain_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { drain_timeout_secs: 30 }
    }
}
