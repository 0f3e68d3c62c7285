//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single backend server and its identity
//! - Track active connections (for weighted least connections)
//! - Hold health state (Unknown/Healthy/Degraded/Unhealthy)
//! - Produce immutable snapshots for selection

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

use crate::config::BackendConfig;

/// Stable backend identifier (the configured backend name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct BackendId(Arc<str>);

impl BackendId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for BackendId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// Protocol spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolClass {
    Tcp,
    Http,
}

/// Where a backend lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BackendTarget {
    pub host: String,
    pub port: u16,
    pub protocol: ProtocolClass,
}

/// Error for unparsable backend addresses.
#[derive(Debug, thiserror::Error)]
#[error("invalid backend address '{address}': {reason}")]
pub struct AddressError {
    pub address: String,
    pub reason: String,
}

impl BackendTarget {
    /// Parse `tcp://host:port`, `http://host:port` or a bare `host:port`.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let with_scheme = if address.contains("://") {
            address.to_string()
        } else {
            format!("tcp://{address}")
        };
        let err = |reason: &str| AddressError {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(&with_scheme).map_err(|e| err(&e.to_string()))?;
        let protocol = match url.scheme() {
            "tcp" => ProtocolClass::Tcp,
            "http" => ProtocolClass::Http,
            _ => return Err(err("unsupported scheme")),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| err("missing host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| err("missing port"))?;

        Ok(Self {
            host,
            port,
            protocol,
        })
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Health State enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    /// Whether the load balancer may pick a backend in this state.
    pub fn is_eligible(self) -> bool {
        matches!(self, HealthState::Healthy | HealthState::Degraded)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct HealthRecord {
    pub(crate) state: HealthState,
    pub(crate) consecutive_failures: u32,
}

/// A single backend server.
///
/// Health is only changed through [`BackendRegistry::report`] and the
/// active count only by the connection pool.
///
/// [`BackendRegistry::report`]: crate::load_balancer::BackendRegistry::report
#[derive(Debug)]
pub struct Backend {
    id: BackendId,
    pool: String,
    target: BackendTarget,
    weight: AtomicU32,
    active_connections: AtomicUsize,
    health: Mutex<HealthRecord>,
    draining: AtomicBool,
}

impl Backend {
    /// Create a new backend in the UNKNOWN state.
    pub fn new(id: BackendId, pool: impl Into<String>, target: BackendTarget, weight: u32) -> Self {
        Self {
            id,
            pool: pool.into(),
            target,
            weight: AtomicU32::new(weight.max(1)),
            active_connections: AtomicUsize::new(0),
            health: Mutex::new(HealthRecord {
                state: HealthState::Unknown,
                consecutive_failures: 0,
            }),
            draining: AtomicBool::new(false),
        }
    }

    /// Build a backend from its configuration entry.
    pub fn from_config(config: &BackendConfig) -> Result<Self, AddressError> {
        let target = BackendTarget::parse(&config.address)?;
        Ok(Self::new(
            BackendId::from(config.name.as_str()),
            config.group.clone(),
            target,
            config.weight,
        ))
    }

    /// Same backend as `config` describes, ignoring weight.
    pub fn matches_config(&self, config: &BackendConfig) -> bool {
        self.id.as_str() == config.name
            && self.pool == config.group
            && BackendTarget::parse(&config.address)
                .map(|t| t == self.target)
                .unwrap_or(false)
    }

    pub fn id(&self) -> &BackendId {
        &self.id
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub(crate) fn set_weight(&self, weight: u32) {
        self.weight.store(weight.max(1), Ordering::Relaxed);
    }

    /// Get the current number of active connections.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement active connection count, returning the new value.
    pub(crate) fn dec_connections(&self) -> usize {
        let prev = self
            .active_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn state(&self) -> HealthState {
        self.record().state
    }

    pub(crate) fn record(&self) -> HealthRecord {
        *self.health.lock().expect("backend health mutex poisoned")
    }

    pub(crate) fn update_record<F>(&self, f: F) -> (HealthRecord, HealthRecord)
    where
        F: FnOnce(HealthRecord) -> HealthRecord,
    {
        let mut guard = self.health.lock().expect("backend health mutex poisoned");
        let before = *guard;
        *guard = f(before);
        (before, *guard)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Immutable view used by selection.
    pub fn snapshot(&self) -> BackendSnapshot {
        let record = self.record();
        BackendSnapshot {
            id: self.id.clone(),
            pool: self.pool.clone(),
            target: self.target.clone(),
            weight: self.weight(),
            state: record.state,
            consecutive_failures: record.consecutive_failures,
            active_connections: self.active_connections(),
            draining: self.is_draining(),
        }
    }
}

/// Point-in-time copy of a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendSnapshot {
    pub id: BackendId,
    pub pool: String,
    pub target: BackendTarget,
    pub weight: u32,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub active_connections: usize,
    pub draining: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_addresses() {
        let bare = BackendTarget::parse("127.0.0.1:9000").unwrap();
        assert_eq!(bare.protocol, ProtocolClass::Tcp);
        assert_eq!(bare.authority(), "127.0.0.1:9000");

        let http = BackendTarget::parse("http://api.internal:8080").unwrap();
        assert_eq!(http.protocol, ProtocolClass::Http);
        assert_eq!(http.host, "api.internal");
        assert_eq!(http.port, 8080);

        let default_port = BackendTarget::parse("http://api.internal").unwrap();
        assert_eq!(default_port.port, 80);

        let v6 = BackendTarget::parse("tcp://[::1]:7000").unwrap();
        assert_eq!(v6.authority(), "[::1]:7000");

        assert!(BackendTarget::parse("ftp://x:1").is_err());
        assert!(BackendTarget::parse("tcp://nohost").is_err());
    }

    #[test]
    fn connection_counter_never_underflows() {
        let backend = Backend::new(
            BackendId::from("a"),
            "api",
            BackendTarget::parse("127.0.0.1:1").unwrap(),
            0,
        );
        assert_eq!(backend.weight(), 1);
        backend.inc_connections();
        assert_eq!(backend.dec_connections(), 0);
        assert_eq!(backend.dec_connections(), 0);
        assert_eq!(backend.snapshot().state, HealthState::Unknown);
    }
}
