//! Route lookup and classification.
//!
//! # Responsibilities
//! - Compile route configs into an immutable, priority-ordered rule set
//! - Classify inbound metadata into (pool, routing mode, session kind)
//! - Swap rule sets atomically on reload
//!
//! # Design Decisions
//! - Rule sets are immutable; readers load one `Arc` and never see a partial set
//! - A rule set without a default pool is rejected at compile time, never at request time
//! - Transport-level traffic is routed by listening port alone
//! - First match wins (ordered by priority, then declaration order)

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::Arc;

use crate::config::{GatewayConfig, RouteConfig};
use crate::error::{GatewayError, Result};
use crate::net::{InboundMetadata, ProtocolKind};
use crate::routing::matcher::{AndMatcher, Matcher};
use crate::session::SessionKind;

/// How a classified connection is forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    /// Opaque bytes, payload never inspected.
    Blind,
    /// Framed, routed on metadata.
    ContentAware,
}

/// Result of classifying one inbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub pool: String,
    pub mode: RoutingMode,
    pub kind: SessionKind,
    /// Name of the matched route; `None` for the default pool or blind traffic.
    pub route: Option<String>,
}

#[derive(Debug)]
struct CompiledRoute {
    name: String,
    pool: String,
    matcher: AndMatcher,
}

/// An immutable, ordered set of routing rules with a mandatory default.
#[derive(Debug)]
pub struct RuleSet {
    routes: Vec<CompiledRoute>,
    default_pool: String,
}

impl RuleSet {
    pub fn compile(routes: &[RouteConfig], default_pool: Option<&str>) -> Result<Self> {
        let default_pool = default_pool
            .filter(|p| !p.is_empty())
            .ok_or_else(|| GatewayError::RuleSetExhausted {
                detail: "rule set has no default pool".to_string(),
            })?
            .to_string();

        let mut ordered: Vec<&RouteConfig> = routes.iter().collect();
        // stable: equal priorities keep declaration order
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let routes = ordered
            .into_iter()
            .map(|route| CompiledRoute {
                name: route.name.clone(),
                pool: route.pool.clone(),
                matcher: AndMatcher::from_route(route),
            })
            .collect();

        Ok(Self { routes, default_pool })
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        Self::compile(&config.routes, config.routing.default_pool.as_deref())
    }

    pub fn default_pool(&self) -> &str {
        &self.default_pool
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn resolve(&self, meta: &InboundMetadata) -> (&str, Option<&str>) {
        self.routes
            .iter()
            .find(|r| r.matcher.matches(meta))
            .map(|r| (r.pool.as_str(), Some(r.name.as_str())))
            .unwrap_or((self.default_pool.as_str(), None))
    }
}

/// Classifies inbound work against the active rule set.
pub struct Router {
    rules: ArcSwap<RuleSet>,
    /// Listening port → pool, for transport-level listeners.
    ports: DashMap<u16, String>,
}

impl Router {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules: ArcSwap::from_pointee(rules),
            ports: DashMap::new(),
        }
    }

    /// Route every blind connection on `port` to `pool`.
    pub fn bind_port(&self, port: u16, pool: impl Into<String>) {
        self.ports.insert(port, pool.into());
    }

    pub fn classify(&self, meta: &InboundMetadata) -> Result<Classification> {
        if meta.kind == ProtocolKind::Opaque {
            let pool = self
                .ports
                .get(&meta.listen_port)
                .map(|p| p.clone())
                .ok_or_else(|| GatewayError::RuleSetExhausted {
                    detail: format!("no pool bound to port {}", meta.listen_port),
                })?;
            return Ok(Classification {
                pool,
                mode: RoutingMode::Blind,
                kind: SessionKind::Stream,
                route: None,
            });
        }

        let rules = self.rules.load();
        let (pool, route) = rules.resolve(meta);
        tracing::trace!(path = %meta.path, pool, route = ?route, "Classified connection");
        Ok(Classification {
            pool: pool.to_string(),
            mode: RoutingMode::ContentAware,
            kind: SessionKind::from(meta.kind),
            route: route.map(str::to_string),
        })
    }

    /// Swap in a new rule set. Classifications already in progress finish on the old one.
    pub fn reload(&self, rules: RuleSet) {
        tracing::info!(routes = rules.len(), default_pool = %rules.default_pool(), "Rule set swapped");
        self.rules.store(Arc::new(rules));
    }

    /// The active rule set.
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.load_full()
    }
}
