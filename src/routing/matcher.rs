//! Route matching logic.
//!
//! # Responsibilities
//! - Match host (exact match, case-insensitive)
//! - Match path prefix (case-sensitive)
//! - Match a header's presence or exact value
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Empty condition = always matches (wildcard)
//! - No regex to guarantee O(n) matching
//! - Matchers only ever see metadata, never payload bytes

use crate::config::RouteConfig;
use crate::net::InboundMetadata;

/// Trait for matching inbound metadata against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the metadata matches this condition.
    fn matches(&self, meta: &InboundMetadata) -> bool;
}

/// Matches the host, taken from the metadata or a `host` header.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// The host is normalized to lowercase for case-insensitive matching.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_lowercase(),
        }
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, meta: &InboundMetadata) -> bool {
        meta.host
            .as_deref()
            .or_else(|| meta.header("host"))
            .map(|h| h.eq_ignore_ascii_case(&self.expected_host))
            .unwrap_or(false)
    }
}

/// Matches the path prefix.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, meta: &InboundMetadata) -> bool {
        meta.path.starts_with(&self.prefix)
    }
}

/// Matches a header by name, optionally requiring an exact value.
#[derive(Debug, Clone)]
pub struct HeaderMatcher {
    name: String,
    value: Option<String>,
}

impl HeaderMatcher {
    pub fn new(name: impl Into<String>, value: Option<String>) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            value,
        }
    }
}

impl Matcher for HeaderMatcher {
    fn matches(&self, meta: &InboundMetadata) -> bool {
        match (meta.header(&self.name), &self.value) {
            (Some(actual), Some(expected)) => actual == expected,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }

    /// Build the conjunction of every condition a route declares.
    pub fn from_route(route: &RouteConfig) -> Self {
        let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
        if let Some(host) = &route.host {
            matchers.push(Box::new(HostMatcher::new(host.clone())));
        }
        if let Some(prefix) = &route.path_prefix {
            matchers.push(Box::new(PathPrefixMatcher::new(prefix.clone())));
        }
        if let Some(header) = &route.header {
            matchers.push(Box::new(HeaderMatcher::new(header.name.clone(), header.value.clone())));
        }
        Self::new(matchers)
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, meta: &InboundMetadata) -> bool {
        self.matchers.iter().all(|m| m.matches(meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeaderMatchConfig;
    use crate::net::ProtocolKind;

    fn meta(path: &str) -> InboundMetadata {
        InboundMetadata::application(8080, path, ProtocolKind::Unary)
    }

    #[test]
    fn test_host_matcher() {
        let matcher = HostMatcher::new("example.com");
        assert!(matcher.matches(&meta("/").with_host("example.com")));
        assert!(matcher.matches(&meta("/").with_host("EXAMPLE.COM"))); // Case insensitive
        assert!(matcher.matches(&meta("/").with_header("Host", "example.com")));
        assert!(!matcher.matches(&meta("/").with_host("other.com")));
        assert!(!matcher.matches(&meta("/")));
    }

    #[test]
    fn test_path_matcher() {
        let matcher = PathPrefixMatcher::new("/api");
        assert!(matcher.matches(&meta("/api/v1")));
        assert!(!matcher.matches(&meta("/images")));
        assert!(!matcher.matches(&meta("/API")));
    }

    #[test]
    fn header_presence_and_value() {
        let present = HeaderMatcher::new("X-Tenant", None);
        let exact = HeaderMatcher::new("x-tenant", Some("blue".to_string()));

        let blue = meta("/").with_header("x-tenant", "blue");
        let green = meta("/").with_header("X-Tenant", "green");
        assert!(present.matches(&blue) && present.matches(&green));
        assert!(exact.matches(&blue));
        assert!(!exact.matches(&green));
        assert!(!present.matches(&meta("/")));
    }

    #[test]
    fn route_conditions_are_conjunctive() {
        let route = RouteConfig {
            name: "tenant-api".to_string(),
            host: None,
            path_prefix: Some("/api".to_string()),
            header: Some(HeaderMatchConfig {
                name: "x-tenant".to_string(),
                value: Some("blue".to_string()),
            }),
            pool: "blue".to_string(),
            priority: 0,
        };
        let matcher = AndMatcher::from_route(&route);
        assert!(matcher.matches(&meta("/api/x").with_header("x-tenant", "blue")));
        assert!(!matcher.matches(&meta("/api/x")));
        assert!(!matcher.matches(&meta("/web").with_header("x-tenant", "blue")));

        let wildcard = AndMatcher::new(Vec::new());
        assert!(wildcard.matches(&meta("/anything")));
    }
}
