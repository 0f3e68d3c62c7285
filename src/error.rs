//! Gateway error taxonomy.
//!
//! Every failure that can reach a caller of the data plane is one of these
//! variants. Retriable variants map to a service-unavailable reply for unary
//! sessions; `StreamFailed` is terminal for streaming sessions.

use crate::load_balancer::BackendId;
use crate::net::CodecError;

/// Errors surfaced by the gateway core.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No backend in the pool is HEALTHY or DEGRADED.
    #[error("no healthy backend in pool '{pool}'")]
    NoHealthyBackend { pool: String },

    /// The backend's pool is exhausted.
    #[error("no connection capacity for backend '{backend}'")]
    NoCapacity { backend: BackendId },

    /// Connecting to the backend failed, or the backend is gone.
    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: BackendId, reason: String },

    /// A streaming session could not be kept alive across failover.
    #[error("stream failed: {reason}")]
    StreamFailed { reason: String },

    /// No routing rule matched and no default pool exists.
    #[error("no routing rule matched: {detail}")]
    RuleSetExhausted { detail: String },

    /// An operation exceeded its deadline.
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    /// Malformed frame on either side.
    #[error("frame error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Whether a caller may retry the same unit of work later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            GatewayError::NoHealthyBackend { .. }
                | GatewayError::NoCapacity { .. }
                | GatewayError::BackendUnavailable { .. }
                | GatewayError::Timeout { .. }
        )
    }

    /// Short, stable code sent to clients in unavailable replies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NoHealthyBackend { .. } => "no_healthy_backend",
            GatewayError::NoCapacity { .. } => "no_capacity",
            GatewayError::BackendUnavailable { .. } => "backend_unavailable",
            GatewayError::StreamFailed { .. } => "stream_failed",
            GatewayError::RuleSetExhausted { .. } => "no_route",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::Codec(_) => "bad_frame",
            GatewayError::Io(_) => "io",
        }
    }
}

impl From<CodecError> for GatewayError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => GatewayError::Io(e),
            other => GatewayError::Codec(other.to_string()),
        }
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        assert!(GatewayError::NoHealthyBackend { pool: "api".into() }.is_retriable());
        assert!(GatewayError::NoCapacity { backend: BackendId::from("a") }.is_retriable());
        assert!(!GatewayError::StreamFailed { reason: "x".into() }.is_retriable());
        assert!(!GatewayError::RuleSetExhausted { detail: "x".into() }.is_retriable());
    }

    #[test]
    fn codec_errors_keep_io_distinct() {
        let truncated = GatewayError::from(CodecError::Truncated);
        assert_eq!(truncated.code(), "bad_frame");
        let io = GatewayError::from(CodecError::Io(std::io::ErrorKind::BrokenPipe.into()));
        assert_eq!(io.code(), "io");
    }
}
