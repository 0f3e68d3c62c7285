//! Protocol-aware reverse proxy and load balancer for long-lived streams.

pub mod admin;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod pool;
pub mod resilience;
pub mod routing;
pub mod session;

#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;

pub use config::GatewayConfig;
pub use dispatch::Gateway;
pub use error::{GatewayError, Result};
pub use lifecycle::Shutdown;
