//! Accept/dispatch pipeline.
//!
//! # Data Flow
//! ```text
//! InboundListener::accept (worker permit held)
//!     → handshake (preamble) in the worker task
//!     → Router::classify
//!     → Blind        → blind.rs (byte splice)
//!     → ContentAware → session::unary | session::stream
//!     → close: connection released, tracker decremented, permit returned
//! ```

pub mod blind;
pub mod pipeline;

pub use pipeline::{Gateway, SetupError};
