//! Observability for the connector
//!
//! Structured logging via `tracing`, with span macros for the driver task
//! and individual transport sessions.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{connector_span, session_span};
