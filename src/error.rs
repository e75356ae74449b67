//! Crate-level error types
//!
//! Only two kinds of failure ever reach a caller of the connector: a
//! configuration problem at start time and misuse after teardown. Transport
//! failures are absorbed by the retry policy and surface as state instead.

use crate::config::ConfigError;
use crate::connector::ConnectionState;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for connector operations
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to serialize message envelope: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection manager has been torn down")]
    TornDown,

    #[error("Timed out waiting for connection state (last state: {state})")]
    Timeout { state: ConnectionState },

    #[error("Connection ended in state {state}")]
    NotConnected { state: ConnectionState },
}

impl ConnectorError {
    /// True for errors caused by the caller's configuration
    pub fn is_config_error(&self) -> bool {
        matches!(self, ConnectorError::Config(_))
    }
}

/// Result type for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;
