//! MQTT Connector - Rust Implementation
//!
//! A client-side connector keeping a publish/subscribe session alive over an
//! MQTT broker reached through WebSocket.
//!
//! # Overview
//!
//! The crate provides:
//! - A connection lifecycle manager with bounded, cancellable retry
//! - A race-free view of connection state and inbound message history
//! - A transport provider contract, with a `rumqttc` implementation
//! - A JSON message envelope and its parsing helpers
//! - TOML configuration with broker presets
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_connector::config::ConnectionConfig;
//! use mqtt_connector::connector::{ConnectionManager, ConnectionState, RetryPolicy};
//! use mqtt_connector::testing::MockTransportProvider;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let provider = MockTransportProvider::always_succeed();
//! let manager = ConnectionManager::start(
//!     ConnectionConfig::new("broker.hivemq.com").with_client_id("quick-start"),
//!     RetryPolicy::default(),
//!     Arc::new(provider.clone()),
//! )
//! .unwrap();
//!
//! manager
//!     .wait_until_connected(Duration::from_secs(1))
//!     .await
//!     .unwrap();
//! assert_eq!(manager.current_state(), ConnectionState::Connected);
//!
//! provider.deliver_message(0, "psu/drone", "{\"message\":\"hello\"}");
//! manager
//!     .wait_for_state(|s| s.messages_received == 1, Duration::from_secs(1))
//!     .await
//!     .unwrap();
//! assert_eq!(manager.messages(), vec!["{\"message\":\"hello\"}".to_string()]);
//!
//! manager.shutdown().await;
//! # });
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{ConnectionConfig, ConnectorConfig};
pub use connector::{ConnectionManager, ConnectionState, ConnectorSnapshot, RetryPolicy};
pub use error::{ConnectorError, ConnectorResult};
pub use protocol::MessageEnvelope;
pub use transport::mqtt::RumqttProvider;
