//! Connection lifecycle management
//!
//! - [`state`] - connection states, retry policy and the published snapshot
//! - [`buffer`] - newest-first message history
//! - [`session`] - sole owner of one transport session
//! - [`health_monitor`] - pure retry and gating decisions
//! - [`lifecycle`] - the transition function
//! - [`manager`] - the tokio task driving it
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_connector::config::ConnectionConfig;
//! use mqtt_connector::connector::{ConnectionManager, RetryPolicy};
//! use mqtt_connector::transport::mqtt::RumqttProvider;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = ConnectionConfig::new("broker.hivemq.com").with_port(8000);
//! let manager = ConnectionManager::start(
//!     config,
//!     RetryPolicy::default(),
//!     Arc::new(RumqttProvider::new()),
//! )?;
//!
//! manager.wait_until_connected(Duration::from_secs(10)).await?;
//! manager.subscribe("psu/drone")?;
//! manager.publish_envelope("psu/drone", "hello")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod buffer;
pub mod health_monitor;
pub mod lifecycle;
pub mod manager;
pub mod session;
pub mod state;

pub use buffer::MessageBuffer;
pub use health_monitor::{HealthMonitor, RetryCause, RetryDecision};
pub use lifecycle::{Effect, Event, LifecycleMachine, RetryToken};
pub use manager::ConnectionManager;
pub use session::SessionHandle;
pub use state::{ConnectionState, ConnectorSnapshot, RetryPolicy, TransportFailure};
