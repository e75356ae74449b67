//! MQTT v5 over WebSocket transport backed by `rumqttc`
//!
//! The module separates pure functions from I/O:
//!
//! - [`connection`] - broker URL and `MqttOptions` construction
//! - [`message_handler`] - event routing and error classification
//! - [`client`] - the provider, its sessions and their polling tasks

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{RumqttProvider, RumqttSession};
pub use connection::{build_broker_url, configure_mqtt_options};
pub use message_handler::{EventRoute, MessageHandler};
