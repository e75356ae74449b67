//! Transport provider contract
//!
//! The connector does not implement a wire protocol. It asks a
//! [`TransportProvider`] for one [`TransportSession`] per connection attempt
//! and learns about the session's lifecycle through an [`EventSink`]. The
//! [`mqtt`] module supplies a provider backed by `rumqttc`; tests use the
//! recording mocks in [`crate::testing`].

pub mod diagnostics;
pub mod mqtt;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Identity of one session object handed out by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Broker endpoint a session is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub client_id: String,
}

impl SessionTarget {
    /// Reject arguments no transport could use
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.host.trim().is_empty() {
            return Err(TransportError::MalformedTarget(
                "host must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(TransportError::MalformedTarget(
                "port must be between 1 and 65535".to_string(),
            ));
        }
        if self.client_id.is_empty() {
            return Err(TransportError::MalformedTarget(
                "client identifier must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Handshake parameters
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub use_tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub keep_alive: Duration,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("use_tls", &self.use_tls)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("timeout", &self.timeout)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// Lifecycle callbacks a session reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake succeeded
    Connected,
    /// Handshake failed; no further events follow for this session
    ConnectFailed { code: i32, message: String },
    /// An established connection dropped
    ConnectionLost { code: i32, message: String },
    /// Inbound publish on a subscribed topic
    MessageArrived { topic: String, payload: String },
}

/// A transport event tagged with the session that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: SessionId,
    pub event: TransportEvent,
}

/// Synchronous provider errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Malformed session target: {0}")]
    MalformedTarget(String),
    #[error("Invalid connect options: {0}")]
    InvalidOptions(String),
}

/// Callback channel through which a session reports [`TransportEvent`]s
#[derive(Clone)]
pub struct EventSink {
    session: SessionId,
    deliver: Arc<dyn Fn(SessionEvent) + Send + Sync>,
}

impl EventSink {
    pub fn new<F>(session: SessionId, deliver: F) -> Self
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        Self {
            session,
            deliver: Arc::new(deliver),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.deliver)(SessionEvent {
            session: self.session,
            event,
        });
    }

    pub fn connected(&self) {
        self.emit(TransportEvent::Connected);
    }

    pub fn connect_failed(&self, code: i32, message: impl Into<String>) {
        self.emit(TransportEvent::ConnectFailed {
            code,
            message: message.into(),
        });
    }

    pub fn connection_lost(&self, code: i32, message: impl Into<String>) {
        self.emit(TransportEvent::ConnectionLost {
            code,
            message: message.into(),
        });
    }

    pub fn message_arrived(&self, topic: impl Into<String>, payload: impl Into<String>) {
        self.emit(TransportEvent::MessageArrived {
            topic: topic.into(),
            payload: payload.into(),
        });
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Factory of transport sessions
///
/// `open` is synchronous and fails only on malformed arguments.
pub trait TransportProvider: Send + Sync {
    fn open(&self, target: &SessionTarget) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// One underlying transport connection
///
/// A session accepts exactly one `connect` call. None of the methods block;
/// results arrive through the [`EventSink`] given to `connect`, which fires
/// exactly one of `Connected` or `ConnectFailed`.
pub trait TransportSession: Send {
    fn connect(&mut self, options: &ConnectOptions, events: EventSink);

    /// Ignored unless connected
    fn subscribe(&mut self, topic: &str);

    /// Ignored unless connected
    fn publish(&mut self, topic: &str, payload: &str);

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}
