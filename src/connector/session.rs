//! Session handle: sole owner of one transport session

use crate::config::ConnectionConfig;
use crate::transport::{EventSink, SessionId, TransportError, TransportProvider, TransportSession};
use tracing::debug;

/// Owns exactly one [`TransportSession`] and mediates every call made on it.
///
/// Publish and subscribe are dropped unless the transport reports itself
/// connected. `disconnect` issues at most one transport call over the
/// handle's lifetime; dropping the handle releases the session the same way.
pub struct SessionHandle {
    id: SessionId,
    session: Box<dyn TransportSession>,
    connect_issued: bool,
    released: bool,
}

impl SessionHandle {
    /// Open a session bound to the config's host, port, path and client id
    pub fn open(
        provider: &dyn TransportProvider,
        id: SessionId,
        config: &ConnectionConfig,
    ) -> Result<Self, TransportError> {
        let target = config.target();
        target.validate()?;
        let session = provider.open(&target)?;
        debug!(session = %id, host = %target.host, port = target.port, "Opened transport session");
        Ok(Self {
            id,
            session,
            connect_issued: false,
            released: false,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Issue the handshake. A session accepts a single connect call.
    pub fn connect(&mut self, config: &ConnectionConfig, events: EventSink) {
        if self.connect_issued || self.released {
            debug!(session = %self.id, "Ignoring repeated connect on session");
            return;
        }
        self.connect_issued = true;
        self.session.connect(&config.connect_options(), events);
    }

    pub fn is_connected(&self) -> bool {
        !self.released && self.session.is_connected()
    }

    /// Returns whether the call reached the transport
    pub fn subscribe(&mut self, topic: &str) -> bool {
        if !self.is_connected() {
            debug!(session = %self.id, topic, "Dropping subscribe on unconnected session");
            return false;
        }
        self.session.subscribe(topic);
        true
    }

    /// Returns whether the call reached the transport
    pub fn publish(&mut self, topic: &str, payload: &str) -> bool {
        if !self.is_connected() {
            debug!(session = %self.id, topic, "Dropping publish on unconnected session");
            return false;
        }
        self.session.publish(topic, payload);
        true
    }

    /// Idempotent; returns whether a transport disconnect was issued
    pub fn disconnect(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        if self.session.is_connected() {
            self.session.disconnect();
            debug!(session = %self.id, "Disconnected transport session");
            true
        } else {
            false
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("connect_issued", &self.connect_issued)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}
