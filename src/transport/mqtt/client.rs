//! Impure I/O for rumqttc-backed sessions
//!
//! Each [`RumqttSession`] owns one `AsyncClient` and the task polling its
//! `EventLoop`. The task reports exactly one of connected or connect-failed,
//! then forwards inbound publishes and at most one connection-lost. It stops
//! polling after any error, so rumqttc never reconnects a session on its own;
//! recovery belongs to the connection manager, which opens a fresh session.

use super::connection::{build_broker_url, configure_mqtt_options};
use super::message_handler::{EventRoute, MessageHandler};
use crate::transport::diagnostics::{codes, log_transport_failure};
use crate::transport::{
    ConnectOptions, EventSink, SessionTarget, TransportError, TransportProvider, TransportSession,
};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Time allowed for a requested disconnect to reach the broker
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Default capacity of the client request channel
const DEFAULT_REQUEST_CAPACITY: usize = 10;

/// Transport provider speaking MQTT v5 over WebSocket via rumqttc
#[derive(Debug, Clone)]
pub struct RumqttProvider {
    request_capacity: usize,
}

impl RumqttProvider {
    pub fn new() -> Self {
        Self {
            request_capacity: DEFAULT_REQUEST_CAPACITY,
        }
    }

    /// Bound on queued subscribe/publish requests; `try_*` calls beyond it are dropped
    pub fn with_request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity.max(1);
        self
    }
}

impl Default for RumqttProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportProvider for RumqttProvider {
    fn open(&self, target: &SessionTarget) -> Result<Box<dyn TransportSession>, TransportError> {
        target.validate()?;
        let url = build_broker_url(target, false)?;
        debug!(target: "mqtt_transport", %url, client_id = %target.client_id, "Opening rumqttc session");

        Ok(Box::new(RumqttSession {
            target: target.clone(),
            request_capacity: self.request_capacity,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
            task: None,
        }))
    }
}

/// One rumqttc client and its polling task
pub struct RumqttSession {
    target: SessionTarget,
    request_capacity: usize,
    client: Option<AsyncClient>,
    connected: Arc<AtomicBool>,
    /// Set once a disconnect is requested; silences every later event
    closing: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl TransportSession for RumqttSession {
    fn connect(&mut self, options: &ConnectOptions, events: EventSink) {
        if self.client.is_some() {
            warn!(target: "mqtt_transport", "Ignoring second connect on rumqttc session");
            return;
        }

        let mqtt_options = match configure_mqtt_options(&self.target, options) {
            Ok(mqtt_options) => mqtt_options,
            Err(e) => {
                events.connect_failed(codes::INTERNAL_ERROR, e.to_string());
                return;
            }
        };

        let (client, event_loop) = AsyncClient::new(mqtt_options, self.request_capacity);
        self.client = Some(client);
        self.task = Some(tokio::spawn(poll_session(
            event_loop,
            events,
            Arc::clone(&self.connected),
            Arc::clone(&self.closing),
            options.timeout,
        )));
    }

    fn subscribe(&mut self, topic: &str) {
        if !self.is_connected() {
            return;
        }
        if let Some(client) = &self.client {
            if let Err(e) = client.try_subscribe(topic, QoS::AtMostOnce) {
                warn!(target: "mqtt_transport", topic, "Subscribe request dropped: {}", e);
            }
        }
    }

    fn publish(&mut self, topic: &str, payload: &str) {
        if !self.is_connected() {
            return;
        }
        if let Some(client) = &self.client {
            if let Err(e) =
                client.try_publish(topic, QoS::AtMostOnce, false, payload.to_string())
            {
                warn!(target: "mqtt_transport", topic, "Publish request dropped: {}", e);
            }
        }
    }

    fn disconnect(&mut self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        if let Some(client) = &self.client {
            if was_connected {
                if let Err(e) = client.try_disconnect() {
                    debug!(target: "mqtt_transport", "Disconnect request dropped: {}", e);
                }
            }
        }
        if !was_connected {
            if let Some(task) = self.task.take() {
                task.abort();
            }
        }
    }

    fn is_connected(&self) -> bool {
        !self.closing.load(Ordering::Acquire) && self.connected.load(Ordering::Acquire)
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            // A closing session finishes flushing its disconnect on its own
            if !self.closing.load(Ordering::Acquire) {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for RumqttSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RumqttSession")
            .field("target", &self.target)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("closing", &self.closing.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Poll the event loop for the lifetime of one session
async fn poll_session(
    mut event_loop: EventLoop,
    events: EventSink,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    handshake_timeout: Duration,
) {
    let session = events.session();
    let is_closing = || closing.load(Ordering::Acquire);

    let handshake = tokio::time::timeout(handshake_timeout, async {
        loop {
            let event = match event_loop.poll().await {
                Ok(event) => event,
                Err(e) => return Err(e),
            };
            match MessageHandler::route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged => return Ok(()),
                route => debug!(target: "mqtt_transport", %session, ?route, "Event before ConnAck"),
            }
        }
    })
    .await;

    match handshake {
        Ok(Ok(())) => {
            connected.store(true, Ordering::Release);
            if is_closing() {
                return;
            }
            info!(target: "mqtt_transport", %session, "ConnAck received");
            events.connected();
        }
        Ok(Err(e)) => {
            if !is_closing() {
                let (code, message) = MessageHandler::classify_connection_error(&e);
                events.connect_failed(code, message);
            }
            return;
        }
        Err(_) => {
            if !is_closing() {
                events.connect_failed(
                    codes::CONNECT_TIMEOUT,
                    format!("no ConnAck within {}s", handshake_timeout.as_secs()),
                );
            }
            return;
        }
    }

    loop {
        let polled = if is_closing() {
            match tokio::time::timeout(DISCONNECT_GRACE, event_loop.poll()).await {
                Ok(polled) => polled,
                Err(_) => return,
            }
        } else {
            event_loop.poll().await
        };

        match polled {
            Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                EventRoute::MessageReceived { topic, payload } => {
                    if is_closing() {
                        continue;
                    }
                    let (payload, clean) = MessageHandler::decode_payload(payload);
                    if !clean {
                        log_transport_failure(
                            "payload decode",
                            codes::MALFORMED_UTF,
                            &format!("non UTF-8 payload on {topic}"),
                        );
                    }
                    events.message_arrived(topic, payload);
                }
                EventRoute::Disconnected => {
                    connected.store(false, Ordering::Release);
                    if !is_closing() {
                        events.connection_lost(codes::SOCKET_CLOSE, "broker closed the session");
                    }
                    return;
                }
                route => debug!(target: "mqtt_transport", %session, ?route, "MQTT event"),
            },
            Err(e) => {
                connected.store(false, Ordering::Release);
                if !is_closing() {
                    let (code, message) = MessageHandler::classify_connection_error(&e);
                    events.connection_lost(code, message);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SessionId, TransportEvent};
    use std::sync::Mutex;

    fn target(host: &str, port: u16) -> SessionTarget {
        SessionTarget {
            host: host.to_string(),
            port,
            path: "/mqtt".to_string(),
            client_id: "rumqttc-unit".to_string(),
        }
    }

    #[test]
    fn test_open_rejects_malformed_target() {
        let provider = RumqttProvider::new();
        assert!(provider.open(&target("", 8000)).is_err());
        assert!(provider.open(&target("bad host", 8000)).is_err());
        assert!(provider.open(&target("localhost", 0)).is_err());
    }

    #[test]
    fn test_unconnected_session_ignores_operations() {
        let provider = RumqttProvider::new();
        let mut session = provider.open(&target("localhost", 9001)).unwrap();
        assert!(!session.is_connected());
        session.subscribe("t");
        session.publish("t", "p");
        session.disconnect();
        session.disconnect();
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_invalid_options_fail_handshake_immediately() {
        let provider = RumqttProvider::new();
        let mut session = provider.open(&target("localhost", 9001)).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let store = received.clone();
        let sink = EventSink::new(SessionId(1), move |event| {
            store.lock().unwrap().push(event.event);
        });

        let options = ConnectOptions {
            use_tls: false,
            username: None,
            password: None,
            timeout: Duration::from_secs(1),
            keep_alive: Duration::from_millis(10),
        };
        session.connect(&options, sink);

        let events = received.lock().unwrap();
        assert!(matches!(
            events.as_slice(),
            [TransportEvent::ConnectFailed {
                code: codes::INTERNAL_ERROR,
                ..
            }]
        ));
    }
}
