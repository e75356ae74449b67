//! Connection manager: drives the lifecycle machine on a tokio task
//!
//! Every input (transport callbacks, caller commands and the retry timer)
//! is funnelled into one task that owns the [`LifecycleMachine`], so state
//! transitions are strictly serialized. Callers never wait on that task: the
//! latest committed [`ConnectorSnapshot`] is published through a `watch`
//! channel and read without blocking.

use super::buffer::MessageBuffer;
use super::lifecycle::{Effect, Event, LifecycleMachine, RetryToken};
use super::session::SessionHandle;
use super::state::{ConnectionState, ConnectorSnapshot, RetryPolicy};
use crate::config::{ConnectionConfig, ConnectorConfig};
use crate::connector_span;
use crate::error::{ConnectorError, ConnectorResult};
use crate::protocol::MessageEnvelope;
use crate::transport::diagnostics::codes;
use crate::transport::{EventSink, SessionEvent, SessionId, TransportEvent, TransportProvider};
use std::future::pending;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, error, info, warn, Instrument};

/// Owner of one broker connection and its message history
///
/// Must be created inside a tokio runtime. Dropping the manager tears it down.
#[derive(Debug)]
pub struct ConnectionManager {
    client_id: String,
    events_tx: mpsc::UnboundedSender<Event>,
    alive: Arc<AtomicBool>,
    snapshot_rx: watch::Receiver<ConnectorSnapshot>,
    driver: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Validate the configuration, open the first session and issue its connect.
    ///
    /// On return the manager is already `Connecting`. Configuration problems
    /// are the only errors; transport failures surface as state.
    pub fn start(
        config: ConnectionConfig,
        policy: RetryPolicy,
        provider: Arc<dyn TransportProvider>,
    ) -> ConnectorResult<Self> {
        Self::start_with_buffer(config, policy, provider, MessageBuffer::unbounded())
    }

    /// Like [`start`](Self::start) with an explicit message history policy
    pub fn start_with_buffer(
        config: ConnectionConfig,
        policy: RetryPolicy,
        provider: Arc<dyn TransportProvider>,
        buffer: MessageBuffer,
    ) -> ConnectorResult<Self> {
        config.validate()?;
        policy.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let mut machine = LifecycleMachine::new(policy, buffer);
        let effects = machine.handle(Event::Start);
        let (snapshot_tx, snapshot_rx) = watch::channel(machine.snapshot());

        let span = connector_span!(
            client_id = %config.client_id,
            host = %config.host,
            port = config.port
        );
        let client_id = config.client_id.clone();

        let mut driver = Driver {
            machine,
            provider,
            config,
            session: None,
            retry: None,
            events_tx: events_tx.clone(),
            alive: Arc::clone(&alive),
            snapshot_tx,
        };

        // The first session is opened before returning so a provider rejecting
        // the target is reported to the caller instead of being retried.
        for effect in effects {
            match effect {
                Effect::OpenSession(id) => driver.open_session(id)?,
                other => driver.apply(other),
            }
        }

        info!(%client_id, "Connection manager started");
        let handle = tokio::spawn(driver.run(events_rx).instrument(span));

        Ok(Self {
            client_id,
            events_tx,
            alive,
            snapshot_rx,
            driver: Some(handle),
        })
    }

    /// Start from a loaded configuration file
    pub fn from_config(
        config: &ConnectorConfig,
        provider: Arc<dyn TransportProvider>,
    ) -> ConnectorResult<Self> {
        let connection = config.connection_config()?;
        Self::start_with_buffer(
            connection,
            config.retry_policy(),
            provider,
            MessageBuffer::with_capacity(config.buffer.max_messages),
        )
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Subscribe on the current session. Ignored unless connected.
    ///
    /// Subscriptions are not replayed after a reconnect; callers re-subscribe
    /// when they observe a transition into `Connected`.
    pub fn subscribe(&self, topic: impl Into<String>) -> ConnectorResult<()> {
        self.send(Event::Subscribe {
            topic: topic.into(),
        })
    }

    /// Publish a raw payload. Dropped unless connected; nothing is queued.
    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<String>,
    ) -> ConnectorResult<()> {
        self.send(Event::Publish {
            topic: topic.into(),
            payload: payload.into(),
        })
    }

    /// Publish `message` wrapped in a timestamped envelope carrying this client id
    pub fn publish_envelope(
        &self,
        topic: impl Into<String>,
        message: impl Into<String>,
    ) -> ConnectorResult<()> {
        let envelope = MessageEnvelope::new(message, Some(self.client_id.clone()));
        self.publish(topic, envelope.to_json()?)
    }

    /// Stop: cancel any pending retry and release the session. Idempotent.
    pub fn disconnect(&self) -> ConnectorResult<()> {
        self.send(Event::Disconnect)
    }

    /// Leave `Failed` or `Disconnected` with a fresh retry budget
    pub fn restart(&self) -> ConnectorResult<()> {
        self.send(Event::Restart)
    }

    /// Disconnect and make the manager permanently inert.
    ///
    /// The liveness flag is cleared before returning, so no retry timer or
    /// transport callback can change state afterwards. Idempotent.
    pub fn teardown(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            info!(client_id = %self.client_id, "Tearing down connection manager");
            let _ = self.events_tx.send(Event::Teardown);
        }
    }

    /// Tear down and wait briefly for the driver task to release its session
    pub async fn shutdown(mut self) {
        self.teardown();
        if let Some(handle) = self.driver.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!("Connection driver stopped"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Connection driver ended with error: {}", e),
                Err(_) => warn!("Connection driver did not stop in time"),
                _ => {}
            }
        }
    }

    pub fn is_torn_down(&self) -> bool {
        !self.alive.load(Ordering::Acquire)
    }

    /// Latest committed snapshot
    pub fn snapshot(&self) -> ConnectorSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.snapshot_rx.borrow().state
    }

    pub fn retry_count(&self) -> u32 {
        self.snapshot_rx.borrow().retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.snapshot_rx.borrow().max_retries
    }

    /// Received payloads, newest first
    pub fn messages(&self) -> Vec<String> {
        self.snapshot_rx.borrow().messages()
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot_rx.borrow().is_connected()
    }

    /// Receiver notified after every committed change
    pub fn watch(&self) -> watch::Receiver<ConnectorSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Wait until a snapshot satisfies `predicate`
    pub async fn wait_for_state<F>(
        &self,
        predicate: F,
        timeout: Duration,
    ) -> ConnectorResult<ConnectorSnapshot>
    where
        F: Fn(&ConnectorSnapshot) -> bool,
    {
        let mut rx = self.snapshot_rx.clone();
        let wait = async {
            loop {
                {
                    let snapshot = rx.borrow_and_update();
                    if predicate(&*snapshot) {
                        return Ok(snapshot.clone());
                    }
                }
                if rx.changed().await.is_err() {
                    // driver gone: the last value is final
                    let snapshot = rx.borrow();
                    return if predicate(&*snapshot) {
                        Ok(snapshot.clone())
                    } else {
                        Err(ConnectorError::TornDown)
                    };
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout {
                state: self.current_state(),
            }),
        }
    }

    /// Wait for `Connected`, returning early if the manager stops or gives up
    pub async fn wait_until_connected(&self, timeout: Duration) -> ConnectorResult<()> {
        let snapshot = self
            .wait_for_state(|s| s.is_connected() || s.state.is_terminal(), timeout)
            .await?;
        if snapshot.is_connected() {
            Ok(())
        } else {
            Err(ConnectorError::NotConnected {
                state: snapshot.state,
            })
        }
    }

    fn send(&self, event: Event) -> ConnectorResult<()> {
        if self.is_torn_down() {
            return Err(ConnectorError::TornDown);
        }
        self.events_tx
            .send(event)
            .map_err(|_| ConnectorError::TornDown)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

struct PendingRetry {
    token: RetryToken,
    sleep: Pin<Box<Sleep>>,
}

/// Task-side state: the machine plus everything its effects touch
struct Driver {
    machine: LifecycleMachine,
    provider: Arc<dyn TransportProvider>,
    config: ConnectionConfig,
    session: Option<SessionHandle>,
    retry: Option<PendingRetry>,
    events_tx: mpsc::UnboundedSender<Event>,
    alive: Arc<AtomicBool>,
    snapshot_tx: watch::Sender<ConnectorSnapshot>,
}

impl Driver {
    async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<Event>) {
        debug!("Connection driver running");

        while !self.machine.is_torn_down() {
            let event = tokio::select! {
                received = events_rx.recv() => received.unwrap_or(Event::Teardown),
                token = retry_elapsed(&mut self.retry), if self.retry.is_some() => {
                    Event::RetryDue(token)
                }
            };
            if matches!(event, Event::RetryDue(_)) {
                self.retry = None;
            }
            self.process(event);
        }

        debug!("Connection driver stopped");
    }

    fn process(&mut self, event: Event) {
        // Anything observed after the liveness flag drops is treated as teardown
        let event = if self.alive.load(Ordering::Acquire) {
            event
        } else {
            Event::Teardown
        };

        for effect in self.machine.handle(event) {
            self.apply(effect);
        }
        self.publish_snapshot();
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::OpenSession(id) => {
                if let Err(e) = self.open_session(id) {
                    error!(session = %id, "Failed to open transport session: {}", e);
                    self.report(
                        id,
                        TransportEvent::ConnectFailed {
                            code: codes::INTERNAL_ERROR,
                            message: e.to_string(),
                        },
                    );
                }
            }
            Effect::ReleaseSession(id) => {
                if self.session.as_ref().map(SessionHandle::id) == Some(id) {
                    if let Some(mut session) = self.session.take() {
                        session.disconnect();
                    }
                }
            }
            Effect::ScheduleRetry { token, delay } => {
                debug!(delay_ms = delay.as_millis() as u64, "Retry scheduled");
                self.retry = Some(PendingRetry {
                    token,
                    sleep: Box::pin(tokio::time::sleep(delay)),
                });
            }
            Effect::CancelRetry(token) => {
                if self.retry.as_ref().map(|pending| pending.token) == Some(token) {
                    self.retry = None;
                    debug!("Pending retry cancelled");
                }
            }
            Effect::Subscribe { session, topic } => match self.session_mut(session) {
                Some(handle) => {
                    if handle.subscribe(&topic) {
                        info!(%topic, "Subscribed");
                    }
                }
                None => debug!(%topic, "No session for subscribe"),
            },
            Effect::Publish {
                session,
                topic,
                payload,
            } => {
                if let Some(handle) = self.session_mut(session) {
                    if handle.publish(&topic, &payload) {
                        debug!(%topic, bytes = payload.len(), "Published");
                    }
                }
            }
        }
    }

    fn open_session(&mut self, id: SessionId) -> Result<(), crate::transport::TransportError> {
        let mut session = SessionHandle::open(self.provider.as_ref(), id, &self.config)?;
        session.connect(&self.config, self.event_sink(id));
        if let Some(mut previous) = self.session.replace(session) {
            previous.disconnect();
        }
        Ok(())
    }

    fn session_mut(&mut self, id: SessionId) -> Option<&mut SessionHandle> {
        self.session.as_mut().filter(|handle| handle.id() == id)
    }

    /// Sink that forwards a session's callbacks into the driver while alive
    fn event_sink(&self, id: SessionId) -> EventSink {
        let events_tx = self.events_tx.clone();
        let alive = Arc::clone(&self.alive);
        EventSink::new(id, move |event| {
            if alive.load(Ordering::Acquire) {
                let _ = events_tx.send(Event::Transport(event));
            }
        })
    }

    fn report(&self, session: SessionId, event: TransportEvent) {
        let _ = self
            .events_tx
            .send(Event::Transport(SessionEvent { session, event }));
    }

    fn publish_snapshot(&self) {
        let next = self.machine.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if current.same_as(&next) {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn retry_elapsed(retry: &mut Option<PendingRetry>) -> RetryToken {
    match retry {
        Some(pending) => {
            pending.sleep.as_mut().await;
            pending.token
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{HandshakeOutcome, MockTransportProvider};

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("test.broker.com").with_client_id("manager-test")
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_start_rejects_empty_host_without_opening() {
        let provider = MockTransportProvider::new();
        let result = ConnectionManager::start(
            ConnectionConfig::new(""),
            RetryPolicy::default(),
            Arc::new(provider.clone()),
        );
        assert!(matches!(result, Err(ConnectorError::Config(_))));
        assert_eq!(provider.session_count(), 0);
    }

    #[tokio::test]
    async fn test_start_rejects_zero_attempts() {
        let provider = MockTransportProvider::new();
        let result = ConnectionManager::start(
            config(),
            RetryPolicy::fixed(0, 100),
            Arc::new(provider.clone()),
        );
        assert!(result.as_ref().is_err_and(ConnectorError::is_config_error));
        assert_eq!(provider.session_count(), 0);
    }

    #[tokio::test]
    async fn test_start_is_connecting_synchronously() {
        let provider = MockTransportProvider::new();
        let manager =
            ConnectionManager::start(config(), RetryPolicy::default(), Arc::new(provider.clone()))
                .unwrap();

        assert_eq!(manager.current_state(), ConnectionState::Connecting);
        assert_eq!(provider.session_count(), 1);
        assert_eq!(provider.connect_calls(), 1);
        assert_eq!(manager.client_id(), "manager-test");
    }

    #[tokio::test]
    async fn test_publish_envelope_carries_client_id() {
        let provider = MockTransportProvider::with_script(vec![HandshakeOutcome::Succeed]);
        let manager =
            ConnectionManager::start(config(), RetryPolicy::default(), Arc::new(provider.clone()))
                .unwrap();
        manager
            .wait_until_connected(Duration::from_secs(1))
            .await
            .unwrap();

        manager.publish_envelope("psu/drone", "hello").unwrap();
        settle().await;

        let published = provider.published(0);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "psu/drone");
        let parsed = crate::protocol::parse_message(&published[0].1).unwrap();
        assert_eq!(parsed.message, "hello");
        assert!(published[0].1.contains("manager-test"));
    }

    #[tokio::test]
    async fn test_commands_after_teardown_are_rejected() {
        let provider = MockTransportProvider::new();
        let manager =
            ConnectionManager::start(config(), RetryPolicy::default(), Arc::new(provider.clone()))
                .unwrap();

        manager.teardown();
        manager.teardown();
        assert!(manager.is_torn_down());
        assert!(matches!(manager.subscribe("t"), Err(ConnectorError::TornDown)));
        assert!(matches!(manager.restart(), Err(ConnectorError::TornDown)));
    }

    #[tokio::test]
    async fn test_wait_until_connected_reports_failure() {
        let provider = MockTransportProvider::always_fail(codes::CONNACK_RETURNCODE);
        let manager = ConnectionManager::start(
            config(),
            RetryPolicy::fixed(1, 10),
            Arc::new(provider.clone()),
        )
        .unwrap();

        let result = manager.wait_until_connected(Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(ConnectorError::NotConnected {
                state: ConnectionState::Failed
            })
        ));
        let last_error = manager.snapshot().last_error.unwrap();
        assert_eq!(last_error.code, codes::CONNACK_RETURNCODE);
        assert!(!last_error.lost_after_connect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_state_times_out() {
        let provider = MockTransportProvider::new();
        let manager =
            ConnectionManager::start(config(), RetryPolicy::default(), Arc::new(provider.clone()))
                .unwrap();

        let result = manager
            .wait_for_state(|s| s.is_connected(), Duration::from_millis(50))
            .await;
        assert!(matches!(
            result,
            Err(ConnectorError::Timeout {
                state: ConnectionState::Connecting
            })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_releases_connected_session() {
        let provider = MockTransportProvider::with_script(vec![HandshakeOutcome::Succeed]);
        let manager =
            ConnectionManager::start(config(), RetryPolicy::default(), Arc::new(provider.clone()))
                .unwrap();
        manager
            .wait_until_connected(Duration::from_secs(1))
            .await
            .unwrap();

        manager.shutdown().await;
        assert_eq!(provider.disconnect_calls(), 1);
    }
}
