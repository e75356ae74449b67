//! Recording transport provider for tests
//!
//! [`MockTransportProvider`] hands out [`MockSession`]s that record every call
//! reaching them. Handshake outcomes are either scripted up front or fired by
//! the test on any session, which makes the lifecycle fully deterministic
//! without a broker.

use crate::transport::{
    ConnectOptions, EventSink, SessionTarget, TransportError, TransportProvider, TransportSession,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A call that reached a mock session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Connect {
        use_tls: bool,
        username: Option<String>,
    },
    Subscribe(String),
    Publish {
        topic: String,
        payload: String,
    },
    Disconnect,
}

/// What a session does when `connect` is called
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HandshakeOutcome {
    /// Fire `Connected` immediately
    Succeed,
    /// Fire `ConnectFailed` immediately
    Fail { code: i32, message: String },
    /// Fire nothing; the test completes the handshake later
    #[default]
    Pending,
}

impl HandshakeOutcome {
    pub fn fail(code: i32) -> Self {
        HandshakeOutcome::Fail {
            code,
            message: format!("mock handshake failure (code {code})"),
        }
    }
}

#[derive(Debug)]
struct SessionRecord {
    target: SessionTarget,
    calls: Vec<RecordedCall>,
    connected: bool,
    sink: Option<EventSink>,
}

#[derive(Debug, Default)]
struct MockState {
    sessions: Vec<SessionRecord>,
    script: VecDeque<HandshakeOutcome>,
    fallback: HandshakeOutcome,
}

/// Provider whose sessions record calls instead of talking to a broker
#[derive(Debug, Clone, Default)]
pub struct MockTransportProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockTransportProvider {
    /// Every handshake stays pending until the test fires an outcome
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always_succeed() -> Self {
        Self::with_fallback(HandshakeOutcome::Succeed)
    }

    pub fn always_fail(code: i32) -> Self {
        Self::with_fallback(HandshakeOutcome::fail(code))
    }

    /// Apply `script` to successive connects, then leave handshakes pending
    pub fn with_script(script: Vec<HandshakeOutcome>) -> Self {
        let provider = Self::new();
        provider.lock().script = script.into();
        provider
    }

    fn with_fallback(fallback: HandshakeOutcome) -> Self {
        let provider = Self::new();
        provider.lock().fallback = fallback;
        provider
    }

    /// Queue an outcome for the next connect that has no scripted outcome yet
    pub fn push_outcome(&self, outcome: HandshakeOutcome) {
        self.lock().script.push_back(outcome);
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn targets(&self) -> Vec<SessionTarget> {
        self.lock()
            .sessions
            .iter()
            .map(|session| session.target.clone())
            .collect()
    }

    /// Calls recorded on session `index`, in order
    pub fn calls(&self, index: usize) -> Vec<RecordedCall> {
        self.lock()
            .sessions
            .get(index)
            .map(|session| session.calls.clone())
            .unwrap_or_default()
    }

    pub fn connect_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, RecordedCall::Connect { .. }))
    }

    pub fn subscribe_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, RecordedCall::Subscribe(_)))
    }

    pub fn publish_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, RecordedCall::Publish { .. }))
    }

    pub fn disconnect_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, RecordedCall::Disconnect))
    }

    fn count_calls(&self, predicate: impl Fn(&RecordedCall) -> bool) -> usize {
        self.lock()
            .sessions
            .iter()
            .flat_map(|session| session.calls.iter())
            .filter(|call| predicate(call))
            .count()
    }

    /// Topics subscribed on session `index`
    pub fn subscriptions(&self, index: usize) -> Vec<String> {
        self.calls(index)
            .into_iter()
            .filter_map(|call| match call {
                RecordedCall::Subscribe(topic) => Some(topic),
                _ => None,
            })
            .collect()
    }

    /// `(topic, payload)` pairs published on session `index`
    pub fn published(&self, index: usize) -> Vec<(String, String)> {
        self.calls(index)
            .into_iter()
            .filter_map(|call| match call {
                RecordedCall::Publish { topic, payload } => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn is_session_connected(&self, index: usize) -> bool {
        self.lock()
            .sessions
            .get(index)
            .is_some_and(|session| session.connected)
    }

    /// Mark session `index` connected and fire `Connected`
    pub fn complete_handshake(&self, index: usize) {
        if let Some(sink) = self.update_session(index, |session| session.connected = true) {
            sink.connected();
        }
    }

    /// Fire `ConnectFailed` on session `index`
    pub fn fail_handshake(&self, index: usize, code: i32, message: &str) {
        if let Some(sink) = self.update_session(index, |session| session.connected = false) {
            sink.connect_failed(code, message);
        }
    }

    /// Drop an established connection and fire `ConnectionLost`
    pub fn drop_connection(&self, index: usize, code: i32, message: &str) {
        if let Some(sink) = self.update_session(index, |session| session.connected = false) {
            sink.connection_lost(code, message);
        }
    }

    /// Fire `MessageArrived` on session `index`
    pub fn deliver_message(&self, index: usize, topic: &str, payload: &str) {
        if let Some(sink) = self.update_session(index, |_| {}) {
            sink.message_arrived(topic, payload);
        }
    }

    /// Apply `update` under the lock and return the session's sink, so that
    /// events are emitted after the lock is released
    fn update_session(
        &self,
        index: usize,
        update: impl FnOnce(&mut SessionRecord),
    ) -> Option<EventSink> {
        let mut state = self.lock();
        let session = state.sessions.get_mut(index)?;
        update(session);
        session.sink.clone()
    }
}

impl TransportProvider for MockTransportProvider {
    fn open(&self, target: &SessionTarget) -> Result<Box<dyn TransportSession>, TransportError> {
        target.validate()?;
        let mut state = self.lock();
        state.sessions.push(SessionRecord {
            target: target.clone(),
            calls: Vec::new(),
            connected: false,
            sink: None,
        });
        Ok(Box::new(MockSession {
            index: state.sessions.len() - 1,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Session handed out by [`MockTransportProvider`]
#[derive(Debug)]
pub struct MockSession {
    index: usize,
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    fn record(&self, call: RecordedCall) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = state.sessions.get_mut(self.index) {
            if matches!(call, RecordedCall::Disconnect) {
                session.connected = false;
            }
            session.calls.push(call);
        }
    }
}

impl TransportSession for MockSession {
    fn connect(&mut self, options: &ConnectOptions, events: EventSink) {
        let outcome = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let scripted = state.script.pop_front();
            let outcome = scripted.unwrap_or_else(|| state.fallback.clone());
            let Some(session) = state.sessions.get_mut(self.index) else {
                return;
            };
            session.calls.push(RecordedCall::Connect {
                use_tls: options.use_tls,
                username: options.username.clone(),
            });
            session.sink = Some(events.clone());
            if outcome == HandshakeOutcome::Succeed {
                session.connected = true;
            }
            outcome
        };

        match outcome {
            HandshakeOutcome::Succeed => events.connected(),
            HandshakeOutcome::Fail { code, message } => events.connect_failed(code, message),
            HandshakeOutcome::Pending => {}
        }
    }

    fn subscribe(&mut self, topic: &str) {
        self.record(RecordedCall::Subscribe(topic.to_string()));
    }

    fn publish(&mut self, topic: &str, payload: &str) {
        self.record(RecordedCall::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
    }

    fn disconnect(&mut self) {
        self.record(RecordedCall::Disconnect);
    }

    fn is_connected(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .get(self.index)
            .is_some_and(|session| session.connected)
    }
}
