//! Connection lifecycle state machine
//!
//! [`LifecycleMachine::handle`] is the single transition function. It consumes
//! one [`Event`] at a time and returns the [`Effect`]s the driver must carry
//! out; it never touches a transport or a timer itself.
//!
//! ```text
//!   Idle ──start──▶ Connecting ──connected──▶ Connected
//!                     │   ▲                      │
//!              failed │   │ retry due            │ lost
//!                     ▼   │                      │
//!                  RetryWaiting ◀────────────────┘
//!                     │
//!          budget exhausted
//!                     ▼
//!                  Failed
//!
//!   any ──disconnect/teardown──▶ Disconnected
//!   Failed | Disconnected ──restart──▶ Connecting
//! ```
//!
//! Deferred work is guarded by capability tokens: every session gets a fresh
//! [`SessionId`] and every scheduled retry a fresh [`RetryToken`]. An event
//! carrying a token that is no longer current is ignored, so late callbacks
//! from a replaced session or a cancelled timer cannot mutate state.

use super::buffer::MessageBuffer;
use super::health_monitor::{HealthMonitor, RetryCause, RetryDecision};
use super::state::{ConnectionState, ConnectorSnapshot, RetryPolicy, TransportFailure};
use crate::transport::diagnostics::log_transport_failure;
use crate::transport::{SessionEvent, SessionId, TransportEvent};
use std::time::Duration;
use tracing::debug;

/// Identity of one scheduled retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetryToken(u64);

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// First connection attempt
    Start,
    /// Callback from a transport session
    Transport(SessionEvent),
    /// A retry timer elapsed
    RetryDue(RetryToken),
    Subscribe { topic: String },
    Publish { topic: String, payload: String },
    Disconnect,
    /// Leave `Failed` or `Disconnected` with a fresh retry budget
    Restart,
    Teardown,
}

/// Work the driver performs on the machine's behalf
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open a new session with this id and issue its connect call
    OpenSession(SessionId),
    /// Disconnect (if connected) and drop the session
    ReleaseSession(SessionId),
    ScheduleRetry { token: RetryToken, delay: Duration },
    CancelRetry(RetryToken),
    Subscribe { session: SessionId, topic: String },
    Publish {
        session: SessionId,
        topic: String,
        payload: String,
    },
}

/// Connection state, retry counter and message history
#[derive(Debug)]
pub struct LifecycleMachine {
    state: ConnectionState,
    policy: RetryPolicy,
    attempts_used: u32,
    connection_losses: u32,
    buffer: MessageBuffer,
    current_session: Option<SessionId>,
    sessions_opened: u64,
    pending_retry: Option<RetryToken>,
    retry_generation: u64,
    last_error: Option<TransportFailure>,
    torn_down: bool,
}

impl LifecycleMachine {
    pub fn new(policy: RetryPolicy, buffer: MessageBuffer) -> Self {
        Self {
            state: ConnectionState::Idle,
            policy,
            attempts_used: 0,
            connection_losses: 0,
            buffer,
            current_session: None,
            sessions_opened: 0,
            pending_retry: None,
            retry_generation: 0,
            last_error: None,
            torn_down: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts_used(&self) -> u32 {
        self.attempts_used
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.current_session
    }

    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn snapshot(&self) -> ConnectorSnapshot {
        ConnectorSnapshot {
            state: self.state,
            retry_count: self.attempts_used,
            max_retries: self.policy.max_attempts,
            messages: self.buffer.snapshot(),
            messages_received: self.buffer.received(),
            connection_losses: self.connection_losses,
            last_error: self.last_error.clone(),
        }
    }

    /// Apply one event and return the effects it requires
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        if self.torn_down {
            debug!(?event, "Ignoring event after teardown");
            return Vec::new();
        }

        match event {
            Event::Start => self.on_start(),
            Event::Transport(SessionEvent { session, event }) => {
                self.on_transport_event(session, event)
            }
            Event::RetryDue(token) => self.on_retry_due(token),
            Event::Subscribe { topic } => self.on_subscribe(topic),
            Event::Publish { topic, payload } => self.on_publish(topic, payload),
            Event::Disconnect => self.stop(),
            Event::Restart => self.on_restart(),
            Event::Teardown => {
                let effects = self.stop();
                self.torn_down = true;
                self.retry_generation += 1;
                effects
            }
        }
    }

    fn on_start(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Idle {
            debug!(state = %self.state, "Ignoring start outside Idle");
            return Vec::new();
        }
        self.begin_attempt()
    }

    fn on_restart(&mut self) -> Vec<Effect> {
        if !HealthMonitor::can_restart(&self.state) {
            debug!(state = %self.state, "Ignoring restart");
            return Vec::new();
        }
        self.attempts_used = 0;
        self.begin_attempt()
    }

    fn on_transport_event(&mut self, session: SessionId, event: TransportEvent) -> Vec<Effect> {
        if self.current_session != Some(session) {
            debug!(%session, ?event, "Ignoring event from stale session");
            return Vec::new();
        }

        match event {
            TransportEvent::Connected => {
                if self.state != ConnectionState::Connecting {
                    debug!(state = %self.state, "Ignoring unexpected connected event");
                    return Vec::new();
                }
                self.attempts_used = 0;
                self.last_error = None;
                self.transition_to(ConnectionState::Connected);
                Vec::new()
            }
            TransportEvent::ConnectFailed { code, message } => {
                if self.state != ConnectionState::Connecting {
                    debug!(state = %self.state, "Ignoring unexpected handshake failure");
                    return Vec::new();
                }
                log_transport_failure("handshake failure", code, &message);
                self.last_error = Some(TransportFailure {
                    code,
                    message,
                    lost_after_connect: false,
                });
                self.recover(session, RetryCause::HandshakeFailed)
            }
            TransportEvent::ConnectionLost { code, message } => {
                // Only a drop of an established connection starts recovery
                if self.state != ConnectionState::Connected {
                    debug!(state = %self.state, "Ignoring connection-lost outside Connected");
                    return Vec::new();
                }
                log_transport_failure("connection lost", code, &message);
                self.connection_losses += 1;
                self.last_error = Some(TransportFailure {
                    code,
                    message,
                    lost_after_connect: true,
                });
                self.recover(session, RetryCause::ConnectionLost)
            }
            TransportEvent::MessageArrived { topic, payload } => {
                debug!(%topic, bytes = payload.len(), "Message arrived");
                if let Some(evicted) = self.buffer.push(payload) {
                    debug!(bytes = evicted.len(), "Evicted oldest message");
                }
                Vec::new()
            }
        }
    }

    fn on_retry_due(&mut self, token: RetryToken) -> Vec<Effect> {
        if self.pending_retry != Some(token) || self.state != ConnectionState::RetryWaiting {
            debug!(?token, "Ignoring stale retry timer");
            return Vec::new();
        }
        self.pending_retry = None;
        self.begin_attempt()
    }

    fn on_subscribe(&mut self, topic: String) -> Vec<Effect> {
        match self.current_session {
            Some(session) if HealthMonitor::can_subscribe(&self.state) => {
                vec![Effect::Subscribe { session, topic }]
            }
            _ => {
                debug!(%topic, state = %self.state, "Subscribe ignored while not connected");
                Vec::new()
            }
        }
    }

    fn on_publish(&mut self, topic: String, payload: String) -> Vec<Effect> {
        match self.current_session {
            Some(session) if HealthMonitor::can_publish(&self.state) => vec![Effect::Publish {
                session,
                topic,
                payload,
            }],
            _ => {
                debug!(%topic, state = %self.state, "Publish dropped while not connected");
                Vec::new()
            }
        }
    }

    /// Release the failed session and either wait for a retry or give up
    fn recover(&mut self, session: SessionId, cause: RetryCause) -> Vec<Effect> {
        let mut effects = vec![Effect::ReleaseSession(session)];
        self.current_session = None;

        match HealthMonitor::should_attempt_retry(
            self.attempts_used,
            &self.policy,
            cause,
            self.torn_down,
        ) {
            RetryDecision::Retry {
                attempts_used,
                delay,
            } => {
                self.attempts_used = attempts_used;
                self.retry_generation += 1;
                let token = RetryToken(self.retry_generation);
                self.pending_retry = Some(token);
                self.transition_to(ConnectionState::RetryWaiting);
                effects.push(Effect::ScheduleRetry { token, delay });
            }
            RetryDecision::GiveUp { attempts_used } => {
                self.attempts_used = attempts_used;
                self.transition_to(ConnectionState::Failed);
            }
            RetryDecision::AbortTornDown => {}
        }

        effects
    }

    fn begin_attempt(&mut self) -> Vec<Effect> {
        self.sessions_opened += 1;
        let session = SessionId(self.sessions_opened);
        let mut effects = Vec::with_capacity(2);
        if let Some(previous) = self.current_session.replace(session) {
            effects.push(Effect::ReleaseSession(previous));
        }
        self.transition_to(ConnectionState::Connecting);
        effects.push(Effect::OpenSession(session));
        effects
    }

    /// Force `Disconnected`, cancelling any retry and releasing the session
    fn stop(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(token) = self.pending_retry.take() {
            effects.push(Effect::CancelRetry(token));
        }
        if let Some(session) = self.current_session.take() {
            effects.push(Effect::ReleaseSession(session));
        }
        if self.state != ConnectionState::Disconnected {
            self.transition_to(ConnectionState::Disconnected);
        }
        effects
    }

    fn transition_to(&mut self, next: ConnectionState) {
        let previous = self.state;
        self.state = next;
        HealthMonitor::log_state_transition(previous, next, self.attempts_used);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(max_attempts: u32) -> LifecycleMachine {
        LifecycleMachine::new(RetryPolicy::fixed(max_attempts, 100), MessageBuffer::unbounded())
    }

    fn transport(session: SessionId, event: TransportEvent) -> Event {
        Event::Transport(SessionEvent { session, event })
    }

    fn failed(session: SessionId) -> Event {
        transport(
            session,
            TransportEvent::ConnectFailed {
                code: 1,
                message: "timeout".to_string(),
            },
        )
    }

    fn scheduled_token(effects: &[Effect]) -> RetryToken {
        effects
            .iter()
            .find_map(|effect| match effect {
                Effect::ScheduleRetry { token, .. } => Some(*token),
                _ => None,
            })
            .expect("a retry should be scheduled")
    }

    #[test]
    fn test_start_opens_first_session() {
        let mut m = machine(5);
        let effects = m.handle(Event::Start);

        assert_eq!(effects, vec![Effect::OpenSession(SessionId(1))]);
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.current_session(), Some(SessionId(1)));
    }

    #[test]
    fn test_start_is_only_valid_from_idle() {
        let mut m = machine(5);
        m.handle(Event::Start);
        assert!(m.handle(Event::Start).is_empty());
        assert_eq!(m.sessions_opened(), 1);
    }

    #[test]
    fn test_failure_then_success_resets_counter() {
        let mut m = machine(5);
        m.handle(Event::Start);

        let effects = m.handle(failed(SessionId(1)));
        assert_eq!(effects[0], Effect::ReleaseSession(SessionId(1)));
        assert_eq!(m.state(), ConnectionState::RetryWaiting);
        assert_eq!(m.attempts_used(), 1);

        let effects = m.handle(Event::RetryDue(scheduled_token(&effects)));
        assert_eq!(effects, vec![Effect::OpenSession(SessionId(2))]);
        assert_eq!(m.state(), ConnectionState::Connecting);

        m.handle(transport(SessionId(2), TransportEvent::Connected));
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.attempts_used(), 0);
        assert_eq!(m.sessions_opened(), 2);
        assert!(m.snapshot().last_error.is_none());
    }

    #[test]
    fn test_exhaustion_enters_failed() {
        let mut m = machine(2);
        m.handle(Event::Start);

        let effects = m.handle(failed(SessionId(1)));
        m.handle(Event::RetryDue(scheduled_token(&effects)));
        let effects = m.handle(failed(SessionId(2)));

        assert_eq!(effects, vec![Effect::ReleaseSession(SessionId(2))]);
        assert_eq!(m.state(), ConnectionState::Failed);
        assert_eq!(m.attempts_used(), 2);
        assert_eq!(m.sessions_opened(), 2);
    }

    #[test]
    fn test_connection_loss_reconnects_with_new_session() {
        let mut m = machine(5);
        m.handle(Event::Start);
        m.handle(transport(SessionId(1), TransportEvent::Connected));

        let effects = m.handle(transport(
            SessionId(1),
            TransportEvent::ConnectionLost {
                code: 1,
                message: "lost".to_string(),
            },
        ));
        assert_eq!(m.state(), ConnectionState::RetryWaiting);
        assert_eq!(m.attempts_used(), 0);
        assert_eq!(m.snapshot().connection_losses, 1);
        assert!(m.snapshot().last_error.unwrap().lost_after_connect);

        let effects = m.handle(Event::RetryDue(scheduled_token(&effects)));
        assert_eq!(effects, vec![Effect::OpenSession(SessionId(2))]);
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_duplicate_connection_lost_ignored() {
        let mut m = machine(5);
        m.handle(Event::Start);
        m.handle(transport(SessionId(1), TransportEvent::Connected));
        let lost = transport(
            SessionId(1),
            TransportEvent::ConnectionLost {
                code: 8,
                message: "closed".to_string(),
            },
        );
        m.handle(lost.clone());

        // same session (now stale) and a lost event during Connecting are both ignored
        assert!(m.handle(lost).is_empty());
        assert_eq!(m.snapshot().connection_losses, 1);
    }

    #[test]
    fn test_lost_while_connecting_ignored() {
        let mut m = machine(5);
        m.handle(Event::Start);
        let effects = m.handle(transport(
            SessionId(1),
            TransportEvent::ConnectionLost {
                code: 8,
                message: "closed".to_string(),
            },
        ));
        assert!(effects.is_empty());
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_retry_counter_shared_across_loss_and_failures() {
        let mut m = machine(2);
        m.handle(Event::Start);
        m.handle(transport(SessionId(1), TransportEvent::Connected));
        let effects = m.handle(transport(
            SessionId(1),
            TransportEvent::ConnectionLost {
                code: 1,
                message: "lost".to_string(),
            },
        ));
        m.handle(Event::RetryDue(scheduled_token(&effects)));

        let effects = m.handle(failed(SessionId(2)));
        assert_eq!(m.attempts_used(), 1);
        m.handle(Event::RetryDue(scheduled_token(&effects)));
        m.handle(failed(SessionId(3)));

        assert_eq!(m.state(), ConnectionState::Failed);
        assert_eq!(m.attempts_used(), 2);
    }

    #[test]
    fn test_stale_session_events_ignored() {
        let mut m = machine(5);
        m.handle(Event::Start);
        let effects = m.handle(failed(SessionId(1)));
        m.handle(Event::RetryDue(scheduled_token(&effects)));

        // late success from the replaced session
        assert!(m
            .handle(transport(SessionId(1), TransportEvent::Connected))
            .is_empty());
        assert_eq!(m.state(), ConnectionState::Connecting);

        m.handle(transport(
            SessionId(1),
            TransportEvent::MessageArrived {
                topic: "t".to_string(),
                payload: "late".to_string(),
            },
        ));
        assert!(m.snapshot().messages.is_empty());
    }

    #[test]
    fn test_stale_retry_token_ignored() {
        let mut m = machine(5);
        m.handle(Event::Start);
        let effects = m.handle(failed(SessionId(1)));
        let token = scheduled_token(&effects);

        m.handle(Event::Disconnect);
        assert!(m.handle(Event::RetryDue(token)).is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.sessions_opened(), 1);
    }

    #[test]
    fn test_messages_newest_first() {
        let mut m = machine(5);
        m.handle(Event::Start);
        m.handle(transport(SessionId(1), TransportEvent::Connected));
        for payload in ["A", "B", "C"] {
            m.handle(transport(
                SessionId(1),
                TransportEvent::MessageArrived {
                    topic: "t".to_string(),
                    payload: payload.to_string(),
                },
            ));
        }
        assert_eq!(m.snapshot().messages(), vec!["C", "B", "A"]);
    }

    #[test]
    fn test_publish_and_subscribe_gated_on_connected() {
        let mut m = machine(5);
        assert!(m
            .handle(Event::Subscribe {
                topic: "t".to_string()
            })
            .is_empty());

        m.handle(Event::Start);
        assert!(m
            .handle(Event::Publish {
                topic: "t".to_string(),
                payload: "p".to_string()
            })
            .is_empty());

        m.handle(transport(SessionId(1), TransportEvent::Connected));
        assert_eq!(
            m.handle(Event::Subscribe {
                topic: "t".to_string()
            }),
            vec![Effect::Subscribe {
                session: SessionId(1),
                topic: "t".to_string()
            }]
        );
    }

    #[test]
    fn test_disconnect_cancels_retry_and_is_idempotent() {
        let mut m = machine(5);
        m.handle(Event::Start);
        let effects = m.handle(failed(SessionId(1)));
        let token = scheduled_token(&effects);

        assert_eq!(m.handle(Event::Disconnect), vec![Effect::CancelRetry(token)]);
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.handle(Event::Disconnect).is_empty());
    }

    #[test]
    fn test_disconnect_releases_connected_session() {
        let mut m = machine(5);
        m.handle(Event::Start);
        m.handle(transport(SessionId(1), TransportEvent::Connected));

        assert_eq!(
            m.handle(Event::Disconnect),
            vec![Effect::ReleaseSession(SessionId(1))]
        );
    }

    #[test]
    fn test_teardown_makes_machine_inert() {
        let mut m = machine(5);
        m.handle(Event::Start);
        let effects = m.handle(failed(SessionId(1)));
        let token = scheduled_token(&effects);

        assert_eq!(m.handle(Event::Teardown), vec![Effect::CancelRetry(token)]);
        assert!(m.is_torn_down());
        assert!(m.handle(Event::RetryDue(token)).is_empty());
        assert!(m.handle(Event::Restart).is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.sessions_opened(), 1);
    }

    #[test]
    fn test_restart_from_failed_resets_budget() {
        let mut m = machine(1);
        m.handle(Event::Start);
        m.handle(failed(SessionId(1)));
        assert_eq!(m.state(), ConnectionState::Failed);

        let effects = m.handle(Event::Restart);
        assert_eq!(effects, vec![Effect::OpenSession(SessionId(2))]);
        assert_eq!(m.attempts_used(), 0);
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_restart_ignored_while_connected() {
        let mut m = machine(5);
        m.handle(Event::Start);
        m.handle(transport(SessionId(1), TransportEvent::Connected));
        assert!(m.handle(Event::Restart).is_empty());
        assert_eq!(m.sessions_opened(), 1);
    }

    #[test]
    fn test_attempts_never_exceed_max() {
        for max_attempts in 1..6 {
            let mut m = machine(max_attempts);
            let mut effects = m.handle(Event::Start);
            while m.state() != ConnectionState::Failed {
                let session = m.current_session().expect("session while connecting");
                effects = m.handle(failed(session));
                assert!(m.attempts_used() <= max_attempts);
                if m.state() == ConnectionState::RetryWaiting {
                    effects = m.handle(Event::RetryDue(scheduled_token(&effects)));
                }
            }
            assert!(effects.iter().all(|e| !matches!(e, Effect::ScheduleRetry { .. })));
            assert_eq!(m.sessions_opened(), u64::from(max_attempts));
        }
    }
}
