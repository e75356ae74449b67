//! Pure retry decisions and transition logging
//!
//! Everything here is a pure function of its inputs so the lifecycle machine
//! can be tested without timers or transports.

use super::state::{ConnectionState, RetryPolicy};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Why the machine is considering a new attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCause {
    /// The handshake on the current session failed
    HandshakeFailed,
    /// An established connection dropped
    ConnectionLost,
}

/// Outcome of a retry decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then open a fresh session. `attempts_used` is the new counter value.
    Retry { attempts_used: u32, delay: Duration },
    /// Budget exhausted; enter `Failed`
    GiveUp { attempts_used: u32 },
    /// Teardown in progress; do nothing
    AbortTornDown,
}

/// Pure retry and gating decisions
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide what follows a failure.
    ///
    /// A handshake failure consumes one attempt and retries only while the
    /// counter stays below `max_attempts`. A connection loss consumes nothing,
    /// so recovery from a drop always gets at least one attempt.
    pub fn should_attempt_retry(
        attempts_used: u32,
        policy: &RetryPolicy,
        cause: RetryCause,
        torn_down: bool,
    ) -> RetryDecision {
        if torn_down {
            return RetryDecision::AbortTornDown;
        }

        let attempts_used = match cause {
            RetryCause::HandshakeFailed => attempts_used.saturating_add(1),
            RetryCause::ConnectionLost => attempts_used,
        };

        if cause == RetryCause::HandshakeFailed && attempts_used >= policy.max_attempts {
            return RetryDecision::GiveUp { attempts_used };
        }

        RetryDecision::Retry {
            attempts_used,
            delay: policy.delay_for_attempt(attempts_used.max(1)),
        }
    }

    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn can_subscribe(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Only an explicit restart leaves these states
    pub fn can_restart(state: &ConnectionState) -> bool {
        matches!(
            state,
            ConnectionState::Failed | ConnectionState::Disconnected
        )
    }

    /// Log a committed state change
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState, attempts_used: u32) {
        match (from, to) {
            (ConnectionState::Idle, ConnectionState::Connecting) => {
                info!("Opening MQTT session");
            }
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::RetryWaiting) => {
                warn!("MQTT connection lost, scheduling reconnect");
            }
            (ConnectionState::Connecting, ConnectionState::RetryWaiting) => {
                warn!(attempts_used, "MQTT handshake failed, scheduling retry");
            }
            (ConnectionState::RetryWaiting, ConnectionState::Connecting) => {
                info!(attempts_used, "Retrying MQTT connection");
            }
            (_, ConnectionState::Failed) => {
                error!(attempts_used, "MQTT connection failed, retry budget exhausted");
            }
            (_, ConnectionState::Disconnected) => {
                info!("MQTT connector disconnected");
            }
            _ => {
                debug!("MQTT connection state: {} -> {}", from, to);
            }
        }
    }
}
