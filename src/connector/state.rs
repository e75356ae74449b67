//! Connection state, retry policy and the published snapshot

use crate::config::ConfigError;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle state of the connector. Exactly one is current at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, no attempt issued yet
    Idle,
    /// Handshake in flight on the current session
    Connecting,
    /// Session established; publish and subscribe are live
    Connected,
    /// Waiting for the retry timer before the next attempt
    RetryWaiting,
    /// Stopped on request
    Disconnected,
    /// Retry budget exhausted; no automatic attempts remain
    Failed,
}

impl ConnectionState {
    /// States that are left only through an explicit caller action
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::RetryWaiting => "retry_waiting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded retry strategy shared by initial-connect and post-loss recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed handshakes tolerated before giving up
    pub max_attempts: u32,
    /// Delay before a retry once `backoff_pattern` is exhausted (or when it is empty)
    pub delay_ms: u64,
    /// Optional per-attempt delays in milliseconds
    pub backoff_pattern: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 3000,
            backoff_pattern: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Fixed delay between attempts
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
            backoff_pattern: Vec::new(),
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let millis = self
            .backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.delay_ms);
        Duration::from_millis(millis)
    }

    /// Total time spent waiting if every retry is used, saturating at `Duration::MAX`
    pub fn calculate_max_total_time(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| self.delay_for_attempt(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidRetryPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Most recent transport failure, kept for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub code: i32,
    pub message: String,
    /// True for a drop of an established connection, false for a handshake failure
    pub lost_after_connect: bool,
}

/// Read-only view of the connector published after every processed event
#[derive(Debug, Clone)]
pub struct ConnectorSnapshot {
    pub state: ConnectionState,
    /// Failed handshakes since the last successful connect
    pub retry_count: u32,
    pub max_retries: u32,
    /// Received payloads, newest first. Never mutated once published.
    pub messages: Arc<VecDeque<String>>,
    /// Total payloads received, including evicted ones
    pub messages_received: u64,
    /// Drops of an established connection over the manager's lifetime
    pub connection_losses: u32,
    pub last_error: Option<TransportFailure>,
}

impl ConnectorSnapshot {
    pub fn initial(max_retries: u32) -> Self {
        Self {
            state: ConnectionState::Idle,
            retry_count: 0,
            max_retries,
            messages: Arc::new(VecDeque::new()),
            messages_received: 0,
            connection_losses: 0,
            last_error: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Owned copy of the message history, newest first
    pub fn messages(&self) -> Vec<String> {
        self.messages.iter().cloned().collect()
    }

    /// Cheap comparison: message histories are compared by identity
    pub fn same_as(&self, other: &ConnectorSnapshot) -> bool {
        self.state == other.state
            && self.retry_count == other.retry_count
            && self.max_retries == other.max_retries
            && self.messages_received == other.messages_received
            && self.connection_losses == other.connection_losses
            && self.last_error == other.last_error
            && Arc::ptr_eq(&self.messages, &other.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_ms, 3000);
        assert!(policy.backoff_pattern.is_empty());
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed(3, 250);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(250));
    }

    #[test]
    fn test_backoff_pattern_then_sustained_delay() {
        let policy = RetryPolicy {
            max_attempts: 10,
            delay_ms: 1000,
            backoff_pattern: vec![25, 50, 100, 250],
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(25));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(100), Duration::from_millis(1000));
        // attempt 0 is treated like the first retry
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(25));
    }

    #[test]
    fn test_calculate_max_total_time() {
        // 3 attempts means at most 2 waits
        let policy = RetryPolicy::fixed(3, 500);
        assert_eq!(policy.calculate_max_total_time(), Duration::from_millis(1000));

        let single = RetryPolicy::fixed(1, 500);
        assert_eq!(single.calculate_max_total_time(), Duration::ZERO);
    }

    #[test]
    fn test_max_total_time_saturates() {
        // u64::MAX ms is ~1.8e16 s, so a couple of thousand waits exceed Duration::MAX
        let policy = RetryPolicy::fixed(2_000, u64::MAX);
        assert_eq!(policy.calculate_max_total_time(), Duration::MAX);
    }

    #[test]
    fn test_zero_attempts_invalid() {
        let policy = RetryPolicy::fixed(0, 100);
        assert!(matches!(
            policy.validate(),
            Err(ConfigError::InvalidRetryPolicy(_))
        ));
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(!ConnectionState::RetryWaiting.is_terminal());
        assert!(!ConnectionState::Idle.is_terminal());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::RetryWaiting.to_string(), "retry_waiting");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }

    #[test]
    fn test_snapshot_identity_comparison() {
        let a = ConnectorSnapshot::initial(5);
        let b = a.clone();
        assert!(a.same_as(&b));

        let mut c = a.clone();
        c.messages = Arc::new(VecDeque::from(vec!["x".to_string()]));
        assert!(!a.same_as(&c));

        let mut d = a.clone();
        d.state = ConnectionState::Connecting;
        assert!(!a.same_as(&d));
    }
}
