//! Inbound message history, newest first

use std::collections::VecDeque;
use std::sync::Arc;

/// Ordered history of received payloads.
///
/// The backing storage is shared with published snapshots and copied on the
/// next write while a snapshot still holds it, so a reader's view never
/// changes underneath it.
#[derive(Debug, Clone, Default)]
pub struct MessageBuffer {
    messages: Arc<VecDeque<String>>,
    capacity: Option<usize>,
    received: u64,
}

impl MessageBuffer {
    /// Keeps every message
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Keeps at most `capacity` messages, evicting the oldest. `None` is unbounded.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            capacity: capacity.map(|c| c.max(1)),
            ..Self::default()
        }
    }

    /// Prepend a payload; returns the evicted oldest payload, if any
    pub fn push(&mut self, payload: String) -> Option<String> {
        let messages = Arc::make_mut(&mut self.messages);
        messages.push_front(payload);
        self.received += 1;

        match self.capacity {
            Some(capacity) if messages.len() > capacity => messages.pop_back(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Total pushes, evicted ones included
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Shared, immutable view of the current history
    pub fn snapshot(&self) -> Arc<VecDeque<String>> {
        Arc::clone(&self.messages)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.messages.iter().cloned().collect()
    }
}
