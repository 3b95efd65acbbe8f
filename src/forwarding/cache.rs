//! Per-backend retry queues for undeliverable forwarding messages.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::warn;

use super::ForwardingMessage;

/// Bounded FIFO retry queues, one per backend target.
///
/// Entries are created when a send fails, appended to on successive
/// failures, and drained when the target reconnects. Queues for different
/// backends are independent; access to a single queue is serialized by the
/// store-wide mutex, which is held only for queue manipulation, never
/// across a send.
///
/// Each queue is capped at `capacity`: when full, the oldest message is
/// evicted so a long outage keeps the freshest votes rather than growing
/// without bound.
pub struct VoteCache {
    entries: Mutex<HashMap<String, VecDeque<ForwardingMessage>>>,
    capacity: usize,
}

impl VoteCache {
    /// Create a cache with the given per-backend capacity.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be at least 1");
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Queue a message for a backend that could not be reached.
    pub fn add(&self, target: &str, message: ForwardingMessage) {
        let mut entries = self.lock();
        let queue = entries.entry(target.to_string()).or_default();

        if queue.len() >= self.capacity {
            queue.pop_front();
            warn!(
                target = target,
                capacity = self.capacity,
                "Vote cache full, dropping oldest queued vote"
            );
        }
        queue.push_back(message);
    }

    /// Take up to `max` messages from the front of a backend's queue,
    /// preserving submission order.
    pub fn drain(&self, target: &str, max: usize) -> Vec<ForwardingMessage> {
        let mut entries = self.lock();
        let Some(queue) = entries.get_mut(target) else {
            return Vec::new();
        };

        let take = max.min(queue.len());
        let drained: Vec<ForwardingMessage> = queue.drain(..take).collect();

        if queue.is_empty() {
            entries.remove(target);
        }
        drained
    }

    /// Return undelivered messages to the front of the queue after a flush
    /// failed partway. `messages` must be in their original order.
    pub fn requeue_front(&self, target: &str, messages: Vec<ForwardingMessage>) {
        if messages.is_empty() {
            return;
        }
        let mut entries = self.lock();
        let queue = entries.entry(target.to_string()).or_default();
        for message in messages.into_iter().rev() {
            queue.push_front(message);
        }
        // Requeueing can momentarily exceed capacity; trim from the front.
        while queue.len() > self.capacity {
            queue.pop_front();
        }
    }

    /// Number of messages queued for a backend.
    pub fn len(&self, target: &str) -> usize {
        self.lock().get(target).map_or(0, |q| q.len())
    }

    /// Whether nothing is queued for a backend.
    pub fn is_empty(&self, target: &str) -> bool {
        self.len(target) == 0
    }

    /// Backends that currently have queued messages.
    pub fn targets(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<ForwardingMessage>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
