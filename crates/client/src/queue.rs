//! Bounded outbound message queue.
//!
//! Holds messages produced while the connection is not `connected`.
//! When full, the lowest-priority, oldest entry is evicted (a new
//! `normal` message is refused outright if everything queued is `high`).
//! Draining yields every `high` message before any `normal` one, FIFO
//! within a tier.

use std::collections::VecDeque;

use chrono::Utc;
use jobsync_core::types::Timestamp;
use uuid::Uuid;

use crate::messages::ClientMessage;

/// Transmission attempts after which a message is dropped.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Delivery priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// An outbound message awaiting delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub payload: ClientMessage,
    pub enqueued_at: Timestamp,
    pub priority: Priority,
    /// Number of transmission attempts so far.
    pub retry_count: u32,
}

impl QueuedMessage {
    pub fn new(payload: ClientMessage, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            enqueued_at: Utc::now(),
            priority,
            retry_count: 0,
        }
    }
}

/// What happened to a message handed to [`MessageQueue::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queued, and this older message was evicted to make room.
    Evicted(QueuedMessage),
    /// The queue is full of higher-priority messages; not queued.
    Rejected(QueuedMessage),
}

/// Bounded two-tier FIFO.
#[derive(Debug)]
pub struct MessageQueue {
    capacity: usize,
    high: VecDeque<QueuedMessage>,
    normal: VecDeque<QueuedMessage>,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            high: VecDeque::new(),
            normal: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, payload: ClientMessage, priority: Priority) -> EnqueueOutcome {
        self.push(QueuedMessage::new(payload, priority))
    }

    /// Insert an already-built message at the back of its tier.
    pub fn push(&mut self, message: QueuedMessage) -> EnqueueOutcome {
        if self.capacity == 0 {
            return EnqueueOutcome::Rejected(message);
        }

        let mut outcome = EnqueueOutcome::Queued;
        if self.len() >= self.capacity {
            let evicted = match (self.normal.pop_front(), message.priority) {
                (Some(oldest_normal), _) => oldest_normal,
                (None, Priority::Normal) => return EnqueueOutcome::Rejected(message),
                (None, Priority::High) => match self.high.pop_front() {
                    Some(oldest_high) => oldest_high,
                    None => return EnqueueOutcome::Rejected(message),
                },
            };
            tracing::warn!(
                message_id = %evicted.id,
                priority = ?evicted.priority,
                capacity = self.capacity,
                "Outbound queue full, evicting message",
            );
            outcome = EnqueueOutcome::Evicted(evicted);
        }

        self.tier_mut(message.priority).push_back(message);
        outcome
    }

    /// Take the next message to transmit and count the attempt.
    ///
    /// Call [`requeue_front`](Self::requeue_front) if the send fails; drop
    /// the message on success.
    pub fn pop_next(&mut self) -> Option<QueuedMessage> {
        let mut message = self.high.pop_front().or_else(|| self.normal.pop_front())?;
        message.retry_count += 1;
        Some(message)
    }

    /// Put back a message whose transmission failed, ahead of its tier.
    ///
    /// Returns `false` (and drops the message) once it has used up
    /// [`MAX_DELIVERY_ATTEMPTS`].
    pub fn requeue_front(&mut self, message: QueuedMessage) -> bool {
        if message.retry_count >= MAX_DELIVERY_ATTEMPTS {
            tracing::warn!(
                message_id = %message.id,
                attempts = message.retry_count,
                "Dropping outbound message after repeated send failures",
            );
            return false;
        }
        self.tier_mut(message.priority).push_front(message);
        true
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<QueuedMessage> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
        }
    }
}
