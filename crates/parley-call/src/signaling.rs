//! Transport-agnostic signaling contract.
//!
//! Any transport (WebSocket relay, database change feed, in-process hub)
//! becomes a thin adapter implementing [`SignalingChannel`] and
//! [`Reachability`].

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use parley_common::{MessageId, SignalingMessage};
use tokio::sync::mpsc;

use crate::error::SignalingError;

/// Inbound messages addressed to one user.
pub type SignalStream = mpsc::UnboundedReceiver<SignalingMessage>;

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Deliver `message` to `message.to_user_id`.
    ///
    /// Best effort and ordered per `(from, to)` pair. Failures are reported,
    /// never retried here.
    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Stream of messages addressed to `user`. Delivery is at-least-once.
    async fn subscribe(&self, user: &str) -> Result<SignalStream, SignalingError>;
}

/// Lookup of whether a user can currently be addressed by the channel.
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn is_reachable(&self, user: &str) -> bool;
}

/// Remembers recently consumed message ids so redelivered messages are no-ops.
#[derive(Debug)]
pub struct Deduplicator {
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl Deduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Mark `message` processed. Returns `false` if it already was.
    pub fn accept(&mut self, message: &mut SignalingMessage) -> bool {
        if message.processed || self.seen.contains(&message.id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(message.id);
        self.order.push_back(message.id);
        message.processed = true;
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(1024)
    }
}
