//! In-process signaling hub with fault injection.
//!
//! Every subscribed user gets a mailbox. Links can be cut per direction,
//! traffic can be held and released in order, and delivery can be doubled
//! to exercise receiver-side dedup.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use parley_common::{SignalKind, SignalingMessage, UserId};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::SignalingError;
use crate::signaling::{Reachability, SignalStream, SignalingChannel};

#[derive(Default)]
struct HubState {
    mailboxes: HashMap<UserId, mpsc::UnboundedSender<SignalingMessage>>,
    cut: HashSet<(UserId, UserId)>,
    duplicate: bool,
    holding: bool,
    held: Vec<SignalingMessage>,
    log: Vec<(UserId, UserId, SignalKind)>,
}

impl HubState {
    fn deliver(&mut self, message: SignalingMessage) -> Result<(), SignalingError> {
        let to = message.to_user_id.clone();
        let Some(tx) = self.mailboxes.get(&to) else {
            return Err(SignalingError::PeerUnreachable(to));
        };
        let copies = if self.duplicate { 2 } else { 1 };
        for _ in 0..copies {
            if tx.send(message.clone()).is_err() {
                self.mailboxes.remove(&to);
                return Err(SignalingError::PeerUnreachable(to));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct LoopbackHub {
    state: Mutex<HubState>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Silently drop everything `from` sends to `to`.
    pub fn cut_link(&self, from: &str, to: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.cut.insert((from.to_string(), to.to_string()));
        }
    }

    pub fn restore_link(&self, from: &str, to: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.cut.remove(&(from.to_string(), to.to_string()));
        }
    }

    /// Deliver every message twice.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.duplicate = enabled;
        }
    }

    /// Queue traffic instead of delivering it until [`LoopbackHub::release`].
    pub fn hold(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.holding = true;
        }
    }

    /// Deliver held traffic in send order and resume normal delivery.
    pub fn release(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.holding = false;
        let held = std::mem::take(&mut state.held);
        for message in held {
            if let Err(e) = state.deliver(message) {
                debug!("held message undeliverable: {}", e);
            }
        }
    }

    pub fn held(&self) -> usize {
        self.state.lock().map(|s| s.held.len()).unwrap_or_default()
    }

    /// Drop the mailbox of `user`, making them unreachable.
    pub fn disconnect(&self, user: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.mailboxes.remove(user);
        }
    }

    /// Kinds of every message accepted for sending, in order.
    pub fn sent(&self) -> Vec<(UserId, UserId, SignalKind)> {
        self.state.lock().map(|s| s.log.clone()).unwrap_or_default()
    }

    /// Number of messages of `kind` sent by `from`.
    pub fn count(&self, from: &str, kind: SignalKind) -> usize {
        self.sent()
            .iter()
            .filter(|(f, _, k)| f == from && *k == kind)
            .count()
    }
}

#[async_trait]
impl SignalingChannel for LoopbackHub {
    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SignalingError::Transport("hub lock poisoned".to_string()))?;
        if !state.mailboxes.contains_key(&message.to_user_id) {
            return Err(SignalingError::PeerUnreachable(message.to_user_id));
        }
        trace!(
            "{} -> {}: {} ({})",
            message.from_user_id,
            message.to_user_id,
            message.kind(),
            message.call_id
        );
        state.log.push((
            message.from_user_id.clone(),
            message.to_user_id.clone(),
            message.kind(),
        ));
        if state
            .cut
            .contains(&(message.from_user_id.clone(), message.to_user_id.clone()))
        {
            debug!("dropping {} on cut link", message.kind());
            return Ok(());
        }
        if state.holding {
            state.held.push(message);
            return Ok(());
        }
        state.deliver(message)
    }

    async fn subscribe(&self, user: &str) -> Result<SignalStream, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self
            .state
            .lock()
            .map_err(|_| SignalingError::Transport("hub lock poisoned".to_string()))?;
        if let Some(existing) = state.mailboxes.get(user) {
            if !existing.is_closed() {
                return Err(SignalingError::AlreadySubscribed(user.to_string()));
            }
        }
        state.mailboxes.insert(user.to_string(), tx);
        Ok(rx)
    }
}

#[async_trait]
impl Reachability for LoopbackHub {
    async fn is_reachable(&self, user: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.mailboxes.get(user).is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::{CallId, SignalPayload};

    fn hangup(from: &str, to: &str) -> SignalingMessage {
        SignalingMessage::new(CallId::new(), from, to, SignalPayload::Hangup)
    }

    #[tokio::test]
    async fn test_delivery_and_reachability() {
        let hub = LoopbackHub::new();
        let mut bob = hub.subscribe("bob").await.unwrap();
        assert!(hub.is_reachable("bob").await);
        assert!(!hub.is_reachable("carol").await);

        hub.send(hangup("alice", "bob")).await.unwrap();
        assert_eq!(bob.recv().await.unwrap().kind(), SignalKind::Hangup);
        assert!(matches!(
            hub.send(hangup("alice", "carol")).await,
            Err(SignalingError::PeerUnreachable(_))
        ));
        assert!(matches!(
            hub.subscribe("bob").await,
            Err(SignalingError::AlreadySubscribed(_))
        ));
    }

    #[tokio::test]
    async fn test_cut_link_drops_silently() {
        let hub = LoopbackHub::new();
        let mut bob = hub.subscribe("bob").await.unwrap();
        hub.cut_link("alice", "bob");
        hub.send(hangup("alice", "bob")).await.unwrap();
        assert!(bob.try_recv().is_err());

        hub.restore_link("alice", "bob");
        hub.send(hangup("alice", "bob")).await.unwrap();
        assert!(bob.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_hold_preserves_order() {
        let hub = LoopbackHub::new();
        let mut bob = hub.subscribe("bob").await.unwrap();
        hub.hold();
        let first = hangup("alice", "bob");
        let second = hangup("alice", "bob");
        hub.send(first.clone()).await.unwrap();
        hub.send(second.clone()).await.unwrap();
        assert_eq!(hub.held(), 2);
        assert!(bob.try_recv().is_err());

        hub.release();
        assert_eq!(bob.recv().await.unwrap().id, first.id);
        assert_eq!(bob.recv().await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_duplicate_delivery() {
        let hub = LoopbackHub::new();
        let mut bob = hub.subscribe("bob").await.unwrap();
        hub.set_duplicate_delivery(true);
        let msg = hangup("alice", "bob");
        hub.send(msg.clone()).await.unwrap();
        assert_eq!(bob.recv().await.unwrap().id, msg.id);
        assert_eq!(bob.recv().await.unwrap().id, msg.id);
    }
}
