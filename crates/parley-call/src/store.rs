//! Durable call records, as seen by the core.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use parley_common::{Call, CallId, CallStatus, MediaKind, UserId};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::StoreError;

/// Push feed of changed call records involving one user.
pub type CallFeed = mpsc::UnboundedReceiver<Call>;

#[async_trait]
pub trait CallRecordStore: Send + Sync {
    async fn create_call(
        &self,
        caller_id: &str,
        receiver_id: &str,
        media_kind: MediaKind,
    ) -> Result<Call, StoreError>;

    /// Move a call to `status`. Repeating a status, or ending an already
    /// terminal call, is a no-op returning the current record.
    async fn update_status(&self, id: CallId, status: CallStatus) -> Result<Call, StoreError>;

    async fn get(&self, id: CallId) -> Result<Option<Call>, StoreError>;

    /// Changes to calls where `user` is a participant.
    async fn subscribe(&self, user: &str) -> Result<CallFeed, StoreError>;

    async fn accept(&self, id: CallId) -> Result<Call, StoreError> {
        self.update_status(id, CallStatus::Accepted).await
    }

    async fn reject(&self, id: CallId) -> Result<Call, StoreError> {
        self.update_status(id, CallStatus::Rejected).await
    }

    async fn end(&self, id: CallId) -> Result<Call, StoreError> {
        self.update_status(id, CallStatus::Ended).await
    }
}

/// Apply `status` to `call` with store semantics. Returns whether the record changed.
pub fn apply_status(call: &mut Call, status: CallStatus) -> Result<bool, StoreError> {
    if call.status == status || (call.status.is_terminal() && status.is_terminal()) {
        return Ok(false);
    }
    if !call.status.can_transition_to(status) {
        return Err(StoreError::IllegalTransition {
            id: call.id,
            from: call.status,
            to: status,
        });
    }
    call.transition(status)
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    Ok(true)
}

/// Fan-out of record changes to subscribed participants.
#[derive(Default)]
pub struct FeedRegistry {
    feeds: Mutex<Vec<(UserId, mpsc::UnboundedSender<Call>)>>,
}

impl FeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, user: &str) -> CallFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut feeds) = self.feeds.lock() {
            feeds.push((user.to_string(), tx));
        }
        rx
    }

    /// Push `call` to both participants, dropping closed feeds.
    pub fn notify(&self, call: &Call) {
        let Ok(mut feeds) = self.feeds.lock() else {
            return;
        };
        feeds.retain(|(user, tx)| {
            if !call.involves(user) {
                return !tx.is_closed();
            }
            tx.send(call.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.feeds.lock().map(|f| f.len()).unwrap_or_default()
    }
}

/// In-process store, shared by every controller that holds it.
#[derive(Default)]
pub struct MemoryCallStore {
    calls: Mutex<HashMap<CallId, Call>>,
    feeds: FeedRegistry,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> StoreError {
        StoreError::Backend("call table lock poisoned".to_string())
    }
}

#[async_trait]
impl CallRecordStore for MemoryCallStore {
    async fn create_call(
        &self,
        caller_id: &str,
        receiver_id: &str,
        media_kind: MediaKind,
    ) -> Result<Call, StoreError> {
        let call = Call::ringing(CallId::new(), caller_id, receiver_id, media_kind);
        self.calls
            .lock()
            .map_err(|_| Self::poisoned())?
            .insert(call.id, call.clone());
        debug!("created call record {} ({} -> {})", call.id, caller_id, receiver_id);
        self.feeds.notify(&call);
        Ok(call)
    }

    async fn update_status(&self, id: CallId, status: CallStatus) -> Result<Call, StoreError> {
        let (call, changed) = {
            let mut calls = self.calls.lock().map_err(|_| Self::poisoned())?;
            let call = calls.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            let changed = apply_status(call, status)?;
            (call.clone(), changed)
        };
        if changed {
            debug!("call record {} is now {}", id, call.status);
            self.feeds.notify(&call);
        }
        Ok(call)
    }

    async fn get(&self, id: CallId) -> Result<Option<Call>, StoreError> {
        Ok(self
            .calls
            .lock()
            .map_err(|_| Self::poisoned())?
            .get(&id)
            .cloned())
    }

    async fn subscribe(&self, user: &str) -> Result<CallFeed, StoreError> {
        Ok(self.feeds.subscribe(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_and_feed() {
        let store = MemoryCallStore::new();
        let mut bob = store.subscribe("bob").await.unwrap();
        let mut carol = store.subscribe("carol").await.unwrap();

        let call = store
            .create_call("alice", "bob", MediaKind::Video)
            .await
            .unwrap();
        assert_eq!(bob.recv().await.unwrap().status, CallStatus::Ringing);

        store.accept(call.id).await.unwrap();
        let connected = store
            .update_status(call.id, CallStatus::Connected)
            .await
            .unwrap();
        assert!(connected.started_at.is_some());
        assert_eq!(bob.recv().await.unwrap().status, CallStatus::Accepted);
        assert_eq!(bob.recv().await.unwrap().status, CallStatus::Connected);
        assert!(carol.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let store = MemoryCallStore::new();
        let call = store
            .create_call("alice", "bob", MediaKind::Audio)
            .await
            .unwrap();
        let ended = store.end(call.id).await.unwrap();
        assert_eq!(ended.status, CallStatus::Ended);
        let again = store.update_status(call.id, CallStatus::Failed).await.unwrap();
        assert_eq!(again.status, CallStatus::Ended);
        assert_eq!(again.ended_at, ended.ended_at);
    }

    #[tokio::test]
    async fn test_illegal_transitions() {
        let store = MemoryCallStore::new();
        let call = store
            .create_call("alice", "bob", MediaKind::Audio)
            .await
            .unwrap();
        let err = store
            .update_status(call.id, CallStatus::Connected)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));

        store.accept(call.id).await.unwrap();
        assert!(store.reject(call.id).await.is_err());
        assert!(matches!(
            store.end(CallId::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_feed_registry_drops_closed() {
        let registry = FeedRegistry::new();
        let rx = registry.subscribe("bob");
        drop(rx);
        let call = Call::ringing(CallId::new(), "alice", "bob", MediaKind::Audio);
        registry.notify(&call);
        assert_eq!(registry.subscriber_count(), 0);
    }
}
