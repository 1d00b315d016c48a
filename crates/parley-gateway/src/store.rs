//! SQLite-backed call records with push of every change to both participants.

use async_trait::async_trait;
use parley_call::store::apply_status;
use parley_call::{CallFeed, CallRecordStore, FeedRegistry, StoreError};
use parley_common::{Call, CallId, CallStatus, MediaKind};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::db;

/// Concurrent writers retry this many times before giving up.
const UPDATE_ATTEMPTS: usize = 5;

fn backend(err: anyhow::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

pub struct SqliteCallStore {
    pool: SqlitePool,
    feeds: FeedRegistry,
}

impl SqliteCallStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            feeds: FeedRegistry::new(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn subscriber_count(&self) -> usize {
        self.feeds.subscriber_count()
    }
}

#[async_trait]
impl CallRecordStore for SqliteCallStore {
    async fn create_call(
        &self,
        caller_id: &str,
        receiver_id: &str,
        media_kind: MediaKind,
    ) -> Result<Call, StoreError> {
        let call = Call::ringing(CallId::new(), caller_id, receiver_id, media_kind);
        db::insert_call(&self.pool, &call).await.map_err(backend)?;
        info!(
            "call {} created: {} -> {} ({})",
            call.id, caller_id, receiver_id, media_kind
        );
        self.feeds.notify(&call);
        Ok(call)
    }

    async fn update_status(&self, id: CallId, status: CallStatus) -> Result<Call, StoreError> {
        for _ in 0..UPDATE_ATTEMPTS {
            let mut call = db::get_call(&self.pool, id)
                .await
                .map_err(backend)?
                .ok_or(StoreError::NotFound(id))?;
            let expected = call.status;
            if !apply_status(&mut call, status)? {
                return Ok(call);
            }
            if db::update_call_status(&self.pool, &call, expected)
                .await
                .map_err(backend)?
            {
                debug!("call {}: {} -> {}", id, expected, call.status);
                self.feeds.notify(&call);
                return Ok(call);
            }
            debug!("call {}: concurrent status change, retrying", id);
        }
        Err(StoreError::Backend(format!(
            "call {}: status kept changing underneath",
            id
        )))
    }

    async fn get(&self, id: CallId) -> Result<Option<Call>, StoreError> {
        db::get_call(&self.pool, id).await.map_err(backend)
    }

    async fn subscribe(&self, user: &str) -> Result<CallFeed, StoreError> {
        Ok(self.feeds.subscribe(user))
    }
}
