//! HTTP adapters for the gateway's call records and presence lookup.

use std::sync::Arc;

use async_trait::async_trait;
use parley_call::{CallFeed, CallRecordStore, Reachability, StoreError};
use parley_common::{
    Call, CallId, CallStatus, CreateCallRequest, ErrorResponse, MediaKind, PresenceResponse,
    StatusUpdateRequest,
};
use reqwest::StatusCode;
use tracing::warn;

use crate::signaling::GatewayChannel;

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

async fn error_text(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => format!("gateway returned {}", status),
    }
}

/// Call records held by the gateway. Record changes arrive over the bound
/// WebSocket connection as `CallUpdated` pushes.
pub struct RemoteCallStore {
    http: reqwest::Client,
    base_url: String,
    channel: Arc<GatewayChannel>,
}

impl RemoteCallStore {
    pub fn new(base_url: &str, channel: Arc<GatewayChannel>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            channel,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl CallRecordStore for RemoteCallStore {
    async fn create_call(
        &self,
        caller_id: &str,
        receiver_id: &str,
        media_kind: MediaKind,
    ) -> Result<Call, StoreError> {
        let response = self
            .http
            .post(self.url("/v1/calls"))
            .json(&CreateCallRequest {
                caller_id: caller_id.to_string(),
                receiver_id: receiver_id.to_string(),
                media_kind,
            })
            .send()
            .await
            .map_err(backend)?;
        if !response.status().is_success() {
            return Err(StoreError::Backend(error_text(response).await));
        }
        response.json::<Call>().await.map_err(backend)
    }

    async fn update_status(&self, id: CallId, status: CallStatus) -> Result<Call, StoreError> {
        let response = self
            .http
            .post(self.url(&format!("/v1/calls/{}/status", id)))
            .json(&StatusUpdateRequest { status })
            .send()
            .await
            .map_err(backend)?;
        match response.status() {
            s if s.is_success() => response.json::<Call>().await.map_err(backend),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(id)),
            StatusCode::CONFLICT => {
                let from = self
                    .get(id)
                    .await?
                    .map(|call| call.status)
                    .unwrap_or(status);
                Err(StoreError::IllegalTransition {
                    id,
                    from,
                    to: status,
                })
            }
            _ => Err(StoreError::Backend(error_text(response).await)),
        }
    }

    async fn get(&self, id: CallId) -> Result<Option<Call>, StoreError> {
        let response = self
            .http
            .get(self.url(&format!("/v1/calls/{}", id)))
            .send()
            .await
            .map_err(backend)?;
        match response.status() {
            s if s.is_success() => response.json::<Call>().await.map(Some).map_err(backend),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(StoreError::Backend(error_text(response).await)),
        }
    }

    async fn subscribe(&self, user: &str) -> Result<CallFeed, StoreError> {
        self.channel.take_call_feed(user).map_err(backend)
    }
}

/// A user is reachable while they hold a bound gateway connection.
pub struct GatewayPresence {
    http: reqwest::Client,
    base_url: String,
}

impl GatewayPresence {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Reachability for GatewayPresence {
    async fn is_reachable(&self, user: &str) -> bool {
        let url = format!("{}/v1/presence/{}", self.base_url, user);
        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("presence lookup for {} failed: {}", user, e);
                return false;
            }
        };
        match response.json::<PresenceResponse>().await {
            Ok(presence) => presence.online,
            Err(e) => {
                warn!("bad presence response for {}: {}", user, e);
                false
            }
        }
    }
}
