//! HTTP surface over the call record store.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_call::{CallRecordStore, StoreError};
use parley_common::{
    Call, CallId, CallStatus, CreateCallRequest, ErrorResponse, PresenceResponse,
    StatusUpdateRequest,
};
use serde::Serialize;
use tracing::warn;

use crate::{security, AppState};

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::IllegalTransition { .. } => StatusCode::CONFLICT,
            StoreError::Backend(_) => {
                warn!("call store failure: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_call_id(raw: &str) -> ApiResult<CallId> {
    raw.parse()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Invalid call id"))
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_ws_connections: usize,
    pub bound_users: usize,
    pub feed_subscribers: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let bound_users = state.connections.read().await.len();
    Json(HealthResponse {
        status: "ok",
        active_ws_connections: state.active_connections(),
        bound_users,
        feed_subscribers: state.store.subscriber_count(),
    })
}

pub async fn create_call(
    State(state): State<AppState>,
    Json(payload): Json<CreateCallRequest>,
) -> ApiResult<(StatusCode, Json<Call>)> {
    if !security::is_valid_user_id(&payload.caller_id)
        || !security::is_valid_user_id(&payload.receiver_id)
    {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Invalid user id"));
    }
    if payload.caller_id == payload.receiver_id {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Caller and receiver must differ",
        ));
    }
    let call = state
        .store
        .create_call(&payload.caller_id, &payload.receiver_id, payload.media_kind)
        .await?;
    Ok((StatusCode::CREATED, Json(call)))
}

pub async fn get_call(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Call>> {
    let id = parse_call_id(&id)?;
    match state.store.get(id).await? {
        Some(call) => Ok(Json(call)),
        None => Err(StoreError::NotFound(id).into()),
    }
}

async fn move_to(state: &AppState, raw_id: &str, status: CallStatus) -> ApiResult<Json<Call>> {
    let id = parse_call_id(raw_id)?;
    let call = state.store.update_status(id, status).await?;
    Ok(Json(call))
}

pub async fn accept_call(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Call>> {
    move_to(&state, &id, CallStatus::Accepted).await
}

pub async fn reject_call(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Call>> {
    move_to(&state, &id, CallStatus::Rejected).await
}

pub async fn end_call(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Call>> {
    move_to(&state, &id, CallStatus::Ended).await
}

pub async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<StatusUpdateRequest>,
) -> ApiResult<Json<Call>> {
    move_to(&state, &id, payload.status).await
}

/// A user is online while they hold a bound signaling connection.
pub async fn presence(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<PresenceResponse> {
    let online = state.connections.read().await.contains_key(&user_id);
    Json(PresenceResponse { user_id, online })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_http_status() {
        let id = CallId::new();
        assert_eq!(
            ApiError::from(StoreError::NotFound(id)).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(StoreError::IllegalTransition {
                id,
                from: CallStatus::Ended,
                to: CallStatus::Connected,
            })
            .status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(StoreError::Backend("disk full".into())).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_call_id_parsing() {
        assert!(parse_call_id("not-a-uuid").is_err());
        let id = CallId::new();
        assert_eq!(parse_call_id(&id.to_string()).ok(), Some(id));
    }
}
