//! Error taxonomy for the call core.

use std::time::Duration;

use parley_common::{CallId, CallStatus, UserId};
use parley_media::MediaError;
use thiserror::Error;

/// Failures of the signaling transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("peer {0} is not reachable")]
    PeerUnreachable(UserId),
    #[error("signaling channel closed")]
    Closed,
    #[error("user {0} already has a subscriber")]
    AlreadySubscribed(UserId),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Failures of the call record store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("call {0} not found")]
    NotFound(CallId),
    #[error("call {id}: illegal status change {from} -> {to}")]
    IllegalTransition {
        id: CallId,
        from: CallStatus,
        to: CallStatus,
    },
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Failures reported by the native peer-connection primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("operation {op} invalid in signaling state {state}")]
    InvalidState { op: &'static str, state: String },
    #[error("unknown sender {0}")]
    UnknownSender(u32),
    #[error("peer connection closed")]
    Closed,
    #[error("malformed session description: {0}")]
    BadDescription(String),
    #[error("native error: {0}")]
    Native(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    /// Capture failed and the local policy requires media.
    #[error("no local media available")]
    NoLocalMedia,
    #[error("media unavailable: {0}")]
    MediaUnavailable(#[from] MediaError),
    #[error("peer {0} is unreachable")]
    PeerUnreachable(UserId),
    #[error("negotiation conflict on call {0}")]
    NegotiationConflict(CallId),
    #[error("renegotiation did not settle within {0:?}")]
    RenegotiationTimeout(Duration),
    #[error("ICE connectivity failed on call {0}")]
    IceFailed(CallId),
    #[error("stale message: {0}")]
    StaleMessage(String),
    #[error("no active call")]
    NoActiveCall,
    #[error("unknown call {0}")]
    UnknownCall(CallId),
    #[error("call {id} is {status}; cannot {op}")]
    InvalidState {
        id: CallId,
        status: CallStatus,
        op: &'static str,
    },
    #[error("another call ({0}) is active")]
    Busy(CallId),
    #[error("an operation on call {0} is already in flight")]
    InFlight(CallId),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

pub type Result<T> = std::result::Result<T, CallError>;
