use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::call::{Call, CallId, CallStatus, MediaKind, UserId};
use crate::error::Result;

/// Unique identity of one signaling message, used for receiver-side dedup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as produced by the native negotiation primitive.
/// The `sdp` body is never interpreted outside the peer-connection adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled network path candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// Closed set of signaling payloads exchanged between two peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum SignalPayload {
    /// Caller announces a new call.
    Invite { media_kind: MediaKind },
    /// Receiver accepted; the caller may now send the initial offer.
    Accept,
    /// Receiver declined a ringing call.
    Reject { reason: Option<String> },
    /// Either side hung up.
    Hangup,
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    RenegotiationOffer(SessionDescription),
    RenegotiationAnswer(SessionDescription),
    /// The sender gave up on the call (ICE failure, transport failure).
    CallFailed { reason: String },
    /// Sender's current media composition.
    MediaState { video: bool, audio: bool, screen: bool },
}

/// Flat discriminant of [`SignalPayload`], handy for logging and storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Invite,
    Accept,
    Reject,
    Hangup,
    Offer,
    Answer,
    IceCandidate,
    RenegotiationOffer,
    RenegotiationAnswer,
    CallFailed,
    MediaState,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Invite => "invite",
            SignalKind::Accept => "accept",
            SignalKind::Reject => "reject",
            SignalKind::Hangup => "hangup",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice_candidate",
            SignalKind::RenegotiationOffer => "renegotiation_offer",
            SignalKind::RenegotiationAnswer => "renegotiation_answer",
            SignalKind::CallFailed => "call_failed",
            SignalKind::MediaState => "media_state",
        }
    }

    /// Kinds that mutate negotiation state and need a session to be applied.
    pub fn is_negotiation(self) -> bool {
        matches!(
            self,
            SignalKind::Offer
                | SignalKind::Answer
                | SignalKind::IceCandidate
                | SignalKind::RenegotiationOffer
                | SignalKind::RenegotiationAnswer
        )
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Invite { .. } => SignalKind::Invite,
            SignalPayload::Accept => SignalKind::Accept,
            SignalPayload::Reject { .. } => SignalKind::Reject,
            SignalPayload::Hangup => SignalKind::Hangup,
            SignalPayload::Offer(_) => SignalKind::Offer,
            SignalPayload::Answer(_) => SignalKind::Answer,
            SignalPayload::IceCandidate(_) => SignalKind::IceCandidate,
            SignalPayload::RenegotiationOffer(_) => SignalKind::RenegotiationOffer,
            SignalPayload::RenegotiationAnswer(_) => SignalKind::RenegotiationAnswer,
            SignalPayload::CallFailed { .. } => SignalKind::CallFailed,
            SignalPayload::MediaState { .. } => SignalKind::MediaState,
        }
    }
}

/// One unit of signaling traffic between exactly two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub id: MessageId,
    pub call_id: CallId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    /// For answers: the offer message this answers.
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    pub payload: SignalPayload,
    /// Set once the receiver consumed the message.
    #[serde(default)]
    pub processed: bool,
    pub sent_at: DateTime<Utc>,
}

impl SignalingMessage {
    pub fn new(
        call_id: CallId,
        from_user_id: impl Into<UserId>,
        to_user_id: impl Into<UserId>,
        payload: SignalPayload,
    ) -> Self {
        Self {
            id: MessageId::new(),
            call_id,
            from_user_id: from_user_id.into(),
            to_user_id: to_user_id.into(),
            reply_to: None,
            payload,
            processed: false,
            sent_at: Utc::now(),
        }
    }

    pub fn in_reply_to(mut self, id: MessageId) -> Self {
        self.reply_to = Some(id);
        self
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }
}

/// Frames exchanged between a client and the signaling gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum GatewayFrame {
    /// Client binds its connection to a user id. Must be the first frame.
    Bind { user_id: UserId },
    /// Gateway confirms the bind.
    Bound { user_id: UserId },
    /// A signaling message, in either direction.
    Signal(SignalingMessage),
    /// Gateway could not deliver a message because the target is offline.
    Undeliverable {
        message_id: MessageId,
        call_id: CallId,
        to_user_id: UserId,
    },
    /// A call record involving the bound user changed.
    CallUpdated(Call),
    /// Generic error from the gateway.
    Error { message: String },
}

impl GatewayFrame {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// Gateway HTTP bodies

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCallRequest {
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub media_kind: MediaKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: CallStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceResponse {
    pub user_id: UserId,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_kind_tags() {
        let msg = SignalingMessage::new(
            CallId::new(),
            "alice",
            "bob",
            SignalPayload::Offer(SessionDescription::offer("v=0")),
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["payload"]["kind"], "offer");
        assert_eq!(json["payload"]["body"]["sdp"], "v=0");
        assert_eq!(msg.kind(), SignalKind::Offer);
        assert!(msg.kind().is_negotiation());
    }

    #[test]
    fn test_unit_payloads_parse() {
        let raw = format!(
            r#"{{"id":"{}","call_id":"{}","from_user_id":"a","to_user_id":"b","payload":{{"kind":"hangup"}},"sent_at":"2024-01-01T00:00:00Z"}}"#,
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        let msg: SignalingMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(msg.payload, SignalPayload::Hangup);
        assert!(!msg.processed);
        assert!(msg.reply_to.is_none());
    }

    #[test]
    fn test_gateway_frame_shape() {
        let frame = GatewayFrame::Bind {
            user_id: "alice".into(),
        };
        let json = frame.encode().unwrap();
        assert_eq!(json, r#"{"type":"Bind","payload":{"user_id":"alice"}}"#);
        assert!(matches!(
            GatewayFrame::decode(&json),
            Ok(GatewayFrame::Bind { user_id }) if user_id == "alice"
        ));
    }

    #[test]
    fn test_malformed_frame_is_a_frame_error() {
        assert!(matches!(
            GatewayFrame::decode(r#"{"type":"Teleport"}"#),
            Err(crate::Error::Frame(_))
        ));
    }

    #[test]
    fn test_lifecycle_kinds_are_not_negotiation() {
        assert!(!SignalKind::Invite.is_negotiation());
        assert!(!SignalKind::Hangup.is_negotiation());
        assert!(!SignalKind::MediaState.is_negotiation());
        assert!(SignalKind::IceCandidate.is_negotiation());
    }
}
