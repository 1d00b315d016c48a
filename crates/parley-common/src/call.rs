//! Call records shared between peers, the gateway and the call store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

/// Stable user identifier as known to the signaling channel.
pub type UserId = String;

/// Opaque identifier of one call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CallId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CallId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|source| Error::InvalidCallId {
                value: s.to_string(),
                source,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn wants_video(self) -> bool {
        matches!(self, MediaKind::Video)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "video" => Ok(MediaKind::Video),
            "audio" => Ok(MediaKind::Audio),
            other => Err(Error::UnknownMediaKind(other.to_string())),
        }
    }
}

/// Status of a call record.
///
/// Transitions are monotonic: `Ringing -> Accepted -> Connected`, with
/// `Rejected` reachable only from `Ringing` and `Ended`/`Failed` reachable
/// from every non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Accepted,
    Connected,
    Rejected,
    Ended,
    Failed,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Rejected | CallStatus::Ended | CallStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: CallStatus) -> bool {
        use CallStatus::*;
        match (self, next) {
            (Ringing, Accepted | Rejected | Ended | Failed) => true,
            (Accepted, Connected | Ended | Failed) => true,
            (Connected, Ended | Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Accepted => "accepted",
            CallStatus::Connected => "connected",
            CallStatus::Rejected => "rejected",
            CallStatus::Ended => "ended",
            CallStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ringing" => Ok(CallStatus::Ringing),
            "accepted" => Ok(CallStatus::Accepted),
            "connected" => Ok(CallStatus::Connected),
            "rejected" => Ok(CallStatus::Rejected),
            "ended" => Ok(CallStatus::Ended),
            "failed" => Ok(CallStatus::Failed),
            other => Err(Error::UnknownStatus(other.to_string())),
        }
    }
}

/// One call attempt between two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub media_kind: MediaKind,
    pub status: CallStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Call {
    /// A fresh call in `Ringing`.
    pub fn ringing(
        id: CallId,
        caller_id: impl Into<UserId>,
        receiver_id: impl Into<UserId>,
        media_kind: MediaKind,
    ) -> Self {
        Self {
            id,
            caller_id: caller_id.into(),
            receiver_id: receiver_id.into(),
            media_kind,
            status: CallStatus::Ringing,
            started_at: None,
            ended_at: None,
        }
    }

    /// Apply a status transition, stamping `started_at` on the first
    /// `Connected` and `ended_at` on any terminal status.
    pub fn transition(&mut self, next: CallStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        let now = Utc::now();
        if next == CallStatus::Connected && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        Ok(())
    }

    pub fn involves(&self, user: &str) -> bool {
        self.caller_id == user || self.receiver_id == user
    }

    /// The participant that is not `user`.
    pub fn peer_of(&self, user: &str) -> &str {
        if self.caller_id == user {
            &self.receiver_id
        } else {
            &self.caller_id
        }
    }
}
