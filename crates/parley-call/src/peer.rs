//! Abstraction over the native peer-connection primitive.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parley_common::{IceCandidate, SessionDescription};
use parley_media::MediaTrack;
use tokio::sync::mpsc;

use crate::error::PeerError;

/// Offer/answer state of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Connectivity state of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Handle on one outbound RTP sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u32);

/// Asynchronous notifications raised by a peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    IceStateChanged(IceState),
    RemoteTrack(MediaTrack),
    RemoteTrackEnded(String),
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
}

/// Operations the negotiation engine needs from a peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Discard the pending local offer and return to `Stable`.
    async fn rollback(&self) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn add_track(&self, track: &MediaTrack) -> Result<SenderId, PeerError>;

    /// Swap the track carried by `sender` without renegotiating.
    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<&MediaTrack>,
    ) -> Result<(), PeerError>;

    fn signaling_state(&self) -> SignalingState;

    fn ice_state(&self) -> IceState;

    /// Tear down the connection. Closes the event stream.
    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents), PeerError>;
}
