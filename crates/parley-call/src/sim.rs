//! In-process peer connection that models offer/answer and ICE without a network.
//!
//! Session descriptions carry a JSON list of the offering side's tracks so the
//! receiving side can surface them as remote tracks. Connectivity is declared
//! once both descriptions and at least one remote candidate are present.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use parley_common::{IceCandidate, SdpKind, SessionDescription};
use parley_media::{MediaTrack, TrackDescriptor};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::PeerError;
use crate::peer::{
    IceState, PeerConfig, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEvents, SenderId,
    SignalingState,
};

/// What connectivity checks end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceOutcome {
    Connect,
    Fail,
    /// Stay in `Checking` forever.
    Stall,
}

#[derive(Debug, Serialize, Deserialize)]
struct SimSdp {
    session: String,
    version: u32,
    tracks: Vec<TrackDescriptor>,
}

struct Sender {
    id: SenderId,
    track: Option<MediaTrack>,
}

struct SimState {
    signaling: SignalingState,
    ice: IceState,
    senders: Vec<Sender>,
    next_sender: u32,
    version: u32,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_tracks: HashMap<String, MediaTrack>,
    remote_candidates: Vec<IceCandidate>,
    gathered: bool,
    events: Option<mpsc::UnboundedSender<PeerEvent>>,
}

impl SimState {
    fn emit(&self, event: PeerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn invalid(&self, op: &'static str) -> PeerError {
        PeerError::InvalidState {
            op,
            state: self.signaling.to_string(),
        }
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.signaling == SignalingState::Closed {
            return Err(PeerError::Closed);
        }
        Ok(())
    }
}

pub struct SimulatedPeer {
    session: String,
    outcome: IceOutcome,
    state: Mutex<SimState>,
}

impl SimulatedPeer {
    pub fn new(outcome: IceOutcome) -> (Self, PeerEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Self {
            session: Uuid::new_v4().to_string(),
            outcome,
            state: Mutex::new(SimState {
                signaling: SignalingState::Stable,
                ice: IceState::New,
                senders: Vec::new(),
                next_sender: 1,
                version: 0,
                local: None,
                remote: None,
                remote_tracks: HashMap::new(),
                remote_candidates: Vec::new(),
                gathered: false,
                events: Some(tx),
            }),
        };
        (peer, rx)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SimState>, PeerError> {
        self.state
            .lock()
            .map_err(|_| PeerError::Native("simulated peer lock poisoned".to_string()))
    }

    /// Tracks currently attached to this peer's senders.
    pub fn sender_tracks(&self) -> Vec<Option<MediaTrack>> {
        self.state
            .lock()
            .map(|s| s.senders.iter().map(|sender| sender.track.clone()).collect())
            .unwrap_or_default()
    }

    pub fn remote_track_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.remote_tracks.len())
            .unwrap_or_default()
    }

    fn describe(&self, state: &mut SimState, kind: SdpKind) -> Result<SessionDescription, PeerError> {
        state.version += 1;
        let sdp = SimSdp {
            session: self.session.clone(),
            version: state.version,
            tracks: state
                .senders
                .iter()
                .filter_map(|s| s.track.as_ref().map(|t| t.descriptor().clone()))
                .collect(),
        };
        let sdp = serde_json::to_string(&sdp).map_err(|e| PeerError::BadDescription(e.to_string()))?;
        Ok(SessionDescription { kind, sdp })
    }

    fn apply_remote_tracks(state: &mut SimState, desc: &SessionDescription) -> Result<(), PeerError> {
        let parsed: SimSdp = serde_json::from_str(&desc.sdp)
            .map_err(|e| PeerError::BadDescription(e.to_string()))?;

        let ended: Vec<String> = state
            .remote_tracks
            .keys()
            .filter(|id| !parsed.tracks.iter().any(|t| &t.id == *id))
            .cloned()
            .collect();
        for id in ended {
            if let Some(track) = state.remote_tracks.remove(&id) {
                track.stop();
            }
            state.emit(PeerEvent::RemoteTrackEnded(id));
        }

        for descriptor in parsed.tracks {
            if state.remote_tracks.contains_key(&descriptor.id) {
                continue;
            }
            let track = MediaTrack::from_descriptor(descriptor);
            state
                .remote_tracks
                .insert(track.id().to_string(), track.clone());
            state.emit(PeerEvent::RemoteTrack(track));
        }
        Ok(())
    }

    fn gather(&self, state: &mut SimState) {
        if state.gathered {
            return;
        }
        state.gathered = true;
        state.emit(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 9 typ host ufrag {}", self.session),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
    }

    fn try_connect(&self, state: &mut SimState) {
        if state.ice != IceState::New || state.remote.is_none() || state.remote_candidates.is_empty() {
            return;
        }
        state.ice = IceState::Checking;
        state.emit(PeerEvent::IceStateChanged(IceState::Checking));
        let next = match self.outcome {
            IceOutcome::Connect => IceState::Connected,
            IceOutcome::Fail => IceState::Failed,
            IceOutcome::Stall => return,
        };
        state.ice = next;
        state.emit(PeerEvent::IceStateChanged(next));
    }
}

#[async_trait]
impl PeerConnection for SimulatedPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let mut state = self.lock()?;
        state.ensure_open()?;
        match state.signaling {
            SignalingState::Stable | SignalingState::HaveLocalOffer => {
                self.describe(&mut state, SdpKind::Offer)
            }
            _ => Err(state.invalid("create_offer")),
        }
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let mut state = self.lock()?;
        state.ensure_open()?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(state.invalid("create_answer"));
        }
        self.describe(&mut state, SdpKind::Answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut state = self.lock()?;
        state.ensure_open()?;
        let next = match (desc.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (SdpKind::Answer | SdpKind::Pranswer, SignalingState::HaveRemoteOffer) => {
                SignalingState::Stable
            }
            (SdpKind::Rollback, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            _ => return Err(state.invalid("set_local_description")),
        };
        debug!("sim {}: local {:?}, {} -> {}", self.session, desc.kind, state.signaling, next);
        state.signaling = next;
        if desc.kind != SdpKind::Rollback {
            state.local = Some(desc);
            self.gather(&mut state);
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut state = self.lock()?;
        state.ensure_open()?;
        let next = match (desc.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer | SdpKind::Pranswer, SignalingState::HaveLocalOffer) => {
                SignalingState::Stable
            }
            (SdpKind::Rollback, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            _ => return Err(state.invalid("set_remote_description")),
        };
        if desc.kind != SdpKind::Rollback {
            Self::apply_remote_tracks(&mut state, &desc)?;
            state.remote = Some(desc);
        }
        state.signaling = next;
        self.try_connect(&mut state);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        self.set_local_description(SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        })
        .await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut state = self.lock()?;
        state.ensure_open()?;
        if state.remote.is_none() {
            return Err(state.invalid("add_ice_candidate"));
        }
        state.remote_candidates.push(candidate);
        self.try_connect(&mut state);
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<SenderId, PeerError> {
        let mut state = self.lock()?;
        state.ensure_open()?;
        let id = SenderId(state.next_sender);
        state.next_sender += 1;
        state.senders.push(Sender {
            id,
            track: Some(track.clone()),
        });
        Ok(id)
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<&MediaTrack>,
    ) -> Result<(), PeerError> {
        let mut state = self.lock()?;
        state.ensure_open()?;
        let slot = state
            .senders
            .iter_mut()
            .find(|s| s.id == sender)
            .ok_or(PeerError::UnknownSender(sender.0))?;
        slot.track = track.cloned();
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state
            .lock()
            .map(|s| s.signaling)
            .unwrap_or(SignalingState::Closed)
    }

    fn ice_state(&self) -> IceState {
        self.state.lock().map(|s| s.ice).unwrap_or(IceState::Closed)
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut state = self.lock()?;
        if state.signaling == SignalingState::Closed {
            return Ok(());
        }
        state.signaling = SignalingState::Closed;
        state.ice = IceState::Closed;
        for track in state.remote_tracks.values() {
            track.stop();
        }
        state.events = None;
        Ok(())
    }
}

/// Factory handing out [`SimulatedPeer`]s and keeping them for inspection.
pub struct SimulatedPeerFactory {
    outcome: IceOutcome,
    created: AtomicUsize,
    peers: Mutex<Vec<Arc<SimulatedPeer>>>,
}

impl SimulatedPeerFactory {
    pub fn new() -> Self {
        Self::with_outcome(IceOutcome::Connect)
    }

    pub fn with_outcome(outcome: IceOutcome) -> Self {
        Self {
            outcome,
            created: AtomicUsize::new(0),
            peers: Mutex::new(Vec::new()),
        }
    }

    /// Number of peer connections created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<Arc<SimulatedPeer>> {
        self.peers.lock().ok().and_then(|p| p.last().cloned())
    }
}

impl Default for SimulatedPeerFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnectionFactory for SimulatedPeerFactory {
    async fn create(
        &self,
        _config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents), PeerError> {
        let (peer, events) = SimulatedPeer::new(self.outcome);
        let peer = Arc::new(peer);
        self.created.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut peers) = self.peers.lock() {
            peers.push(peer.clone());
        }
        Ok((peer, events))
    }
}
