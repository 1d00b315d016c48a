//! Per-call offer/answer negotiation.
//!
//! One [`NegotiationEngine`] wraps one peer connection. It turns local intents
//! (initial offer, screen attach) and inbound negotiation messages into peer
//! operations and outbound messages. Conflicting offers are resolved by role:
//! the responder yields by rolling back its own offer, the initiator keeps its
//! offer and ignores the remote one.

use std::collections::HashMap;
use std::sync::Arc;

use parley_common::{CallId, IceCandidate, MessageId, SignalPayload, SignalingMessage, UserId};
use parley_media::{MediaTrack, TrackKind};
use tracing::{debug, info, warn};

use crate::error::{CallError, PeerError, Result};
use crate::peer::{IceState, PeerConnection, SenderId, SignalingState};
use crate::signaling::SignalingChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Placed the call and sends the initial offer.
    Initiator,
    /// Accepted the call. Yields on offer collisions.
    Responder,
}

impl Role {
    fn yields_on_conflict(self) -> bool {
        matches!(self, Role::Responder)
    }
}

/// A local change waiting for its own offer/answer round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenegotiationPending {
    pub initiated_locally: bool,
}

/// How a screen track was put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenAttach {
    /// Swapped onto the existing video sender.
    Replaced,
    /// A new sender was added; an offer/answer round must follow.
    NeedsRenegotiation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationStats {
    pub offers_sent: u32,
    pub answers_sent: u32,
    pub rollbacks: u32,
    pub conflicts_ignored: u32,
    pub stale_dropped: u32,
    pub candidates_buffered: u32,
}

/// Point-in-time view of an engine, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationSnapshot {
    pub role: Role,
    pub signaling_state: SignalingState,
    pub ice_state: IceState,
    pub pending: Option<RenegotiationPending>,
    pub stats: NegotiationStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// The remote side has not been told about this sender.
    Local,
    /// Described by the outstanding local offer.
    Offered,
    /// Part of a completed offer/answer exchange.
    Negotiated,
}

struct SenderSlot {
    id: SenderId,
    track: Option<MediaTrack>,
    state: SlotState,
    /// Added before the first exchange, so either side's first offer covers it.
    /// Senders added later only reach the remote side through our own offer.
    initial: bool,
}

pub struct NegotiationEngine {
    call_id: CallId,
    local_user: UserId,
    remote_user: UserId,
    role: Role,
    peer: Arc<dyn PeerConnection>,
    channel: Arc<dyn SignalingChannel>,
    senders: HashMap<TrackKind, SenderSlot>,
    pending: Option<RenegotiationPending>,
    outstanding_offer: Option<MessageId>,
    remote_description_set: bool,
    initial_exchange_done: bool,
    pending_candidates: Vec<IceCandidate>,
    stats: NegotiationStats,
    closed: bool,
}

impl NegotiationEngine {
    pub fn new(
        call_id: CallId,
        local_user: impl Into<UserId>,
        remote_user: impl Into<UserId>,
        role: Role,
        peer: Arc<dyn PeerConnection>,
        channel: Arc<dyn SignalingChannel>,
    ) -> Self {
        Self {
            call_id,
            local_user: local_user.into(),
            remote_user: remote_user.into(),
            role,
            peer,
            channel,
            senders: HashMap::new(),
            pending: None,
            outstanding_offer: None,
            remote_description_set: false,
            initial_exchange_done: false,
            pending_candidates: Vec::new(),
            stats: NegotiationStats::default(),
            closed: false,
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.peer.signaling_state()
    }

    pub fn ice_state(&self) -> IceState {
        self.peer.ice_state()
    }

    pub fn stats(&self) -> NegotiationStats {
        self.stats
    }

    pub fn pending(&self) -> Option<RenegotiationPending> {
        self.pending
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn snapshot(&self) -> NegotiationSnapshot {
        NegotiationSnapshot {
            role: self.role,
            signaling_state: self.signaling_state(),
            ice_state: self.ice_state(),
            pending: self.pending,
            stats: self.stats,
        }
    }

    /// No local change waiting, no offer outstanding and the connection is stable.
    pub fn is_settled(&self) -> bool {
        self.pending.is_none()
            && self.outstanding_offer.is_none()
            && self.signaling_state() == SignalingState::Stable
    }

    /// Attach local capture tracks, one sender per kind.
    pub async fn add_local_tracks(&mut self, tracks: &[MediaTrack]) -> Result<()> {
        for track in tracks {
            if self.senders.contains_key(&track.kind()) {
                debug!(
                    "call {}: already sending {:?}, skipping track {}",
                    self.call_id,
                    track.kind(),
                    track.id()
                );
                continue;
            }
            let id = self.peer.add_track(track).await?;
            self.senders.insert(
                track.kind(),
                SenderSlot {
                    id,
                    track: Some(track.clone()),
                    state: SlotState::Local,
                    initial: !self.initial_exchange_done,
                },
            );
        }
        Ok(())
    }

    /// Create, apply and send an offer. Only valid while `Stable`.
    pub async fn create_offer(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.signaling_state() != SignalingState::Stable {
            return Err(CallError::NegotiationConflict(self.call_id));
        }
        let offer = self.peer.create_offer().await?;
        self.peer.set_local_description(offer.clone()).await?;

        let payload = if self.initial_exchange_done {
            SignalPayload::RenegotiationOffer(offer)
        } else {
            SignalPayload::Offer(offer)
        };
        let message = self.message(payload);
        self.outstanding_offer = Some(message.id);
        self.pending = None;
        self.mark_senders(SlotState::Local, SlotState::Offered);
        self.stats.offers_sent += 1;
        info!(
            "call {}: sending {} to {}",
            self.call_id,
            message.kind(),
            self.remote_user
        );
        self.channel.send(message).await?;
        Ok(())
    }

    /// Apply a remote offer and answer it, resolving collisions by role.
    pub async fn handle_offer(&mut self, message: &SignalingMessage) -> Result<()> {
        self.ensure_open()?;
        let (desc, renegotiation) = match &message.payload {
            SignalPayload::Offer(desc) => (desc.clone(), false),
            SignalPayload::RenegotiationOffer(desc) => (desc.clone(), true),
            other => {
                return Err(CallError::StaleMessage(format!(
                    "{} is not an offer",
                    other.kind()
                )))
            }
        };

        match self.signaling_state() {
            SignalingState::Stable => {}
            SignalingState::HaveLocalOffer if self.role.yields_on_conflict() => {
                info!(
                    "call {}: offer collision, rolling back local offer",
                    self.call_id
                );
                self.peer.rollback().await?;
                self.stats.rollbacks += 1;
                self.outstanding_offer = None;
                self.mark_senders(SlotState::Offered, SlotState::Local);
                self.pending = Some(RenegotiationPending {
                    initiated_locally: true,
                });
            }
            SignalingState::HaveLocalOffer => {
                self.stats.conflicts_ignored += 1;
                warn!(
                    "call {}: offer collision, keeping local offer and ignoring {} from {}",
                    self.call_id,
                    message.kind(),
                    message.from_user_id
                );
                return Ok(());
            }
            state => {
                self.stats.stale_dropped += 1;
                debug!(
                    "call {}: dropping {} in state {}",
                    self.call_id,
                    message.kind(),
                    state
                );
                return Ok(());
            }
        }

        self.peer.set_remote_description(desc).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;

        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        let payload = if renegotiation {
            SignalPayload::RenegotiationAnswer(answer)
        } else {
            SignalPayload::Answer(answer)
        };
        let reply = self.message(payload).in_reply_to(message.id);
        self.answered_remote_offer();
        self.stats.answers_sent += 1;
        debug!("call {}: answering {}", self.call_id, message.id);
        self.channel.send(reply).await?;

        self.resume_pending().await
    }

    /// Apply an answer to the outstanding offer. Anything else is stale and dropped.
    pub async fn handle_answer(&mut self, message: &SignalingMessage) -> Result<()> {
        self.ensure_open()?;
        let desc = match &message.payload {
            SignalPayload::Answer(desc) | SignalPayload::RenegotiationAnswer(desc) => desc.clone(),
            other => {
                return Err(CallError::StaleMessage(format!(
                    "{} is not an answer",
                    other.kind()
                )))
            }
        };

        let state = self.signaling_state();
        let answers_outstanding = match message.reply_to {
            Some(offer) => self.outstanding_offer == Some(offer),
            None => self.outstanding_offer.is_some(),
        };
        if state != SignalingState::HaveLocalOffer || !answers_outstanding {
            self.stats.stale_dropped += 1;
            debug!(
                "call {}: dropping stale {} in state {}",
                self.call_id,
                message.kind(),
                state
            );
            return Ok(());
        }

        self.peer.set_remote_description(desc).await?;
        self.remote_description_set = true;
        self.outstanding_offer = None;
        self.initial_exchange_done = true;
        self.mark_senders(SlotState::Offered, SlotState::Negotiated);
        self.flush_candidates().await;
        debug!("call {}: offer answered, stable", self.call_id);

        self.resume_pending().await
    }

    /// Apply a remote candidate, or buffer it until a remote description exists.
    pub async fn handle_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        if !self.remote_description_set {
            self.stats.candidates_buffered += 1;
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            warn!("call {}: rejected remote candidate: {}", self.call_id, e);
        }
        Ok(())
    }

    /// Trickle a locally gathered candidate to the remote side.
    pub async fn send_local_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        let message = self.message(SignalPayload::IceCandidate(candidate));
        self.channel.send(message).await?;
        Ok(())
    }

    /// Put a screen track on the wire. Replaces the video sender's track when
    /// the remote side knows or is about to learn of that sender, otherwise
    /// adds a sender and marks a renegotiation pending.
    pub async fn attach_screen(&mut self, track: &MediaTrack) -> Result<ScreenAttach> {
        self.ensure_open()?;
        let first_exchange_open = !self.initial_exchange_done;
        match self.senders.get_mut(&TrackKind::Video) {
            Some(slot)
                if slot.state != SlotState::Local || (slot.initial && first_exchange_open) =>
            {
                self.peer.replace_track(slot.id, Some(track)).await?;
                slot.track = Some(track.clone());
                info!("call {}: screen replaces video sender track", self.call_id);
                return Ok(ScreenAttach::Replaced);
            }
            // Left over from an abandoned attempt; the remote side never learned of it.
            Some(slot) => {
                self.peer.replace_track(slot.id, Some(track)).await?;
                slot.track = Some(track.clone());
            }
            None => {
                let id = self.peer.add_track(track).await?;
                self.senders.insert(
                    TrackKind::Video,
                    SenderSlot {
                        id,
                        track: Some(track.clone()),
                        state: SlotState::Local,
                        initial: false,
                    },
                );
            }
        }
        self.pending = Some(RenegotiationPending {
            initiated_locally: true,
        });
        info!(
            "call {}: screen needs a new video sender, renegotiating",
            self.call_id
        );
        Ok(ScreenAttach::NeedsRenegotiation)
    }

    /// Take the screen off the video sender, restoring `restore` (or nothing).
    /// Never renegotiates.
    pub async fn detach_screen(&mut self, restore: Option<&MediaTrack>) -> Result<()> {
        self.ensure_open()?;
        if let Some(slot) = self.senders.get_mut(&TrackKind::Video) {
            self.peer.replace_track(slot.id, restore).await?;
            slot.track = restore.cloned();
        }
        Ok(())
    }

    /// One step of waiting for a pending change to settle. Offers as soon as
    /// the connection is stable. Returns whether everything has settled.
    pub async fn step_renegotiation(&mut self) -> Result<bool> {
        self.ensure_open()?;
        if self.pending.is_some() && self.signaling_state() == SignalingState::Stable {
            self.create_offer().await?;
        }
        Ok(self.is_settled())
    }

    /// Give up on an unsettled change: drop it and roll back our offer if one is out.
    pub async fn abandon_renegotiation(&mut self) -> Result<()> {
        self.pending = None;
        if self.outstanding_offer.take().is_some()
            && self.signaling_state() == SignalingState::HaveLocalOffer
        {
            self.peer.rollback().await?;
            self.stats.rollbacks += 1;
            self.mark_senders(SlotState::Offered, SlotState::Local);
            info!("call {}: abandoned renegotiation rolled back", self.call_id);
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending = None;
        self.outstanding_offer = None;
        self.pending_candidates.clear();
        if let Err(e) = self.peer.close().await {
            warn!("call {}: error closing peer connection: {}", self.call_id, e);
        }
        debug!("call {}: negotiation closed", self.call_id);
    }

    fn mark_senders(&mut self, from: SlotState, to: SlotState) {
        for slot in self.senders.values_mut().filter(|slot| slot.state == from) {
            slot.state = to;
        }
    }

    /// An answer only covers senders the remote offer already described.
    fn answered_remote_offer(&mut self) {
        self.initial_exchange_done = true;
        for slot in self.senders.values_mut().filter(|slot| slot.initial) {
            slot.state = SlotState::Negotiated;
        }
    }

    async fn resume_pending(&mut self) -> Result<()> {
        let locally_pending = self.pending.is_some_and(|p| p.initiated_locally);
        if locally_pending && self.signaling_state() == SignalingState::Stable {
            debug!("call {}: re-issuing pending local change", self.call_id);
            self.create_offer().await?;
        }
        Ok(())
    }

    async fn flush_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                warn!("call {}: rejected buffered candidate: {}", self.call_id, e);
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(PeerError::Closed.into());
        }
        Ok(())
    }

    fn message(&self, payload: SignalPayload) -> SignalingMessage {
        SignalingMessage::new(
            self.call_id,
            self.local_user.clone(),
            self.remote_user.clone(),
            payload,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackHub;
    use crate::sim::{IceOutcome, SimulatedPeer};
    use parley_common::SessionDescription;
    use parley_media::TrackSource;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Side {
        engine: NegotiationEngine,
        inbox: UnboundedReceiver<SignalingMessage>,
    }

    async fn pair(hub: &Arc<LoopbackHub>) -> (Side, Side) {
        let call_id = CallId::new();
        let inbox_a = hub.subscribe("alice").await.unwrap();
        let inbox_b = hub.subscribe("bob").await.unwrap();
        let (peer_a, _) = SimulatedPeer::new(IceOutcome::Connect);
        let (peer_b, _) = SimulatedPeer::new(IceOutcome::Connect);
        let a = NegotiationEngine::new(
            call_id,
            "alice",
            "bob",
            Role::Initiator,
            Arc::new(peer_a),
            hub.clone(),
        );
        let b = NegotiationEngine::new(
            call_id,
            "bob",
            "alice",
            Role::Responder,
            Arc::new(peer_b),
            hub.clone(),
        );
        (
            Side {
                engine: a,
                inbox: inbox_a,
            },
            Side {
                engine: b,
                inbox: inbox_b,
            },
        )
    }

    /// Feed every queued negotiation message of `side` into its engine.
    async fn pump(side: &mut Side) -> Vec<SignalingMessage> {
        let mut seen = Vec::new();
        while let Ok(message) = side.inbox.try_recv() {
            match &message.payload {
                SignalPayload::Offer(_) | SignalPayload::RenegotiationOffer(_) => {
                    side.engine.handle_offer(&message).await.unwrap()
                }
                SignalPayload::Answer(_) | SignalPayload::RenegotiationAnswer(_) => {
                    side.engine.handle_answer(&message).await.unwrap()
                }
                SignalPayload::IceCandidate(c) => {
                    side.engine.handle_ice_candidate(c.clone()).await.unwrap()
                }
                _ => {}
            }
            seen.push(message);
        }
        seen
    }

    fn mic() -> MediaTrack {
        MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic")
    }

    fn screen() -> MediaTrack {
        MediaTrack::new(TrackKind::Video, TrackSource::Screen, "screen")
    }

    async fn negotiate(a: &mut Side, b: &mut Side) {
        a.engine.add_local_tracks(&[mic()]).await.unwrap();
        b.engine.add_local_tracks(&[mic()]).await.unwrap();
        a.engine.create_offer().await.unwrap();
        pump(b).await;
        pump(a).await;
        assert!(a.engine.is_settled());
        assert!(b.engine.is_settled());
    }

    #[tokio::test]
    async fn test_initial_exchange() {
        let hub = Arc::new(LoopbackHub::new());
        let (mut a, mut b) = pair(&hub).await;
        negotiate(&mut a, &mut b).await;
        assert_eq!(a.engine.stats().offers_sent, 1);
        assert_eq!(b.engine.stats().answers_sent, 1);
    }

    #[tokio::test]
    async fn test_answer_carries_reply_to() {
        let hub = Arc::new(LoopbackHub::new());
        let (mut a, mut b) = pair(&hub).await;
        a.engine.create_offer().await.unwrap();
        let offers = pump(&mut b).await;
        let answer = a.inbox.try_recv().unwrap();
        assert_eq!(answer.reply_to, Some(offers[0].id));
    }

    #[tokio::test]
    async fn test_offer_requires_stable() {
        let hub = Arc::new(LoopbackHub::new());
        let (mut a, _b) = pair(&hub).await;
        a.engine.create_offer().await.unwrap();
        assert!(matches!(
            a.engine.create_offer().await,
            Err(CallError::NegotiationConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_collision_responder_yields() {
        let hub = Arc::new(LoopbackHub::new());
        let (mut a, mut b) = pair(&hub).await;
        negotiate(&mut a, &mut b).await;

        assert_eq!(
            a.engine.attach_screen(&screen()).await.unwrap(),
            ScreenAttach::NeedsRenegotiation
        );
        assert_eq!(
            b.engine.attach_screen(&screen()).await.unwrap(),
            ScreenAttach::NeedsRenegotiation
        );
        assert!(!a.engine.step_renegotiation().await.unwrap());
        assert!(!b.engine.step_renegotiation().await.unwrap());

        // Both offers cross on the wire.
        pump(&mut a).await;
        pump(&mut b).await;
        pump(&mut a).await;
        pump(&mut b).await;

        assert!(a.engine.is_settled());
        assert!(b.engine.is_settled());
        assert_eq!(a.engine.stats().conflicts_ignored, 1);
        assert_eq!(a.engine.stats().rollbacks, 0);
        assert_eq!(b.engine.stats().rollbacks, 1);
        // The rolled back offer plus its re-issue.
        assert_eq!(b.engine.stats().offers_sent, 2);
    }

    #[tokio::test]
    async fn test_stale_answer_dropped() {
        let hub = Arc::new(LoopbackHub::new());
        let (mut a, mut b) = pair(&hub).await;
        negotiate(&mut a, &mut b).await;

        let stale = SignalingMessage::new(
            a.engine.call_id(),
            "bob",
            "alice",
            SignalPayload::Answer(SessionDescription::answer("{}")),
        );
        a.engine.handle_answer(&stale).await.unwrap();
        assert_eq!(a.engine.stats().stale_dropped, 1);
        assert_eq!(a.engine.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_early_candidates_buffered() {
        let hub = Arc::new(LoopbackHub::new());
        let (_a, mut b) = pair(&hub).await;
        let candidate = IceCandidate {
            candidate: "candidate:early".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        b.engine.handle_ice_candidate(candidate).await.unwrap();
        assert_eq!(b.engine.stats().candidates_buffered, 1);
    }

    #[tokio::test]
    async fn test_replace_when_video_sender_exists() {
        let hub = Arc::new(LoopbackHub::new());
        let (mut a, mut b) = pair(&hub).await;
        let camera = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        a.engine.add_local_tracks(&[camera.clone()]).await.unwrap();
        a.engine.create_offer().await.unwrap();
        pump(&mut b).await;
        pump(&mut a).await;

        assert_eq!(
            a.engine.attach_screen(&screen()).await.unwrap(),
            ScreenAttach::Replaced
        );
        assert!(a.engine.is_settled());
        a.engine.detach_screen(Some(&camera)).await.unwrap();
        assert_eq!(a.engine.stats().offers_sent, 1);
    }

    #[tokio::test]
    async fn test_share_during_first_exchange_replaces() {
        let hub = Arc::new(LoopbackHub::new());
        let (mut a, mut b) = pair(&hub).await;
        let camera = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        a.engine.add_local_tracks(&[camera]).await.unwrap();
        a.engine.create_offer().await.unwrap();

        assert_eq!(
            a.engine.attach_screen(&screen()).await.unwrap(),
            ScreenAttach::Replaced
        );
        assert!(a.engine.pending().is_none());
        pump(&mut b).await;
        pump(&mut a).await;

        assert!(a.engine.step_renegotiation().await.unwrap());
        assert_eq!(a.engine.stats().offers_sent, 1);
    }

    #[tokio::test]
    async fn test_screen_sender_from_rolled_back_offer_is_reannounced() {
        let hub = Arc::new(LoopbackHub::new());
        let (mut a, mut b) = pair(&hub).await;
        negotiate(&mut a, &mut b).await;

        a.engine.attach_screen(&screen()).await.unwrap();
        b.engine.attach_screen(&screen()).await.unwrap();
        a.engine.step_renegotiation().await.unwrap();
        b.engine.step_renegotiation().await.unwrap();
        // Alice ignores the crossing offer; Bob rolls back, answers and re-offers.
        pump(&mut a).await;
        pump(&mut b).await;
        assert_eq!(b.engine.stats().rollbacks, 1);
        assert_eq!(b.engine.signaling_state(), SignalingState::HaveLocalOffer);

        // The re-issued offer never settles.
        b.engine.abandon_renegotiation().await.unwrap();
        assert!(b.engine.is_settled());

        assert_eq!(
            b.engine.attach_screen(&screen()).await.unwrap(),
            ScreenAttach::NeedsRenegotiation
        );
    }

    #[tokio::test]
    async fn test_abandon_rolls_back() {
        let hub = Arc::new(LoopbackHub::new());
        let (mut a, mut b) = pair(&hub).await;
        negotiate(&mut a, &mut b).await;
        a.engine.attach_screen(&screen()).await.unwrap();
        a.engine.step_renegotiation().await.unwrap();
        assert_eq!(a.engine.signaling_state(), SignalingState::HaveLocalOffer);

        a.engine.abandon_renegotiation().await.unwrap();
        assert!(a.engine.is_settled());
        assert_eq!(a.engine.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_closed_engine_refuses_work() {
        let hub = Arc::new(LoopbackHub::new());
        let (mut a, _b) = pair(&hub).await;
        a.engine.close().await;
        a.engine.close().await;
        assert!(matches!(
            a.engine.create_offer().await,
            Err(CallError::Peer(PeerError::Closed))
        ));
    }
}
