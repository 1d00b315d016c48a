//! Call lifecycle orchestration.
//!
//! The [`CallController`] owns at most one active call. It reacts to user
//! operations, inbound signaling, call record changes and peer events, and
//! publishes a [`CallView`] snapshot on every change.
//!
//! No state lock is held across an await. Every operation re-checks that its
//! call is still the active one after each suspension point and releases
//! whatever it acquired if the call went away meanwhile.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use parley_common::{Call, CallId, CallStatus, MediaKind, SignalPayload, SignalingMessage, UserId};
use parley_media::{
    MediaError, MediaSourceProvider, MediaStream, ScreenSelector, ScreenSource, TrackKind,
    TrackSource,
};
use rand::Rng;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::CallConfig;
use crate::engine::{NegotiationEngine, NegotiationSnapshot, Role, ScreenAttach};
use crate::error::{CallError, Result, SignalingError};
use crate::peer::{IceState, PeerConfig, PeerConnectionFactory, PeerEvent, PeerEvents};
use crate::signaling::{Deduplicator, Reachability, SignalingChannel};
use crate::store::CallRecordStore;

/// Reason sent with a `Reject` when another call is already active.
pub const BUSY_REASON: &str = "busy";

const FINISHED_MEMORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Why a call left the active set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    /// Declined locally.
    Declined,
    /// Declined by the remote side.
    Rejected(Option<String>),
    NoAnswer,
    PeerUnreachable,
    IceFailed,
    NoLocalMedia,
    RemoteFailed(String),
    Transport(String),
    Negotiation(String),
}

impl EndReason {
    fn from_error(err: &CallError) -> Self {
        match err {
            CallError::PeerUnreachable(_)
            | CallError::Signaling(SignalingError::PeerUnreachable(_)) => EndReason::PeerUnreachable,
            CallError::IceFailed(_) => EndReason::IceFailed,
            CallError::NoLocalMedia => EndReason::NoLocalMedia,
            CallError::Signaling(e) => EndReason::Transport(e.to_string()),
            other => EndReason::Negotiation(other.to_string()),
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::LocalHangup => f.write_str("hung up"),
            EndReason::RemoteHangup => f.write_str("remote hung up"),
            EndReason::Declined => f.write_str("declined"),
            EndReason::Rejected(Some(reason)) => write!(f, "rejected: {}", reason),
            EndReason::Rejected(None) => f.write_str("rejected"),
            EndReason::NoAnswer => f.write_str("no answer"),
            EndReason::PeerUnreachable => f.write_str("peer unreachable"),
            EndReason::IceFailed => f.write_str("connectivity failed"),
            EndReason::NoLocalMedia => f.write_str("no local media"),
            EndReason::RemoteFailed(reason) => write!(f, "remote failed: {}", reason),
            EndReason::Transport(reason) => write!(f, "signaling failed: {}", reason),
            EndReason::Negotiation(reason) => write!(f, "negotiation failed: {}", reason),
        }
    }
}

/// Snapshot of the controller, published on every change.
#[derive(Debug, Clone, Default)]
pub struct CallView {
    pub call: Option<Call>,
    pub direction: Option<Direction>,
    pub remote_user: Option<UserId>,
    pub local_stream: MediaStream,
    pub remote_stream: MediaStream,
    /// Our own screen capture while sharing.
    pub screen_stream: Option<MediaStream>,
    /// The remote side's screen share, empty unless they announced one.
    pub remote_screen_stream: MediaStream,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub end_reason: Option<EndReason>,
}

impl CallView {
    pub fn status(&self) -> Option<CallStatus> {
        self.call.as_ref().map(|c| c.status)
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.call.as_ref().map(|c| c.id)
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.screen_stream.is_some()
    }
}

/// `delay` plus up to a quarter of it.
fn with_jitter(delay: Duration) -> Duration {
    let quarter = delay.as_millis() as u64 / 4;
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=quarter))
}

/// External collaborators a controller is wired to.
pub struct Collaborators {
    pub channel: Arc<dyn SignalingChannel>,
    pub reachability: Arc<dyn Reachability>,
    pub store: Arc<dyn CallRecordStore>,
    pub media: Arc<MediaSourceProvider>,
    pub peers: Arc<dyn PeerConnectionFactory>,
}

struct ActiveCall {
    call: Call,
    direction: Direction,
    remote_user: UserId,
    local_stream: MediaStream,
    media_ready: bool,
    remote_stream: MediaStream,
    screen_stream: Option<MediaStream>,
    remote_screen: bool,
    engine: Option<Arc<AsyncMutex<NegotiationEngine>>>,
    /// Negotiation messages received before the engine existed.
    backlog: Vec<SignalingMessage>,
}

impl ActiveCall {
    fn new(call: Call, direction: Direction, local_user: &str) -> Self {
        let remote_user = call.peer_of(local_user).to_string();
        Self {
            call,
            direction,
            remote_user,
            local_stream: MediaStream::empty(),
            media_ready: false,
            remote_stream: MediaStream::empty(),
            screen_stream: None,
            remote_screen: false,
            engine: None,
            backlog: Vec::new(),
        }
    }

    fn remote_screen_stream(&self) -> MediaStream {
        if !self.remote_screen {
            return MediaStream::empty();
        }
        let screen: Vec<_> = self
            .remote_stream
            .tracks()
            .iter()
            .filter(|t| t.source() == TrackSource::Screen)
            .cloned()
            .collect();
        if !screen.is_empty() {
            return MediaStream::new(screen);
        }
        MediaStream::new(self.remote_stream.video_tracks().cloned().collect())
    }

    fn kind_enabled(&self, kind: TrackKind) -> bool {
        self.local_stream
            .tracks()
            .iter()
            .any(|t| t.kind() == kind && t.is_enabled())
    }

    fn media_state(&self) -> SignalPayload {
        SignalPayload::MediaState {
            video: self.kind_enabled(TrackKind::Video) || self.screen_stream.is_some(),
            audio: self.kind_enabled(TrackKind::Audio),
            screen: self.screen_stream.is_some(),
        }
    }

    fn view(&self) -> CallView {
        CallView {
            call: Some(self.call.clone()),
            direction: Some(self.direction),
            remote_user: Some(self.remote_user.clone()),
            local_stream: self.local_stream.clone(),
            remote_stream: self.remote_stream.clone(),
            screen_stream: self.screen_stream.clone(),
            remote_screen_stream: self.remote_screen_stream(),
            video_enabled: self.kind_enabled(TrackKind::Video),
            audio_enabled: self.kind_enabled(TrackKind::Audio),
            end_reason: None,
        }
    }

    /// View of the call after teardown: terminal status, no streams.
    fn ended_view(&self, reason: EndReason) -> CallView {
        CallView {
            call: Some(self.call.clone()),
            direction: Some(self.direction),
            remote_user: Some(self.remote_user.clone()),
            end_reason: Some(reason),
            ..CallView::default()
        }
    }
}

struct ControllerState {
    active: Option<ActiveCall>,
    ended: Option<CallView>,
    finished: VecDeque<CallId>,
    in_flight: HashSet<CallId>,
    dedup: Deduplicator,
}

impl ControllerState {
    fn view(&self) -> CallView {
        match &self.active {
            Some(active) => active.view(),
            None => self.ended.clone().unwrap_or_default(),
        }
    }

    fn active_for(&mut self, id: CallId) -> Option<&mut ActiveCall> {
        self.active.as_mut().filter(|a| a.call.id == id)
    }

    fn is_active(&self, id: CallId) -> bool {
        self.active.as_ref().is_some_and(|a| a.call.id == id)
    }

    fn remember_finished(&mut self, id: CallId) {
        if self.finished.len() >= FINISHED_MEMORY {
            self.finished.pop_front();
        }
        self.finished.push_back(id);
    }
}

struct Shared {
    local_user: UserId,
    config: CallConfig,
    channel: Arc<dyn SignalingChannel>,
    reachability: Arc<dyn Reachability>,
    store: Arc<dyn CallRecordStore>,
    media: Arc<MediaSourceProvider>,
    peers: Arc<dyn PeerConnectionFactory>,
    state: Mutex<ControllerState>,
    view_tx: watch::Sender<CallView>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

/// Marks a call as having a place/accept/share operation running.
struct InFlightGuard {
    shared: Arc<Shared>,
    id: CallId,
}

impl InFlightGuard {
    fn acquire(shared: &Arc<Shared>, id: CallId) -> Result<Self> {
        if !shared.state().in_flight.insert(id) {
            return Err(CallError::InFlight(id));
        }
        Ok(Self {
            shared: shared.clone(),
            id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared.state().in_flight.remove(&self.id);
    }
}

/// Handle on one user's call controller. Cheap to clone.
#[derive(Clone)]
pub struct CallController {
    shared: Arc<Shared>,
}

impl CallController {
    pub fn new(local_user: impl Into<UserId>, config: CallConfig, deps: Collaborators) -> Self {
        let (view_tx, _) = watch::channel(CallView::default());
        Self {
            shared: Arc::new(Shared {
                local_user: local_user.into(),
                config,
                channel: deps.channel,
                reachability: deps.reachability,
                store: deps.store,
                media: deps.media,
                peers: deps.peers,
                state: Mutex::new(ControllerState {
                    active: None,
                    ended: None,
                    finished: VecDeque::new(),
                    in_flight: HashSet::new(),
                    dedup: Deduplicator::default(),
                }),
                view_tx,
                pumps: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn local_user(&self) -> &str {
        &self.shared.local_user
    }

    /// Subscribe to signaling and call record changes for the local user.
    pub async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let mut signals = shared.channel.subscribe(&shared.local_user).await?;
        let mut records = shared.store.subscribe(&shared.local_user).await?;

        let weak = Arc::downgrade(shared);
        let signal_pump = tokio::spawn(async move {
            while let Some(message) = signals.recv().await {
                let Some(shared) = weak.upgrade() else { break };
                shared.handle_signal(message).await;
            }
            debug!("signal stream closed");
        });

        let weak = Arc::downgrade(shared);
        let record_pump = tokio::spawn(async move {
            while let Some(call) = records.recv().await {
                let Some(shared) = weak.upgrade() else { break };
                shared.handle_record(call).await;
            }
            debug!("call record feed closed");
        });

        shared
            .pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([signal_pump, record_pump]);
        info!("{} is ready for calls", shared.local_user);
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<CallView> {
        self.shared.view_tx.subscribe()
    }

    pub fn view(&self) -> CallView {
        self.shared.state().view()
    }

    /// Start an outgoing call.
    ///
    /// An unreachable receiver is not an error: the call record is created and
    /// immediately marked `Failed`, and the returned id refers to it.
    pub async fn place_call(&self, receiver_id: &str, media_kind: MediaKind) -> Result<CallId> {
        let shared = &self.shared;
        if let Some(current) = shared.current_call_id() {
            return Err(CallError::Busy(current));
        }

        let call = shared
            .store
            .create_call(&shared.local_user, receiver_id, media_kind)
            .await?;
        let id = call.id;

        if !shared.reachability.is_reachable(receiver_id).await {
            warn!("call {}: {} is not reachable", id, receiver_id);
            shared.record_unreachable(call).await;
            return Ok(id);
        }

        let installed = {
            let mut st = shared.state();
            match st.active.as_ref().map(|a| a.call.id) {
                Some(current) => Err(current),
                None => {
                    st.active = Some(ActiveCall::new(
                        call,
                        Direction::Outgoing,
                        &shared.local_user,
                    ));
                    shared.publish(&st);
                    Ok(())
                }
            }
        };
        if let Err(current) = installed {
            if let Err(e) = shared.store.end(id).await {
                debug!("call {}: could not close record: {}", id, e);
            }
            return Err(CallError::Busy(current));
        }

        info!("call {}: calling {} ({})", id, receiver_id, media_kind);
        let _guard = InFlightGuard::acquire(shared, id)?;
        shared.spawn_ring_timer(id);

        let stream = shared.media.acquire(media_kind.wants_video(), true).await;
        let Some(status) = shared.attach_local_stream(id, &stream) else {
            info!("call {}: ended while acquiring media", id);
            shared.media.release(&stream);
            return Ok(id);
        };
        if stream.is_empty() && shared.config.require_media {
            shared.fail(id, &CallError::NoLocalMedia).await;
            return Err(CallError::NoLocalMedia);
        }

        let invite = SignalingMessage::new(
            id,
            shared.local_user.clone(),
            receiver_id,
            SignalPayload::Invite { media_kind },
        );
        if let Err(e) = shared.channel.send(invite).await {
            shared.fail(id, &CallError::from(e)).await;
            return Ok(id);
        }

        // Accepted while local media was still being acquired.
        if status == CallStatus::Accepted {
            shared.begin_offer(id).await;
        }
        Ok(id)
    }

    /// Accept a ringing incoming call.
    pub async fn accept_call(&self, id: CallId) -> Result<()> {
        let shared = &self.shared;
        let _guard = InFlightGuard::acquire(shared, id)?;

        let (media_kind, remote) = {
            let mut st = shared.state();
            let Some(active) = st.active_for(id) else {
                return Err(CallError::UnknownCall(id));
            };
            if active.direction != Direction::Incoming || active.call.status != CallStatus::Ringing
            {
                return Err(CallError::InvalidState {
                    id,
                    status: active.call.status,
                    op: "accept",
                });
            }
            active
                .call
                .transition(CallStatus::Accepted)
                .map_err(|_| CallError::InvalidState {
                    id,
                    status: CallStatus::Ringing,
                    op: "accept",
                })?;
            let out = (active.call.media_kind, active.remote_user.clone());
            shared.publish(&st);
            out
        };
        info!("call {}: accepting call from {}", id, remote);

        let stream = shared.media.acquire(media_kind.wants_video(), true).await;
        if shared.attach_local_stream(id, &stream).is_none() {
            info!("call {}: ended while acquiring media", id);
            shared.media.release(&stream);
            return Ok(());
        }
        if stream.is_empty() && shared.config.require_media {
            shared.fail(id, &CallError::NoLocalMedia).await;
            return Err(CallError::NoLocalMedia);
        }

        // The session must exist before the caller learns about the accept.
        match shared.install_engine(id, Role::Responder).await {
            Ok(Some(_engine)) => {}
            Ok(None) => return Ok(()),
            Err(e) => {
                shared.fail(id, &e).await;
                return Err(e);
            }
        }

        if let Err(e) = shared.store.accept(id).await {
            warn!("call {}: could not record accept: {}", id, e);
        }
        let accept = SignalingMessage::new(id, shared.local_user.clone(), remote, SignalPayload::Accept);
        if let Err(e) = shared.channel.send(accept).await {
            let e = CallError::from(e);
            shared.fail(id, &e).await;
            return Err(e);
        }
        Ok(())
    }

    /// Decline a ringing incoming call. Callers cancel with [`CallController::end_call`].
    pub async fn reject_call(&self, id: CallId) -> Result<()> {
        let shared = &self.shared;
        let current = {
            let st = shared.state();
            st.active
                .as_ref()
                .filter(|a| a.call.id == id)
                .map(|a| (a.direction, a.call.status))
        };
        match current {
            None => Err(CallError::UnknownCall(id)),
            Some((Direction::Incoming, CallStatus::Ringing)) => {
                shared
                    .finish(
                        id,
                        CallStatus::Rejected,
                        EndReason::Declined,
                        Some(SignalPayload::Reject { reason: None }),
                    )
                    .await;
                Ok(())
            }
            Some((_, status)) => Err(CallError::InvalidState {
                id,
                status,
                op: "reject",
            }),
        }
    }

    /// Hang up. Valid from any non-terminal status; repeating it is a no-op.
    pub async fn end_call(&self, id: CallId) -> Result<()> {
        let shared = &self.shared;
        let (active, finished) = {
            let st = shared.state();
            (st.is_active(id), st.finished.contains(&id))
        };
        match (active, finished) {
            (true, _) => {
                shared
                    .finish(
                        id,
                        CallStatus::Ended,
                        EndReason::LocalHangup,
                        Some(SignalPayload::Hangup),
                    )
                    .await;
                Ok(())
            }
            (false, true) => Ok(()),
            (false, false) => Err(CallError::UnknownCall(id)),
        }
    }

    /// Flip the camera on or off. Returns the new state.
    pub async fn toggle_video(&self) -> Result<bool> {
        self.toggle(TrackKind::Video).await
    }

    /// Flip the microphone on or off. Returns the new state.
    pub async fn toggle_audio(&self) -> Result<bool> {
        self.toggle(TrackKind::Audio).await
    }

    async fn toggle(&self, kind: TrackKind) -> Result<bool> {
        let shared = &self.shared;
        let (id, enabled) = {
            let st = shared.state();
            let active = st.active.as_ref().ok_or(CallError::NoActiveCall)?;
            let tracks: Vec<_> = active
                .local_stream
                .tracks()
                .iter()
                .filter(|t| t.kind() == kind)
                .collect();
            if tracks.is_empty() {
                return Ok(false);
            }
            let enabled = !tracks.iter().any(|t| t.is_enabled());
            for track in tracks {
                track.set_enabled(enabled);
            }
            let id = active.call.id;
            shared.publish(&st);
            (id, enabled)
        };
        debug!("call {}: {:?} enabled={}", id, kind, enabled);
        shared.announce_media_state(id).await;
        Ok(enabled)
    }

    pub async fn screen_sources(&self) -> Result<Vec<ScreenSource>> {
        Ok(self.shared.media.screen_sources().await?)
    }

    /// Share a screen source on the active call.
    ///
    /// Replaces the outgoing video track when one exists. Otherwise a new
    /// sender is negotiated within the configured window; if that does not
    /// settle, the share is abandoned, the capture released, and
    /// `RenegotiationTimeout` returned while the call itself continues.
    pub async fn start_screen_share(&self, selector: ScreenSelector) -> Result<()> {
        let shared = &self.shared;
        let (id, engine) = {
            let st = shared.state();
            let active = st.active.as_ref().ok_or(CallError::NoActiveCall)?;
            if active.screen_stream.is_some() {
                return Ok(());
            }
            match (&active.engine, active.call.status) {
                (Some(engine), CallStatus::Accepted | CallStatus::Connected) => {
                    (active.call.id, engine.clone())
                }
                _ => {
                    return Err(CallError::InvalidState {
                        id: active.call.id,
                        status: active.call.status,
                        op: "share screen",
                    })
                }
            }
        };
        let _guard = InFlightGuard::acquire(shared, id)?;

        let screen = shared.media.acquire_screen(&selector).await?;
        let Some(track) = screen.video_tracks().next().cloned() else {
            shared.media.release(&screen);
            return Err(MediaError::NoSourceAvailable.into());
        };
        if !shared.state().is_active(id) {
            shared.media.release(&screen);
            return Err(CallError::UnknownCall(id));
        }

        let attached = engine.lock().await.attach_screen(&track).await;
        let attached = match attached {
            Ok(attached) => attached,
            Err(e) => {
                shared.media.release(&screen);
                return Err(e);
            }
        };

        if attached == ScreenAttach::NeedsRenegotiation {
            if let Err(e) = shared.settle_renegotiation(&engine).await {
                warn!("call {}: screen share abandoned: {}", id, e);
                {
                    let mut engine = engine.lock().await;
                    if let Err(e) = engine.abandon_renegotiation().await {
                        debug!("call {}: rollback after abandon failed: {}", id, e);
                    }
                    if let Err(e) = engine.detach_screen(None).await {
                        debug!("call {}: detach after abandon failed: {}", id, e);
                    }
                }
                shared.media.release(&screen);
                return Err(e);
            }
        }

        let installed = {
            let mut st = shared.state();
            let installed = st
                .active_for(id)
                .map(|active| active.screen_stream = Some(screen.clone()))
                .is_some();
            if installed {
                shared.publish(&st);
            }
            installed
        };
        if !installed {
            shared.media.release(&screen);
            return Err(CallError::UnknownCall(id));
        }

        info!("call {}: sharing screen ({})", id, track.label());
        shared.announce_media_state(id).await;
        Ok(())
    }

    /// Stop sharing. Restores the camera track when there is one; never renegotiates.
    pub async fn stop_screen_share(&self) -> Result<()> {
        let shared = &self.shared;
        let stopped = {
            let mut st = shared.state();
            let taken = st.active.as_mut().and_then(|active| {
                let screen = active.screen_stream.take()?;
                let camera = active.local_stream.video_tracks().next().cloned();
                Some((active.call.id, active.engine.clone(), screen, camera))
            });
            if taken.is_some() {
                shared.publish(&st);
            }
            taken
        };
        let Some((id, engine, screen, camera)) = stopped else {
            return Ok(());
        };

        if let Some(engine) = engine {
            let mut engine = engine.lock().await;
            if let Err(e) = engine.detach_screen(camera.as_ref()).await {
                warn!("call {}: could not restore video sender: {}", id, e);
            }
        }
        shared.media.release(&screen);
        info!("call {}: screen share stopped", id);
        shared.announce_media_state(id).await;
        Ok(())
    }

    /// Negotiation state of the active call, if it has a session.
    pub async fn negotiation(&self) -> Option<NegotiationSnapshot> {
        let engine = self
            .shared
            .state()
            .active
            .as_ref()
            .and_then(|a| a.engine.clone())?;
        let snapshot = engine.lock().await.snapshot();
        Some(snapshot)
    }

    /// End any active call and stop consuming signaling.
    pub async fn shutdown(&self) {
        if let Some(id) = self.shared.current_call_id() {
            if let Err(e) = self.end_call(id).await {
                debug!("call {}: end on shutdown failed: {}", id, e);
            }
        }
        let pumps: Vec<_> = self
            .shared
            .pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for pump in pumps {
            pump.abort();
        }
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &ControllerState) {
        self.view_tx.send_replace(state.view());
    }

    fn current_call_id(&self) -> Option<CallId> {
        self.state().active.as_ref().map(|a| a.call.id)
    }

    /// Store freshly acquired media on the call. Returns the call status, or
    /// `None` if the call is gone.
    fn attach_local_stream(&self, id: CallId, stream: &MediaStream) -> Option<CallStatus> {
        let mut st = self.state();
        let status = st.active_for(id).map(|active| {
            active.local_stream = stream.clone();
            active.media_ready = true;
            active.call.status
        });
        if status.is_some() {
            self.publish(&st);
        }
        status
    }

    async fn record_unreachable(&self, call: Call) {
        let id = call.id;
        let mut failed = call;
        if let Err(e) = failed.transition(CallStatus::Failed) {
            warn!("call {}: {}", id, e);
        }
        {
            let mut st = self.state();
            let remote_user = failed.receiver_id.clone();
            st.ended = Some(CallView {
                call: Some(failed),
                direction: Some(Direction::Outgoing),
                remote_user: Some(remote_user),
                end_reason: Some(EndReason::PeerUnreachable),
                ..CallView::default()
            });
            st.remember_finished(id);
            if st.active.is_none() {
                self.publish(&st);
            }
        }
        if let Err(e) = self.store.update_status(id, CallStatus::Failed).await {
            warn!("call {}: could not record failure: {}", id, e);
        }
    }

    fn spawn_ring_timer(self: &Arc<Self>, id: CallId) {
        let weak = Arc::downgrade(self);
        let after = self.config.ring_timeout;
        tokio::spawn(async move {
            sleep(after).await;
            if let Some(shared) = weak.upgrade() {
                shared.ring_expired(id).await;
            }
        });
    }

    async fn ring_expired(self: &Arc<Self>, id: CallId) {
        let ringing = {
            let st = self.state();
            st.active
                .as_ref()
                .is_some_and(|a| a.call.id == id && a.call.status == CallStatus::Ringing)
        };
        if ringing {
            info!("call {}: unanswered after {:?}", id, self.config.ring_timeout);
            self.finish(
                id,
                CallStatus::Ended,
                EndReason::NoAnswer,
                Some(SignalPayload::Hangup),
            )
            .await;
        }
    }

    async fn handle_signal(self: &Arc<Self>, mut message: SignalingMessage) {
        if message.to_user_id != self.local_user {
            warn!(
                "ignoring {} addressed to {}",
                message.kind(),
                message.to_user_id
            );
            return;
        }
        let fresh = self.state().dedup.accept(&mut message);
        if !fresh {
            debug!("dropping duplicate {} {}", message.kind(), message.id);
            return;
        }

        let id = message.call_id;
        debug!(
            "call {}: received {} from {}",
            id,
            message.kind(),
            message.from_user_id
        );
        match message.payload.clone() {
            SignalPayload::Invite { media_kind } => {
                let call = Call::ringing(
                    id,
                    message.from_user_id.clone(),
                    self.local_user.clone(),
                    media_kind,
                );
                self.on_incoming(call).await;
            }
            SignalPayload::Accept => self.on_remote_accept(id, &message.from_user_id).await,
            SignalPayload::Reject { reason } => {
                self.on_remote_terminal(
                    id,
                    &message.from_user_id,
                    CallStatus::Rejected,
                    EndReason::Rejected(reason),
                )
                .await
            }
            SignalPayload::Hangup => {
                self.on_remote_terminal(
                    id,
                    &message.from_user_id,
                    CallStatus::Ended,
                    EndReason::RemoteHangup,
                )
                .await
            }
            SignalPayload::CallFailed { reason } => {
                self.on_remote_terminal(
                    id,
                    &message.from_user_id,
                    CallStatus::Failed,
                    EndReason::RemoteFailed(reason),
                )
                .await
            }
            SignalPayload::MediaState { screen, .. } => {
                self.on_media_state(id, &message.from_user_id, screen)
            }
            _ => self.on_negotiation(message).await,
        }
    }

    async fn handle_record(self: &Arc<Self>, call: Call) {
        if !call.involves(&self.local_user) {
            return;
        }
        let id = call.id;
        let remote = call.peer_of(&self.local_user).to_string();
        let tracked = {
            let st = self.state();
            st.active
                .as_ref()
                .filter(|a| a.call.id == id)
                .map(|a| (a.direction, a.call.status))
        };

        match (tracked, call.status) {
            (None, CallStatus::Ringing) if call.receiver_id == self.local_user => {
                self.on_incoming(call).await
            }
            (Some((Direction::Outgoing, CallStatus::Ringing)), CallStatus::Accepted) => {
                self.on_remote_accept(id, &remote).await
            }
            (Some(_), CallStatus::Rejected) => {
                self.on_remote_terminal(id, &remote, CallStatus::Rejected, EndReason::Rejected(None))
                    .await
            }
            (Some(_), CallStatus::Ended) => {
                self.on_remote_terminal(id, &remote, CallStatus::Ended, EndReason::RemoteHangup)
                    .await
            }
            (Some(_), CallStatus::Failed) => {
                self.on_remote_terminal(
                    id,
                    &remote,
                    CallStatus::Failed,
                    EndReason::RemoteFailed("call record failed".to_string()),
                )
                .await
            }
            _ => {}
        }
    }

    async fn on_incoming(self: &Arc<Self>, call: Call) {
        let id = call.id;
        let busy_with = {
            let mut st = self.state();
            if st.finished.contains(&id) {
                return;
            }
            match st.active.as_ref().map(|a| a.call.id) {
                Some(current) if current == id => return,
                Some(current) => Some(current),
                None => {
                    info!(
                        "call {}: incoming {} call from {}",
                        id, call.media_kind, call.caller_id
                    );
                    st.active = Some(ActiveCall::new(
                        call.clone(),
                        Direction::Incoming,
                        &self.local_user,
                    ));
                    self.publish(&st);
                    None
                }
            }
        };

        let Some(current) = busy_with else {
            self.spawn_ring_timer(id);
            return;
        };

        info!(
            "call {}: busy with {}, declining call from {}",
            id, current, call.caller_id
        );
        self.state().remember_finished(id);
        let reply = SignalingMessage::new(
            id,
            self.local_user.clone(),
            call.caller_id.clone(),
            SignalPayload::Reject {
                reason: Some(BUSY_REASON.to_string()),
            },
        );
        if let Err(e) = self.channel.send(reply).await {
            debug!("call {}: could not decline: {}", id, e);
        }
        if let Err(e) = self.store.reject(id).await {
            debug!("call {}: could not record decline: {}", id, e);
        }
    }

    async fn on_remote_accept(self: &Arc<Self>, id: CallId, from: &str) {
        let ready = {
            let mut st = self.state();
            let Some(active) = st.active_for(id) else {
                debug!("call {}: accept for inactive call", id);
                return;
            };
            if active.direction != Direction::Outgoing
                || active.remote_user != from
                || active.call.status != CallStatus::Ringing
            {
                return;
            }
            if let Err(e) = active.call.transition(CallStatus::Accepted) {
                warn!("call {}: {}", id, e);
                return;
            }
            let ready = active.media_ready;
            self.publish(&st);
            ready
        };

        info!("call {}: accepted by {}", id, from);
        if ready {
            self.begin_offer(id).await;
        } else {
            debug!("call {}: offer waits for local media", id);
        }
    }

    /// Create the caller's session and send the initial offer.
    async fn begin_offer(self: &Arc<Self>, id: CallId) {
        let result = match self.install_engine(id, Role::Initiator).await {
            Ok(Some(mut engine)) => engine.create_offer().await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.fail(id, &e).await;
        }
    }

    /// Create the negotiation session for `id` and replay buffered messages.
    ///
    /// Returns the locked engine so the caller can continue without another
    /// message slipping in first, or `None` if the call went away.
    async fn install_engine(
        self: &Arc<Self>,
        id: CallId,
        role: Role,
    ) -> Result<Option<OwnedMutexGuard<NegotiationEngine>>> {
        let prepared = {
            let st = self.state();
            st.active
                .as_ref()
                .filter(|a| a.call.id == id && a.engine.is_none())
                .map(|a| (a.remote_user.clone(), a.local_stream.tracks().to_vec()))
        };
        let Some((remote, tracks)) = prepared else {
            return Ok(None);
        };

        let config = PeerConfig {
            ice_servers: self.config.ice_servers.clone(),
        };
        let (peer, events) = self.peers.create(&config).await?;
        let mut engine = NegotiationEngine::new(
            id,
            self.local_user.clone(),
            remote,
            role,
            peer,
            self.channel.clone(),
        );
        if let Err(e) = engine.add_local_tracks(&tracks).await {
            engine.close().await;
            return Err(e);
        }

        let engine = Arc::new(AsyncMutex::new(engine));
        let mut guard = engine.clone().lock_owned().await;
        let backlog = {
            let mut st = self.state();
            st.active_for(id)
                .filter(|a| a.engine.is_none())
                .map(|active| {
                    active.engine = Some(engine.clone());
                    std::mem::take(&mut active.backlog)
                })
        };
        let Some(backlog) = backlog else {
            debug!("call {}: gone before its session was ready", id);
            guard.close().await;
            return Ok(None);
        };

        self.spawn_event_pump(id, events);
        info!("call {}: negotiation session ready ({:?})", id, role);
        for message in backlog {
            apply_negotiation(&mut guard, &message).await?;
        }
        Ok(Some(guard))
    }

    fn spawn_event_pump(self: &Arc<Self>, id: CallId, mut events: PeerEvents) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(shared) = weak.upgrade() else { break };
                shared.handle_peer_event(id, event).await;
            }
            debug!("call {}: peer events closed", id);
        });
    }

    async fn handle_peer_event(self: &Arc<Self>, id: CallId, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let Some(engine) = self.engine_for(id) else {
                    return;
                };
                let mut engine = engine.lock().await;
                if let Err(e) = engine.send_local_candidate(candidate).await {
                    debug!("call {}: candidate not sent: {}", id, e);
                }
            }
            PeerEvent::IceStateChanged(IceState::Connected) => self.on_connected(id).await,
            PeerEvent::IceStateChanged(IceState::Failed) => {
                self.fail(id, &CallError::IceFailed(id)).await
            }
            PeerEvent::IceStateChanged(IceState::Disconnected) => {
                warn!("call {}: connectivity interrupted", id)
            }
            PeerEvent::IceStateChanged(state) => debug!("call {}: ICE {:?}", id, state),
            PeerEvent::RemoteTrack(track) => {
                let mut st = self.state();
                let kept = st
                    .active_for(id)
                    .map(|active| {
                        debug!("call {}: remote {:?} track {}", id, track.kind(), track.id());
                        active.remote_stream.add_track(track.clone());
                    })
                    .is_some();
                if kept {
                    self.publish(&st);
                } else {
                    track.stop();
                }
            }
            PeerEvent::RemoteTrackEnded(track_id) => {
                let mut st = self.state();
                let removed = st
                    .active_for(id)
                    .and_then(|active| active.remote_stream.remove_track(&track_id));
                if let Some(track) = removed {
                    track.stop();
                    self.publish(&st);
                }
            }
        }
    }

    async fn on_connected(self: &Arc<Self>, id: CallId) {
        let connected = {
            let mut st = self.state();
            let connected = st.active_for(id).is_some_and(|active| {
                active.call.status == CallStatus::Accepted
                    && active.call.transition(CallStatus::Connected).is_ok()
            });
            if connected {
                self.publish(&st);
            }
            connected
        };
        if connected {
            info!("call {}: connected", id);
            if let Err(e) = self.store.update_status(id, CallStatus::Connected).await {
                warn!("call {}: could not record connect: {}", id, e);
            }
        }
    }

    async fn on_remote_terminal(
        self: &Arc<Self>,
        id: CallId,
        from: &str,
        status: CallStatus,
        reason: EndReason,
    ) {
        let known = {
            let st = self.state();
            st.active
                .as_ref()
                .is_some_and(|a| a.call.id == id && a.remote_user == from)
        };
        if !known {
            debug!("call {}: {} for inactive call", id, status);
            return;
        }
        self.finish(id, status, reason, None).await;
    }

    fn on_media_state(&self, id: CallId, from: &str, screen: bool) {
        let mut st = self.state();
        let changed = st
            .active_for(id)
            .filter(|a| a.remote_user == from)
            .map(|active| active.remote_screen = screen)
            .is_some();
        if changed {
            debug!("call {}: remote screen share {}", id, screen);
            self.publish(&st);
        }
    }

    async fn on_negotiation(self: &Arc<Self>, message: SignalingMessage) {
        let id = message.call_id;
        let engine = {
            let mut st = self.state();
            let Some(active) = st.active_for(id) else {
                debug!("call {}: dropping {} for inactive call", id, message.kind());
                return;
            };
            if active.remote_user != message.from_user_id {
                warn!(
                    "call {}: dropping {} from non-participant {}",
                    id,
                    message.kind(),
                    message.from_user_id
                );
                return;
            }
            match &active.engine {
                Some(engine) => engine.clone(),
                None => {
                    debug!(
                        "call {}: buffering {} until the session exists",
                        id,
                        message.kind()
                    );
                    active.backlog.push(message);
                    return;
                }
            }
        };

        let result = {
            let mut engine = engine.lock().await;
            if engine.is_closed() {
                return;
            }
            apply_negotiation(&mut engine, &message).await
        };
        if let Err(e) = result {
            self.fail(id, &e).await;
        }
    }

    fn engine_for(&self, id: CallId) -> Option<Arc<AsyncMutex<NegotiationEngine>>> {
        self.state()
            .active
            .as_ref()
            .filter(|a| a.call.id == id)
            .and_then(|a| a.engine.clone())
    }

    async fn announce_media_state(&self, id: CallId) {
        let message = {
            let st = self.state();
            st.active.as_ref().filter(|a| a.call.id == id).map(|a| {
                SignalingMessage::new(id, self.local_user.clone(), a.remote_user.clone(), a.media_state())
            })
        };
        if let Some(message) = message {
            if let Err(e) = self.channel.send(message).await {
                debug!("call {}: media state not sent: {}", id, e);
            }
        }
    }

    /// Wait for a pending change to settle, retrying with bounded backoff.
    async fn settle_renegotiation(&self, engine: &Arc<AsyncMutex<NegotiationEngine>>) -> Result<()> {
        let window = self.config.renegotiation_window;
        let deadline = Instant::now() + window;
        let mut delay = self.config.renegotiation_backoff;
        loop {
            let settled = engine.lock().await.step_renegotiation().await?;
            if settled {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CallError::RenegotiationTimeout(window));
            }
            sleep(with_jitter(delay).min(deadline - now)).await;
            delay = (delay * 2).min(self.config.renegotiation_backoff_max);
        }
    }

    async fn fail(self: &Arc<Self>, id: CallId, err: &CallError) {
        warn!("call {}: failed: {}", id, err);
        self.finish(
            id,
            CallStatus::Failed,
            EndReason::from_error(err),
            Some(SignalPayload::CallFailed {
                reason: err.to_string(),
            }),
        )
        .await;
    }

    /// Tear the call down: notify the peer, close the session, release every
    /// stream and record the terminal status. Idempotent.
    async fn finish(
        self: &Arc<Self>,
        id: CallId,
        status: CallStatus,
        reason: EndReason,
        notice: Option<SignalPayload>,
    ) {
        let taken = {
            let mut st = self.state();
            if st.is_active(id) {
                st.active.take()
            } else {
                None
            }
        };
        let Some(mut active) = taken else {
            return;
        };

        let status = if active.call.status.can_transition_to(status) {
            status
        } else {
            CallStatus::Ended
        };
        if let Err(e) = active.call.transition(status) {
            warn!("call {}: {}", id, e);
        }
        info!("call {}: {} ({})", id, status, reason);

        if let Some(payload) = notice {
            let message = SignalingMessage::new(
                id,
                self.local_user.clone(),
                active.remote_user.clone(),
                payload,
            );
            if let Err(e) = self.channel.send(message).await {
                debug!("call {}: could not notify {}: {}", id, active.remote_user, e);
            }
        }

        if let Some(engine) = active.engine.take() {
            engine.lock().await.close().await;
        }
        self.media.release(&active.local_stream);
        if let Some(screen) = active.screen_stream.take() {
            self.media.release(&screen);
        }
        active.remote_stream.stop_all();

        {
            let mut st = self.state();
            st.ended = Some(active.ended_view(reason));
            st.remember_finished(id);
            if st.active.is_none() {
                self.publish(&st);
            }
        }

        let recorded = match status {
            CallStatus::Rejected => self.store.reject(id).await,
            CallStatus::Failed => self.store.update_status(id, CallStatus::Failed).await,
            _ => self.store.end(id).await,
        };
        if let Err(e) = recorded {
            warn!("call {}: could not record {}: {}", id, status, e);
        }
    }
}

async fn apply_negotiation(engine: &mut NegotiationEngine, message: &SignalingMessage) -> Result<()> {
    match &message.payload {
        SignalPayload::Offer(_) | SignalPayload::RenegotiationOffer(_) => {
            engine.handle_offer(message).await
        }
        SignalPayload::Answer(_) | SignalPayload::RenegotiationAnswer(_) => {
            engine.handle_answer(message).await
        }
        SignalPayload::IceCandidate(candidate) => {
            engine.handle_ice_candidate(candidate.clone()).await
        }
        other => Err(CallError::StaleMessage(format!(
            "{} is not a negotiation message",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_reason_from_error() {
        let id = CallId::new();
        assert_eq!(
            EndReason::from_error(&CallError::IceFailed(id)),
            EndReason::IceFailed
        );
        assert_eq!(
            EndReason::from_error(&SignalingError::PeerUnreachable("bob".into()).into()),
            EndReason::PeerUnreachable
        );
        assert!(matches!(
            EndReason::from_error(&SignalingError::Closed.into()),
            EndReason::Transport(_)
        ));
        assert!(matches!(
            EndReason::from_error(&CallError::NegotiationConflict(id)),
            EndReason::Negotiation(_)
        ));
    }

    #[test]
    fn test_remote_screen_requires_announcement() {
        use parley_media::MediaTrack;

        let call = Call::ringing(CallId::new(), "alice", "bob", MediaKind::Audio);
        let mut active = ActiveCall::new(call, Direction::Outgoing, "alice");
        active.remote_stream.add_track(MediaTrack::new(
            TrackKind::Video,
            TrackSource::Screen,
            "display",
        ));
        assert!(active.remote_screen_stream().is_empty());
        active.remote_screen = true;
        assert_eq!(active.remote_screen_stream().len(), 1);
        assert_eq!(active.remote_user, "bob");
    }

    #[test]
    fn test_ended_view_has_no_streams() {
        let call = Call::ringing(CallId::new(), "alice", "bob", MediaKind::Video);
        let mut active = ActiveCall::new(call, Direction::Incoming, "bob");
        active.local_stream = MediaStream::new(vec![parley_media::MediaTrack::silence()]);
        let view = active.ended_view(EndReason::NoAnswer);
        assert!(view.local_stream.is_empty());
        assert_eq!(view.end_reason, Some(EndReason::NoAnswer));
        assert_eq!(view.remote_user.as_deref(), Some("alice"));
    }
}
