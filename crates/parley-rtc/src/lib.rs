#![forbid(unsafe_code)]

//! [`PeerConnection`] backed by webrtc-rs.
//!
//! Local [`MediaTrack`]s are published as sample tracks whose stream id
//! carries the capture source, so the remote side can tell a screen share
//! from a camera. Callbacks registered on the native connection forward into
//! one event channel that [`RtcPeer::close`] shuts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use parley_call::{
    IceState, PeerConfig, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent,
    PeerEvents, SenderId, SignalingState,
};
use parley_common::{IceCandidate, SessionDescription};
use parley_media::{MediaTrack, TrackDescriptor};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

mod convert;

type EventSink = Arc<Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>>;

fn emit(sink: &EventSink, event: PeerEvent) {
    let guard = sink.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(tx) = guard.as_ref() {
        let _ = tx.send(event);
    }
}

fn local_track(track: &MediaTrack) -> Arc<dyn TrackLocal + Send + Sync> {
    Arc::new(TrackLocalStaticSample::new(
        convert::codec_for(track.kind()),
        track.id().to_string(),
        convert::stream_id_for(track.source()),
    ))
}

/// Builds webrtc-rs peer connections sharing one codec/interceptor setup.
pub struct RtcPeerFactory {
    api: API,
}

impl RtcPeerFactory {
    pub fn new() -> Result<Self, PeerError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(convert::native)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media).map_err(convert::native)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents), PeerError> {
        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let pc = self
            .api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(convert::native)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let peer = RtcPeer {
            pc: Arc::new(pc),
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU32::new(1),
            events: Arc::new(Mutex::new(Some(tx))),
        };
        peer.wire_callbacks();
        debug!("created webrtc peer connection");
        Ok((Arc::new(peer), rx))
    }
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<SenderId, Arc<RTCRtpSender>>>,
    next_sender: AtomicU32,
    events: EventSink,
}

impl RtcPeer {
    fn wire_callbacks(&self) {
        let sink = self.events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => emit(&sink, PeerEvent::LocalCandidate(convert::from_init(init))),
                    Err(e) => warn!("could not serialize local candidate: {}", e),
                }
            })
        }));

        let sink = self.events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state| {
                let sink = sink.clone();
                Box::pin(async move {
                    debug!("ice connection state {}", state);
                    emit(&sink, PeerEvent::IceStateChanged(convert::ice_state(state)));
                })
            }));

        let sink = self.events.clone();
        self.pc
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let sink = sink.clone();
                Box::pin(async move {
                    let Some(kind) = convert::kind_of(track.kind()) else {
                        warn!("ignoring remote track {} of unknown kind", track.id());
                        return;
                    };
                    let stream_id = track.stream_id();
                    let remote = MediaTrack::from_descriptor(TrackDescriptor {
                        id: track.id(),
                        kind,
                        source: convert::source_of(&stream_id),
                        label: stream_id,
                    });
                    info!("remote {:?} track {}", kind, remote.id());
                    let id = remote.id().to_string();
                    emit(&sink, PeerEvent::RemoteTrack(remote));

                    // The track ends when its RTP stream does.
                    tokio::spawn(async move {
                        while track.read_rtp().await.is_ok() {}
                        emit(&sink, PeerEvent::RemoteTrackEnded(id));
                    });
                })
            }));
    }

    fn senders(&self) -> std::sync::MutexGuard<'_, HashMap<SenderId, Arc<RTCRtpSender>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(convert::native)?;
        convert::from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(convert::native)?;
        convert::from_rtc(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let desc = convert::to_rtc(&desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(convert::native)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let desc = convert::to_rtc(&desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(convert::native)
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        if self.signaling_state() != SignalingState::HaveLocalOffer {
            return Err(PeerError::InvalidState {
                op: "rollback",
                state: self.signaling_state().to_string(),
            });
        }
        self.pc
            .set_local_description(convert::rollback())
            .await
            .map_err(convert::native)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(convert::to_init(candidate))
            .await
            .map_err(convert::native)
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<SenderId, PeerError> {
        let sender = self
            .pc
            .add_track(local_track(track))
            .await
            .map_err(convert::native)?;

        // RTCP has to be drained for interceptors to work.
        let reader = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while reader.read(&mut buf).await.is_ok() {}
        });

        let id = SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst));
        self.senders().insert(id, sender);
        debug!("sender {:?} carries {:?} track {}", id, track.kind(), track.id());
        Ok(id)
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<&MediaTrack>,
    ) -> Result<(), PeerError> {
        let rtp_sender = self
            .senders()
            .get(&sender)
            .cloned()
            .ok_or(PeerError::UnknownSender(sender.0))?;
        rtp_sender
            .replace_track(track.map(local_track))
            .await
            .map_err(convert::native)
    }

    fn signaling_state(&self) -> SignalingState {
        convert::signaling_state(self.pc.signaling_state())
    }

    fn ice_state(&self) -> IceState {
        convert::ice_state(self.pc.ice_connection_state())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.senders().clear();
        self.pc.close().await.map_err(convert::native)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_media::{TrackKind, TrackSource};
    use std::time::Duration;

    async fn peer() -> (Arc<dyn PeerConnection>, PeerEvents) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("parley_rtc=debug")
            .with_test_writer()
            .try_init();
        RtcPeerFactory::new()
            .unwrap()
            .create(&PeerConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_peers() {
        let (a, _a_events) = peer().await;
        let (b, _b_events) = peer().await;
        a.add_track(&MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic"))
            .await
            .unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        b.set_remote_description(offer).await.unwrap();
        assert_eq!(b.signaling_state(), SignalingState::HaveRemoteOffer);
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(b.signaling_state(), SignalingState::Stable);
        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_requires_local_offer() {
        let (a, _events) = peer().await;
        assert!(matches!(
            a.rollback().await,
            Err(PeerError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_sender() {
        let (a, _events) = peer().await;
        assert!(matches!(
            a.replace_track(SenderId(42), None).await,
            Err(PeerError::UnknownSender(42))
        ));
    }

    #[tokio::test]
    async fn test_close_ends_event_stream() {
        let (a, mut events) = peer().await;
        a.close().await.unwrap();
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while events.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }
}
