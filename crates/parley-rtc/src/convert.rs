//! Mapping between webrtc-rs types and the call core's types.

use parley_call::{IceState, PeerError, SignalingState};
use parley_common::{IceCandidate, SdpKind, SessionDescription};
use parley_media::{TrackKind, TrackSource};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};

const STREAM_PREFIX: &str = "parley-";

pub(crate) fn native(err: webrtc::Error) -> PeerError {
    PeerError::Native(err.to_string())
}

pub(crate) fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp.clone()),
        SdpKind::Rollback => return Ok(rollback()),
    };
    parsed.map_err(|e| PeerError::BadDescription(e.to_string()))
}

pub(crate) fn from_rtc(desc: &RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(PeerError::BadDescription(
                "description without a type".to_string(),
            ))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    })
}

pub(crate) fn rollback() -> RTCSessionDescription {
    let mut desc = RTCSessionDescription::default();
    desc.sdp_type = RTCSdpType::Rollback;
    desc
}

pub(crate) fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => SignalingState::Closed,
    }
}

pub(crate) fn ice_state(state: RTCIceConnectionState) -> IceState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => IceState::Connected,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
    }
}

pub(crate) fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

pub(crate) fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
    }
}

pub(crate) fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

pub(crate) fn kind_of(codec: RTPCodecType) -> Option<TrackKind> {
    match codec {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        RTPCodecType::Unspecified => None,
    }
}

/// Stream id that carries the capture source across the wire.
pub(crate) fn stream_id_for(source: TrackSource) -> String {
    let name = match source {
        TrackSource::Microphone => "microphone",
        TrackSource::Camera => "camera",
        TrackSource::Screen => "screen",
        TrackSource::Silence => "silence",
        TrackSource::Remote => "relay",
    };
    format!("{}{}", STREAM_PREFIX, name)
}

/// Remote tracks keep the screen marker; everything else is just remote.
pub(crate) fn source_of(stream_id: &str) -> TrackSource {
    match stream_id.strip_prefix(STREAM_PREFIX) {
        Some("screen") => TrackSource::Screen,
        _ => TrackSource::Remote,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_state_mapping() {
        assert_eq!(
            signaling_state(RTCSignalingState::HaveLocalPranswer),
            SignalingState::HaveLocalOffer
        );
        assert_eq!(
            signaling_state(RTCSignalingState::HaveRemoteOffer),
            SignalingState::HaveRemoteOffer
        );
        assert_eq!(
            signaling_state(RTCSignalingState::Unspecified),
            SignalingState::Stable
        );
        assert_eq!(
            signaling_state(RTCSignalingState::Closed),
            SignalingState::Closed
        );
    }

    #[test]
    fn test_ice_state_mapping() {
        assert_eq!(
            ice_state(RTCIceConnectionState::Completed),
            IceState::Connected
        );
        assert_eq!(ice_state(RTCIceConnectionState::Failed), IceState::Failed);
        assert_eq!(ice_state(RTCIceConnectionState::Unspecified), IceState::New);
    }

    #[test]
    fn test_rollback_needs_no_sdp() {
        let desc = to_rtc(&SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        })
        .unwrap();
        assert_eq!(desc.sdp_type, RTCSdpType::Rollback);
        assert_eq!(from_rtc(&desc).unwrap().kind, SdpKind::Rollback);
    }

    #[test]
    fn test_garbage_offer_is_rejected() {
        let err = to_rtc(&SessionDescription::offer("not sdp")).unwrap_err();
        assert!(matches!(err, PeerError::BadDescription(_)));
    }

    #[test]
    fn test_untyped_description_is_rejected() {
        assert!(from_rtc(&RTCSessionDescription::default()).is_err());
    }

    #[test]
    fn test_screen_marker_survives_the_wire() {
        assert_eq!(source_of(&stream_id_for(TrackSource::Screen)), TrackSource::Screen);
        assert_eq!(source_of(&stream_id_for(TrackSource::Camera)), TrackSource::Remote);
        assert_eq!(source_of("browser-stream"), TrackSource::Remote);
    }

    #[test]
    fn test_candidate_fields_carry_over() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        assert_eq!(from_init(to_init(candidate.clone())), candidate);
    }

    #[test]
    fn test_codecs_per_kind() {
        assert_eq!(codec_for(TrackKind::Audio).mime_type, MIME_TYPE_OPUS);
        assert_eq!(codec_for(TrackKind::Video).clock_rate, 90000);
        assert_eq!(kind_of(RTPCodecType::Unspecified), None);
    }
}
