//! Screen sharing on a live call: track replacement, renegotiation and its timeout.

mod common;

use std::time::Duration;

use common::{connect, eventually, wait_for, World};
use parley_call::{CallConfig, CallError, IceOutcome};
use parley_common::{CallStatus, MediaKind, SignalKind};
use parley_media::{DeviceBehavior, ScreenSelector, SyntheticBackend, TrackSource};

#[tokio::test]
async fn test_share_on_audio_call_renegotiates_once() {
    let world = World::new();
    let alice = world.party("alice").await;
    let bob = world.party("bob").await;
    connect(&alice, &bob, MediaKind::Audio).await;
    assert_eq!(world.hub.count("alice", SignalKind::RenegotiationOffer), 0);

    alice
        .controller
        .start_screen_share(ScreenSelector::First)
        .await
        .unwrap();
    assert!(alice.controller.view().is_sharing_screen());
    assert_eq!(world.hub.count("alice", SignalKind::RenegotiationOffer), 1);
    assert_eq!(world.hub.count("bob", SignalKind::RenegotiationAnswer), 1);

    let seen = wait_for(&bob, "alice's screen", |v| !v.remote_screen_stream.is_empty()).await;
    assert!(seen
        .remote_screen_stream
        .tracks()
        .iter()
        .all(|t| t.source() == TrackSource::Screen));

    let snapshot = alice.controller.negotiation().await.unwrap();
    assert!(snapshot.pending.is_none());
    assert_eq!(snapshot.stats.rollbacks, 0);

    alice.controller.stop_screen_share().await.unwrap();
    assert!(!alice.controller.view().is_sharing_screen());
    wait_for(&bob, "screen to go away", |v| v.remote_screen_stream.is_empty()).await;

    // Stopping never renegotiates; the added sender is simply emptied.
    assert_eq!(world.hub.count("alice", SignalKind::RenegotiationOffer), 1);
    let peer = alice.peers.last().unwrap();
    assert!(peer.sender_tracks().contains(&None));
    // Microphone only; the screen capture was released.
    assert_eq!(alice.media.live_tracks(), 1);
    assert_eq!(alice.controller.view().status(), Some(CallStatus::Connected));
}

#[tokio::test]
async fn test_share_on_video_call_replaces_camera() {
    let world = World::new();
    let alice = world.party("alice").await;
    let bob = world.party("bob").await;
    connect(&alice, &bob, MediaKind::Video).await;

    let camera = alice
        .controller
        .view()
        .local_stream
        .video_tracks()
        .next()
        .cloned()
        .unwrap();

    alice
        .controller
        .start_screen_share(ScreenSelector::Name("built-in display".to_string()))
        .await
        .unwrap();
    assert_eq!(world.hub.count("alice", SignalKind::RenegotiationOffer), 0);

    let peer = alice.peers.last().unwrap();
    let sending: Vec<_> = peer.sender_tracks().into_iter().flatten().collect();
    assert!(sending.iter().any(|t| t.source() == TrackSource::Screen));
    assert!(!sending.iter().any(|t| t.same_track(&camera)));
    wait_for(&bob, "alice's screen", |v| !v.remote_screen_stream.is_empty()).await;

    // Sharing twice is a no-op.
    alice
        .controller
        .start_screen_share(ScreenSelector::First)
        .await
        .unwrap();

    alice.controller.stop_screen_share().await.unwrap();
    let sending: Vec<_> = peer.sender_tracks().into_iter().flatten().collect();
    assert!(sending.iter().any(|t| t.same_track(&camera)));
    assert!(!sending.iter().any(|t| t.source() == TrackSource::Screen));
    assert_eq!(world.hub.count("alice", SignalKind::RenegotiationOffer), 0);
    assert_eq!(alice.media.live_tracks(), 2);
    wait_for(&bob, "screen to go away", |v| v.remote_screen_stream.is_empty()).await;
}

#[tokio::test]
async fn test_denied_screen_leaves_call_untouched() {
    let world = World::new();
    let alice = world
        .party_with(
            "alice",
            SyntheticBackend::new().screen(DeviceBehavior::Denied),
            IceOutcome::Connect,
        )
        .await;
    let bob = world.party("bob").await;
    connect(&alice, &bob, MediaKind::Video).await;

    let result = alice
        .controller
        .start_screen_share(ScreenSelector::First)
        .await;
    assert!(matches!(result, Err(CallError::MediaUnavailable(_))));
    assert!(!alice.controller.view().is_sharing_screen());
    assert_eq!(alice.controller.view().status(), Some(CallStatus::Connected));
    assert_eq!(alice.media.live_tracks(), 2);

    let missing = alice
        .controller
        .start_screen_share(ScreenSelector::Id("display-9".to_string()))
        .await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn test_share_requires_a_session() {
    let world = World::new();
    let alice = world.party("alice").await;
    let bob = world.party("bob").await;

    assert!(matches!(
        alice.controller.start_screen_share(ScreenSelector::First).await,
        Err(CallError::NoActiveCall)
    ));

    alice
        .controller
        .place_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    common::wait_status(&bob, CallStatus::Ringing).await;
    assert!(matches!(
        alice.controller.start_screen_share(ScreenSelector::First).await,
        Err(CallError::InvalidState { .. })
    ));
    assert_eq!(alice.media.live_tracks(), 1);
}

#[tokio::test]
async fn test_unsettled_renegotiation_abandons_share() {
    let world = World::with_config(CallConfig {
        renegotiation_window: Duration::from_millis(300),
        ..common::test_config()
    });
    let alice = world.party("alice").await;
    let bob = world.party("bob").await;
    let id = connect(&alice, &bob, MediaKind::Audio).await;

    world.hub.cut_link("alice", "bob");
    let result = alice
        .controller
        .start_screen_share(ScreenSelector::First)
        .await;
    assert!(matches!(result, Err(CallError::RenegotiationTimeout(_))));

    let view = alice.controller.view();
    assert_eq!(view.call_id(), Some(id));
    assert_eq!(view.status(), Some(CallStatus::Connected));
    assert!(!view.is_sharing_screen());
    assert_eq!(alice.media.live_tracks(), 1);

    let snapshot = alice.controller.negotiation().await.unwrap();
    assert_eq!(snapshot.stats.rollbacks, 1);
    assert!(snapshot.pending.is_none());
    assert_eq!(
        snapshot.signaling_state,
        parley_call::SignalingState::Stable
    );
    assert!(!bob.controller.view().is_sharing_screen());

    // Once the link is back the same share goes through.
    world.hub.restore_link("alice", "bob");
    alice
        .controller
        .start_screen_share(ScreenSelector::First)
        .await
        .unwrap();
    assert_eq!(world.hub.count("alice", SignalKind::RenegotiationOffer), 2);
    wait_for(&bob, "alice's screen", |v| !v.remote_screen_stream.is_empty()).await;

    let peer = alice.peers.last().unwrap();
    eventually("bob sees the screen track", || {
        let peer = peer.clone();
        async move { peer.sender_tracks().iter().flatten().count() == 2 }
    })
    .await;
    assert_eq!(bob.media.live_tracks(), 1);
}

#[tokio::test]
async fn test_hangup_releases_screen_capture() {
    let world = World::new();
    let alice = world.party("alice").await;
    let bob = world.party("bob").await;
    let id = connect(&alice, &bob, MediaKind::Video).await;

    alice
        .controller
        .start_screen_share(ScreenSelector::First)
        .await
        .unwrap();
    assert_eq!(alice.media.live_tracks(), 3);

    bob.controller.end_call(id).await.unwrap();
    common::wait_status(&alice, CallStatus::Ended).await;
    assert_eq!(alice.media.live_tracks(), 0);
    assert!(!alice.controller.view().is_sharing_screen());
}
