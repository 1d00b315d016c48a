use std::time::Duration;

use parley_call::CallConfig;
use parley_client::{run_demo, DemoOptions};
use parley_common::{CallStatus, MediaKind};

fn quick(media_kind: MediaKind) -> DemoOptions {
    DemoOptions {
        media_kind,
        hold: Duration::from_millis(50),
        ..DemoOptions::default()
    }
}

#[tokio::test]
async fn test_video_demo_replaces_camera_without_renegotiation() {
    let report = run_demo(quick(MediaKind::Video), CallConfig::default())
        .await
        .unwrap();
    assert_eq!(
        report.caller_statuses,
        vec![
            CallStatus::Ringing,
            CallStatus::Accepted,
            CallStatus::Connected,
            CallStatus::Ended
        ]
    );
    assert_eq!(
        report.callee_statuses,
        vec![
            CallStatus::Ringing,
            CallStatus::Accepted,
            CallStatus::Connected,
            CallStatus::Ended
        ]
    );
    assert!(report.remote_saw_screen);
    assert_eq!(report.renegotiation_offers, 0);
    assert_eq!(report.live_tracks_after, 0);
}

#[tokio::test]
async fn test_audio_demo_renegotiates_once_for_screen() {
    let report = run_demo(quick(MediaKind::Audio), CallConfig::default())
        .await
        .unwrap();
    assert!(report.remote_saw_screen);
    assert_eq!(report.renegotiation_offers, 1);
    assert_eq!(report.live_tracks_after, 0);
}

#[tokio::test]
async fn test_demo_without_screen_share() {
    let report = run_demo(
        DemoOptions {
            share_screen: false,
            ..quick(MediaKind::Audio)
        },
        CallConfig::default(),
    )
    .await
    .unwrap();
    assert!(!report.remote_saw_screen);
    assert_eq!(report.renegotiation_offers, 0);
    assert_eq!(report.caller_statuses.last(), Some(&CallStatus::Ended));
}
