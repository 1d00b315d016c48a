use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::{
    CaptureBackend, MediaError, MediaTrack, ScreenSource, ScreenSourceKind, TrackKind, TrackSource,
};

/// How a synthetic device responds to an open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceBehavior {
    Available,
    Denied,
    Missing,
    /// Never answers; exercises the provider's device timeout.
    Hang,
    /// Answers after the given delay.
    Slow(Duration),
}

/// Capture backend that fabricates tracks without touching hardware.
///
/// Used by tests, the demo command and hosts without capture support.
pub struct SyntheticBackend {
    camera: DeviceBehavior,
    microphone: DeviceBehavior,
    screen: DeviceBehavior,
    sources: Vec<ScreenSource>,
    opened: AtomicU32,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self {
            camera: DeviceBehavior::Available,
            microphone: DeviceBehavior::Available,
            screen: DeviceBehavior::Available,
            sources: vec![ScreenSource {
                id: "display-0".to_string(),
                name: "Built-in Display".to_string(),
                kind: ScreenSourceKind::Display,
            }],
            opened: AtomicU32::new(0),
        }
    }

    pub fn camera(mut self, behavior: DeviceBehavior) -> Self {
        self.camera = behavior;
        self
    }

    pub fn microphone(mut self, behavior: DeviceBehavior) -> Self {
        self.microphone = behavior;
        self
    }

    pub fn screen(mut self, behavior: DeviceBehavior) -> Self {
        self.screen = behavior;
        self
    }

    pub fn sources(mut self, sources: Vec<ScreenSource>) -> Self {
        self.sources = sources;
        self
    }

    /// Number of tracks this backend has produced.
    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    async fn open(
        &self,
        behavior: DeviceBehavior,
        device: &'static str,
        kind: TrackKind,
        source: TrackSource,
        label: &str,
    ) -> Result<MediaTrack, MediaError> {
        match behavior {
            DeviceBehavior::Available => {}
            DeviceBehavior::Denied => {
                return Err(if source == TrackSource::Screen {
                    MediaError::ScreenShareDenied
                } else {
                    MediaError::PermissionDenied(device)
                })
            }
            DeviceBehavior::Missing => return Err(MediaError::DeviceMissing(device)),
            DeviceBehavior::Hang => std::future::pending::<()>().await,
            DeviceBehavior::Slow(delay) => tokio::time::sleep(delay).await,
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MediaTrack::new(kind, source, label))
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureBackend for SyntheticBackend {
    async fn open_camera(&self) -> Result<MediaTrack, MediaError> {
        self.open(
            self.camera,
            "camera",
            TrackKind::Video,
            TrackSource::Camera,
            "synthetic camera",
        )
        .await
    }

    async fn open_microphone(&self) -> Result<MediaTrack, MediaError> {
        self.open(
            self.microphone,
            "microphone",
            TrackKind::Audio,
            TrackSource::Microphone,
            "synthetic microphone",
        )
        .await
    }

    async fn screen_sources(&self) -> Result<Vec<ScreenSource>, MediaError> {
        Ok(self.sources.clone())
    }

    async fn open_screen(&self, source: &ScreenSource) -> Result<MediaTrack, MediaError> {
        if !self.sources.iter().any(|s| s.id == source.id) {
            return Err(MediaError::NoSourceAvailable);
        }
        self.open(
            self.screen,
            "screen",
            TrackKind::Video,
            TrackSource::Screen,
            &source.name,
        )
        .await
    }
}
