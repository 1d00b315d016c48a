#![forbid(unsafe_code)]

//! Local capture sources for Parley calls.
//!
//! A [`MediaTrack`] is a handle on one live capture (or remote) source. Clones
//! share liveness, so stopping any clone stops the track everywhere. The
//! [`MediaSourceProvider`] hands out tracks from a [`CaptureBackend`] and keeps
//! a registry of everything it issued.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

mod provider;
mod synthetic;

pub use provider::{MediaSourceProvider, ProviderConfig, ScreenSelector};
pub use synthetic::{DeviceBehavior, SyntheticBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where a track's content comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
    /// Synthetic silence, used to keep a transport alive without devices.
    Silence,
    /// Received from the remote peer.
    Remote,
}

/// Serializable description of a track, without its live state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub id: String,
    pub kind: TrackKind,
    pub source: TrackSource,
    pub label: String,
}

struct TrackInner {
    descriptor: TrackDescriptor,
    enabled: AtomicBool,
    live: AtomicBool,
}

#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, source: TrackSource, label: impl Into<String>) -> Self {
        Self::from_descriptor(TrackDescriptor {
            id: Uuid::new_v4().to_string(),
            kind,
            source,
            label: label.into(),
        })
    }

    pub fn from_descriptor(descriptor: TrackDescriptor) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                descriptor,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    /// A silent audio track that carries no device.
    pub fn silence() -> Self {
        Self::new(TrackKind::Audio, TrackSource::Silence, "silence")
    }

    pub fn id(&self) -> &str {
        &self.inner.descriptor.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.descriptor.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.descriptor.source
    }

    pub fn label(&self) -> &str {
        &self.inner.descriptor.label
    }

    pub fn descriptor(&self) -> &TrackDescriptor {
        &self.inner.descriptor
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute/unmute without releasing the device.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Stop the track. Idempotent.
    pub fn stop(&self) {
        if self.inner.live.swap(false, Ordering::SeqCst) {
            tracing::debug!(
                "stopped {:?} track {} ({})",
                self.kind(),
                self.id(),
                self.label()
            );
        }
    }

    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for MediaTrack {}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("source", &self.source())
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// A set of tracks delivered together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaStream {
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn has_video(&self) -> bool {
        self.video_tracks().next().is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_tracks().next().is_some()
    }

    pub fn add_track(&mut self, track: MediaTrack) {
        if !self.tracks.iter().any(|t| t.id() == track.id()) {
            self.tracks.push(track);
        }
    }

    pub fn remove_track(&mut self, id: &str) -> Option<MediaTrack> {
        let pos = self.tracks.iter().position(|t| t.id() == id)?;
        Some(self.tracks.remove(pos))
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenSourceKind {
    Display,
    Window,
}

/// A capturable screen or window, as enumerated by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSource {
    pub id: String,
    pub name: String,
    pub kind: ScreenSourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("permission denied for {0}")]
    PermissionDenied(&'static str),
    #[error("no {0} device present")]
    DeviceMissing(&'static str),
    #[error("timed out opening {0}")]
    Timeout(&'static str),
    #[error("screen share denied")]
    ScreenShareDenied,
    #[error("no screen source available")]
    NoSourceAvailable,
    #[error("capture backend error: {0}")]
    Backend(String),
}

/// Platform capture access. Implementations open one device per call and
/// return a live track for it.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open_camera(&self) -> Result<MediaTrack, MediaError>;

    async fn open_microphone(&self) -> Result<MediaTrack, MediaError>;

    async fn screen_sources(&self) -> Result<Vec<ScreenSource>, MediaError>;

    async fn open_screen(&self, source: &ScreenSource) -> Result<MediaTrack, MediaError>;
}

/// Backend with no devices at all.
pub struct NullBackend;

#[async_trait]
impl CaptureBackend for NullBackend {
    async fn open_camera(&self) -> Result<MediaTrack, MediaError> {
        Err(MediaError::DeviceMissing("camera"))
    }

    async fn open_microphone(&self) -> Result<MediaTrack, MediaError> {
        Err(MediaError::DeviceMissing("microphone"))
    }

    async fn screen_sources(&self) -> Result<Vec<ScreenSource>, MediaError> {
        Ok(vec![])
    }

    async fn open_screen(&self, _source: &ScreenSource) -> Result<MediaTrack, MediaError> {
        Err(MediaError::NoSourceAvailable)
    }
}
