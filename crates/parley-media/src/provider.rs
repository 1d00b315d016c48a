use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{CaptureBackend, MediaError, MediaStream, MediaTrack, ScreenSource};

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Upper bound on any single device open.
    pub device_timeout: Duration,
    /// Add a silent audio track when nothing else could be opened.
    pub silent_audio_fallback: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            device_timeout: Duration::from_secs(5),
            silent_audio_fallback: false,
        }
    }
}

/// Which screen source to capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenSelector {
    First,
    Id(String),
    Name(String),
}

impl ScreenSelector {
    fn pick<'a>(&self, sources: &'a [ScreenSource]) -> Option<&'a ScreenSource> {
        match self {
            ScreenSelector::First => sources.first(),
            ScreenSelector::Id(id) => sources.iter().find(|s| &s.id == id),
            ScreenSelector::Name(name) => sources.iter().find(|s| s.name.eq_ignore_ascii_case(name)),
        }
    }
}

/// Acquires and releases local capture streams.
///
/// Every track handed out is remembered so that leaks can be detected with
/// [`MediaSourceProvider::live_tracks`].
pub struct MediaSourceProvider {
    backend: Arc<dyn CaptureBackend>,
    config: ProviderConfig,
    issued: Mutex<Vec<MediaTrack>>,
}

impl MediaSourceProvider {
    pub fn new(backend: Arc<dyn CaptureBackend>, config: ProviderConfig) -> Self {
        Self {
            backend,
            config,
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Open camera and/or microphone.
    ///
    /// Never fails: a denied camera degrades to audio-only, and total failure
    /// yields an empty stream so the call can continue as signaling-only.
    pub async fn acquire(&self, want_video: bool, want_audio: bool) -> MediaStream {
        let mut tracks = Vec::new();

        if want_audio {
            match self
                .bounded("microphone", self.backend.open_microphone())
                .await
            {
                Ok(track) => tracks.push(track),
                Err(e) => warn!("microphone unavailable, continuing without audio: {}", e),
            }
        }

        if want_video {
            match self.bounded("camera", self.backend.open_camera()).await {
                Ok(track) => tracks.push(track),
                Err(e) => warn!("camera unavailable, continuing without video: {}", e),
            }
        }

        if tracks.is_empty() && (want_audio || want_video) && self.config.silent_audio_fallback {
            info!("no capture device available, using a silent audio track");
            tracks.push(MediaTrack::silence());
        }

        self.register(&tracks);
        debug!(
            "acquired local stream with {} track(s) (video={}, audio={})",
            tracks.len(),
            want_video,
            want_audio
        );
        MediaStream::new(tracks)
    }

    pub async fn screen_sources(&self) -> Result<Vec<ScreenSource>, MediaError> {
        self.bounded("screen sources", self.backend.screen_sources())
            .await
    }

    /// Open a video-only stream for the selected screen source.
    pub async fn acquire_screen(
        &self,
        selector: &ScreenSelector,
    ) -> Result<MediaStream, MediaError> {
        let sources = self.screen_sources().await?;
        let source = selector
            .pick(&sources)
            .ok_or(MediaError::NoSourceAvailable)?;
        let track = self
            .bounded("screen", self.backend.open_screen(source))
            .await?;
        info!("capturing screen source {} ({})", source.id, source.name);
        self.register(std::slice::from_ref(&track));
        Ok(MediaStream::new(vec![track]))
    }

    /// Stop every track of `stream`.
    pub fn release(&self, stream: &MediaStream) {
        if stream.is_empty() {
            return;
        }
        stream.stop_all();
        self.prune();
    }

    /// Number of tracks issued by this provider that are still live.
    pub fn live_tracks(&self) -> usize {
        self.prune();
        self.issued
            .lock()
            .map(|issued| issued.len())
            .unwrap_or_default()
    }

    async fn bounded<T>(
        &self,
        device: &'static str,
        fut: impl Future<Output = Result<T, MediaError>>,
    ) -> Result<T, MediaError> {
        match timeout(self.config.device_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(MediaError::Timeout(device)),
        }
    }

    fn register(&self, tracks: &[MediaTrack]) {
        if let Ok(mut issued) = self.issued.lock() {
            issued.extend(tracks.iter().cloned());
        }
    }

    fn prune(&self) {
        if let Ok(mut issued) = self.issued.lock() {
            issued.retain(|t| t.is_live());
        }
    }
}
