//! Controller wiring for a user connected to a gateway.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parley_call::{CallConfig, CallController, CallView, Collaborators, PeerConnectionFactory};
use parley_media::{CaptureBackend, MediaSourceProvider};
use tokio::sync::watch;

use crate::records::{GatewayPresence, RemoteCallStore};
use crate::signaling::GatewayChannel;

pub struct GatewaySession {
    pub controller: CallController,
    pub media: Arc<MediaSourceProvider>,
    pub channel: Arc<GatewayChannel>,
}

impl GatewaySession {
    /// Bind `user` at the gateway and start a controller on top of it.
    pub async fn connect(
        base_url: &str,
        user: &str,
        config: CallConfig,
        backend: Arc<dyn CaptureBackend>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Result<Self> {
        let channel = Arc::new(GatewayChannel::connect(base_url, user).await?);
        let media = Arc::new(MediaSourceProvider::new(backend, config.provider_config()));
        let controller = CallController::new(
            user,
            config,
            Collaborators {
                channel: channel.clone(),
                reachability: Arc::new(GatewayPresence::new(base_url)),
                store: Arc::new(RemoteCallStore::new(base_url, channel.clone())),
                media: media.clone(),
                peers,
            },
        );
        controller.start().await?;
        Ok(Self {
            controller,
            media,
            channel,
        })
    }
}

/// Wait until the published view satisfies `pred`.
pub async fn wait_for_view(
    rx: &mut watch::Receiver<CallView>,
    within: Duration,
    what: &str,
    pred: impl FnMut(&CallView) -> bool,
) -> Result<CallView> {
    match tokio::time::timeout(within, rx.wait_for(pred)).await {
        Ok(Ok(view)) => Ok(view.clone()),
        Ok(Err(_)) => Err(anyhow!("controller went away while waiting for {}", what)),
        Err(_) => Err(anyhow!("timed out waiting for {}", what)),
    }
}
