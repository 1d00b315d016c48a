//! Scripted two-party call over the in-process loopback hub.
//!
//! Alice calls Bob, Bob answers, Alice shares her screen for a while, stops,
//! and hangs up. Used by `parley demo` and as a smoke test of the whole core.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parley_call::{
    CallConfig, CallController, Collaborators, Direction, LoopbackHub, MemoryCallStore,
    PeerConnectionFactory, SimulatedPeerFactory,
};
use parley_common::{CallStatus, MediaKind, SignalKind};
use parley_media::{MediaSourceProvider, ScreenSelector, SyntheticBackend};
use tracing::info;

use crate::session::wait_for_view;

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoPeers {
    Simulated,
    Rtc,
}

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub media_kind: MediaKind,
    pub share_screen: bool,
    /// Time spent in each connected phase (plain, then sharing).
    pub hold: Duration,
    pub peers: DemoPeers,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            media_kind: MediaKind::Video,
            share_screen: true,
            hold: Duration::from_secs(2),
            peers: DemoPeers::Simulated,
        }
    }
}

/// What happened during a demo run.
#[derive(Debug, Clone, Default)]
pub struct DemoReport {
    /// Milestones each side passed through, in order.
    pub caller_statuses: Vec<CallStatus>,
    pub callee_statuses: Vec<CallStatus>,
    pub remote_saw_screen: bool,
    pub renegotiation_offers: usize,
    /// Tracks still live on either side after hangup.
    pub live_tracks_after: usize,
}

struct DemoParty {
    controller: CallController,
    media: Arc<MediaSourceProvider>,
}

fn peer_factory(peers: DemoPeers) -> Result<Arc<dyn PeerConnectionFactory>> {
    Ok(match peers {
        DemoPeers::Simulated => Arc::new(SimulatedPeerFactory::new()),
        DemoPeers::Rtc => Arc::new(parley_rtc::RtcPeerFactory::new()?),
    })
}

async fn party(
    user: &str,
    hub: &Arc<LoopbackHub>,
    store: &Arc<MemoryCallStore>,
    config: &CallConfig,
    peers: DemoPeers,
) -> Result<DemoParty> {
    let media = Arc::new(MediaSourceProvider::new(
        Arc::new(SyntheticBackend::new()),
        config.provider_config(),
    ));
    let controller = CallController::new(
        user,
        config.clone(),
        Collaborators {
            channel: hub.clone(),
            reachability: hub.clone(),
            store: store.clone(),
            media: media.clone(),
            peers: peer_factory(peers)?,
        },
    );
    controller.start().await?;
    Ok(DemoParty { controller, media })
}

fn record(statuses: &mut Vec<CallStatus>, status: Option<CallStatus>) {
    if let Some(status) = status {
        if statuses.last() != Some(&status) {
            statuses.push(status);
        }
    }
}

pub async fn run_demo(options: DemoOptions, config: CallConfig) -> Result<DemoReport> {
    let hub = Arc::new(LoopbackHub::new());
    let store = Arc::new(MemoryCallStore::new());
    let alice = party("alice", &hub, &store, &config, options.peers).await?;
    let bob = party("bob", &hub, &store, &config, options.peers).await?;

    let mut report = DemoReport::default();
    let mut alice_view = alice.controller.subscribe();
    let mut bob_view = bob.controller.subscribe();

    let id = alice
        .controller
        .place_call("bob", options.media_kind)
        .await?;
    info!("alice is calling bob ({}), call {}", options.media_kind, id);
    record(&mut report.caller_statuses, alice.controller.view().status());

    let ringing = wait_for_view(&mut bob_view, STEP_TIMEOUT, "incoming call", |v| {
        v.call_id() == Some(id) && v.direction == Some(Direction::Incoming)
    })
    .await?;
    record(&mut report.callee_statuses, ringing.status());
    info!("bob's phone is ringing");
    bob.controller.accept_call(id).await?;

    for (view, statuses) in [
        (&mut alice_view, &mut report.caller_statuses),
        (&mut bob_view, &mut report.callee_statuses),
    ] {
        let connected = wait_for_view(view, STEP_TIMEOUT, "connected call", |v| {
            v.call_id() == Some(id)
                && matches!(
                    v.status(),
                    Some(CallStatus::Connected | CallStatus::Ended | CallStatus::Failed)
                )
        })
        .await?;
        record(statuses, Some(CallStatus::Accepted));
        record(statuses, connected.status());
    }
    if alice.controller.view().status() != Some(CallStatus::Connected) {
        return Err(anyhow!(
            "call did not connect: {:?}",
            alice.controller.view().end_reason
        ));
    }
    info!("call {} connected", id);
    tokio::time::sleep(options.hold).await;

    if options.share_screen {
        let sources = alice.controller.screen_sources().await?;
        info!("alice has {} screen source(s)", sources.len());
        alice
            .controller
            .start_screen_share(ScreenSelector::First)
            .await?;
        info!("alice is sharing her screen");
        let seen = wait_for_view(&mut bob_view, STEP_TIMEOUT, "remote screen", |v| {
            !v.remote_screen_stream.is_empty()
        })
        .await;
        report.remote_saw_screen = seen.is_ok();
        tokio::time::sleep(options.hold).await;
        alice.controller.stop_screen_share().await?;
        info!("alice stopped sharing");
    }
    report.renegotiation_offers = hub.count("alice", SignalKind::RenegotiationOffer);

    alice.controller.end_call(id).await?;
    for (view, statuses) in [
        (&mut alice_view, &mut report.caller_statuses),
        (&mut bob_view, &mut report.callee_statuses),
    ] {
        let ended = wait_for_view(view, STEP_TIMEOUT, "hangup", |v| {
            v.status().is_some_and(|s| s.is_terminal())
        })
        .await?;
        record(statuses, ended.status());
    }
    info!("call {} ended", id);

    alice.controller.shutdown().await;
    bob.controller.shutdown().await;
    report.live_tracks_after = alice.media.live_tracks() + bob.media.live_tracks();
    Ok(report)
}
