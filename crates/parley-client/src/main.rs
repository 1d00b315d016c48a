//! Parley CLI: scripted demo, outgoing calls and an auto-answering listener.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use parley_call::{CallConfig, CallView, Direction};
use parley_client::{run_demo, wait_for_view, DemoOptions, DemoPeers, GatewaySession};
use parley_common::{CallStatus, MediaKind};
use parley_media::{ScreenSelector, SyntheticBackend};
use parley_rtc::RtcPeerFactory;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(about = "Parley call client")]
struct Args {
    /// Gateway base URL
    #[arg(long, env = "PARLEY_GATEWAY_URL", default_value = "http://127.0.0.1:3000", global = true)]
    gateway: String,

    /// Local user id
    #[arg(long, env = "PARLEY_USER", global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Media {
    Video,
    Audio,
}

impl From<Media> for MediaKind {
    fn from(media: Media) -> Self {
        match media {
            Media::Video => MediaKind::Video,
            Media::Audio => MediaKind::Audio,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scripted call between two in-process users
    Demo {
        #[arg(long, value_enum, default_value = "video")]
        media: Media,
        /// Seconds spent in each phase of the call
        #[arg(long, default_value_t = 2)]
        hold_secs: u64,
        #[arg(long)]
        no_screen_share: bool,
        /// Use the webrtc peer connection instead of the simulated one
        #[arg(long)]
        rtc: bool,
    },

    /// Call a user through the gateway
    Call {
        receiver: String,
        #[arg(long, value_enum, default_value = "video")]
        media: Media,
        /// Hang up after this many seconds once connected
        #[arg(long, default_value_t = 30)]
        duration_secs: u64,
        /// Share the first screen source once connected
        #[arg(long)]
        share_screen: bool,
    },

    /// Wait for incoming calls and answer them
    Listen {
        /// Exit after the first call ends
        #[arg(long)]
        once: bool,
    },
}

fn local_user(args_user: Option<String>) -> Result<String> {
    args_user.ok_or_else(|| anyhow!("set --user or PARLEY_USER"))
}

async fn connect(gateway: &str, user: &str) -> Result<GatewaySession> {
    let config = CallConfig::from_env();
    let peers = Arc::new(RtcPeerFactory::new()?);
    GatewaySession::connect(
        gateway,
        user,
        config,
        Arc::new(SyntheticBackend::new()),
        peers,
    )
    .await
}

fn describe(view: &CallView) -> String {
    match (&view.call, &view.end_reason) {
        (Some(call), Some(reason)) => format!("call {} {} ({})", call.id, call.status, reason),
        (Some(call), None) => format!("call {} {}", call.id, call.status),
        (None, _) => "idle".to_string(),
    }
}

async fn run_call(
    gateway: &str,
    user: &str,
    receiver: &str,
    media: MediaKind,
    duration: Duration,
    share_screen: bool,
) -> Result<()> {
    let session = connect(gateway, user).await?;
    let controller = &session.controller;
    let mut views = controller.subscribe();

    let id = controller.place_call(receiver, media).await?;
    info!("calling {} (call {})", receiver, id);

    let view = wait_for_view(&mut views, Duration::from_secs(120), "answer", |v| {
        v.call_id() == Some(id)
            && v.status()
                .is_some_and(|s| s == CallStatus::Connected || s.is_terminal())
    })
    .await?;
    if view.status() != Some(CallStatus::Connected) {
        return Err(anyhow!("{}", describe(&view)));
    }
    info!("{}", describe(&view));

    if share_screen {
        if let Err(e) = controller.start_screen_share(ScreenSelector::First).await {
            warn!("screen share failed: {}", e);
        }
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => {
            controller.end_call(id).await?;
        }
        _ = tokio::signal::ctrl_c() => {
            controller.end_call(id).await?;
        }
        ended = wait_for_view(&mut views, Duration::MAX, "hangup", |v| {
            v.status().is_some_and(|s| s.is_terminal())
        }) => {
            info!("{}", describe(&ended?));
        }
    }
    controller.shutdown().await;
    Ok(())
}

async fn run_listen(gateway: &str, user: &str, once: bool) -> Result<()> {
    let session = connect(gateway, user).await?;
    let controller = &session.controller;
    let mut views = controller.subscribe();
    info!("{} is listening for calls", user);

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
        let view = views.borrow_and_update().clone();
        info!("{}", describe(&view));
        match (view.status(), view.direction, view.call_id()) {
            (Some(CallStatus::Ringing), Some(Direction::Incoming), Some(id)) => {
                info!("answering call {} from {:?}", id, view.remote_user);
                if let Err(e) = controller.accept_call(id).await {
                    warn!("could not answer call {}: {}", id, e);
                }
            }
            (Some(status), _, _) if status.is_terminal() && once => break,
            _ => {}
        }
    }
    controller.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    parley_common::init_tracing();
    dotenv::dotenv().ok();

    let args = Args::parse();

    match args.command {
        Command::Demo {
            media,
            hold_secs,
            no_screen_share,
            rtc,
        } => {
            let options = DemoOptions {
                media_kind: media.into(),
                share_screen: !no_screen_share,
                hold: Duration::from_secs(hold_secs),
                peers: if rtc { DemoPeers::Rtc } else { DemoPeers::Simulated },
            };
            let report = run_demo(options, CallConfig::from_env()).await?;
            println!("Caller statuses:      {:?}", report.caller_statuses);
            println!("Callee statuses:      {:?}", report.callee_statuses);
            println!("Remote saw screen:    {}", report.remote_saw_screen);
            println!("Renegotiation offers: {}", report.renegotiation_offers);
            println!("Live tracks after:    {}", report.live_tracks_after);
        }
        Command::Call {
            receiver,
            media,
            duration_secs,
            share_screen,
        } => {
            let user = local_user(args.user)?;
            run_call(
                &args.gateway,
                &user,
                &receiver,
                media.into(),
                Duration::from_secs(duration_secs),
                share_screen,
            )
            .await?;
        }
        Command::Listen { once } => {
            let user = local_user(args.user)?;
            run_listen(&args.gateway, &user, once).await?;
        }
    }

    Ok(())
}
