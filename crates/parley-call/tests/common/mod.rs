//! Shared harness: two or more controllers wired through one loopback hub
//! and one in-memory call store.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_call::{
    CallConfig, CallController, CallView, Collaborators, IceOutcome, LoopbackHub,
    MemoryCallStore, SimulatedPeerFactory,
};
use parley_common::{CallId, CallStatus, MediaKind};
use parley_media::{MediaSourceProvider, SyntheticBackend};
use tokio::time::{sleep, timeout, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Party {
    pub user: String,
    pub controller: CallController,
    pub media: Arc<MediaSourceProvider>,
    pub peers: Arc<SimulatedPeerFactory>,
}

pub struct World {
    pub hub: Arc<LoopbackHub>,
    pub store: Arc<MemoryCallStore>,
    pub config: CallConfig,
}

pub fn test_config() -> CallConfig {
    CallConfig {
        device_timeout: Duration::from_secs(1),
        ring_timeout: Duration::from_secs(30),
        ..CallConfig::default()
    }
}

impl World {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: CallConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("parley_call=debug")
            .with_test_writer()
            .try_init();
        Self {
            hub: Arc::new(LoopbackHub::new()),
            store: Arc::new(MemoryCallStore::new()),
            config,
        }
    }

    pub async fn party(&self, user: &str) -> Party {
        self.party_with(user, SyntheticBackend::new(), IceOutcome::Connect)
            .await
    }

    pub async fn party_with(
        &self,
        user: &str,
        backend: SyntheticBackend,
        outcome: IceOutcome,
    ) -> Party {
        let media = Arc::new(MediaSourceProvider::new(
            Arc::new(backend),
            self.config.provider_config(),
        ));
        let peers = Arc::new(SimulatedPeerFactory::with_outcome(outcome));
        let controller = CallController::new(
            user,
            self.config.clone(),
            Collaborators {
                channel: self.hub.clone(),
                reachability: self.hub.clone(),
                store: self.store.clone(),
                media: media.clone(),
                peers: peers.clone(),
            },
        );
        controller.start().await.unwrap();
        Party {
            user: user.to_string(),
            controller,
            media,
            peers,
        }
    }

    pub async fn record_status(&self, id: CallId) -> CallStatus {
        use parley_call::CallRecordStore;
        self.store.get(id).await.unwrap().unwrap().status
    }
}

/// Wait until the party's published view satisfies `pred`.
pub async fn wait_for(party: &Party, what: &str, pred: impl Fn(&CallView) -> bool) -> CallView {
    let mut rx = party.controller.subscribe();
    let waited = timeout(WAIT, async {
        loop {
            let view = rx.borrow_and_update().clone();
            if pred(&view) {
                return view;
            }
            if rx.changed().await.is_err() {
                return view;
            }
        }
    })
    .await;
    match waited {
        Ok(view) if pred(&view) => view,
        _ => panic!(
            "{}: timed out waiting for {}; view: {:?}",
            party.user,
            what,
            party.controller.view()
        ),
    }
}

pub async fn wait_status(party: &Party, status: CallStatus) -> CallView {
    wait_for(party, status.as_str(), |v| v.status() == Some(status)).await
}

/// Poll `check` until it holds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT;
    loop {
        if check().await {
            return;
        }
        if Instant::now() >= deadline {
            panic!("condition never held: {}", what);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Place a call from `caller` to `callee`, accept it and wait for both sides to connect.
pub async fn connect(caller: &Party, callee: &Party, kind: MediaKind) -> CallId {
    let id = caller
        .controller
        .place_call(&callee.user, kind)
        .await
        .unwrap();
    wait_for(callee, "incoming call", |v| {
        v.call_id() == Some(id) && v.status() == Some(CallStatus::Ringing)
    })
    .await;
    callee.controller.accept_call(id).await.unwrap();
    wait_status(caller, CallStatus::Connected).await;
    wait_status(callee, CallStatus::Connected).await;
    id
}

/// Record every status a party publishes.
pub fn record_statuses(party: &Party) -> Arc<Mutex<Vec<CallStatus>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut rx = party.controller.subscribe();
    let sink = seen.clone();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let status = rx.borrow_and_update().status();
            if let Some(status) = status {
                let mut seen = sink.lock().unwrap();
                if seen.last() != Some(&status) {
                    seen.push(status);
                }
            }
        }
    });
    seen
}

/// Position of a status in the lifecycle; terminal statuses share the last rank.
pub fn rank(status: CallStatus) -> u8 {
    match status {
        CallStatus::Ringing => 0,
        CallStatus::Accepted => 1,
        CallStatus::Connected => 2,
        CallStatus::Rejected | CallStatus::Ended | CallStatus::Failed => 3,
    }
}
