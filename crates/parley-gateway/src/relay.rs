//! WebSocket signaling relay.
//!
//! A client binds its connection to a user id with the first frame. After
//! that every `Signal` frame is logged and forwarded to the target's
//! connection, or answered with `Undeliverable` when the target is offline.
//! Call record changes involving the bound user are pushed as `CallUpdated`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures::{stream::StreamExt, SinkExt};
use parley_call::CallRecordStore;
use parley_common::{GatewayFrame, SignalPayload, SignalingMessage, UserId};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::{db, security, AppState};

const WS_OUTBOX_CAPACITY: usize = 128;
/// How long a relayed signal may wait for room in a full target outbox.
const WS_DELIVERY_WAIT: Duration = Duration::from_secs(2);
pub const WS_MAX_TEXT_BYTES: usize = 64 * 1024;
pub const MAX_SIGNAL_SDP_BYTES: usize = 32 * 1024;
pub const MAX_SIGNAL_CANDIDATE_BYTES: usize = 4096;

static CONNECTION_SERIAL: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct Connection {
    serial: u64,
    tx: mpsc::Sender<Message>,
}

/// Outcome of handing a frame to a bound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The connection is alive but its outbox stayed full.
    Congested,
    /// The connection is gone.
    Closed,
}

impl Connection {
    pub fn try_send(&self, frame: &GatewayFrame) -> bool {
        match to_ws_message(frame) {
            Some(message) => self.tx.try_send(message).is_ok(),
            None => false,
        }
    }

    /// Queue `frame`, waiting up to `wait` for room when the outbox is full.
    pub async fn deliver(&self, frame: &GatewayFrame, wait: Duration) -> Delivery {
        let Some(message) = to_ws_message(frame) else {
            return Delivery::Closed;
        };
        let message = match self.tx.try_send(message) {
            Ok(()) => return Delivery::Sent,
            Err(mpsc::error::TrySendError::Closed(_)) => return Delivery::Closed,
            Err(mpsc::error::TrySendError::Full(message)) => message,
        };
        match self.tx.send_timeout(message, wait).await {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Delivery::Congested,
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Delivery::Closed,
        }
    }
}

pub type ConnectionMap = Arc<RwLock<HashMap<UserId, Connection>>>;

fn to_ws_message(frame: &GatewayFrame) -> Option<Message> {
    frame.encode().ok().map(Message::Text)
}

async fn send_frame(tx: &mpsc::Sender<Message>, frame: &GatewayFrame) -> bool {
    let Some(message) = to_ws_message(frame) else {
        return false;
    };
    tx.send(message).await.is_ok()
}

async fn send_error(tx: &mpsc::Sender<Message>, message: &str) {
    let _ = send_frame(
        tx,
        &GatewayFrame::Error {
            message: message.to_string(),
        },
    )
    .await;
}

/// Why a signal was refused before relaying.
fn signal_rejection(message: &SignalingMessage, bound: &str) -> Option<&'static str> {
    if message.from_user_id != bound {
        return Some("Sender does not match bound user");
    }
    if !security::is_valid_user_id(&message.to_user_id) {
        return Some("Invalid target user");
    }
    let oversized = match &message.payload {
        SignalPayload::Offer(desc)
        | SignalPayload::Answer(desc)
        | SignalPayload::RenegotiationOffer(desc)
        | SignalPayload::RenegotiationAnswer(desc) => desc.sdp.len() > MAX_SIGNAL_SDP_BYTES,
        SignalPayload::IceCandidate(candidate) => {
            candidate.candidate.len() > MAX_SIGNAL_CANDIDATE_BYTES
        }
        _ => false,
    };
    if oversized {
        return Some("Signal payload too large");
    }
    None
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !security::ws_origin_allowed(origin) {
        return StatusCode::FORBIDDEN.into_response();
    }

    if state.active_connections() >= state.config.max_connections {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(WS_MAX_TEXT_BYTES)
        .max_frame_size(WS_MAX_TEXT_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
        .into_response()
}

async fn handle_socket(stream: WebSocket, state: AppState, addr: SocketAddr) {
    state.active.fetch_add(1, Ordering::Relaxed);
    info!("client connecting from {}", addr);
    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(WS_OUTBOX_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    if let Some((user, serial)) = bind(&mut receiver, &tx, &state, addr).await {
        let feed = match state.store.subscribe(&user).await {
            Ok(mut feed) => {
                let tx = tx.clone();
                Some(tokio::spawn(async move {
                    while let Some(call) = feed.recv().await {
                        if !send_frame(&tx, &GatewayFrame::CallUpdated(call)).await {
                            break;
                        }
                    }
                }))
            }
            Err(e) => {
                warn!("could not subscribe {} to call records: {}", user, e);
                None
            }
        };
        let _ = send_frame(
            &tx,
            &GatewayFrame::Bound {
                user_id: user.clone(),
            },
        )
        .await;

        serve_bound(&mut receiver, &tx, &state, &user, addr).await;

        if let Some(feed) = feed {
            feed.abort();
        }
        let mut connections = state.connections.write().await;
        if connections.get(&user).is_some_and(|c| c.serial == serial) {
            connections.remove(&user);
        }
        info!("client disconnected: {}", user);
    }

    drop(tx);
    let _ = writer.await;
    state.active.fetch_sub(1, Ordering::Relaxed);
}

/// Wait for the bind frame and register the connection. Returns the bound
/// user and the connection serial; the caller confirms with `Bound`.
async fn bind(
    receiver: &mut futures::stream::SplitStream<WebSocket>,
    tx: &mpsc::Sender<Message>,
    state: &AppState,
    addr: SocketAddr,
) -> Option<(UserId, u64)> {
    let first = match tokio::time::timeout(state.config.bind_timeout, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => return None,
        Err(_) => {
            send_error(tx, "Bind timeout").await;
            return None;
        }
    };

    let user_id = match GatewayFrame::decode(&first) {
        Ok(GatewayFrame::Bind { user_id }) => user_id,
        Ok(_) => {
            send_error(tx, "Bind required before signaling").await;
            return None;
        }
        Err(err) => {
            warn!("invalid JSON from {}: {}", addr, err);
            send_error(tx, "Invalid JSON").await;
            return None;
        }
    };

    if !security::allow_ws_bind_request(&format!("bind:{}", addr.ip())) {
        send_error(tx, "Bind rate limit exceeded").await;
        return None;
    }
    if !security::is_valid_user_id(&user_id) {
        send_error(tx, "Invalid user id").await;
        return None;
    }

    let serial = CONNECTION_SERIAL.fetch_add(1, Ordering::Relaxed);
    let replaced = state.connections.write().await.insert(
        user_id.clone(),
        Connection {
            serial,
            tx: tx.clone(),
        },
    );
    if let Some(previous) = replaced {
        let _ = previous.try_send(&GatewayFrame::Error {
            message: "Session replaced by a newer connection".into(),
        });
    }

    info!("bound signaling session for user {}", user_id);
    Some((user_id, serial))
}

async fn serve_bound(
    receiver: &mut futures::stream::SplitStream<WebSocket>,
    tx: &mpsc::Sender<Message>,
    state: &AppState,
    user: &str,
    addr: SocketAddr,
) {
    let mut window_start = Instant::now();
    let mut message_count: u32 = 0;

    while let Some(Ok(msg)) = receiver.next().await {
        let now = Instant::now();
        if now.duration_since(window_start) >= Duration::from_secs(60) {
            window_start = now;
            message_count = 0;
        }
        message_count = message_count.saturating_add(1);
        if message_count > state.config.max_messages_per_minute {
            send_error(tx, "Rate limit exceeded").await;
            break;
        }

        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(_) => {
                send_error(tx, "Binary messages are not supported").await;
                break;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if text.len() > WS_MAX_TEXT_BYTES {
            send_error(tx, "Message too large").await;
            break;
        }

        let frame = match GatewayFrame::decode(&text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("invalid JSON from {}: {}", addr, err);
                send_error(tx, "Invalid JSON").await;
                break;
            }
        };

        match frame {
            GatewayFrame::Signal(message) => {
                if let Some(reason) = signal_rejection(&message, user) {
                    send_error(tx, reason).await;
                    continue;
                }
                relay_signal(state, tx, message).await;
            }
            GatewayFrame::Bind { .. } => {
                send_error(tx, "Already bound").await;
                break;
            }
            GatewayFrame::Bound { .. }
            | GatewayFrame::Undeliverable { .. }
            | GatewayFrame::CallUpdated(_)
            | GatewayFrame::Error { .. } => {
                send_error(tx, "Unsupported client message type").await;
            }
        }
    }
}

/// Log `message` and hand it to the target's connection.
async fn relay_signal(
    state: &AppState,
    sender: &mpsc::Sender<Message>,
    message: SignalingMessage,
) {
    if let Err(e) = db::log_signal(&state.pool, &message).await {
        warn!("call {}: could not log {}: {}", message.call_id, message.kind(), e);
    }

    let target = {
        let guard = state.connections.read().await;
        guard.get(&message.to_user_id).cloned()
    };

    let delivery = match target {
        Some(target) => {
            target
                .deliver(&GatewayFrame::Signal(message.clone()), WS_DELIVERY_WAIT)
                .await
        }
        None => Delivery::Closed,
    };
    if delivery == Delivery::Congested {
        // Still bound: report congestion to the sender, not Undeliverable.
        warn!(
            "call {}: dropped {} for {}, outbox full",
            message.call_id,
            message.kind(),
            message.to_user_id
        );
        send_error(sender, "Target connection congested").await;
        return;
    }
    if delivery == Delivery::Sent {
        debug!(
            "call {}: relayed {} {} -> {}",
            message.call_id,
            message.kind(),
            message.from_user_id,
            message.to_user_id
        );
        if let Err(e) = db::mark_processed(&state.pool, message.id).await {
            debug!("could not mark {} processed: {}", message.id, e);
        }
        return;
    }

    warn!(
        "call {}: {} undeliverable, {} is not connected",
        message.call_id,
        message.kind(),
        message.to_user_id
    );
    let _ = send_frame(
        sender,
        &GatewayFrame::Undeliverable {
            message_id: message.id,
            call_id: message.call_id,
            to_user_id: message.to_user_id,
        },
    )
    .await;
}
