//! WebSocket signaling channel backed by the Parley gateway.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parley_call::{CallFeed, SignalStream, SignalingChannel, SignalingError};
use parley_common::{Call, GatewayFrame, SignalPayload, SignalingMessage, UserId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const BIND_TIMEOUT: Duration = Duration::from_secs(10);

/// Reason carried by the local `CallFailed` notice synthesized when the
/// gateway reports a message as undeliverable.
pub const UNDELIVERABLE_REASON: &str = "peer unreachable";

/// `ws://host/ws` for an `http://host` gateway base URL.
pub fn ws_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    if base.ends_with("/ws") {
        base
    } else {
        format!("{}/ws", base)
    }
}

fn transport(err: impl std::fmt::Display) -> SignalingError {
    SignalingError::Transport(err.to_string())
}

/// One bound gateway connection for one local user.
///
/// Signals addressed to the user are exposed through [`SignalingChannel`];
/// `CallUpdated` pushes are exposed through [`GatewayChannel::take_call_feed`].
pub struct GatewayChannel {
    user: UserId,
    outbox: mpsc::UnboundedSender<GatewayFrame>,
    signals: Mutex<Option<SignalStream>>,
    calls: Mutex<Option<CallFeed>>,
    tasks: Vec<JoinHandle<()>>,
}

impl GatewayChannel {
    /// Connect to `url` (an `http(s)://` base or a `ws(s)://` URL) and bind
    /// the connection to `user`.
    pub async fn connect(url: &str, user: &str) -> Result<Self, SignalingError> {
        let url = ws_url(url);
        let (mut ws_stream, _) = connect_async(url.as_str()).await.map_err(transport)?;

        let bind = GatewayFrame::Bind {
            user_id: user.to_string(),
        };
        let text = bind.encode().map_err(transport)?;
        ws_stream.send(Message::text(text)).await.map_err(transport)?;

        let bound = tokio::time::timeout(BIND_TIMEOUT, async {
            while let Some(msg) = ws_stream.next().await {
                let msg = msg.map_err(transport)?;
                let Message::Text(text) = msg else { continue };
                match GatewayFrame::decode(text.as_str()) {
                    Ok(GatewayFrame::Bound { user_id }) => return Ok(user_id),
                    Ok(GatewayFrame::Error { message }) => {
                        return Err(SignalingError::Transport(message))
                    }
                    Ok(other) => debug!("ignoring {:?} before bind", other),
                    Err(e) => return Err(transport(e)),
                }
            }
            Err(SignalingError::Closed)
        })
        .await
        .map_err(|_| SignalingError::Transport("gateway bind timed out".into()))??;
        info!("bound to gateway {} as {}", url, bound);

        let (mut sink, mut stream) = ws_stream.split();
        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<GatewayFrame>();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let (call_tx, call_rx) = mpsc::unbounded_channel::<Call>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbox_rx.recv().await {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("could not encode frame: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let local = bound.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("gateway connection error: {}", e);
                        break;
                    }
                };
                let frame = match GatewayFrame::decode(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("invalid frame from gateway: {}", e);
                        continue;
                    }
                };
                match frame {
                    GatewayFrame::Signal(message) => {
                        let _ = signal_tx.send(message);
                    }
                    GatewayFrame::Undeliverable {
                        message_id,
                        call_id,
                        to_user_id,
                    } => {
                        debug!("call {}: {} was undeliverable", call_id, message_id);
                        let notice = SignalingMessage::new(
                            call_id,
                            to_user_id,
                            local.clone(),
                            SignalPayload::CallFailed {
                                reason: UNDELIVERABLE_REASON.to_string(),
                            },
                        );
                        let _ = signal_tx.send(notice);
                    }
                    GatewayFrame::CallUpdated(call) => {
                        let _ = call_tx.send(call);
                    }
                    GatewayFrame::Error { message } => warn!("gateway error: {}", message),
                    GatewayFrame::Bind { .. } | GatewayFrame::Bound { .. } => {}
                }
            }
            info!("gateway connection for {} closed", local);
        });

        Ok(Self {
            user: bound,
            outbox,
            signals: Mutex::new(Some(signal_rx)),
            calls: Mutex::new(Some(call_rx)),
            tasks: vec![writer, reader],
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Record changes pushed by the gateway. Can be taken once.
    pub fn take_call_feed(&self, user: &str) -> Result<CallFeed, SignalingError> {
        if user != self.user {
            return Err(SignalingError::Transport(format!(
                "connection is bound to {}, not {}",
                self.user, user
            )));
        }
        self.calls
            .lock()
            .ok()
            .and_then(|mut feed| feed.take())
            .ok_or_else(|| SignalingError::AlreadySubscribed(user.to_string()))
    }
}

impl Drop for GatewayChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalingChannel for GatewayChannel {
    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        if message.from_user_id != self.user {
            return Err(SignalingError::Transport(format!(
                "connection is bound to {}, cannot send as {}",
                self.user, message.from_user_id
            )));
        }
        self.outbox
            .send(GatewayFrame::Signal(message))
            .map_err(|_| SignalingError::Closed)
    }

    async fn subscribe(&self, user: &str) -> Result<SignalStream, SignalingError> {
        if user != self.user {
            return Err(SignalingError::Transport(format!(
                "connection is bound to {}, not {}",
                self.user, user
            )));
        }
        self.signals
            .lock()
            .ok()
            .and_then(|mut stream| stream.take())
            .ok_or_else(|| SignalingError::AlreadySubscribed(user.to_string()))
    }
}
