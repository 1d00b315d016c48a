//! End-to-end tests for the gateway: WebSocket relay and HTTP call routes.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use parley_call::CallRecordStore;
use parley_common::{
    Call, CallStatus, GatewayFrame, MediaKind, PresenceResponse, SessionDescription,
    SignalPayload, SignalingMessage,
};
use parley_gateway::{connect_database, router, AppState, GatewayConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn test_state(config: GatewayConfig) -> AppState {
    let pool = connect_database("sqlite::memory:")
        .await
        .expect("Failed to create test database");
    AppState::new(pool, config)
}

async fn spawn_gateway(state: AppState) -> SocketAddr {
    let app = router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn send(socket: &mut Socket, frame: &GatewayFrame) {
    let text = serde_json::to_string(frame).unwrap();
    socket.send(Message::text(text)).await.unwrap();
}

async fn recv(socket: &mut Socket) -> Option<GatewayFrame> {
    loop {
        let next = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for a frame");
        match next {
            Some(Ok(Message::Text(text))) => {
                return Some(serde_json::from_str(text.as_str()).unwrap())
            }
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn bind(addr: SocketAddr, user: &str) -> Socket {
    let (mut socket, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    send(
        &mut socket,
        &GatewayFrame::Bind {
            user_id: user.to_string(),
        },
    )
    .await;
    match recv(&mut socket).await {
        Some(GatewayFrame::Bound { user_id }) => assert_eq!(user_id, user),
        other => panic!("expected Bound, got {:?}", other),
    }
    socket
}

#[tokio::test]
async fn test_signal_is_relayed_to_bound_target() {
    let state = test_state(GatewayConfig::default()).await;
    let addr = spawn_gateway(state.clone()).await;
    let mut alice = bind(addr, "alice").await;
    let mut bob = bind(addr, "bob").await;

    let call = state
        .store
        .create_call("alice", "bob", MediaKind::Audio)
        .await
        .unwrap();
    let offer = SignalingMessage::new(
        call.id,
        "alice",
        "bob",
        SignalPayload::Offer(SessionDescription::offer("v=0")),
    );
    send(&mut alice, &GatewayFrame::Signal(offer.clone())).await;

    // Bob first sees the record push, then the relayed offer.
    let mut relayed = None;
    for _ in 0..3 {
        match recv(&mut bob).await {
            Some(GatewayFrame::Signal(msg)) => {
                relayed = Some(msg);
                break;
            }
            Some(GatewayFrame::CallUpdated(update)) => assert_eq!(update.id, call.id),
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert_eq!(relayed, Some(offer.clone()));

    let rows = parley_gateway::db::signals_for_call(&state.pool, call.id)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].kind, "offer");
}

#[tokio::test]
async fn test_offline_target_is_reported_undeliverable() {
    let state = test_state(GatewayConfig::default()).await;
    let addr = spawn_gateway(state).await;
    let mut alice = bind(addr, "alice").await;

    let hangup = SignalingMessage::new(
        parley_common::CallId::new(),
        "alice",
        "carol",
        SignalPayload::Hangup,
    );
    send(&mut alice, &GatewayFrame::Signal(hangup.clone())).await;

    match recv(&mut alice).await {
        Some(GatewayFrame::Undeliverable {
            message_id,
            call_id,
            to_user_id,
        }) => {
            assert_eq!(message_id, hangup.id);
            assert_eq!(call_id, hangup.call_id);
            assert_eq!(to_user_id, "carol");
        }
        other => panic!("expected Undeliverable, got {:?}", other),
    }
}

#[tokio::test]
async fn test_spoofed_sender_is_refused() {
    let state = test_state(GatewayConfig::default()).await;
    let addr = spawn_gateway(state).await;
    let mut mallory = bind(addr, "mallory").await;
    let mut bob = bind(addr, "bob").await;

    let forged = SignalingMessage::new(
        parley_common::CallId::new(),
        "alice",
        "bob",
        SignalPayload::Hangup,
    );
    send(&mut mallory, &GatewayFrame::Signal(forged)).await;
    assert!(matches!(
        recv(&mut mallory).await,
        Some(GatewayFrame::Error { .. })
    ));

    let nothing = tokio::time::timeout(Duration::from_millis(200), bob.next()).await;
    assert!(nothing.is_err(), "bob must not receive the forged message");
}

#[tokio::test]
async fn test_signal_before_bind_is_refused() {
    let state = test_state(GatewayConfig::default()).await;
    let addr = spawn_gateway(state).await;
    let (mut socket, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

    let msg = SignalingMessage::new(
        parley_common::CallId::new(),
        "alice",
        "bob",
        SignalPayload::Accept,
    );
    send(&mut socket, &GatewayFrame::Signal(msg)).await;
    assert!(matches!(
        recv(&mut socket).await,
        Some(GatewayFrame::Error { .. })
    ));
    assert!(recv(&mut socket).await.is_none());
}

#[tokio::test]
async fn test_bind_timeout_closes_connection() {
    let state = test_state(GatewayConfig {
        bind_timeout: Duration::from_millis(200),
        ..GatewayConfig::default()
    })
    .await;
    let addr = spawn_gateway(state).await;
    let (mut socket, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

    match recv(&mut socket).await {
        Some(GatewayFrame::Error { message }) => assert_eq!(message, "Bind timeout"),
        other => panic!("expected bind timeout, got {:?}", other),
    }
    assert!(recv(&mut socket).await.is_none());
}

#[tokio::test]
async fn test_presence_follows_binding() {
    let state = test_state(GatewayConfig::default()).await;
    let addr = spawn_gateway(state.clone()).await;

    async fn online(state: &AppState, user: &str) -> bool {
        let response = router(state.clone())
            .oneshot(
                Request::get(format!("/v1/presence/{}", user))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let presence: PresenceResponse = serde_json::from_slice(&bytes).unwrap();
        presence.online
    }

    assert!(!online(&state, "alice").await);
    let alice = bind(addr, "alice").await;
    assert!(online(&state, "alice").await);

    drop(alice);
    let mut offline = false;
    for _ in 0..50 {
        if !online(&state, "alice").await {
            offline = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(offline, "presence should clear after disconnect");
}

async fn call_request(
    state: &AppState,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_call_routes() {
    let state = test_state(GatewayConfig::default()).await;

    let (status, created) = call_request(
        &state,
        "POST",
        "/v1/calls",
        Some(serde_json::json!({
            "caller_id": "alice",
            "receiver_id": "bob",
            "media_kind": "video"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let call: Call = serde_json::from_value(created).unwrap();
    assert_eq!(call.status, CallStatus::Ringing);

    let (status, fetched) = call_request(&state, "GET", &format!("/v1/calls/{}", call.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["receiver_id"], "bob");

    let (status, accepted) =
        call_request(&state, "POST", &format!("/v1/calls/{}/accept", call.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(accepted["status"], "accepted");

    let (status, connected) = call_request(
        &state,
        "POST",
        &format!("/v1/calls/{}/status", call.id),
        Some(serde_json::json!({ "status": "connected" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(connected["status"], "connected");

    let (status, error) =
        call_request(&state, "POST", &format!("/v1/calls/{}/reject", call.id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(error["error"].as_str().is_some());

    let (status, ended) =
        call_request(&state, "POST", &format!("/v1/calls/{}/end", call.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ended["status"], "ended");

    let (status, _) = call_request(
        &state,
        "GET",
        &format!("/v1/calls/{}", parley_common::CallId::new()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call_request(&state, "GET", "/v1/calls/not-a-call", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_call_validates_participants() {
    let state = test_state(GatewayConfig::default()).await;
    let (status, _) = call_request(
        &state,
        "POST",
        "/v1/calls",
        Some(serde_json::json!({
            "caller_id": "alice",
            "receiver_id": "alice",
            "media_kind": "audio"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call_request(
        &state,
        "POST",
        "/v1/calls",
        Some(serde_json::json!({
            "caller_id": "has space",
            "receiver_id": "bob",
            "media_kind": "audio"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
