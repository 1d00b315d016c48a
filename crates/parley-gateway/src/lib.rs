//! Parley signaling gateway: relays signaling between bound users over
//! WebSocket and owns the durable call records.

pub mod config;
pub mod db;
pub mod relay;
pub mod rpc;
pub mod security;
pub mod store;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::GatewayConfig;
pub use relay::ConnectionMap;
pub use store::SqliteCallStore;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub store: Arc<SqliteCallStore>,
    pub connections: ConnectionMap,
    pub active: Arc<AtomicUsize>,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: GatewayConfig) -> Self {
        Self {
            store: Arc::new(SqliteCallStore::new(pool.clone())),
            pool,
            connections: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(AtomicUsize::new(0)),
            config: Arc::new(config),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

impl axum::extract::FromRef<AppState> for SqlitePool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl axum::extract::FromRef<AppState> for ConnectionMap {
    fn from_ref(state: &AppState) -> Self {
        state.connections.clone()
    }
}

/// Open (creating if needed) the gateway database and make sure the schema
/// exists.
pub async fn connect_database(database_url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    // Each in-memory connection is its own database.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    db::init_schema(&pool).await?;
    Ok(pool)
}

pub fn spawn_signal_purge(pool: SqlitePool, retention: Duration, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let cutoff = chrono::Utc::now()
                - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::minutes(10));
            match db::purge_signals(&pool, cutoff).await {
                Ok(count) if count > 0 => tracing::info!("purged {} signaling log entries", count),
                Ok(_) => {}
                Err(err) => tracing::warn!("failed to purge signaling log: {}", err),
            }
        }
    })
}

fn build_cors_layer() -> CorsLayer {
    let allow_origin = if security::cors_allow_any() {
        AllowOrigin::any()
    } else {
        let origins = security::cors_origin_values();
        if origins.is_empty() {
            tracing::warn!(
                "no valid CORS origins configured; cross-origin browser access will be blocked"
            );
        }
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Parley Gateway Online" }))
        .route("/health", get(rpc::health))
        .route("/v1/calls", post(rpc::create_call))
        .route("/v1/calls/:id", get(rpc::get_call))
        .route("/v1/calls/:id/accept", post(rpc::accept_call))
        .route("/v1/calls/:id/reject", post(rpc::reject_call))
        .route("/v1/calls/:id/end", post(rpc::end_call))
        .route("/v1/calls/:id/status", post(rpc::update_status))
        .route("/v1/presence/:user_id", get(rpc::presence))
        .route("/ws", get(relay::ws_handler))
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `ws://` URL clients should dial for a listener bound to `bound_addr`.
pub fn ws_signaling_url_for_bound_addr(bound_addr: std::net::SocketAddr) -> String {
    let host = if bound_addr.ip().is_unspecified() {
        "127.0.0.1".to_string()
    } else {
        bound_addr.ip().to_string()
    };
    format!("ws://{}:{}/ws", host, bound_addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_for_unspecified_addr() {
        assert_eq!(
            ws_signaling_url_for_bound_addr("0.0.0.0:4000".parse().unwrap()),
            "ws://127.0.0.1:4000/ws"
        );
        assert_eq!(
            ws_signaling_url_for_bound_addr("10.0.0.2:3000".parse().unwrap()),
            "ws://10.0.0.2:3000/ws"
        );
    }
}
