use std::io::ErrorKind;
use std::net::SocketAddr;

use parley_gateway::{
    connect_database, router, spawn_signal_purge, ws_signaling_url_for_bound_addr, AppState,
    GatewayConfig,
};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "parley_gateway=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenv::dotenv().ok();

    let config = GatewayConfig::from_env();
    let pool = connect_database(&config.database_url).await?;
    tracing::info!("connected to gateway database");

    spawn_signal_purge(pool.clone(), config.signal_retention, config.purge_interval);

    let addr: SocketAddr = config.bind_addr.parse()?;
    config.check_public_bind_allowed(addr)?;

    let app = router(AppState::new(pool, config));

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == ErrorKind::AddrInUse => {
            let fallback_addr = SocketAddr::new(addr.ip(), 0);
            tracing::warn!(
                "gateway bind {} is already in use, falling back to {}",
                addr,
                fallback_addr
            );
            TcpListener::bind(fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };
    let bound_addr = listener.local_addr()?;
    tracing::info!("gateway listening on {}", bound_addr);
    tracing::info!(
        "gateway signaling url {}",
        ws_signaling_url_for_bound_addr(bound_addr)
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
