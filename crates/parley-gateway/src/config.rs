use std::net::SocketAddr;
use std::time::Duration;

use parley_common::helpers::{env_bool, env_parse};

/// Gateway settings, read from `PARLEY_*` variables (and `.env`).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub database_url: String,
    pub allow_public_bind: bool,
    pub max_connections: usize,
    /// Frames per connection per minute.
    pub max_messages_per_minute: u32,
    /// Signaling log entries older than this are purged.
    pub signal_retention: Duration,
    pub purge_interval: Duration,
    pub bind_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            database_url: "sqlite:parley-gateway.db".to_string(),
            allow_public_bind: false,
            max_connections: 4096,
            max_messages_per_minute: 600,
            signal_retention: Duration::from_secs(600),
            purge_interval: Duration::from_secs(60),
            bind_timeout: Duration::from_secs(10),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("PARLEY_GATEWAY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            allow_public_bind: env_bool("PARLEY_ALLOW_PUBLIC_BIND", defaults.allow_public_bind),
            max_connections: env_parse("PARLEY_WS_MAX_CONNECTIONS", defaults.max_connections),
            max_messages_per_minute: env_parse(
                "PARLEY_WS_MAX_MESSAGES_PER_MINUTE",
                defaults.max_messages_per_minute,
            ),
            signal_retention: Duration::from_secs(
                env_parse(
                    "PARLEY_SIGNAL_RETENTION_SECS",
                    defaults.signal_retention.as_secs(),
                )
                .max(30),
            ),
            purge_interval: defaults.purge_interval,
            bind_timeout: defaults.bind_timeout,
        }
    }

    pub fn check_public_bind_allowed(&self, addr: SocketAddr) -> anyhow::Result<()> {
        if addr.ip().is_loopback() || self.allow_public_bind {
            return Ok(());
        }
        Err(anyhow::anyhow!(
            "refusing non-loopback bind without PARLEY_ALLOW_PUBLIC_BIND=1"
        ))
    }
}
