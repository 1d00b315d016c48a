use std::time::Duration;

use parley_common::helpers::{env_bool, env_duration_ms, env_duration_secs, split_list};
use parley_media::ProviderConfig;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Tunables of the call controller and negotiation engine.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Upper bound on one device open.
    pub device_timeout: Duration,
    /// How long a renegotiation may take to settle before the feature is dropped.
    pub renegotiation_window: Duration,
    /// First retry delay while waiting for a stable signaling state.
    pub renegotiation_backoff: Duration,
    /// Cap on the exponential retry delay.
    pub renegotiation_backoff_max: Duration,
    /// Unanswered calls end after this long.
    pub ring_timeout: Duration,
    /// Fail `place_call` with `NoLocalMedia` when no track could be opened.
    pub require_media: bool,
    /// Add a silent audio track when no device could be opened.
    pub silent_audio_fallback: bool,
    pub ice_servers: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            device_timeout: Duration::from_secs(5),
            renegotiation_window: Duration::from_secs(2),
            renegotiation_backoff: Duration::from_millis(50),
            renegotiation_backoff_max: Duration::from_millis(400),
            ring_timeout: Duration::from_secs(45),
            require_media: false,
            silent_audio_fallback: false,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl CallConfig {
    /// Defaults overridden by `PARLEY_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ice_servers = std::env::var("PARLEY_ICE_SERVERS")
            .ok()
            .map(|v| split_list(&v))
            .filter(|servers| !servers.is_empty())
            .unwrap_or(defaults.ice_servers);

        Self {
            device_timeout: env_duration_ms("PARLEY_DEVICE_TIMEOUT_MS", defaults.device_timeout),
            renegotiation_window: env_duration_ms(
                "PARLEY_RENEGOTIATION_WINDOW_MS",
                defaults.renegotiation_window,
            ),
            renegotiation_backoff: env_duration_ms(
                "PARLEY_RENEGOTIATION_BACKOFF_MS",
                defaults.renegotiation_backoff,
            ),
            renegotiation_backoff_max: defaults.renegotiation_backoff_max,
            ring_timeout: env_duration_secs("PARLEY_RING_TIMEOUT_SECS", defaults.ring_timeout),
            require_media: env_bool("PARLEY_REQUIRE_MEDIA", defaults.require_media),
            silent_audio_fallback: env_bool(
                "PARLEY_SILENT_AUDIO_FALLBACK",
                defaults.silent_audio_fallback,
            ),
            ice_servers,
        }
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            device_timeout: self.device_timeout,
            silent_audio_fallback: self.silent_audio_fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.renegotiation_window, Duration::from_secs(2));
        assert!(!config.require_media);
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
    }

    #[test]
    fn test_provider_config_follows() {
        let config = CallConfig {
            silent_audio_fallback: true,
            device_timeout: Duration::from_millis(250),
            ..CallConfig::default()
        };
        let provider = config.provider_config();
        assert!(provider.silent_audio_fallback);
        assert_eq!(provider.device_timeout, Duration::from_millis(250));
    }
}
