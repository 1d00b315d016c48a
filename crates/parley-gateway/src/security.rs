use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, OnceLock},
    time::{Duration, Instant},
};

use axum::http::HeaderValue;
use parley_common::helpers::{env_bool, env_parse, split_list};

const DEFAULT_ALLOWED_ORIGINS: [&str; 4] = [
    "http://localhost:3000",
    "http://127.0.0.1:3000",
    "http://localhost:5173",
    "http://127.0.0.1:5173",
];

#[derive(Clone, Copy)]
struct RateEntry {
    count: u32,
    window_start: Instant,
}

pub struct FixedWindowRateLimiter {
    max_requests: u32,
    window: Duration,
    max_keys: usize,
    entries: Mutex<HashMap<String, RateEntry>>,
}

impl FixedWindowRateLimiter {
    pub fn new(max_requests: u32, window: Duration, max_keys: usize) -> Self {
        Self {
            max_requests,
            window,
            max_keys,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut guard = match self.entries.lock() {
            Ok(v) => v,
            Err(_) => return false,
        };

        if guard.len() > self.max_keys {
            guard.retain(|_, entry| now.duration_since(entry.window_start) < self.window);
            if guard.len() > self.max_keys {
                return false;
            }
        }

        let entry = guard.entry(key.to_string()).or_insert(RateEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count = entry.count.saturating_add(1);
        entry.count <= self.max_requests
    }
}

static WS_BIND_LIMITER: OnceLock<FixedWindowRateLimiter> = OnceLock::new();
static ALLOWED_ORIGINS: OnceLock<HashSet<String>> = OnceLock::new();

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn load_allowed_origins() -> HashSet<String> {
    let configured = std::env::var("PARLEY_ALLOWED_ORIGINS").unwrap_or_default();
    let set: HashSet<String> = split_list(&configured)
        .iter()
        .map(|v| normalize_origin(v))
        .filter(|v| !v.is_empty())
        .collect();
    if set.is_empty() {
        return DEFAULT_ALLOWED_ORIGINS
            .iter()
            .map(|v| normalize_origin(v))
            .collect();
    }
    set
}

pub fn cors_allow_any() -> bool {
    env_bool("PARLEY_CORS_ALLOW_ANY", false)
}

pub fn cors_origin_values() -> Vec<HeaderValue> {
    let set = ALLOWED_ORIGINS.get_or_init(load_allowed_origins);
    set.iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect()
}

/// Native clients send no `Origin`; browsers must come from an allowed one.
pub fn ws_origin_allowed(origin: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return !env_bool("PARLEY_WS_REQUIRE_ORIGIN", false);
    };
    if cors_allow_any() {
        return true;
    }
    let set = ALLOWED_ORIGINS.get_or_init(load_allowed_origins);
    set.contains(&normalize_origin(origin))
}

pub fn allow_ws_bind_request(key: &str) -> bool {
    WS_BIND_LIMITER
        .get_or_init(|| {
            FixedWindowRateLimiter::new(
                env_parse("PARLEY_WS_BIND_RATE_LIMIT", 30),
                Duration::from_secs(env_parse("PARLEY_WS_BIND_RATE_WINDOW_SECS", 60u64).max(1)),
                env_parse("PARLEY_WS_BIND_RATE_MAX_KEYS", 50_000),
            )
        })
        .allow(key)
}

pub fn is_valid_user_id(user_id: &str) -> bool {
    let len = user_id.len();
    if !(1..=64).contains(&len) {
        return false;
    }
    user_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_window() {
        let limiter = FixedWindowRateLimiter::new(2, Duration::from_secs(60), 10);
        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
    }

    #[test]
    fn test_rate_limiter_key_cap() {
        let limiter = FixedWindowRateLimiter::new(5, Duration::from_secs(60), 1);
        assert!(limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert!(!limiter.allow("c"));
    }

    #[test]
    fn test_user_id_validation() {
        assert!(is_valid_user_id("alice"));
        assert!(is_valid_user_id("bob.smith@example.org"));
        assert!(!is_valid_user_id(""));
        assert!(!is_valid_user_id("has space"));
        assert!(!is_valid_user_id(&"x".repeat(65)));
    }

    #[test]
    fn test_origin_normalization() {
        assert_eq!(
            normalize_origin(" HTTP://Localhost:3000/ "),
            "http://localhost:3000"
        );
    }
}
