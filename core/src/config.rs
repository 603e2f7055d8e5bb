//! Client configuration.
//!
//! Defaults match the development backend. Hosts can deserialize a
//! `ClientConfig` from JSON (missing fields fall back to defaults) and
//! layer environment overrides on top with `from_env`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_BASE_URL: &str = "http://localhost:5001";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_LOGIN_ROUTE: &str = "/pages/login/login";
pub const DEFAULT_REALTIME_PATH: &str = "/ws";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub login_route: String,
    pub token_key: String,
    pub user_info_key: String,
    pub realtime_path: String,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            login_route: DEFAULT_LOGIN_ROUTE.to_string(),
            token_key: "token".to_string(),
            user_info_key: "userInfo".to_string(),
            realtime_path: DEFAULT_REALTIME_PATH.to_string(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `SWORDEDGE_BASE_URL`, `SWORDEDGE_TIMEOUT_MS`
    /// and `SWORDEDGE_REALTIME_PATH`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(base_url) = lookup("SWORDEDGE_BASE_URL") {
            if !is_absolute(&base_url) {
                return Err(ConfigError::InvalidBaseUrl(base_url));
            }
            self.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(raw) = lookup("SWORDEDGE_TIMEOUT_MS") {
            self.timeout_ms = match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => ms,
                _ => {
                    return Err(ConfigError::InvalidNumber {
                        key: "SWORDEDGE_TIMEOUT_MS".to_string(),
                        value: raw,
                    })
                }
            };
        }
        if let Some(path) = lookup("SWORDEDGE_REALTIME_PATH") {
            self.realtime_path = path;
        }
        Ok(self)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Resolve `url` against the base endpoint unless it is already absolute.
    pub fn resolve_url(&self, url: &str) -> String {
        if is_absolute(url) {
            return url.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        if url.starts_with('/') {
            format!("{base}{url}")
        } else {
            format!("{base}/{url}")
        }
    }

    /// WebSocket endpoint on the same origin as the HTTP base.
    pub fn realtime_endpoint(&self) -> String {
        let http = self.resolve_url(&self.realtime_path);
        if let Some(rest) = http.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = http.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            http
        }
    }
}

fn is_absolute(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn relative_urls_resolve_against_base() {
        let config = ClientConfig::new("http://localhost:5001/");
        assert_eq!(config.resolve_url("/api/login"), "http://localhost:5001/api/login");
        assert_eq!(config.resolve_url("api/login"), "http://localhost:5001/api/login");
        assert_eq!(
            config.resolve_url("https://cdn.example.com/a.mp4"),
            "https://cdn.example.com/a.mp4"
        );
    }

    #[test]
    fn realtime_endpoint_switches_scheme() {
        assert_eq!(ClientConfig::default().realtime_endpoint(), "ws://localhost:5001/ws");
        let secure = ClientConfig::new("https://api.swordedge.com");
        assert_eq!(secure.realtime_endpoint(), "wss://api.swordedge.com/ws");
    }

    #[test]
    fn overrides_apply() {
        let config = ClientConfig::default()
            .with_overrides(lookup(&[
                ("SWORDEDGE_BASE_URL", "https://api.swordedge.com/"),
                ("SWORDEDGE_TIMEOUT_MS", "5000"),
            ]))
            .unwrap();
        assert_eq!(config.base_url, "https://api.swordedge.com");
        assert_eq!(config.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn bad_overrides_are_rejected() {
        let err = ClientConfig::default()
            .with_overrides(lookup(&[("SWORDEDGE_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { .. }));

        let err = ClientConfig::default()
            .with_overrides(lookup(&[("SWORDEDGE_BASE_URL", "localhost:5001")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBaseUrl(_)));
    }

    #[test]
    fn deserializes_partial_json() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"base_url":"http://10.0.0.2:5001","timeout_ms":1000}"#).unwrap();
        assert_eq!(config.base_url, "http://10.0.0.2:5001");
        assert_eq!(config.timeout_ms, 1000);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.token_key, "token");
    }
}
