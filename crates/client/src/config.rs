//! Client configuration from environment variables.

use std::time::Duration;

use storetalk_shared::Heartbeat;

use crate::ws::ReconnectConfig;

pub const DEFAULT_BROKER_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_MS: u64 = 10_000;

/// Settings for the transport session and the REST client.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// WebSocket endpoint of the STOMP broker
    pub broker_url: String,
    /// Base URL of the REST room directory
    pub api_url: String,
    /// Bearer token sent with the STOMP CONNECT frame and REST calls
    pub token: Option<String>,
    /// Upper bound on the socket + STOMP handshake
    pub connect_timeout: Duration,
    /// Heart-beat offer sent in CONNECT
    pub heartbeat: Heartbeat,
    /// Transport-level retry after an established connection drops
    pub reconnect: ReconnectConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat: Heartbeat::new(DEFAULT_HEARTBEAT_MS, DEFAULT_HEARTBEAT_MS),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ChatConfig {
    /// Build configuration from the environment.
    ///
    /// Environment variables:
    /// - `STORETALK_BROKER_URL`: broker WebSocket URL (default: "ws://127.0.0.1:8080/ws")
    /// - `STORETALK_API_URL`: REST base URL (default: "http://127.0.0.1:8080")
    /// - `STORETALK_TOKEN`: bearer token (default: none)
    /// - `STORETALK_CONNECT_TIMEOUT_MS`: handshake bound (default: 10000)
    /// - `STORETALK_HEARTBEAT_MS`: heart-beat interval both ways, 0 disables (default: 10000)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let broker_url =
            std::env::var("STORETALK_BROKER_URL").unwrap_or(defaults.broker_url);
        let api_url = std::env::var("STORETALK_API_URL").unwrap_or(defaults.api_url);
        let token = std::env::var("STORETALK_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());

        let connect_timeout = env_u64("STORETALK_CONNECT_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.connect_timeout);

        let heartbeat = env_u64("STORETALK_HEARTBEAT_MS")
            .map(|ms| Heartbeat::new(ms, ms))
            .unwrap_or(defaults.heartbeat);

        Self {
            broker_url,
            api_url,
            token,
            connect_timeout,
            heartbeat,
            reconnect: defaults.reconnect,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            crate::log_warn!("ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}
