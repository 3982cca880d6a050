//! Server configuration from environment variables.

use std::net::SocketAddr;

use storetalk_shared::Heartbeat;

pub const DEFAULT_HEARTBEAT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// When set, STOMP CONNECT and `/api/*` calls must carry this bearer token
    pub token: Option<String>,
    /// Heart-beat offer sent in CONNECTED
    pub heartbeat: Heartbeat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            token: None,
            heartbeat: Heartbeat::new(DEFAULT_HEARTBEAT_MS, DEFAULT_HEARTBEAT_MS),
        }
    }
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STORETALK_BIND`: listen address (default: "0.0.0.0:8080")
    /// - `STORETALK_TOKEN`: required bearer token (default: none, open access)
    /// - `STORETALK_HEARTBEAT_MS`: heart-beat interval both ways, 0 disables (default: 10000)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let bind = match std::env::var("STORETALK_BIND") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid STORETALK_BIND {:?}: {}", raw, e))?,
            Err(_) => defaults.bind,
        };

        let token = std::env::var("STORETALK_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());

        let heartbeat = match std::env::var("STORETALK_HEARTBEAT_MS") {
            Ok(raw) => {
                let ms: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid STORETALK_HEARTBEAT_MS {:?}: {}", raw, e))?;
                Heartbeat::new(ms, ms)
            }
            Err(_) => defaults.heartbeat,
        };

        Ok(Self {
            bind,
            token,
            heartbeat,
        })
    }

    /// Local test configuration: ephemeral port, no auth
    pub fn local() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Whether an `Authorization` header value carries the configured token
    pub fn accepts(&self, authorization: Option<&str>) -> bool {
        match &self.token {
            None => true,
            Some(expected) => authorization
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| t.trim() == expected)
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_server_accepts_anything() {
        assert!(ServerConfig::default().accepts(None));
    }

    #[test]
    fn token_must_match() {
        let config = ServerConfig::default().with_token("secret");
        assert!(config.accepts(Some("Bearer secret")));
        assert!(!config.accepts(Some("Bearer other")));
        assert!(!config.accepts(Some("secret")));
        assert!(!config.accepts(None));
    }
}
