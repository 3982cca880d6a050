//! Connection state, reconnect policy and session errors.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// Connection state of the transport session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// An established connection dropped and the transport is retrying
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }
}

/// Errors surfaced by the transport session.
///
/// Cloneable because every caller joined on one connect attempt receives
/// the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("connection timed out after {0:?}")]
    ConnectionTimeout(Duration),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("not connected")]
    NotConnected,
    #[error("message has no content")]
    EmptyMessage,
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("session closed")]
    Closed,
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 1.5,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> u32 {
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(attempt as i32);
        (delay as u32).min(self.max_delay_ms)
    }

    /// Backoff delay with up to 25% random reduction, so clients dropped
    /// together do not reconnect in lockstep.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt) as u64;
        let spread = base / 4;
        let cut = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        Duration::from_millis(base - cut)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for_attempt(0), 1000);
        assert_eq!(config.delay_for_attempt(1), 1500);
        assert_eq!(config.delay_for_attempt(20), 30000);
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let config = ReconnectConfig::default();
        for _ in 0..50 {
            let delay = config.jittered_delay(2).as_millis() as u64;
            assert!((1687..=2250).contains(&delay), "delay {delay}");
        }
    }

    #[test]
    fn zero_attempts_means_unbounded() {
        let config = ReconnectConfig {
            max_attempts: 0,
            ..ReconnectConfig::default()
        };
        assert!(!config.exhausted(1_000));
        assert!(ReconnectConfig::default().exhausted(10));
    }
}
