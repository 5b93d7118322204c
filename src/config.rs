use std::time::Duration;

/// Engine and messaging configuration for the server side.
///
/// Defaults mirror the values advertised in the OPEN handshake:
/// 25s ping interval, 20s ping timeout, 1 MB max payload.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// URL prefix the handshake endpoint is mounted under.
    pub path: String,
    /// Interval between server-initiated PINGs.
    pub ping_interval: Duration,
    /// How long to wait for a PONG before declaring the peer dead.
    pub ping_timeout: Duration,
    /// Upper bound for one polling batch and one accepted POST body, bytes.
    pub max_payload: usize,
    /// Deadline for a session to complete its first namespace CONNECT.
    pub connect_timeout: Duration,
    /// Default timeout applied by broadcast-with-ack when none is given.
    pub ack_timeout: Duration,
    /// How long a graceful shutdown keeps flushing before dropping writes.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            path: "/socket.io/".to_string(),
            ping_interval: Duration::from_millis(25_000),
            ping_timeout: Duration::from_millis(20_000),
            max_payload: 1_000_000,
            connect_timeout: Duration::from_secs(45),
            ack_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the environment, falling back to defaults
    /// for anything unset or unparsable.
    ///
    /// Recognized variables: `SOCKETIO_PATH`, `SOCKETIO_PING_INTERVAL_MS`,
    /// `SOCKETIO_PING_TIMEOUT_MS`, `SOCKETIO_MAX_PAYLOAD`,
    /// `SOCKETIO_CONNECT_TIMEOUT_MS`, `SOCKETIO_ACK_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        Self {
            path: std::env::var("SOCKETIO_PATH").unwrap_or(defaults.path),
            ping_interval: env_ms("SOCKETIO_PING_INTERVAL_MS", defaults.ping_interval),
            ping_timeout: env_ms("SOCKETIO_PING_TIMEOUT_MS", defaults.ping_timeout),
            max_payload: env_num("SOCKETIO_MAX_PAYLOAD", defaults.max_payload),
            connect_timeout: env_ms("SOCKETIO_CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            ack_timeout: env_ms("SOCKETIO_ACK_TIMEOUT_MS", defaults.ack_timeout),
            shutdown_grace: defaults.shutdown_grace,
        }
    }

    pub fn ping_interval_ms(&self) -> u64 {
        self.ping_interval.as_millis() as u64
    }

    pub fn ping_timeout_ms(&self) -> u64 {
        self.ping_timeout.as_millis() as u64
    }
}

/// Reconnection policy for the client-side [`Manager`].
///
/// The delay before attempt `n` is `base * 2^n`, capped at `delay_max`,
/// then spread by `randomization_factor` in both directions.
///
/// [`Manager`]: crate::manager::Manager
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Whether to reconnect at all after an unexpected close.
    pub enabled: bool,
    /// Attempt cap; 0 means unlimited.
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub delay: Duration,
    /// Ceiling for the exponential backoff.
    pub delay_max: Duration,
    /// Jitter spread, 0.0..=1.0.
    pub randomization_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 0,
            delay: Duration::from_millis(1_000),
            delay_max: Duration::from_millis(5_000),
            randomization_factor: 0.5,
        }
    }
}

fn env_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_num(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_handshake_advertisement() {
        let config = ServerConfig::default();
        assert_eq!(config.ping_interval_ms(), 25_000);
        assert_eq!(config.ping_timeout_ms(), 20_000);
        assert_eq!(config.max_payload, 1_000_000);
        assert_eq!(config.path, "/socket.io/");
    }

    #[test]
    fn backoff_defaults() {
        let config = ReconnectConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_attempts, 0);
        assert!(config.delay < config.delay_max);
    }
}
