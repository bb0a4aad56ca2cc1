//! Configuration for the endpoint, its connections and logging
//!
//! Values are layered: defaults, then an optional file (format picked from
//! the extension), then `QUICMUX_` environment variables with `__` between
//! section and key, e.g. `QUICMUX_CONNECTION__DRAINING_PERIOD_MS=1000`.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::connection_id::{MAX_CONNECTION_ID_LENGTH, StatelessResetKey};
use crate::error::{QuicError, Result};

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "QUICMUX";

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuicConfig {
    pub endpoint: EndpointConfig,
    pub connection: ConnectionConfig,
    pub logging: LoggingConfig,
}

/// Socket-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub bind_address: SocketAddr,
    /// Length of locally generated connection IDs
    pub connection_id_length: usize,
    /// Handshaking connections not yet accepted before new Initials are dropped
    pub max_pending_connections: usize,
    /// Check the token of every client Initial
    pub require_address_validation: bool,
    /// How long a retired connection ID keeps routing, in milliseconds
    pub retired_connection_id_delay_ms: u64,
    /// Hex encoded 32 byte key. A random key is used when absent, which
    /// makes resets after a restart unverifiable by peers.
    pub stateless_reset_key: Option<String>,
    /// Capacity of the queue in front of the socket writer
    pub outbound_queue_depth: usize,
    pub retirement_sweep_interval_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 4433)),
            connection_id_length: 8,
            max_pending_connections: 128,
            require_address_validation: false,
            retired_connection_id_delay_ms: 5_000,
            stateless_reset_key: None,
            outbound_queue_depth: 1024,
            retirement_sweep_interval_ms: 250,
        }
    }
}

/// Per-connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub handshake_timeout_ms: u64,
    pub max_idle_timeout_ms: u64,
    /// Time spent draining after a close before the connection is destroyed
    pub draining_period_ms: u64,
    /// Connection IDs the peer may hold active at once
    pub active_connection_id_limit: usize,
    /// Inbound packets buffered per connection, overflow is dropped
    pub max_queued_packets: usize,
    pub allow_early_data: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            max_idle_timeout_ms: 30_000,
            draining_period_ms: 3_000,
            active_connection_id_limit: 4,
            max_queued_packets: 256,
            allow_early_data: true,
        }
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.max_idle_timeout_ms)
    }

    pub fn draining_period(&self) -> Duration {
        Duration::from_millis(self.draining_period_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Compact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl QuicConfig {
    /// Load defaults, then `path` if given, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let endpoint = &self.endpoint;
        if endpoint.connection_id_length == 0 || endpoint.connection_id_length > MAX_CONNECTION_ID_LENGTH {
            return Err(QuicError::Config(format!(
                "connection_id_length must be between 1 and {}",
                MAX_CONNECTION_ID_LENGTH
            )));
        }
        if endpoint.outbound_queue_depth == 0 {
            return Err(QuicError::Config("outbound_queue_depth must be greater than 0".to_string()));
        }
        if endpoint.retirement_sweep_interval_ms == 0 {
            return Err(QuicError::Config(
                "retirement_sweep_interval_ms must be greater than 0".to_string(),
            ));
        }
        if let Some(key) = &endpoint.stateless_reset_key {
            StatelessResetKey::from_hex(key)?;
        }

        let connection = &self.connection;
        if connection.handshake_timeout_ms == 0 {
            return Err(QuicError::Config("handshake_timeout_ms must be greater than 0".to_string()));
        }
        if connection.max_idle_timeout_ms == 0 {
            return Err(QuicError::Config("max_idle_timeout_ms must be greater than 0".to_string()));
        }
        if connection.draining_period_ms == 0 {
            return Err(QuicError::Config("draining_period_ms must be greater than 0".to_string()));
        }
        // RFC 9000 Section 18.2
        if connection.active_connection_id_limit < 2 {
            return Err(QuicError::Config("active_connection_id_limit must be at least 2".to_string()));
        }
        if connection.max_queued_packets == 0 {
            return Err(QuicError::Config("max_queued_packets must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn retired_connection_id_delay(&self) -> Duration {
        Duration::from_millis(self.endpoint.retired_connection_id_delay_ms)
    }

    pub fn retirement_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.endpoint.retirement_sweep_interval_ms)
    }

    /// Configured reset key, or a fresh random one
    pub fn stateless_reset_key(&self) -> Result<StatelessResetKey> {
        match &self.endpoint.stateless_reset_key {
            Some(key) => StatelessResetKey::from_hex(key),
            None => Ok(StatelessResetKey::generate()),
        }
    }

    /// Get tracing level
    pub fn tracing_level(&self) -> Level {
        match self.logging.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = QuicConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.draining_period(), Duration::from_secs(3));
        assert_eq!(config.retired_connection_id_delay(), Duration::from_secs(5));
        assert_eq!(config.tracing_level(), Level::INFO);
    }

    #[test]
    fn test_config_validation() {
        let mut config = QuicConfig::default();
        config.connection.draining_period_ms = 0;
        assert!(config.validate().is_err());

        let mut config = QuicConfig::default();
        config.endpoint.connection_id_length = 21;
        assert!(config.validate().is_err());

        let mut config = QuicConfig::default();
        config.connection.active_connection_id_limit = 1;
        assert!(config.validate().is_err());

        let mut config = QuicConfig::default();
        config.endpoint.stateless_reset_key = Some("00ff".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let path = std::env::temp_dir().join(format!("quicmux-test-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[connection]\ndraining_period_ms = 1500\n\n[logging]\nlevel = \"debug\"").unwrap();
        drop(file);

        let config = QuicConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.connection.draining_period_ms, 1500);
        assert_eq!(config.connection.handshake_timeout_ms, 10_000);
        assert_eq!(config.endpoint, EndpointConfig::default());
        assert_eq!(config.tracing_level(), Level::DEBUG);
    }

    #[test]
    fn test_configured_reset_key_is_used() {
        let mut config = QuicConfig::default();
        config.endpoint.stateless_reset_key = Some("11".repeat(32));
        let id = crate::connection_id::ConnectionId::from_slice(&[1, 2, 3]).unwrap();
        assert_eq!(
            config.stateless_reset_key().unwrap().token_for(&id),
            StatelessResetKey::new([0x11; 32]).token_for(&id)
        );
    }
}
