//! # Configuration Management
//!
//! Centralized configuration for the relay node.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides (`BDN_RELAY_*`)
//!
//! ## Sections
//! - `server`: listen address, node identity, network number
//! - `connection`: handshake whitelist, keepalive, bad-message threshold, limits
//! - `tx_cache`: short-id TTL, content memory limit, confirmation depth
//! - `logging`: level and output format

use crate::error::{RelayError, Result};
use crate::protocol::message::MessageType;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;
use uuid::Uuid;

/// Current relay protocol version
pub const PROTOCOL_VERSION: u32 = 10;

/// Oldest protocol version a peer may announce in its hello
pub const MIN_PROTOCOL_VERSION: u32 = 4;

/// Network number that matches every network
pub const ALL_NETWORK_NUM: u32 = 0;

/// Default network number
pub const DEFAULT_NETWORK_NUM: u32 = 1;

/// Max allowed payload size (64 MB)
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Consecutive bad messages tolerated before a connection is closed
pub const MAX_BAD_MESSAGES: u32 = 3;

/// Interval between keepalive pings
pub const PING_INTERVAL: Duration = Duration::from_secs(60);

/// Time allowed for a pong reply
pub const PING_PONG_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Short-id assignment lifetime (3 days)
pub const SID_EXPIRE_TIME: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// Upper bound accepted for `sid_expire_time`
pub const MAX_SID_EXPIRE_TIME: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Transaction content cache limit per network (250 MB)
pub const DEFAULT_TX_CACHE_MEMORY_LIMIT_BYTES: usize = 250 * 1024 * 1024;

/// Blocks after which a transaction's short ids are retired
pub const DEFAULT_FINAL_TX_CONFIRMATIONS_COUNT: usize = 24;

/// Lower bound for the delay between expiration sweeps
pub const MIN_CLEAN_UP_EXPIRED_TXS_TASK_INTERVAL: Duration = Duration::from_secs(1);

/// Main relay configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RelayConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-connection protocol configuration
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Transaction cache configuration
    #[serde(default)]
    pub tx_cache: TxCacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| RelayError::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| RelayError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| RelayError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BDN_RELAY_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(network) = std::env::var("BDN_RELAY_NETWORK_NUM") {
            if let Ok(val) = network.parse::<u32>() {
                config.server.network_num = val;
            }
        }

        if let Ok(ping) = std::env::var("BDN_RELAY_PING_INTERVAL_MS") {
            if let Ok(val) = ping.parse::<u64>() {
                config.connection.ping_interval = Duration::from_millis(val);
            }
        }

        if let Ok(expire) = std::env::var("BDN_RELAY_SID_EXPIRE_TIME_MS") {
            if let Ok(val) = expire.parse::<u64>() {
                config.tx_cache.sid_expire_time = Duration::from_millis(val);
            }
        }

        if let Ok(limit) = std::env::var("BDN_RELAY_TX_CACHE_MEMORY_LIMIT_BYTES") {
            if let Ok(val) = limit.parse::<usize>() {
                config.tx_cache.memory_limit_bytes = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| RelayError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| RelayError::Config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.connection.validate());
        errors.extend(self.tx_cache.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RelayError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:1809")
    pub address: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Blockchain network served by this node
    pub network_num: u32,

    /// Node identifier announced in hello messages; random when absent
    #[serde(default)]
    pub node_id: Option<Uuid>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:1809"),
            max_connections: 1000,
            network_num: DEFAULT_NETWORK_NUM,
            node_id: None,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:1809')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        errors
    }
}

/// Per-connection protocol configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Message types accepted before the handshake completes
    pub handshake_message_types: Vec<MessageType>,

    /// Interval between keepalive pings once established
    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,

    /// Time a ping may go unanswered before the connection is closed
    #[serde(with = "duration_serde")]
    pub pong_timeout: Duration,

    /// Consecutive bad messages that close the connection
    pub max_bad_messages: u32,

    /// Largest payload length accepted in a header
    pub max_payload_size: usize,

    /// Bytes handed to the socket before further output waits in the buffer
    pub outbound_high_water: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_message_types: vec![MessageType::Hello, MessageType::Ack],
            ping_interval: PING_INTERVAL,
            pong_timeout: PING_PONG_REPLY_TIMEOUT,
            max_bad_messages: MAX_BAD_MESSAGES,
            max_payload_size: MAX_PAYLOAD_SIZE,
            outbound_high_water: 8 * 1024 * 1024,
        }
    }
}

impl ConnectionConfig {
    /// Validate connection configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !self.handshake_message_types.contains(&MessageType::Hello) {
            errors.push("Handshake message types must include hello".to_string());
        }

        if self.ping_interval.as_millis() < 100 {
            errors.push("Ping interval too short (minimum: 100ms)".to_string());
        } else if self.ping_interval.as_secs() > 3600 {
            errors.push("Ping interval too long (maximum: 1 hour)".to_string());
        }

        if self.pong_timeout.as_millis() < 100 {
            errors.push("Pong timeout too short (minimum: 100ms)".to_string());
        } else if self.pong_timeout >= self.ping_interval {
            errors.push("Pong timeout must be shorter than the ping interval".to_string());
        }

        if self.max_bad_messages == 0 {
            errors.push("Max bad messages must be greater than 0".to_string());
        }

        if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > u32::MAX as usize {
            errors.push(format!(
                "Max payload size too large: {} bytes (header length field is 32 bits)",
                self.max_payload_size
            ));
        }

        if self.outbound_high_water == 0 {
            errors.push("Outbound high water mark must be greater than 0".to_string());
        }

        errors
    }
}

/// Transaction cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TxCacheConfig {
    /// Lifetime of a short-id assignment
    #[serde(with = "duration_serde")]
    pub sid_expire_time: Duration,

    /// Limit on the total size of cached transaction contents
    pub memory_limit_bytes: usize,

    /// Number of tracked blocks after which short ids are retired
    pub final_tx_confirmations_count: usize,

    /// Lower bound for the delay between expiration sweeps
    #[serde(with = "duration_serde")]
    pub min_cleanup_interval: Duration,
}

impl Default for TxCacheConfig {
    fn default() -> Self {
        Self {
            sid_expire_time: SID_EXPIRE_TIME,
            memory_limit_bytes: DEFAULT_TX_CACHE_MEMORY_LIMIT_BYTES,
            final_tx_confirmations_count: DEFAULT_FINAL_TX_CONFIRMATIONS_COUNT,
            min_cleanup_interval: MIN_CLEAN_UP_EXPIRED_TXS_TASK_INTERVAL,
        }
    }
}

impl TxCacheConfig {
    /// Validate transaction cache configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.sid_expire_time.is_zero() {
            errors.push("Short id expire time must be greater than 0".to_string());
        } else if self.sid_expire_time > MAX_SID_EXPIRE_TIME {
            errors.push("Short id expire time too long (maximum: 30 days)".to_string());
        }

        if self.memory_limit_bytes == 0 {
            errors.push("Transaction cache memory limit must be greater than 0".to_string());
        }

        if self.final_tx_confirmations_count == 0 {
            errors.push("Final transaction confirmations count must be greater than 0".to_string());
        }

        if self.min_cleanup_interval > self.sid_expire_time {
            errors.push("Minimum cleanup interval cannot exceed short id expire time".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("bdn-relay"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
