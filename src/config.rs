use std::time::Duration;

use config::{Config, ConfigError};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::networking::frame::MIN_PAYLOAD_LENGTH;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 128;
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 256 * 1024;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 4096;
pub const DEFAULT_WRITE_QUEUE_SIZE: usize = 32;

/// Configuration for the connection pool: listener, limits, timeouts and
/// queue capacities. Read from the `network` table of the settings file.
///
/// ```toml
/// [network]
/// address = "0.0.0.0"
/// port = 6000
/// max_connections = 128
/// write_queue_size = 32
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub address: String,
    pub port: u16,
    pub max_connections: usize,
    /// Upper bound for a single frame payload (message id + body).
    pub max_message_length: usize,
    pub dial_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Capacity of the data and disconnect event queues.
    pub event_channel_size: usize,
    /// Capacity of each connection's outbound queue.
    pub write_queue_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            address: String::from(DEFAULT_ADDRESS),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            dial_timeout_ms: DEFAULT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_TIMEOUT_MS,
            event_channel_size: DEFAULT_EVENT_CHANNEL_SIZE,
            write_queue_size: DEFAULT_WRITE_QUEUE_SIZE,
        }
    }
}

impl PoolConfig {
    /// Loads the `network` table, falling back to defaults when the table is
    /// missing entirely.
    pub fn from_settings(settings: &Config) -> Result<PoolConfig, ConfigError> {
        match settings.get::<PoolConfig>("network") {
            Ok(pool_config) => Ok(pool_config),
            Err(ConfigError::NotFound(_)) => Ok(PoolConfig::default()),
            Err(err) => Err(err),
        }
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.max_message_length < MIN_PAYLOAD_LENGTH
            || self.max_message_length > u32::MAX as usize
        {
            return Err(TransportError::InvalidConfig(format!(
                "max_message_length {} must be within [{}, {}]",
                self.max_message_length,
                MIN_PAYLOAD_LENGTH,
                u32::MAX
            )));
        }
        if self.event_channel_size == 0 {
            return Err(TransportError::InvalidConfig(String::from(
                "event_channel_size must be non-zero",
            )));
        }
        if self.write_queue_size == 0 {
            return Err(TransportError::InvalidConfig(String::from(
                "write_queue_size must be non-zero",
            )));
        }
        Ok(())
    }
}
