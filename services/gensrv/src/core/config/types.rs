//! Configuration types

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::register_map::RegisterMap;

/// Default status API port
pub const DEFAULT_PORT: u16 = 3001;

/// Application configuration, loaded once and shared read-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    /// Controller model → register map
    #[serde(default)]
    pub register_maps: BTreeMap<String, RegisterMap>,

    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// Service identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            description: None,
        }
    }
}

/// Health/status HTTP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_api_host(),
            port: DEFAULT_PORT,
        }
    }
}

/// Where readings go
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Backend endpoint; readings are only logged when absent
    #[serde(default)]
    pub url: Option<String>,

    /// Sent as `x-api-key`
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_publish_timeout_ms")]
    pub timeout_ms: u64,

    /// JSON key carrying the channel id
    #[serde(default = "default_identifier_field")]
    pub identifier_field: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_ms: default_publish_timeout_ms(),
            identifier_field: default_identifier_field(),
        }
    }
}

impl PublisherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log root; `GENSRV_LOG_DIR` takes precedence
    #[serde(default)]
    pub dir: Option<String>,

    #[serde(default = "default_true")]
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            file_enabled: true,
        }
    }
}

/// Engine timings shared by every channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Interface the channel listeners bind to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// How long one accept waits for the bridge before looping
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,

    /// Deadline for the frame body once its marker is found
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,

    /// Bus settle time between block reads
    #[serde(default = "default_inter_block_delay_ms")]
    pub inter_block_delay_ms: u64,

    /// Idle time after an unexpected scheduler fault
    #[serde(default = "default_fault_backoff_ms")]
    pub fault_backoff_ms: u64,

    /// Bytes searched for a frame marker before giving up
    #[serde(default = "default_sync_buffer_limit")]
    pub sync_buffer_limit: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            accept_timeout_ms: default_accept_timeout_ms(),
            frame_timeout_ms: default_frame_timeout_ms(),
            inter_block_delay_ms: default_inter_block_delay_ms(),
            fault_backoff_ms: default_fault_backoff_ms(),
            sync_buffer_limit: default_sync_buffer_limit(),
        }
    }
}

impl PollingConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn inter_block_delay(&self) -> Duration {
        Duration::from_millis(self.inter_block_delay_ms)
    }

    pub fn fault_backoff(&self) -> Duration {
        Duration::from_millis(self.fault_backoff_ms)
    }
}

/// One polling target: a listening port and the controller behind it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Identifier sent with every reading
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// TCP port the bridge connects to
    pub port: u16,

    #[serde(default = "default_slave_address")]
    pub slave_address: u8,

    /// Read timeout applied to the live session
    #[serde(default = "default_channel_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Key into `register_maps`
    pub model: String,
}

impl ChannelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

fn default_service_name() -> String {
    "gensrv".to_string()
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    DEFAULT_PORT
}

fn default_publish_timeout_ms() -> u64 {
    10_000
}

fn default_identifier_field() -> String {
    "porta_vps".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_accept_timeout_ms() -> u64 {
    5_000
}

fn default_frame_timeout_ms() -> u64 {
    1_000
}

fn default_inter_block_delay_ms() -> u64 {
    100
}

fn default_fault_backoff_ms() -> u64 {
    30_000
}

fn default_sync_buffer_limit() -> usize {
    crate::protocols::modbus::constants::DEFAULT_SYNC_BUFFER_LIMIT
}

fn default_slave_address() -> u8 {
    1
}

fn default_channel_timeout_ms() -> u64 {
    3_000
}

fn default_poll_interval_ms() -> u64 {
    10_000
}
