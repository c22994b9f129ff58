//! Configuration loading and validation
//!
//! Sources, later ones overriding earlier ones:
//! 1. YAML file (`config/gensrv.yaml` unless overridden)
//! 2. `GENSRV_*` environment variables, nested with `__`
//!    (e.g. `GENSRV_PUBLISHER__URL`, `GENSRV_POLLING__FAULT_BACKOFF_MS`)

pub mod types;

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use tracing::{debug, warn};

use crate::error::{GenSrvError, Result};
use crate::protocols::modbus::constants::MAX_SLAVE_ADDRESS;

pub use types::{
    ApiConfig, AppConfig, ChannelConfig, LoggingConfig, PollingConfig, PublisherConfig,
    ServiceConfig, DEFAULT_PORT,
};

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/gensrv.yaml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "GENSRV_";

/// Parse a bind host: an IPv4 or IPv6 literal, brackets allowed (`[::]`)
pub fn parse_host(host: &str) -> Result<IpAddr> {
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    bare.parse()
        .map_err(|e| GenSrvError::config(format!("Invalid bind host '{}': {}", host, e)))
}

impl ApiConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(parse_host(&self.host)?, self.port))
    }
}

impl AppConfig {
    /// Load from a YAML file merged with environment overrides. Not validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(GenSrvError::config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        debug!("Loading configuration from {}", path.display());

        let config: AppConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse YAML text without consulting the environment
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(Figment::new().merge(Yaml::string(yaml)).extract()?)
    }

    /// Check cross-field rules; every problem is reported in one error.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.publisher.timeout_ms == 0 {
            problems.push("publisher.timeout_ms must be > 0".to_string());
        }
        if self.publisher.identifier_field.trim().is_empty() {
            problems.push("publisher.identifier_field must not be empty".to_string());
        }
        if let Some(url) = &self.publisher.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                problems.push(format!("publisher.url '{}' is not an http(s) URL", url));
            }
        }

        if let Err(e) = parse_host(&self.api.host) {
            problems.push(format!("api.host: {}", e));
        }

        let polling = &self.polling;
        if let Err(e) = parse_host(&polling.bind_host) {
            problems.push(format!("polling.bind_host: {}", e));
        }
        for (name, value) in [
            ("accept_timeout_ms", polling.accept_timeout_ms),
            ("frame_timeout_ms", polling.frame_timeout_ms),
            ("fault_backoff_ms", polling.fault_backoff_ms),
        ] {
            if value == 0 {
                problems.push(format!("polling.{} must be > 0", name));
            }
        }
        if polling.sync_buffer_limit < 2 {
            problems.push("polling.sync_buffer_limit must be >= 2".to_string());
        }

        for (model, map) in &self.register_maps {
            for problem in map.problems() {
                problems.push(format!("register_maps.{}: {}", model, problem));
            }
        }

        let mut ids = HashSet::new();
        let mut ports = HashSet::new();
        for channel in &self.channels {
            let label = format!("channel '{}'", channel.id);

            if channel.id.trim().is_empty() {
                problems.push("channel with empty id".to_string());
            }
            if !ids.insert(channel.id.as_str()) {
                problems.push(format!("{}: duplicate id", label));
            }
            if !ports.insert(channel.port) {
                problems.push(format!("{}: port {} already used", label, channel.port));
            }
            if channel.slave_address == 0 || channel.slave_address > MAX_SLAVE_ADDRESS {
                problems.push(format!(
                    "{}: slave_address {} outside 1..={}",
                    label, channel.slave_address, MAX_SLAVE_ADDRESS
                ));
            }
            if channel.timeout_ms == 0 {
                problems.push(format!("{}: timeout_ms must be > 0", label));
            }
            if channel.poll_interval_ms == 0 {
                problems.push(format!("{}: poll_interval_ms must be > 0", label));
            }
            if channel.enabled && !self.register_maps.contains_key(&channel.model) {
                problems.push(format!(
                    "{}: unknown register map '{}'",
                    label, channel.model
                ));
            }

            if channel.enabled && polling.fault_backoff_ms <= channel.poll_interval_ms {
                warn!(
                    "{}: fault_backoff_ms ({}) is not longer than poll_interval_ms ({})",
                    label, polling.fault_backoff_ms, channel.poll_interval_ms
                );
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GenSrvError::config(problems.join("; ")))
        }
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }

    pub fn register_map(&self, model: &str) -> Option<&crate::core::register_map::RegisterMap> {
        self.register_maps.get(model)
    }
}
