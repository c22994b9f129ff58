//! Service bootstrap
//!
//! Command-line arguments, logging setup, and the two one-shot modes
//! (`--validate`, `--publish-test`).

use std::path::PathBuf;

use clap::Parser;
use tracing::{debug, error, info, warn};

use crate::core::config::{AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_PORT};
use crate::error::{GenSrvError, Result};
use crate::publisher::Publisher;
use common::service_bootstrap::{self, ServiceInfo};

/// Command-line arguments for gensrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "gensrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Generator controller polling service (Modbus RTU over TCP bridge)",
    long_about = None
)]
pub struct Args {
    /// Configuration file
    #[arg(short = 'c', long, env = "GENSRV_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides logging.level
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,

    /// Publish one synthetic reading per enabled channel, then exit
    #[arg(long)]
    pub publish_test: bool,
}

pub fn service_info() -> ServiceInfo {
    ServiceInfo::new(
        "gensrv",
        env!("CARGO_PKG_VERSION"),
        "Generator Polling Service - Modbus RTU over TCP bridge",
        DEFAULT_PORT,
    )
}

/// Initialize logging from CLI arguments and the loaded configuration
///
/// Log root directory priority:
/// 1. GENSRV_LOG_DIR environment variable
/// 2. logging.dir from the configuration file
/// 3. Default "logs"
pub fn initialize_logging(args: &Args, service: &ServiceInfo, config: &AppConfig) -> Result<()> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(config.logging.level.as_str());

    service_bootstrap::init_logging(
        service,
        level,
        config.logging.dir.as_deref(),
        config.logging.file_enabled,
        !args.no_color,
    )
    .map_err(|e| GenSrvError::config(format!("Failed to init logging: {}", e)))
}

/// Log a summary of a configuration that already passed validation
pub fn describe_configuration(config: &AppConfig) {
    info!("Service: {}", config.service.name);
    if let Some(desc) = &config.service.description {
        info!("Description: {}", desc);
    }

    info!("Register maps: {}", config.register_maps.len());
    for (model, map) in &config.register_maps {
        let registers: u32 = map.blocks.iter().map(|b| u32::from(b.count)).sum();
        info!(
            "  {}: {} block(s), {} registers, {} outputs",
            model,
            map.blocks.len(),
            registers,
            map.output_names().len()
        );
        for block in &map.blocks {
            for field in &block.fields {
                let address = u32::from(block.start) + u32::from(field.offset);
                match &field.unit {
                    Some(unit) => debug!("    {} @{} ({})", field.name, address, unit),
                    None => debug!("    {} @{}", field.name, address),
                }
            }
        }
    }

    info!("Found {} channel(s)", config.channels.len());
    for channel in &config.channels {
        info!(
            "  Channel {}: {} (port {}, slave {}, model {}, every {}ms){}",
            channel.id,
            channel.display_name(),
            channel.port,
            channel.slave_address,
            channel.model,
            channel.poll_interval_ms,
            if channel.enabled { "" } else { " [disabled]" }
        );
    }

    match &config.publisher.url {
        Some(url) => info!("Publisher: {}", url),
        None => info!("Publisher: log only"),
    }
}

/// Publish an all-zero reading for every enabled channel.
///
/// Returns the number of channels whose publish failed.
pub async fn run_publish_test(config: &AppConfig, publisher: &dyn Publisher) -> usize {
    let mut failures = 0;

    for channel in config.enabled_channels() {
        let Some(map) = config.register_map(&channel.model) else {
            warn!("Channel {}: no register map '{}'", channel.id, channel.model);
            failures += 1;
            continue;
        };

        let reading = map.decode_zeroed(&channel.id);
        match publisher.publish(&reading).await {
            Ok(receipt) => info!(
                "Channel {}: published {} fields via {}{}",
                channel.id,
                reading.len(),
                publisher.name(),
                receipt
                    .reading_id
                    .map(|id| format!(" (reading_id {})", id))
                    .unwrap_or_default()
            ),
            Err(e) => {
                error!("Channel {}: publish failed: {}", channel.id, e);
                failures += 1;
            },
        }
    }

    failures
}
