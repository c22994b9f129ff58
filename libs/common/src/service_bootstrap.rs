//! Unified service bootstrap utilities
//!
//! Startup banner, service metadata and logging initialization shared by the
//! polling service and its tools.

use crate::logging::{self, LogConfig};
use tracing::info;

/// Service metadata for startup
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Service name (e.g., "gensrv")
    pub name: String,
    /// Service version from Cargo.toml
    pub version: String,
    /// Service description
    pub description: String,
    /// Default port of the status API
    pub default_port: u16,
}

impl ServiceInfo {
    /// Create new service info
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        default_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            default_port,
        }
    }
}

/// Print unified startup banner for any service
pub fn print_startup_banner(service: &ServiceInfo) {
    let banner = match service.name.as_str() {
        "gensrv" => {
            r#"
  ██████╗ ███████╗███╗   ██╗███████╗██████╗ ██╗   ██╗
 ██╔════╝ ██╔════╝████╗  ██║██╔════╝██╔══██╗██║   ██║
 ██║  ███╗█████╗  ██╔██╗ ██║███████╗██████╔╝██║   ██║
 ██║   ██║██╔══╝  ██║╚██╗██║╚════██║██╔══██╗╚██╗ ██╔╝
 ╚██████╔╝███████╗██║ ╚████║███████║██║  ██║ ╚████╔╝
  ╚═════╝ ╚══════╝╚═╝  ╚═══╝╚══════╝╚═╝  ╚═╝  ╚═══╝
            "#
        },
        _ => "",
    };

    if !banner.is_empty() {
        info!("{}", banner);
    }
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!(" Status API default port: {}", service.default_port);
}

/// Initialize logging for a service with standard configuration
///
/// Log root directory priority:
/// 1. `GENSRV_LOG_DIR` environment variable
/// 2. `log_dir` argument (from the service config)
/// 3. Default "logs"
pub fn init_logging(
    service: &ServiceInfo,
    level: &str,
    log_dir: Option<&str>,
    file_enabled: bool,
    ansi: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    logging::init_log_root(log_dir);

    let log_config = LogConfig {
        service_name: service.name.clone(),
        log_dir: logging::get_log_root().join(&service.name),
        console_level: logging::parse_level(level),
        file_enabled,
        ansi,
    };

    logging::init_with_config(log_config)
}
