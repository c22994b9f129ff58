//! Shared service library
//!
//! Provides the plumbing every polling service needs, independent of protocol:
//! - logging initialization (console + daily rolling file)
//! - startup banner and service metadata
//! - shutdown signal handling
//! - hex helpers for frame dumps

pub mod hex;
pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

pub use logging::LogConfig;
pub use service_bootstrap::ServiceInfo;
pub use shutdown::wait_for_shutdown;
