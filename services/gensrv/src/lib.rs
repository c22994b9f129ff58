//! Generator polling service
//!
//! Polls generator controllers over Modbus RTU carried through transparent
//! TCP-to-serial bridges. Each bridge connects *in* to a fixed port; the
//! service accepts it, reads the controller's register blocks, decodes them
//! into a reading and hands the reading to a publisher.
//!
//! ```text
//! ChannelRegistry ──► ChannelScheduler ──► ChannelSession ──► Codec + Synchronizer
//!   (per port)            │
//!                         │ Reading
//!                         ▼
//!                     Publisher
//! ```
//!
//! - **`protocols::modbus`**: CRC-16, RTU frame codec, stream synchronizer
//! - **`core`**: configuration, register maps, listener/session/status
//! - **`runtime`**: per-channel scheduler and its supervision
//! - **`publisher`**: HTTP and log publishers
//! - **`api`**: health/status endpoints

pub mod api;
pub mod core;
pub mod error;
pub mod protocols;
pub mod publisher;
pub mod runtime;
pub mod scanner;

pub use crate::core::config::AppConfig;
pub use crate::core::register_map::{FieldValue, Reading, RegisterMap};
pub use error::{GenSrvError, ModbusError, Result};
pub use publisher::Publisher;
pub use runtime::ChannelRegistry;
