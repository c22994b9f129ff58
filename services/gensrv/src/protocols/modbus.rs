//! Modbus RTU over a transparent TCP-to-serial bridge
//!
//! The bridge relays serial bytes opaquely, so there is no MBAP header and no
//! framing beyond the RTU frame itself. Leaf-first:
//! - [`crc`]: CRC-16/MODBUS
//! - [`frame`]: request encoding and response validation
//! - [`sync`]: recovering aligned frames from a noisy byte stream

pub mod constants;
pub mod crc;
pub mod frame;
pub mod sync;

pub use crc::crc16;
pub use frame::{decode_response, encode_request, ReadRequest};
pub use sync::{FrameSynchronizer, SyncedFrame};
