//! Core components: configuration, register maps, and the per-channel
//! connection plumbing the schedulers drive.

pub mod bootstrap;
pub mod channels;
pub mod config;
pub mod register_map;
