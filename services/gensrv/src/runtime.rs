//! Runtime orchestration: channel schedulers and their supervision

pub mod lifecycle;
pub mod scheduler;

pub use lifecycle::ChannelRegistry;
pub use scheduler::{run_cycle, ChannelScheduler, CycleOutcome};
