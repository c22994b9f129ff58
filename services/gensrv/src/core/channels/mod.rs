//! Channel plumbing
//!
//! A channel is one listening port with at most one bridge device attached.
//! The listener hands out sessions; the session performs block reads; the
//! status module publishes what the scheduler is doing.

pub mod listener;
pub mod session;
pub mod status;

pub use listener::ChannelListener;
pub use session::ChannelSession;
pub use status::{ChannelState, ChannelStats, ChannelStatus, StatusReporter};
