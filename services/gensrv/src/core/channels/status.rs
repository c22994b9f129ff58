//! Per-channel status
//!
//! Each scheduler is the single writer of its channel's status; the health
//! API holds receivers and reads the latest snapshot without locking.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::core::config::ChannelConfig;

/// Where a channel's scheduler currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Not configured to run
    Disabled,
    /// Waiting for the bridge to connect
    Listening,
    /// Session open, idle between cycles
    Connected,
    /// Poll cycle in flight
    Polling,
    /// Session torn down, about to listen again
    Disconnected,
    /// Scheduler exited (shutdown)
    Stopped,
}

impl ChannelState {
    pub fn is_connected(self) -> bool {
        matches!(self, ChannelState::Connected | ChannelState::Polling)
    }
}

/// Counters since process start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub cycles: u64,
    pub readings_published: u64,
    pub partial_readings: u64,
    pub publish_failures: u64,
    pub block_failures: u64,
    pub sessions_accepted: u64,
}

/// Snapshot served by the health API
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub enabled: bool,
    pub connected: bool,
    pub state: ChannelState,
    pub peer: Option<String>,
    pub last_reading_at: Option<DateTime<Utc>>,
    /// Last successful block read on any session
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub stats: ChannelStats,
}

impl ChannelStatus {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.display_name().to_string(),
            port: config.port,
            enabled: config.enabled,
            connected: false,
            state: if config.enabled {
                ChannelState::Listening
            } else {
                ChannelState::Disabled
            },
            peer: None,
            last_reading_at: None,
            last_activity_at: None,
            last_error: None,
            stats: ChannelStats::default(),
        }
    }
}

/// Write side of a channel status
#[derive(Debug)]
pub struct StatusReporter {
    tx: watch::Sender<ChannelStatus>,
}

impl StatusReporter {
    pub fn new(initial: ChannelStatus) -> (Self, watch::Receiver<ChannelStatus>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx }, rx)
    }

    pub fn snapshot(&self) -> ChannelStatus {
        self.tx.borrow().clone()
    }

    pub fn set_state(&self, state: ChannelState) {
        self.tx.send_modify(|s| {
            s.state = state;
            s.connected = state.is_connected();
            if !s.connected {
                s.peer = None;
            }
        });
    }

    pub fn connected(&self, peer: &str) {
        self.tx.send_modify(|s| {
            s.state = ChannelState::Connected;
            s.connected = true;
            s.peer = Some(peer.to_string());
            s.stats.sessions_accepted += 1;
        });
    }

    pub fn record_error(&self, error: impl ToString) {
        let error = error.to_string();
        self.tx.send_modify(|s| s.last_error = Some(error));
    }

    /// Apply a change to the counters
    pub fn update_stats(&self, f: impl FnOnce(&mut ChannelStats)) {
        self.tx.send_modify(|s| f(&mut s.stats));
    }

    pub fn activity(&self, at: DateTime<Utc>) {
        self.tx.send_if_modified(|s| {
            if s.last_activity_at == Some(at) {
                return false;
            }
            s.last_activity_at = Some(at);
            true
        });
    }

    pub fn published(&self, at: DateTime<Utc>) {
        self.tx.send_modify(|s| {
            s.last_reading_at = Some(at);
            s.stats.readings_published += 1;
        });
    }
}
