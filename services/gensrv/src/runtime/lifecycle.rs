//! Channel registry
//!
//! Spawns one supervised scheduler per enabled channel. Channels share
//! nothing but the publisher; a channel that cannot bind, keeps losing its
//! device, or panics never affects the others.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::channels::{ChannelListener, ChannelState, ChannelStatus, StatusReporter};
use crate::core::config::{AppConfig, ChannelConfig};
use crate::core::register_map::RegisterMap;
use crate::error::{GenSrvError, Result};
use crate::publisher::Publisher;
use crate::runtime::scheduler::ChannelScheduler;

/// How long shutdown waits for schedulers to exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct ChannelHandle {
    id: String,
    task: Option<JoinHandle<()>>,
}

/// The fixed set of configured channels
pub struct ChannelRegistry {
    handles: Vec<ChannelHandle>,
    statuses: Vec<watch::Receiver<ChannelStatus>>,
    token: CancellationToken,
}

impl ChannelRegistry {
    /// Start a scheduler for every enabled channel. Disabled channels only
    /// get a status entry.
    pub fn start(
        config: Arc<AppConfig>,
        publisher: Arc<dyn Publisher>,
        token: CancellationToken,
    ) -> Result<Self> {
        let mut handles = Vec::with_capacity(config.channels.len());
        let mut statuses = Vec::with_capacity(config.channels.len());

        for channel in &config.channels {
            let (reporter, rx) = StatusReporter::new(ChannelStatus::new(channel));
            statuses.push(rx);

            if !channel.enabled {
                info!("Channel {} disabled", channel.id);
                handles.push(ChannelHandle {
                    id: channel.id.clone(),
                    task: None,
                });
                continue;
            }

            let Some(map) = config.register_map(&channel.model).cloned() else {
                // Stop whatever was already spawned before bailing out
                token.cancel();
                return Err(GenSrvError::config(format!(
                    "Channel {}: unknown register map '{}'",
                    channel.id, channel.model
                )));
            };

            let task = tokio::spawn(supervise(
                channel.clone(),
                Arc::new(map),
                Arc::clone(&config),
                Arc::clone(&publisher),
                Arc::new(reporter),
                token.child_token(),
            ));
            handles.push(ChannelHandle {
                id: channel.id.clone(),
                task: Some(task),
            });
        }

        let running = handles.iter().filter(|h| h.task.is_some()).count();
        info!("{} of {} channels started", running, handles.len());
        if running == 0 {
            warn!("No channels enabled");
        }

        Ok(Self {
            handles,
            statuses,
            token,
        })
    }

    /// Status receivers in configuration order
    pub fn statuses(&self) -> Vec<watch::Receiver<ChannelStatus>> {
        self.statuses.clone()
    }

    pub fn running_count(&self) -> usize {
        self.handles
            .iter()
            .filter(|h| h.task.as_ref().is_some_and(|t| !t.is_finished()))
            .count()
    }

    /// Cancel every scheduler and wait for them to exit
    pub async fn shutdown(mut self) {
        self.token.cancel();
        for handle in &mut self.handles {
            if let Some(task) = handle.task.take() {
                match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                    Ok(Ok(())) => {},
                    Ok(Err(e)) => error!("Channel {} task failed: {}", handle.id, e),
                    Err(_) => warn!("Channel {} did not stop within {:?}", handle.id, SHUTDOWN_GRACE),
                }
            }
        }
        info!("All channels stopped");
    }
}

/// Bind, run, and restart one channel's scheduler until cancelled.
///
/// A failed bind or a scheduler panic waits out the fault backoff and tries
/// again.
async fn supervise(
    channel: ChannelConfig,
    map: Arc<RegisterMap>,
    config: Arc<AppConfig>,
    publisher: Arc<dyn Publisher>,
    status: Arc<StatusReporter>,
    token: CancellationToken,
) {
    let backoff = config.polling.fault_backoff();

    while !token.is_cancelled() {
        let listener = match ChannelListener::bind_host(&config.polling.bind_host, channel.port) {
            Ok(listener) => listener,
            Err(e) => {
                error!("Channel {}: {}", channel.id, e);
                status.record_error(&e);
                status.set_state(ChannelState::Disconnected);
                if !sleep_or_cancel(backoff, &token).await {
                    break;
                }
                continue;
            },
        };

        let scheduler = ChannelScheduler::new(
            channel.clone(),
            Arc::clone(&map),
            config.polling.clone(),
            Arc::clone(&publisher),
            Arc::clone(&status),
            token.clone(),
        );

        match tokio::spawn(scheduler.run(listener)).await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                error!("Channel {} scheduler panicked, restarting in {:?}", channel.id, backoff);
                status.record_error(GenSrvError::internal("scheduler panicked"));
                status.set_state(ChannelState::Disconnected);
                if !sleep_or_cancel(backoff, &token).await {
                    break;
                }
            },
            Err(e) => {
                warn!("Channel {} scheduler aborted: {}", channel.id, e);
                break;
            },
        }
    }

    status.set_state(ChannelState::Stopped);
}

async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        () = token.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}
