//! Per-channel polling scheduler
//!
//! ```text
//!   Listening ──accept──► Connected ──cycle──► Polling
//!       ▲                     ▲                   │
//!       │                     └──poll interval────┤ reading published
//!       └──── Disconnected ◄──────────────────────┘ no reading / session lost
//! ```
//!
//! Every suspension point also waits on the cancellation token, so shutdown
//! drops the listener and session (closing their sockets) promptly.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::core::channels::{ChannelListener, ChannelSession, ChannelState, StatusReporter};
use crate::core::config::{ChannelConfig, PollingConfig};
use crate::core::register_map::{Reading, RegisterMap};
use crate::error::{GenSrvError, Result};
use crate::protocols::modbus::FrameSynchronizer;
use crate::publisher::Publisher;

/// Result of one pass over the register map
#[derive(Debug)]
pub struct CycleOutcome {
    /// `None` when the first block failed or nothing decoded
    pub reading: Option<Reading>,
    pub blocks_ok: usize,
    pub blocks_failed: usize,
    /// A session-fatal error ended the cycle early
    pub session_lost: bool,
}

impl CycleOutcome {
    pub fn is_partial(&self) -> bool {
        self.reading.is_some() && self.blocks_failed > 0
    }
}

/// Execute `map` against a live session.
///
/// First block failure means no reading. A later failure drops only that
/// block's fields; remaining blocks are still read unless the session is gone.
pub async fn run_cycle<S>(
    session: &mut ChannelSession<S>,
    map: &RegisterMap,
    channel_id: &str,
    inter_block_delay: Duration,
) -> CycleOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reading = Reading::new(channel_id);
    let mut outcome = CycleOutcome {
        reading: None,
        blocks_ok: 0,
        blocks_failed: 0,
        session_lost: false,
    };

    for (index, block) in map.blocks.iter().enumerate() {
        if index > 0 && !inter_block_delay.is_zero() {
            tokio::time::sleep(inter_block_delay).await;
        }

        match session.read_block(block.start, block.count).await {
            Ok(registers) => {
                let decoded = block.decode_into(&registers, &mut reading.fields);
                trace!("Block '{}': {} outputs", block.name, decoded);
                outcome.blocks_ok += 1;
            },
            Err(e) => {
                outcome.blocks_failed += 1;
                outcome.session_lost = e.is_fatal_for_session();
                if index == 0 {
                    warn!(
                        "First block '{}' failed [{}], no reading this cycle: {}",
                        block.name,
                        e.error_code(),
                        e
                    );
                    return outcome;
                }
                warn!("Block '{}' failed [{}]: {}", block.name, e.error_code(), e);
                if outcome.session_lost {
                    break;
                }
            },
        }
    }

    if !reading.is_empty() {
        reading.captured_at = chrono::Utc::now();
        outcome.reading = Some(reading);
    }
    outcome
}

/// Long-running poller for one channel
pub struct ChannelScheduler {
    channel: ChannelConfig,
    map: Arc<RegisterMap>,
    polling: PollingConfig,
    publisher: Arc<dyn Publisher>,
    status: Arc<StatusReporter>,
    token: CancellationToken,
}

impl ChannelScheduler {
    pub fn new(
        channel: ChannelConfig,
        map: Arc<RegisterMap>,
        polling: PollingConfig,
        publisher: Arc<dyn Publisher>,
        status: Arc<StatusReporter>,
        token: CancellationToken,
    ) -> Self {
        Self {
            channel,
            map,
            polling,
            publisher,
            status,
            token,
        }
    }

    /// Run until cancelled
    pub async fn run(self, listener: ChannelListener) {
        let span = info_span!("channel", id = %self.channel.id);
        async move {
            info!(
                "Polling {} (slave {}) every {:?}",
                self.channel.display_name(),
                self.channel.slave_address,
                self.channel.poll_interval()
            );
            self.run_loop(listener).await;
            self.status.set_state(ChannelState::Stopped);
            info!("Scheduler stopped");
        }
        .instrument(span)
        .await
    }

    async fn run_loop(&self, listener: ChannelListener) {
        let sync = FrameSynchronizer::new(self.polling.frame_timeout())
            .with_buffer_limit(self.polling.sync_buffer_limit);

        loop {
            self.status.set_state(ChannelState::Listening);

            let accepted = match self
                .cancellable(listener.accept(self.polling.accept_timeout()))
                .await
            {
                Some(result) => result,
                None => return,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(GenSrvError::AcceptTimeout(_)) => {
                    trace!("No device yet");
                    continue;
                },
                Err(e) => {
                    error!("Accept error: {}", e);
                    self.status.record_error(&e);
                    if !self.backoff().await {
                        return;
                    }
                    continue;
                },
            };

            let peer = peer.to_string();
            self.status.connected(&peer);
            let mut session = ChannelSession::new(
                stream,
                peer,
                self.channel.slave_address,
                self.channel.timeout(),
                sync.clone(),
            );

            let keep_running = self.poll_session(&mut session).await;

            session.close().await;
            self.status.set_state(ChannelState::Disconnected);
            let stats = self.status.snapshot().stats;
            info!(
                "Session ended: {} cycles, {} published, {} partial, {} block failures",
                stats.cycles, stats.readings_published, stats.partial_readings, stats.block_failures
            );

            if !keep_running {
                return;
            }

            // A dropped session still counts as a poll; hold the cadence
            // before accepting the device again.
            debug!("Next accept in {:?}", self.channel.poll_interval());
            if self
                .cancellable(tokio::time::sleep(self.channel.poll_interval()))
                .await
                .is_none()
            {
                return;
            }
        }
    }

    /// Poll until the session is unusable. Returns false on cancellation.
    ///
    /// The caller sleeps the poll interval after a `true` return, so every
    /// exit path here leaves the interval sleep to `run_loop`.
    async fn poll_session<S>(&self, session: &mut ChannelSession<S>) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            self.status.set_state(ChannelState::Polling);

            let outcome = match self
                .cancellable(run_cycle(
                    session,
                    &self.map,
                    &self.channel.id,
                    self.polling.inter_block_delay(),
                ))
                .await
            {
                Some(outcome) => outcome,
                None => return false,
            };

            self.status.update_stats(|s| {
                s.cycles += 1;
                s.block_failures += outcome.blocks_failed as u64;
                if outcome.is_partial() {
                    s.partial_readings += 1;
                }
            });
            if let Some(at) = session.last_activity() {
                self.status.activity(at);
            }

            let session_lost = outcome.session_lost;
            let partial = outcome.is_partial();

            match outcome.reading {
                Some(reading) => {
                    if partial {
                        warn!(
                            "Partial reading: {} fields, {}/{} blocks",
                            reading.len(),
                            outcome.blocks_ok,
                            self.map.blocks.len()
                        );
                    }
                    match self.cancellable(self.publish(reading)).await {
                        Some(Ok(())) => {},
                        Some(Err(e)) => {
                            // Not a session problem; the next cycle publishes afresh
                            warn!("Publish failed: {}", e);
                        },
                        None => return false,
                    }
                },
                None => {
                    info!("No reading this cycle, dropping session");
                    self.status.record_error("no reading");
                    session.mark_disconnected();
                    return true;
                },
            }

            if session_lost || !session.is_connected() {
                self.status.record_error("connection lost");
                return true;
            }

            self.status.set_state(ChannelState::Connected);
            if self
                .cancellable(tokio::time::sleep(self.channel.poll_interval()))
                .await
                .is_none()
            {
                return false;
            }
        }
    }

    async fn publish(&self, reading: Reading) -> Result<()> {
        let captured_at = reading.captured_at;
        match self.publisher.publish(&reading).await {
            Ok(receipt) => {
                match receipt.reading_id {
                    Some(id) => info!("Published {} fields (reading_id {})", reading.len(), id),
                    None => info!("Published {} fields", reading.len()),
                }
                self.status.published(captured_at);
                Ok(())
            },
            Err(e) => {
                self.status.update_stats(|s| s.publish_failures += 1);
                self.status.record_error(&e);
                Err(e)
            },
        }
    }

    /// Fault backoff. Returns false if cancelled while waiting.
    async fn backoff(&self) -> bool {
        let delay = self.polling.fault_backoff();
        debug!("Backing off for {:?}", delay);
        self.cancellable(tokio::time::sleep(delay)).await.is_some()
    }

    /// `None` once the token is cancelled
    async fn cancellable<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            () = self.token.cancelled() => None,
            out = fut => Some(out),
        }
    }
}
