//! Live device session
//!
//! One accepted bridge connection. Requests are strictly serialized: the
//! serial side is half-duplex, so a new request goes out only after the
//! previous response was read or given up on.

use std::time::Duration;

use chrono::{DateTime, Utc};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::error::{GenSrvError, Result};
use crate::protocols::modbus::sync::drain_pending;
use crate::protocols::modbus::{decode_response, FrameSynchronizer, ReadRequest};
use common::hex;

/// Session bound to one connection
#[derive(Debug)]
pub struct ChannelSession<S> {
    stream: S,
    peer: String,
    slave: u8,
    read_timeout: Duration,
    sync: FrameSynchronizer,
    connected: bool,
    last_activity: Option<DateTime<Utc>>,
    last_frame: Option<Vec<u8>>,
}

impl<S> ChannelSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: impl Into<String>,
        slave: u8,
        read_timeout: Duration,
        sync: FrameSynchronizer,
    ) -> Self {
        Self {
            stream,
            peer: peer.into(),
            slave,
            read_timeout,
            sync,
            connected: true,
            last_activity: None,
            last_frame: None,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// When the device last answered; `None` until its first answer
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_activity
    }

    /// Raw bytes of the most recent synchronized response
    pub fn last_frame(&self) -> Option<&[u8]> {
        self.last_frame.as_deref()
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn mark_disconnected(&mut self) {
        self.connected = false;
    }

    /// Read `count` holding registers starting at `start` from this channel's slave
    pub async fn read_block(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        let request = ReadRequest::holding(self.slave, start, count);
        self.exchange(&request).await
    }

    /// One request/response exchange.
    ///
    /// Session-fatal errors (I/O, EOF) mark the session disconnected; frame
    /// rejections leave it usable for the next request.
    pub async fn exchange(&mut self, request: &ReadRequest) -> Result<Vec<u16>> {
        if !self.connected {
            return Err(GenSrvError::connection_lost("session already closed"));
        }

        let result = self.exchange_inner(request).await;
        match &result {
            Ok(_) => self.last_activity = Some(Utc::now()),
            Err(e) if e.is_fatal_for_session() => {
                warn!("Session {} lost: {}", self.peer, e);
                self.connected = false;
            },
            Err(e) => debug!("Block {}+{} failed: {}", request.start, request.count, e),
        }
        result
    }

    async fn exchange_inner(&mut self, request: &ReadRequest) -> Result<Vec<u16>> {
        drain_pending(&mut self.stream)?;
        self.last_frame = None;

        let frame = request.encode()?;
        trace!("TX: {}", hex::encode_spaced(&frame));

        match tokio::time::timeout(self.read_timeout, async {
            self.stream.write_all(&frame).await?;
            self.stream.flush().await
        })
        .await
        {
            Ok(Ok(())) => {},
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(GenSrvError::io(format!(
                    "Write timed out after {:?}",
                    self.read_timeout
                )))
            },
        }

        let synced = self
            .sync
            .read_frame(
                &mut self.stream,
                request.slave,
                request.function,
                self.read_timeout,
            )
            .await?;

        if synced.discarded > 0 {
            debug!("Resynchronized past {} bytes", synced.discarded);
        }
        self.last_frame = Some(synced.bytes.clone());

        let registers = decode_response(&synced.bytes, request)?;
        if registers.len() < request.count as usize {
            warn!(
                "Short response{}: {}/{} registers",
                if synced.truncated { " (truncated)" } else { "" },
                registers.len(),
                request.count
            );
        }
        Ok(registers)
    }

    /// Shut the write half down and drop the connection
    pub async fn close(mut self) {
        self.connected = false;
        if let Err(e) = self.stream.shutdown().await {
            trace!("Shutdown of {}: {}", self.peer, e);
        }
        debug!("Session {} closed", self.peer);
    }
}
