//! Stream synchronizer
//!
//! The bridge relays the serial line byte for byte, so a response can be
//! preceded by line noise or the tail of an earlier exchange that timed out.
//! The synchronizer reads one byte at a time until the last two bytes form the
//! `[slave, fc]` marker (or `[slave, fc | 0x80]` for an exception), then reads
//! the rest of the frame under a separate, shorter deadline.

use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace, warn};

use super::constants::{CRC_LEN, DEFAULT_SYNC_BUFFER_LIMIT, EXCEPTION_FLAG, EXCEPTION_RESPONSE_LEN};
use crate::error::{GenSrvError, ModbusError, Result};
use common::hex;

/// Body bytes that must have arrived before a timed-out frame is salvaged
const MIN_SALVAGE_BODY: usize = 2;

/// A frame located in the byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedFrame {
    /// Frame bytes starting at the marker, CRC included
    pub bytes: Vec<u8>,
    /// Noise bytes skipped ahead of the marker
    pub discarded: usize,
    /// Body deadline elapsed before the declared length arrived
    pub truncated: bool,
}

impl SyncedFrame {
    pub fn is_exception(&self) -> bool {
        self.bytes.get(1).is_some_and(|fc| fc & EXCEPTION_FLAG != 0)
    }
}

/// Locates aligned response frames in an unframed byte stream
#[derive(Debug, Clone)]
pub struct FrameSynchronizer {
    buffer_limit: usize,
    frame_timeout: Duration,
}

impl FrameSynchronizer {
    pub fn new(frame_timeout: Duration) -> Self {
        Self {
            buffer_limit: DEFAULT_SYNC_BUFFER_LIMIT,
            frame_timeout,
        }
    }

    pub fn with_buffer_limit(mut self, limit: usize) -> Self {
        self.buffer_limit = limit;
        self
    }

    /// Read one response frame addressed from `slave` for `function`.
    ///
    /// `timeout` bounds the marker search; the body that follows the marker is
    /// bounded by the synchronizer's own frame timeout. EOF at any point is a
    /// lost connection.
    pub async fn read_frame<R>(
        &self,
        reader: &mut R,
        slave: u8,
        function: u8,
        timeout: Duration,
    ) -> Result<SyncedFrame>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer: Vec<u8> = Vec::with_capacity(self.buffer_limit + 1);

        let marker = tokio::time::timeout(
            timeout,
            self.find_marker(reader, slave, function, &mut buffer),
        )
        .await;

        let is_exception = match marker {
            Ok(Ok(is_exception)) => is_exception,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!(
                    "Sync timeout after {:?}, {} bytes buffered",
                    timeout,
                    buffer.len()
                );
                if !buffer.is_empty() {
                    trace!("Unmatched: {}", hex::encode_spaced(&buffer));
                }
                return Err(ModbusError::SyncTimeout {
                    discarded: buffer.len(),
                }
                .into());
            },
        };

        let discarded = buffer.len() - 2;
        if discarded > 0 {
            debug!(
                "Discarded {} noise bytes: {}",
                discarded,
                hex::encode_spaced(&buffer[..discarded])
            );
        }
        let mut frame = buffer.split_off(discarded);

        let mut body = Vec::new();
        let completed = tokio::time::timeout(
            self.frame_timeout,
            read_body(reader, is_exception, &mut body),
        )
        .await;

        let truncated = match completed {
            Ok(Ok(())) => false,
            Ok(Err(e)) => return Err(e),
            Err(_) if body.len() >= MIN_SALVAGE_BODY => {
                warn!(
                    "Frame body timed out after {} bytes, salvaging truncated frame",
                    body.len()
                );
                true
            },
            Err(_) => {
                debug!("Frame body timed out after {} bytes", body.len());
                return Err(ModbusError::SyncTimeout {
                    discarded: discarded + frame.len() + body.len(),
                }
                .into());
            },
        };

        frame.extend_from_slice(&body);
        trace!("RX: {}", hex::encode_spaced(&frame));

        Ok(SyncedFrame {
            bytes: frame,
            discarded,
            truncated,
        })
    }

    /// Returns whether the marker found was the exception form
    async fn find_marker<R>(
        &self,
        reader: &mut R,
        slave: u8,
        function: u8,
        buffer: &mut Vec<u8>,
    ) -> Result<bool>
    where
        R: AsyncRead + Unpin,
    {
        let exception_fc = function | EXCEPTION_FLAG;

        loop {
            let byte = reader.read_u8().await?;
            buffer.push(byte);

            if let [.., addr, fc] = buffer.as_slice() {
                if *addr == slave && (*fc == function || *fc == exception_fc) {
                    return Ok(*fc == exception_fc);
                }
            }

            if buffer.len() > self.buffer_limit {
                debug!(
                    "No marker [{:02X} {:02X}] within {} bytes",
                    slave,
                    function,
                    self.buffer_limit
                );
                return Err(ModbusError::SyncTimeout {
                    discarded: buffer.len(),
                }
                .into());
            }
        }
    }
}

/// Read what follows the marker: `[code][crc x2]` for an exception,
/// `[byte count][data...][crc x2]` otherwise.
async fn read_body<R>(reader: &mut R, is_exception: bool, body: &mut Vec<u8>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    if is_exception {
        // code + crc
        return read_into(reader, body, EXCEPTION_RESPONSE_LEN - 2).await;
    }

    read_into(reader, body, 1).await?;
    let byte_count = body[0] as usize;
    read_into(reader, body, 1 + byte_count + CRC_LEN).await
}

/// Grow `body` until it holds `target` bytes. Bytes read before a cancellation
/// stay in `body`.
async fn read_into<R>(reader: &mut R, body: &mut Vec<u8>, target: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 64];
    while body.len() < target {
        let want = (target - body.len()).min(chunk.len());
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(GenSrvError::connection_lost("peer closed mid-frame"));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Ok(())
}

/// Discard whatever is already waiting in the receive buffer without blocking.
///
/// Returns the number of stale bytes dropped. EOF is reported as a lost
/// connection so a dead peer is noticed before the next request goes out.
pub fn drain_pending<R>(reader: &mut R) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 256];
    let mut total = 0;

    loop {
        match reader.read(&mut chunk).now_or_never() {
            Some(Ok(0)) => return Err(GenSrvError::connection_lost("peer closed")),
            Some(Ok(n)) => {
                trace!("Drained: {}", hex::encode_spaced(&chunk[..n]));
                total += n;
            },
            Some(Err(e)) => return Err(e.into()),
            None => break,
        }
    }

    if total > 0 {
        debug!("Drained {} stale bytes", total);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::modbus::frame::{build_exception, build_response};
    use tokio::io::{duplex, AsyncWriteExt};

    const LONG: Duration = Duration::from_secs(5);

    fn sync() -> FrameSynchronizer {
        FrameSynchronizer::new(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_aligned_frame_without_noise() {
        let (mut device, mut host) = duplex(1024);
        let frame = build_response(1, 0x03, &[0x0102, 0x0304]);
        device.write_all(&frame).await.expect("Test: write");

        let synced = sync()
            .read_frame(&mut host, 1, 0x03, LONG)
            .await
            .expect("Test: frame");
        assert_eq!(synced.bytes, frame);
        assert_eq!(synced.discarded, 0);
        assert!(!synced.truncated);
    }

    #[tokio::test]
    async fn test_noise_prefix_up_to_limit_is_discarded() {
        let frame = build_response(1, 0x03, &[0x1051, 0x0000, 0x011D]);

        for garbage_len in 0..100 {
            let (mut device, mut host) = duplex(1024);
            let mut stream = vec![0xAA; garbage_len];
            stream.extend_from_slice(&frame);
            device.write_all(&stream).await.expect("Test: write");

            let synced = sync()
                .read_frame(&mut host, 1, 0x03, LONG)
                .await
                .expect("Test: frame after noise");
            assert_eq!(synced.bytes, frame, "garbage_len {garbage_len}");
            assert_eq!(synced.discarded, garbage_len);
        }
    }

    #[tokio::test]
    async fn test_noise_past_limit_is_sync_timeout() {
        let (mut device, mut host) = duplex(1024);
        device.write_all(&[0x55; 150]).await.expect("Test: write");

        let err = sync()
            .read_frame(&mut host, 1, 0x03, LONG)
            .await
            .expect_err("Test: no marker");
        assert!(matches!(
            err,
            GenSrvError::ProtocolError(ModbusError::SyncTimeout { discarded: 101 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_line_is_sync_timeout_not_hang() {
        let (mut device, mut host) = duplex(1024);
        device.write_all(&[0x00, 0x11]).await.expect("Test: write");

        let err = sync()
            .read_frame(&mut host, 1, 0x03, Duration::from_secs(3))
            .await
            .expect_err("Test: silence");
        assert!(matches!(
            err,
            GenSrvError::ProtocolError(ModbusError::SyncTimeout { discarded: 2 })
        ));
        drop(device);
    }

    #[tokio::test]
    async fn test_marker_for_other_slave_is_skipped() {
        let (mut device, mut host) = duplex(1024);
        let other = build_response(2, 0x03, &[9]);
        let ours = build_response(1, 0x03, &[7]);
        let mut stream = other.clone();
        stream.extend_from_slice(&ours);
        device.write_all(&stream).await.expect("Test: write");

        let synced = sync()
            .read_frame(&mut host, 1, 0x03, LONG)
            .await
            .expect("Test: frame");
        assert_eq!(synced.bytes, ours);
        assert_eq!(synced.discarded, other.len());
    }

    #[tokio::test]
    async fn test_exception_marker_reads_five_byte_frame() {
        let (mut device, mut host) = duplex(1024);
        let frame = build_exception(1, 0x03, 0x02);
        device.write_all(&[0xFF, 0xFE]).await.expect("Test: write");
        device.write_all(&frame).await.expect("Test: write");

        let synced = sync()
            .read_frame(&mut host, 1, 0x03, LONG)
            .await
            .expect("Test: exception frame");
        assert_eq!(synced.bytes, frame);
        assert_eq!(synced.discarded, 2);
        assert!(synced.is_exception());
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_body_is_salvaged() {
        let (mut device, mut host) = duplex(1024);
        let frame = build_response(1, 0x03, &[1, 2, 3]);
        // marker + byte count + first register, then the line goes quiet
        device.write_all(&frame[..5]).await.expect("Test: write");

        let synced = sync()
            .read_frame(&mut host, 1, 0x03, LONG)
            .await
            .expect("Test: salvaged frame");
        assert!(synced.truncated);
        assert_eq!(synced.bytes, frame[..5].to_vec());
        drop(device);
    }

    #[tokio::test(start_paused = true)]
    async fn test_body_with_single_byte_is_sync_timeout() {
        let (mut device, mut host) = duplex(1024);
        device.write_all(&[0x01, 0x03, 0x06]).await.expect("Test: write");

        let err = sync()
            .read_frame(&mut host, 1, 0x03, LONG)
            .await
            .expect_err("Test: too little body");
        assert!(matches!(
            err,
            GenSrvError::ProtocolError(ModbusError::SyncTimeout { .. })
        ));
        drop(device);
    }

    #[tokio::test]
    async fn test_eof_is_connection_lost() {
        let (mut device, mut host) = duplex(1024);
        device.write_all(&[0x01]).await.expect("Test: write");
        drop(device);

        let err = sync()
            .read_frame(&mut host, 1, 0x03, LONG)
            .await
            .expect_err("Test: eof");
        assert!(matches!(err, GenSrvError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_drain_pending_discards_buffered_bytes() {
        let (mut device, mut host) = duplex(1024);
        device.write_all(&[1, 2, 3, 4, 5]).await.expect("Test: write");

        assert_eq!(drain_pending(&mut host).expect("Test: drain"), 5);
        assert_eq!(drain_pending(&mut host).expect("Test: drain"), 0);
    }

    #[tokio::test]
    async fn test_drain_pending_reports_closed_peer() {
        let (device, mut host) = duplex(64);
        drop(device);
        assert!(matches!(
            drain_pending(&mut host),
            Err(GenSrvError::ConnectionLost(_))
        ));
    }
}
