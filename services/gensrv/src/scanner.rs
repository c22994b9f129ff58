//! Slave address scanner
//!
//! Commissioning aid: with the bridge connected, probe a range of slave
//! addresses with a small read and report which ones answer.

use std::ops::RangeInclusive;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::channels::ChannelSession;
use crate::error::{GenSrvError, ModbusError, Result};
use crate::protocols::modbus::ReadRequest;

/// What to probe and how patiently
#[derive(Debug, Clone)]
pub struct ScanPlan {
    pub addresses: RangeInclusive<u8>,
    pub start: u16,
    pub count: u16,
    pub response_timeout: Duration,
    /// Pause between probes so the bus settles
    pub delay: Duration,
}

impl Default for ScanPlan {
    fn default() -> Self {
        Self {
            addresses: 0..=10,
            start: 0,
            count: 1,
            response_timeout: Duration::from_secs(3),
            delay: Duration::from_millis(500),
        }
    }
}

/// How one address answered
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// Valid response with register values
    Responded(Vec<u16>),
    /// Device is present but refused the read
    Exception(u8),
    /// Something answered but the frame was rejected
    Rejected(String),
    NoResponse,
}

impl ProbeOutcome {
    /// The address has a live device behind it
    pub fn is_present(&self) -> bool {
        matches!(self, ProbeOutcome::Responded(_) | ProbeOutcome::Exception(_))
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub address: u8,
    pub request: Vec<u8>,
    pub response: Option<Vec<u8>>,
    pub outcome: ProbeOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub probes: Vec<ProbeResult>,
    /// Scan ended early because the bridge went away
    pub aborted: bool,
}

impl ScanReport {
    pub fn present(&self) -> impl Iterator<Item = &ProbeResult> {
        self.probes.iter().filter(|p| p.outcome.is_present())
    }

    /// First address that returned register data, else first that answered at all
    pub fn recommendation(&self) -> Option<u8> {
        self.probes
            .iter()
            .find(|p| matches!(p.outcome, ProbeOutcome::Responded(_)))
            .or_else(|| self.present().next())
            .map(|p| p.address)
    }
}

/// Probe every address in the plan over `session`, calling `on_probe` after each.
pub async fn scan<S, F>(
    session: &mut ChannelSession<S>,
    plan: &ScanPlan,
    token: &CancellationToken,
    mut on_probe: F,
) -> Result<ScanReport>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(&ProbeResult),
{
    let mut report = ScanReport::default();
    session.set_read_timeout(plan.response_timeout);

    for address in plan.addresses.clone() {
        let request = ReadRequest::holding(address, plan.start, plan.count);
        let encoded = request.encode()?;

        let exchanged = tokio::select! {
            () = token.cancelled() => return Err(GenSrvError::Cancelled),
            r = session.exchange(&request) => r,
        };

        let outcome = match exchanged {
            Ok(values) => ProbeOutcome::Responded(values),
            Err(GenSrvError::ProtocolError(ModbusError::FunctionException { code, .. })) => {
                ProbeOutcome::Exception(code)
            },
            Err(GenSrvError::ProtocolError(ModbusError::SyncTimeout { .. })) => {
                ProbeOutcome::NoResponse
            },
            Err(e) if e.is_fatal_for_session() => {
                debug!("Scan aborted at address {}: {}", address, e);
                report.aborted = true;
                break;
            },
            Err(e) => ProbeOutcome::Rejected(e.to_string()),
        };

        let result = ProbeResult {
            address,
            request: encoded,
            response: session.last_frame().map(<[u8]>::to_vec),
            outcome,
        };
        on_probe(&result);
        report.probes.push(result);

        if address != *plan.addresses.end() {
            tokio::select! {
                () = token.cancelled() => return Err(GenSrvError::Cancelled),
                () = tokio::time::sleep(plan.delay) => {},
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::modbus::frame::{build_exception, build_response, parse_request};
    use crate::protocols::modbus::FrameSynchronizer;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_scan_finds_responding_address() {
        let (mut device, host) = duplex(1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            while device.read_exact(&mut buf).await.is_ok() {
                let request = parse_request(&buf).expect("Test: request");
                match request.slave {
                    2 => device
                        .write_all(&build_exception(2, 0x03, 0x02))
                        .await
                        .expect("Test: write"),
                    3 => device
                        .write_all(&build_response(3, 0x03, &[2203]))
                        .await
                        .expect("Test: write"),
                    _ => {},
                }
            }
        });

        let mut session = ChannelSession::new(
            host,
            "test",
            1,
            Duration::from_secs(1),
            FrameSynchronizer::new(Duration::from_millis(100)),
        );
        let plan = ScanPlan {
            addresses: 1..=4,
            response_timeout: Duration::from_millis(150),
            delay: Duration::ZERO,
            ..ScanPlan::default()
        };

        let mut seen = Vec::new();
        let report = scan(&mut session, &plan, &CancellationToken::new(), |p| {
            seen.push(p.address)
        })
        .await
        .expect("Test: scan");

        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert!(!report.aborted);
        assert_eq!(report.probes[0].outcome, ProbeOutcome::NoResponse);
        assert_eq!(report.probes[1].outcome, ProbeOutcome::Exception(0x02));
        assert_eq!(report.probes[2].outcome, ProbeOutcome::Responded(vec![2203]));
        assert_eq!(report.present().count(), 2);
        assert_eq!(report.recommendation(), Some(3));
    }

    #[tokio::test]
    async fn test_scan_aborts_when_bridge_disconnects() {
        let (device, host) = duplex(64);
        drop(device);

        let mut session = ChannelSession::new(
            host,
            "test",
            1,
            Duration::from_secs(1),
            FrameSynchronizer::new(Duration::from_millis(100)),
        );
        let report = scan(
            &mut session,
            &ScanPlan::default(),
            &CancellationToken::new(),
            |_| {},
        )
        .await
        .expect("Test: scan");

        assert!(report.aborted);
        assert!(report.probes.is_empty());
        assert_eq!(report.recommendation(), None);
    }
}
