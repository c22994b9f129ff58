//! Slave address scanner (`gensrv-scan`)
//!
//! Waits for the bridge on one port, then probes a range of slave addresses
//! and prints every exchange. Run it with the channel stopped in gensrv.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use common::hex;
use common::service_bootstrap::{init_logging, ServiceInfo};
use common::shutdown::cancel_on_shutdown;
use gensrv::core::channels::{ChannelListener, ChannelSession};
use gensrv::protocols::modbus::FrameSynchronizer;
use gensrv::scanner::{scan, ProbeOutcome, ProbeResult, ScanPlan};

#[derive(Parser, Debug)]
#[command(
    name = "gensrv-scan",
    version = env!("CARGO_PKG_VERSION"),
    about = "Probe slave addresses behind a Modbus RTU TCP bridge"
)]
struct ScanArgs {
    /// Port the bridge connects to
    #[arg(short, long, default_value_t = 15002)]
    port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// First slave address to probe
    #[arg(long, default_value_t = 0)]
    from: u8,

    /// Last slave address to probe (inclusive)
    #[arg(long, default_value_t = 10)]
    to: u8,

    /// Register to read
    #[arg(long, default_value_t = 0)]
    start: u16,

    #[arg(long, default_value_t = 1)]
    count: u16,

    /// How long to wait for the bridge to connect
    #[arg(long, default_value_t = 60)]
    accept_timeout_secs: u64,

    /// Response timeout per probe
    #[arg(long, default_value_t = 3000)]
    timeout_ms: u64,

    /// Pause between probes
    #[arg(long, default_value_t = 500)]
    delay_ms: u64,

    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

fn print_probe(probe: &ProbeResult) {
    println!("Address {:>3}", probe.address);
    println!("  TX: {}", hex::encode_spaced(&probe.request));
    match &probe.response {
        Some(frame) => println!("  RX: {}", hex::encode_spaced(frame)),
        None => println!("  RX: -"),
    }
    match &probe.outcome {
        ProbeOutcome::Responded(values) => println!("  OK  registers {:?}", values),
        ProbeOutcome::Exception(code) => println!("  OK  exception 0x{:02X} (device present)", code),
        ProbeOutcome::Rejected(reason) => println!("  ??  {}", reason),
        ProbeOutcome::NoResponse => println!("  --  no response"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ScanArgs::parse();
    if args.from > args.to {
        anyhow::bail!("--from ({}) must not exceed --to ({})", args.from, args.to);
    }

    let info = ServiceInfo::new(
        "gensrv-scan",
        env!("CARGO_PKG_VERSION"),
        "Slave address scanner",
        args.port,
    );
    init_logging(&info, &args.log_level, None, false, true)
        .map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))?;

    let token = CancellationToken::new();
    let signal_handle = cancel_on_shutdown(token.clone());

    let listener = ChannelListener::bind_host(&args.host, args.port)
        .with_context(|| format!("Failed to bind {}:{}", args.host, args.port))?;
    println!(
        "Waiting up to {}s for the bridge on {}...",
        args.accept_timeout_secs,
        listener.local_addr()
    );

    let (stream, peer) = tokio::select! {
        () = token.cancelled() => return Ok(()),
        r = listener.accept(Duration::from_secs(args.accept_timeout_secs)) => r?,
    };
    println!("Bridge connected from {}", peer);

    let timeout = Duration::from_millis(args.timeout_ms);
    let mut session = ChannelSession::new(
        stream,
        peer.to_string(),
        args.from,
        timeout,
        FrameSynchronizer::new(timeout),
    );

    let plan = ScanPlan {
        addresses: args.from..=args.to,
        start: args.start,
        count: args.count,
        response_timeout: timeout,
        delay: Duration::from_millis(args.delay_ms),
    };

    let report = scan(&mut session, &plan, &token, print_probe).await?;
    session.close().await;

    println!();
    println!("Probed {} address(es)", report.probes.len());
    if report.aborted {
        println!("Scan stopped early: bridge disconnected");
    }
    let present: Vec<String> = report.present().map(|p| p.address.to_string()).collect();
    if present.is_empty() {
        println!("No device answered");
    } else {
        println!("Answering: {}", present.join(", "));
    }
    if let Some(address) = report.recommendation() {
        println!("Recommended slave_address: {}", address);
    }

    token.cancel();
    let _ = signal_handle.await;
    Ok(())
}
