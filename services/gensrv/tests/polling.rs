//! End-to-end polling against a simulated bridge.
//!
//! Each test binds a channel listener on an ephemeral port, runs the real
//! scheduler against it and plays the bridge side over TCP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use gensrv::api::{create_router, AppState};
use gensrv::core::channels::{ChannelListener, ChannelState, ChannelStatus, StatusReporter};
use gensrv::core::config::ChannelConfig;
use gensrv::protocols::modbus::frame::{build_exception, build_response, parse_request};
use gensrv::publisher::PublishReceipt;
use gensrv::runtime::ChannelScheduler;
use gensrv::{AppConfig, ChannelRegistry, FieldValue, GenSrvError, Publisher, Reading, Result};

const CONFIG: &str = r#"
polling:
  bind_host: "127.0.0.1"
  accept_timeout_ms: 200
  frame_timeout_ms: 100
  inter_block_delay_ms: 10
  fault_backoff_ms: 500
register_maps:
  k30xl:
    blocks:
      - name: rede
        start: 0
        count: 3
        fields:
          - { name: tensao_rede_rs, offset: 0, kind: scaled_u16, scale: 0.1 }
          - { name: tensao_rede_st, offset: 1, kind: scaled_u16, scale: 0.1 }
          - { name: frequencia_rede, offset: 2, kind: scaled_u16, scale: 0.1 }
      - name: motor
        start: 40
        count: 3
        fields:
          - { name: rpm, offset: 0, kind: scaled_u16 }
          - { name: horimetro, offset: 1, kind: u32_pair }
channels:
  - { id: "15002", name: "Gerador 2", port: 0, timeout_ms: 300, poll_interval_ms: 50, model: k30xl }
"#;

/// Forwards every published reading to the test
struct ChannelPublisher {
    tx: mpsc::UnboundedSender<Reading>,
    fail: bool,
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, reading: &Reading) -> Result<PublishReceipt> {
        let _ = self.tx.send(reading.clone());
        if self.fail {
            return Err(GenSrvError::publish("HTTP 500 Internal Server Error: down"));
        }
        Ok(PublishReceipt {
            reading_id: Some("42".to_string()),
        })
    }

    fn name(&self) -> &str {
        "channel"
    }
}

struct Harness {
    addr: std::net::SocketAddr,
    status: watch::Receiver<ChannelStatus>,
    readings: mpsc::UnboundedReceiver<Reading>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(fail_publish: bool) -> Self {
        Self::with_poll_interval(fail_publish, 50)
    }

    fn with_poll_interval(fail_publish: bool, poll_interval_ms: u64) -> Self {
        let config = AppConfig::from_yaml_str(CONFIG).expect("Test: config");
        let mut channel = config.channels[0].clone();
        channel.poll_interval_ms = poll_interval_ms;
        let map = Arc::new(config.register_map("k30xl").expect("Test: map").clone());

        let listener = ChannelListener::bind_host("127.0.0.1", 0).expect("Test: bind");
        let addr = listener.local_addr();
        let (tx, readings) = mpsc::unbounded_channel();
        let (reporter, status) = StatusReporter::new(ChannelStatus::new(&channel));
        let token = CancellationToken::new();

        let scheduler = ChannelScheduler::new(
            channel,
            map,
            config.polling.clone(),
            Arc::new(ChannelPublisher {
                tx,
                fail: fail_publish,
            }),
            Arc::new(reporter),
            token.clone(),
        );
        let task = tokio::spawn(scheduler.run(listener));

        Self {
            addr,
            status,
            readings,
            token,
            task,
        }
    }

    async fn next_reading(&mut self) -> Reading {
        tokio::time::timeout(Duration::from_secs(5), self.readings.recv())
            .await
            .expect("Test: reading in time")
            .expect("Test: publisher alive")
    }

    async fn stop(self) {
        self.token.cancel();
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("Test: scheduler stops")
            .expect("Test: scheduler did not panic");
        assert_eq!(self.status.borrow().state, ChannelState::Stopped);
    }
}

/// Bridge side: answers each request from `registers(start)`, prefixed with
/// `noise`, and stays silent when it returns `None`.
fn bridge<F>(addr: std::net::SocketAddr, noise: Vec<u8>, registers: F) -> JoinHandle<()>
where
    F: Fn(u16) -> Option<Vec<u16>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.expect("Test: connect");
        let mut buf = [0u8; 8];
        while stream.read_exact(&mut buf).await.is_ok() {
            let request = parse_request(&buf).expect("Test: valid request");
            assert_eq!(request.slave, 1);
            assert_eq!(request.function, 0x03);

            if let Some(values) = registers(request.start) {
                let mut frame = noise.clone();
                frame.extend(build_response(1, 0x03, &values));
                if stream.write_all(&frame).await.is_err() {
                    return;
                }
            }
        }
    })
}

/// Bridge whose controller rejects every read, and which dials back in as
/// soon as the service hangs up.
fn rejecting_bridge(addr: std::net::SocketAddr) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Ok(mut stream) = TcpStream::connect(addr).await else {
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            };
            let mut buf = [0u8; 8];
            while stream.read_exact(&mut buf).await.is_ok() {
                if stream.write_all(&build_exception(1, 0x03, 0x02)).await.is_err() {
                    break;
                }
            }
        }
    })
}

fn generator(start: u16) -> Option<Vec<u16>> {
    match start {
        0 => Some(vec![2203, 2210, 600]),
        40 => Some(vec![1800, 0x0001, 0x0002]),
        _ => None,
    }
}

#[tokio::test]
async fn test_bridge_readings_are_published() {
    let mut harness = Harness::start(false);
    let bridge = bridge(harness.addr, vec![0xFF, 0x00, 0x13, 0x37], generator);

    let reading = harness.next_reading().await;
    assert_eq!(reading.channel, "15002");
    assert_eq!(reading.get("tensao_rede_rs"), Some(&FieldValue::Number(220.3)));
    assert_eq!(reading.get("frequencia_rede"), Some(&FieldValue::Number(60.0)));
    assert_eq!(reading.get("rpm"), Some(&FieldValue::Number(1800.0)));
    assert_eq!(reading.get("horimetro"), Some(&FieldValue::Number(65538.0)));

    // Polling continues on the same session
    harness.next_reading().await;
    {
        let status = harness.status.borrow();
        assert!(status.connected);
        assert!(status.stats.readings_published >= 1);
        assert_eq!(status.stats.sessions_accepted, 1);
        assert!(status.last_reading_at.is_some());
        assert!(status.last_activity_at.is_some());
    }

    harness.stop().await;
    bridge.abort();
}

#[tokio::test]
async fn test_silent_second_block_gives_partial_reading() {
    let mut harness = Harness::start(false);
    let bridge = bridge(harness.addr, Vec::new(), |start| match start {
        0 => Some(vec![2203, 2210, 600]),
        _ => None,
    });

    let reading = harness.next_reading().await;
    assert_eq!(reading.len(), 3);
    assert!(reading.get("rpm").is_none());

    let stats = harness.status.borrow().stats.clone();
    assert!(stats.partial_readings >= 1);
    assert!(stats.block_failures >= 1);

    harness.stop().await;
    bridge.abort();
}

#[tokio::test]
async fn test_publish_failure_keeps_polling() {
    let mut harness = Harness::start(true);
    let bridge = bridge(harness.addr, Vec::new(), generator);

    harness.next_reading().await;
    harness.next_reading().await;

    {
        let status = harness.status.borrow();
        assert!(status.stats.publish_failures >= 1);
        assert_eq!(status.stats.readings_published, 0);
        assert_eq!(status.stats.sessions_accepted, 1);
        assert!(status.last_error.as_deref().is_some_and(|e| e.contains("HTTP 500")));
    }

    harness.stop().await;
    bridge.abort();
}

#[tokio::test]
async fn test_bridge_reconnect_is_accepted() {
    let mut harness = Harness::start(false);

    let first = bridge(harness.addr, Vec::new(), generator);
    harness.next_reading().await;
    first.abort();
    let _ = first.await;

    let second = bridge(harness.addr, Vec::new(), generator);
    // Readings still in flight from the first session may arrive first
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            harness.next_reading().await;
            if harness.status.borrow().stats.sessions_accepted >= 2 {
                break;
            }
        }
    })
    .await
    .expect("Test: second session polled");

    harness.stop().await;
    second.abort();
}

#[tokio::test]
async fn test_idle_channel_does_not_block_others() {
    let mut busy = Harness::start(false);
    let idle = Harness::start(false);

    let bridge = bridge(busy.addr, Vec::new(), generator);
    busy.next_reading().await;
    busy.next_reading().await;

    assert!(!idle.status.borrow().connected);
    assert_eq!(idle.status.borrow().stats.cycles, 0);

    busy.stop().await;
    idle.stop().await;
    bridge.abort();
}

#[tokio::test]
async fn test_registry_statuses_served_by_api() {
    let mut config = AppConfig::from_yaml_str(CONFIG).expect("Test: config");
    config.channels.push(ChannelConfig {
        id: "15001".to_string(),
        name: "Gerador 1".to_string(),
        port: 0,
        slave_address: 1,
        timeout_ms: 300,
        poll_interval_ms: 50,
        enabled: false,
        model: "k30xl".to_string(),
    });
    let (tx, _rx) = mpsc::unbounded_channel();
    let publisher = Arc::new(ChannelPublisher { tx, fail: false });

    let registry = ChannelRegistry::start(Arc::new(config), publisher, CancellationToken::new())
        .expect("Test: registry");
    assert_eq!(registry.running_count(), 1);

    let app = create_router(AppState::new("gensrv", registry.statuses()));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/channels")
                .body(Body::empty())
                .expect("Test: request"),
        )
        .await
        .expect("Test: response");
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Test: body")
        .to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).expect("Test: json");
    let channels = body.as_array().expect("Test: array");
    assert_eq!(channels.len(), 2);
    assert_eq!(channels[0]["id"], "15002");
    assert_eq!(channels[0]["enabled"], true);
    assert_eq!(channels[1]["id"], "15001");
    assert_eq!(channels[1]["state"], "disabled");

    registry.shutdown().await;
}

#[tokio::test]
async fn test_failed_first_block_reconnects_on_poll_cadence() {
    let mut harness = Harness::with_poll_interval(false, 400);
    let bridge = rejecting_bridge(harness.addr);

    tokio::time::timeout(
        Duration::from_secs(2),
        harness.status.wait_for(|s| s.stats.sessions_accepted >= 1),
    )
    .await
    .expect("Test: first session in time")
    .expect("Test: status alive");

    // Session dropped, waiting out the interval before listening again
    tokio::time::sleep(Duration::from_millis(150)).await;
    {
        let status = harness.status.borrow();
        assert_eq!(status.state, ChannelState::Disconnected);
        assert_eq!(status.stats.sessions_accepted, 1);
        assert_eq!(status.stats.cycles, 1);
        assert_eq!(status.last_error.as_deref(), Some("no reading"));
        // An exception reply is not a successful read
        assert!(status.last_activity_at.is_none());
    }

    tokio::time::timeout(
        Duration::from_secs(2),
        harness.status.wait_for(|s| s.stats.sessions_accepted >= 2),
    )
    .await
    .expect("Test: bridge accepted again")
    .expect("Test: status alive");

    tokio::time::sleep(Duration::from_millis(700)).await;
    {
        let status = harness.status.borrow();
        // Roughly one session per 400ms interval, never a tight loop
        assert!(
            status.stats.sessions_accepted <= 5,
            "{} sessions accepted",
            status.stats.sessions_accepted
        );
        assert_eq!(status.stats.readings_published, 0);
    }
    assert!(harness.readings.try_recv().is_err());

    harness.stop().await;
    bridge.abort();
}
