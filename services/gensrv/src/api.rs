//! Health and status API
//!
//! Read-only view of the channel statuses published by the schedulers.
//! Nothing here can influence polling.

use std::sync::Arc;

use axum::{extract::State, response::Json, routing::get, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::core::channels::ChannelStatus;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<StateInner>,
}

struct StateInner {
    service: String,
    version: String,
    started_at: DateTime<Utc>,
    channels: Vec<watch::Receiver<ChannelStatus>>,
}

impl AppState {
    pub fn new(service: impl Into<String>, channels: Vec<watch::Receiver<ChannelStatus>>) -> Self {
        Self {
            inner: Arc::new(StateInner {
                service: service.into(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                started_at: Utc::now(),
                channels,
            }),
        }
    }

    fn snapshot(&self) -> Vec<ChannelStatus> {
        self.inner
            .channels
            .iter()
            .map(|rx| rx.borrow().clone())
            .collect()
    }
}

/// `GET /health` body
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
    pub channels: Vec<ChannelStatus>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/channels", get(list_channels))
        .with_state(state)
}

/// Health check
///
/// @route GET /health
/// @output `Json<HealthResponse>` - service identity, uptime, per-channel state
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let now = Utc::now();
    let uptime_seconds = (now - state.inner.started_at)
        .num_seconds()
        .max(0)
        .try_into()
        .unwrap_or(0);

    Json(HealthResponse {
        status: "ok",
        service: state.inner.service.clone(),
        version: state.inner.version.clone(),
        uptime_seconds,
        timestamp: now,
        channels: state.snapshot(),
    })
}

/// Channel list
///
/// @route GET /api/channels
/// @output `Json<Vec<ChannelStatus>>`
pub async fn list_channels(State(state): State<AppState>) -> Json<Vec<ChannelStatus>> {
    Json(state.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channels::{ChannelState, StatusReporter};
    use crate::core::config::ChannelConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn channel(id: &str, enabled: bool) -> ChannelConfig {
        ChannelConfig {
            id: id.to_string(),
            name: format!("Gerador {id}"),
            port: id.parse().expect("Test: port"),
            slave_address: 1,
            timeout_ms: 3000,
            poll_interval_ms: 10_000,
            enabled,
            model: "k30xl".to_string(),
        }
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("Test: request"))
            .await
            .expect("Test: response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Test: body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("Test: json")
    }

    #[tokio::test]
    async fn test_health_lists_channels() {
        let (active, active_rx) = StatusReporter::new(ChannelStatus::new(&channel("15002", true)));
        let (_idle, idle_rx) = StatusReporter::new(ChannelStatus::new(&channel("15001", false)));
        active.connected("10.0.0.9:50000");

        let app = create_router(AppState::new("gensrv", vec![idle_rx, active_rx]));
        let body = get_json(app, "/health").await;

        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "gensrv");
        let channels = body["channels"].as_array().expect("Test: array");
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0]["id"], "15001");
        assert_eq!(channels[0]["enabled"], false);
        assert_eq!(channels[0]["connected"], false);
        assert_eq!(channels[1]["connected"], true);
        assert_eq!(channels[1]["state"], "connected");
    }

    #[tokio::test]
    async fn test_channels_endpoint_tracks_updates() {
        let (reporter, rx) = StatusReporter::new(ChannelStatus::new(&channel("15002", true)));
        let app = create_router(AppState::new("gensrv", vec![rx]));

        reporter.set_state(ChannelState::Polling);
        reporter.published(Utc::now());

        let body = get_json(app, "/api/channels").await;
        assert_eq!(body[0]["state"], "polling");
        assert_eq!(body[0]["readings_published"], 1);
        assert!(body[0]["last_reading_at"].is_string());
    }
}
