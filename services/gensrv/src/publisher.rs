//! Reading publishers
//!
//! The scheduler hands every reading to a [`Publisher`]. A failed publish is
//! logged and dropped; the next cycle publishes the next reading.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::core::config::PublisherConfig;
use crate::core::register_map::Reading;
use crate::error::{GenSrvError, Result};

/// Longest response body quoted in a publish error
const ERROR_BODY_LIMIT: usize = 200;

/// What the backend said about an accepted reading
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReceipt {
    pub reading_id: Option<String>,
}

/// Destination for decoded readings. Called concurrently from every channel.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, reading: &Reading) -> Result<PublishReceipt>;

    fn name(&self) -> &str;
}

/// Flat JSON body: identifier, capture time, then every decoded field
pub fn reading_payload(reading: &Reading, identifier_field: &str) -> Result<Value> {
    let mut body = Map::new();
    body.insert(
        identifier_field.to_string(),
        Value::String(reading.channel.clone()),
    );
    body.insert(
        "captured_at".to_string(),
        Value::String(reading.captured_at.to_rfc3339()),
    );
    for (name, value) in &reading.fields {
        body.insert(name.clone(), serde_json::to_value(value)?);
    }
    Ok(Value::Object(body))
}

/// POSTs readings to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpPublisher {
    client: Client,
    url: String,
    api_key: Option<String>,
    identifier_field: String,
}

impl HttpPublisher {
    pub fn new(url: impl Into<String>, config: &PublisherConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| GenSrvError::publish(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            api_key: config.api_key.clone(),
            identifier_field: config.identifier_field.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, reading: &Reading) -> Result<PublishReceipt> {
        let payload = reading_payload(reading, &self.identifier_field)?;
        debug!("POST {} ({} fields)", self.url, reading.len());

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
            return Err(GenSrvError::publish(format!("HTTP {}: {}", status, body)));
        }

        // Body is optional; a 2xx without JSON is still a success
        let reading_id = match response.json::<Value>().await {
            Ok(body) => match body.get("reading_id") {
                Some(Value::String(id)) => Some(id.clone()),
                Some(Value::Number(id)) => Some(id.to_string()),
                _ => None,
            },
            Err(e) => {
                debug!("Publish response without JSON body: {}", e);
                None
            },
        };

        Ok(PublishReceipt { reading_id })
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Logs readings instead of sending them
#[derive(Debug, Clone)]
pub struct LogPublisher {
    identifier_field: String,
}

impl LogPublisher {
    pub fn new(identifier_field: impl Into<String>) -> Self {
        Self {
            identifier_field: identifier_field.into(),
        }
    }
}

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, reading: &Reading) -> Result<PublishReceipt> {
        let payload = reading_payload(reading, &self.identifier_field)?;
        info!("Reading: {}", payload);
        Ok(PublishReceipt::default())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// HTTP when a URL is configured, log-only otherwise
pub fn build_publisher(config: &PublisherConfig) -> Result<Arc<dyn Publisher>> {
    match config.url.as_deref().filter(|url| !url.trim().is_empty()) {
        Some(url) => {
            info!("Publishing readings to {}", url);
            if config.api_key.is_none() {
                warn!("Publisher has no api_key; requests go out unauthenticated");
            }
            Ok(Arc::new(HttpPublisher::new(url, config)?))
        },
        None => {
            info!("No publisher URL configured, readings will be logged only");
            Ok(Arc::new(LogPublisher::new(config.identifier_field.clone())))
        },
    }
}
