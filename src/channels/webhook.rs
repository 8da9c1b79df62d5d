//! Webhook publication channel
//!
//! POSTs the event as JSON together with the rendered post text. The message
//! id is taken from the `id` field of the JSON response when present.

use std::time::Duration;

use async_trait::async_trait;
use chrono::FixedOffset;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::render::render_post;
use super::{ChannelClient, DeliveryError};
use crate::models::{Event, PublishedRef};

/// Webhook channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChannelConfig {
    /// Channel name used in receipts and metrics
    pub name: String,

    /// Webhook URL endpoint
    pub url: String,

    /// Optional authentication token (sent as Bearer token)
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    10
}

impl WebhookChannelConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            auth_token: None,
            timeout_secs: default_timeout(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Webhook channel name cannot be empty".to_string());
        }
        if !crate::utils::is_http_url(&self.url) {
            return Err(format!("Webhook URL must be an http(s) URL: '{}'", self.url));
        }
        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

pub struct WebhookChannel {
    config: WebhookChannelConfig,
    client: Client,
    offset: FixedOffset,
}

impl WebhookChannel {
    pub fn new(config: WebhookChannelConfig, offset: FixedOffset) -> Result<Self, DeliveryError> {
        config.validate().map_err(DeliveryError::Config)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DeliveryError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            config,
            client,
            offset,
        })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn build_payload(&self, event: &Event) -> serde_json::Value {
        serde_json::json!({
            "event_id": event.event_id,
            "source": event.source,
            "title": event.title,
            "body": event.body,
            "address": event.address,
            "price": event.price,
            "image": event.image_ref,
            "url": event.url,
            "from_time": event.from_time.to_rfc3339(),
            "to_time": event.to_time.to_rfc3339(),
            "text": render_post(event, self.offset, None),
        })
    }
}

/// Message id from a response body: `id` as string or number
fn message_id(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("id")? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl ChannelClient for WebhookChannel {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn publish(&self, event: &Event) -> Result<PublishedRef, DeliveryError> {
        let mut request = self.client.post(&self.config.url);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .json(&self.build_payload(event))
            .send()
            .await
            .map_err(DeliveryError::from_send_error)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(DeliveryError::from_status(status, body));
        }

        let id = message_id(&body).unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::info!(event_id = %event.event_id, channel = %self.config.name, message_id = %id, "Posted to webhook");
        Ok(PublishedRef::new(self.name(), id))
    }
}
