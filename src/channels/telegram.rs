//! Telegram Bot API channel
//!
//! Events with an image are sent with `sendPhoto` (the post becomes the
//! caption); others with `sendMessage`. The image URL is probed first so an
//! unreachable poster fails before anything is sent.

use std::time::Duration;

use async_trait::async_trait;
use chrono::FixedOffset;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::render::{render_post, CAPTION_LIMIT, MESSAGE_LIMIT};
use super::{ChannelClient, DeliveryError};
use crate::models::{Event, PublishedRef};

/// Telegram channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,

    /// Channel id (`-100...`) or `@channel_name`
    pub chat_id: String,

    /// Bot API base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_timeout() -> u64 {
    10
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            api_base: default_api_base(),
            timeout_secs: default_timeout(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.bot_token.trim().is_empty() {
            return Err("Telegram bot token cannot be empty".to_string());
        }
        if self.chat_id.trim().is_empty() {
            return Err("Telegram chat id cannot be empty".to_string());
        }
        url::Url::parse(&self.api_base).map_err(|e| format!("Invalid Telegram API base: {e}"))?;
        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<SentMessage>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

pub struct TelegramChannel {
    config: TelegramConfig,
    client: Client,
    offset: FixedOffset,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig, offset: FixedOffset) -> Result<Self, DeliveryError> {
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

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    /// Check that the poster is reachable and is an image
    async fn probe_image(&self, url: &str) -> Result<(), DeliveryError> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| DeliveryError::Prepare(format!("image probe failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Prepare(format!(
                "image probe returned HTTP {status}"
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.is_empty() && !content_type.starts_with("image/") {
            return Err(DeliveryError::Prepare(format!(
                "poster is not an image ({content_type})"
            )));
        }
        Ok(())
    }

    async fn call(&self, method: &str, payload: serde_json::Value) -> Result<i64, DeliveryError> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(&payload)
            .send()
            .await
            .map_err(DeliveryError::from_send_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DeliveryError::Transport(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            let description = serde_json::from_str::<ApiResponse>(&body)
                .ok()
                .and_then(|r| r.description)
                .unwrap_or(body);
            return Err(DeliveryError::from_status(status, description));
        }

        let parsed: ApiResponse = serde_json::from_str(&body)
            .map_err(|e| DeliveryError::Transport(format!("unexpected response: {e}")))?;

        match (parsed.ok, parsed.result) {
            (true, Some(message)) => Ok(message.message_id),
            _ => Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body: parsed.description.unwrap_or_else(|| "ok=false".to_string()),
            }),
        }
    }
}

#[async_trait]
impl ChannelClient for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn publish(&self, event: &Event) -> Result<PublishedRef, DeliveryError> {
        let message_id = match event.image_ref.as_deref() {
            Some(image) => {
                self.probe_image(image).await?;
                let caption = render_post(event, self.offset, Some(CAPTION_LIMIT));
                self.call(
                    "sendPhoto",
                    serde_json::json!({
                        "chat_id": self.config.chat_id,
                        "photo": image,
                        "caption": caption,
                        "parse_mode": "Markdown",
                    }),
                )
                .await?
            }
            None => {
                let text = render_post(event, self.offset, Some(MESSAGE_LIMIT));
                self.call(
                    "sendMessage",
                    serde_json::json!({
                        "chat_id": self.config.chat_id,
                        "text": text,
                        "parse_mode": "Markdown",
                    }),
                )
                .await?
            }
        };

        tracing::info!(event_id = %event.event_id, message_id, "Posted to Telegram");
        Ok(PublishedRef::new(self.name(), message_id.to_string()))
    }
}
