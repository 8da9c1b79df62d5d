//! Outbound publication channels
//!
//! A [`ChannelClient`] turns an [`Event`] into one post on an external
//! channel and returns the channel's message id. Clients never retry on their
//! own; the publication coordinator decides what is safe to retry based on
//! [`DeliveryError::is_pre_send`].

pub mod render;
pub mod telegram;
pub mod webhook;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{FixedOffset, Offset, Utc};
use thiserror::Error;

use crate::error::{ErrorCategory, EventcastErrorTrait};
use crate::models::{Event, PublishedRef};

pub use telegram::{TelegramChannel, TelegramConfig};
pub use webhook::{WebhookChannel, WebhookChannelConfig};

/// Errors that can occur while publishing to a channel
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Nothing was sent yet (image probe, request build, connection refused)
    #[error("Failed to prepare message: {0}")]
    Prepare(String),

    /// The request may have reached the channel
    #[error("Transport error: {0}")]
    Transport(String),

    /// The channel answered with a client error
    #[error("Rejected by channel (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    /// Invalid channel configuration
    #[error("Invalid channel configuration: {0}")]
    Config(String),
}

impl DeliveryError {
    /// Whether the failure happened before anything was sent
    ///
    /// Only these failures may be retried without risking a duplicate post.
    pub fn is_pre_send(&self) -> bool {
        matches!(self, Self::Prepare(_))
    }

    /// Classify a `reqwest` send failure
    pub fn from_send_error(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_builder() {
            Self::Prepare(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        if status.is_client_error() {
            Self::Rejected {
                status: status.as_u16(),
                body,
            }
        } else {
            Self::Transport(format!("HTTP {status}: {body}"))
        }
    }
}

impl EventcastErrorTrait for DeliveryError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Prepare(_) | Self::Transport(_) => true,
            Self::Rejected { status, .. } => *status == 429,
            Self::Config(_) => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Config,
            _ => ErrorCategory::Delivery,
        }
    }
}

/// A channel that can publish events
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Channel name used in receipts, logs and metrics
    fn name(&self) -> &str;

    /// Publish one event; must send at most one message per call
    async fn publish(&self, event: &Event) -> Result<PublishedRef, DeliveryError>;
}

pub type SharedChannel = Arc<dyn ChannelClient>;

/// Logs posts instead of sending them, for dry runs
#[derive(Debug)]
pub struct LogChannel {
    offset: FixedOffset,
    published: Mutex<Vec<String>>,
}

impl Default for LogChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl LogChannel {
    pub fn new() -> Self {
        Self::with_offset(Utc.fix())
    }

    /// Render dates at `offset`
    pub fn with_offset(offset: FixedOffset) -> Self {
        Self {
            offset,
            published: Mutex::new(Vec::new()),
        }
    }

    /// Ids of the events "published" so far
    pub fn published(&self) -> Vec<String> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChannelClient for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, event: &Event) -> Result<PublishedRef, DeliveryError> {
        let text = render::render_post(event, self.offset, None);
        tracing::info!(event_id = %event.event_id, "Dry run post:\n{text}");

        let mut published = self
            .published
            .lock()
            .map_err(|_| DeliveryError::Prepare("log channel lock poisoned".into()))?;
        published.push(event.event_id.clone());
        Ok(PublishedRef::new(
            self.name(),
            format!("dry-run-{}", published.len()),
        ))
    }
}
