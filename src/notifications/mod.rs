//! Observability sink for the publication core
//!
//! Retry events, publication conflicts, "nothing to publish" ticks, delivery
//! failures and data-quality warnings are raised as [`Alert`]s and handed to
//! an [`AlertSink`]. Sinks are fire-and-forget: `notify` never blocks and
//! never fails, so observability can not stall publication.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  RetryPolicy / PublicationCoordinator /      │
//! │  PostingScheduler / Ingestor                 │
//! └──────────────────────────────────────────────┘
//!                     │ notify(Alert)
//!                     ▼
//!              ┌─────────────┐
//!              │  FanoutSink │
//!              └─────────────┘
//!          ┌──────────┼──────────┐
//!          ▼          ▼          ▼
//!    ┌─────────┐ ┌─────────┐ ┌─────────┐
//!    │ Tracing │ │ Webhook │ │ Memory  │
//!    │  Sink   │ │  Sink   │ │ (tests) │
//!    └─────────┘ └─────────┘ └─────────┘
//! ```

pub mod webhook;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use webhook::{WebhookSink, WebhookSinkConfig};

/// Severity level of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational alerts for tracking purposes
    Info,
    /// Warning alerts that require attention
    Warning,
    /// Critical alerts requiring immediate action
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    /// Get emoji representation
    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Info => "ℹ️",
            Self::Warning => "⚠️",
            Self::Critical => "🚨",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A remote call failed and is about to be retried
    Retry,
    /// Another worker claimed or posted the event first
    PublicationConflict,
    /// A tick found no due event
    NothingToPublish,
    /// Publication failed after all attempts
    DeliveryFailed,
    /// Queued events without a post time
    DataQuality,
    /// The ready queue is about to run dry
    QueueLow,
    /// A scraper source failed during ingestion
    SourceFailed,
    /// The rescheduling token changed underneath us
    TriggerConflict,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::PublicationConflict => "publication_conflict",
            Self::NothingToPublish => "nothing_to_publish",
            Self::DeliveryFailed => "delivery_failed",
            Self::DataQuality => "data_quality",
            Self::QueueLow => "queue_low",
            Self::SourceFailed => "source_failed",
            Self::TriggerConflict => "trigger_conflict",
        }
    }

    /// Default severity for the kind
    pub fn severity(&self) -> AlertSeverity {
        match self {
            Self::Retry | Self::NothingToPublish | Self::TriggerConflict => AlertSeverity::Info,
            Self::PublicationConflict
            | Self::DataQuality
            | Self::QueueLow
            | Self::SourceFailed => AlertSeverity::Warning,
            Self::DeliveryFailed => AlertSeverity::Critical,
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An alert instance with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    /// Event the alert refers to, if any
    pub event_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    /// Create an alert with the kind's default severity
    pub fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            severity: kind.severity(),
            message: message.into(),
            event_id: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_event(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    /// Single-line text form used by chat-style sinks
    pub fn summary(&self) -> String {
        match &self.event_id {
            Some(id) => format!(
                "{} [{}] {} (event {id})",
                self.severity.emoji(),
                self.kind,
                self.message
            ),
            None => format!("{} [{}] {}", self.severity.emoji(), self.kind, self.message),
        }
    }
}

/// Fire-and-forget alert destination
pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: Alert);
}

/// Shared sink handle
pub type SharedAlertSink = Arc<dyn AlertSink>;

/// Logs alerts through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl AlertSink for TracingSink {
    fn notify(&self, alert: Alert) {
        let event_id = alert.event_id.as_deref().unwrap_or("-");
        match alert.severity {
            AlertSeverity::Info => tracing::info!(
                kind = %alert.kind,
                event_id,
                metadata = ?alert.metadata,
                "{}",
                alert.message
            ),
            AlertSeverity::Warning => tracing::warn!(
                kind = %alert.kind,
                event_id,
                metadata = ?alert.metadata,
                "{}",
                alert.message
            ),
            AlertSeverity::Critical => tracing::error!(
                kind = %alert.kind,
                event_id,
                metadata = ?alert.metadata,
                "{}",
                alert.message
            ),
        }
    }
}

/// Records alerts in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: AlertKind) -> usize {
        self.alerts
            .lock()
            .map(|a| a.iter().filter(|alert| alert.kind == kind).count())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.clear();
        }
    }
}

impl AlertSink for MemorySink {
    fn notify(&self, alert: Alert) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert);
        }
    }
}

/// Forwards every alert to each inner sink
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<SharedAlertSink>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedAlertSink) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AlertSink for FanoutSink {
    fn notify(&self, alert: Alert) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.notify(alert.clone());
            }
            last.notify(alert);
        }
    }
}

/// Default sink: logs only
pub fn tracing_sink() -> SharedAlertSink {
    Arc::new(TracingSink)
}
