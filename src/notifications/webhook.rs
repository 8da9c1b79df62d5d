//! Operator webhook sink
//!
//! Posts alerts as JSON to an HTTP endpoint (a chat bot relay, an incident
//! tool, a developer channel). Delivery runs on a spawned task; failures are
//! logged and dropped.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{Alert, AlertSeverity, AlertSink};

/// Webhook sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSinkConfig {
    /// Webhook URL endpoint
    pub url: String,

    /// Optional authentication token (sent as Bearer token)
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Alerts below this severity are not forwarded
    #[serde(default = "default_min_severity")]
    pub min_severity: AlertSeverity,
}

fn default_timeout() -> u64 {
    10
}

fn default_min_severity() -> AlertSeverity {
    AlertSeverity::Warning
}

impl WebhookSinkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            timeout_secs: default_timeout(),
            min_severity: default_min_severity(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_min_severity(mut self, severity: AlertSeverity) -> Self {
        self.min_severity = severity;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Webhook URL cannot be empty".to_string());
        }
        url::Url::parse(&self.url).map_err(|e| format!("Invalid webhook URL: {e}"))?;
        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

fn severity_rank(severity: AlertSeverity) -> u8 {
    match severity {
        AlertSeverity::Info => 0,
        AlertSeverity::Warning => 1,
        AlertSeverity::Critical => 2,
    }
}

/// Sends alerts to a webhook without blocking the caller
pub struct WebhookSink {
    config: WebhookSinkConfig,
    client: Client,
}

impl WebhookSink {
    pub fn new(config: WebhookSinkConfig) -> Result<Self, String> {
        config.validate()?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;

        Ok(Self { config, client })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn build_payload(alert: &Alert) -> serde_json::Value {
        serde_json::json!({
            "id": alert.id,
            "kind": alert.kind.as_str(),
            "severity": alert.severity.as_str(),
            "message": alert.message,
            "text": alert.summary(),
            "event_id": alert.event_id,
            "metadata": alert.metadata,
            "created_at": alert.created_at.to_rfc3339(),
        })
    }

    /// Deliver one alert and wait for the response
    pub async fn deliver(&self, alert: &Alert) -> Result<(), String> {
        let mut request = self.client.post(&self.config.url);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .json(&Self::build_payload(alert))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {status}"))
        }
    }
}

impl AlertSink for WebhookSink {
    fn notify(&self, alert: Alert) {
        if severity_rank(alert.severity) < severity_rank(self.config.min_severity) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(kind = %alert.kind, "No async runtime, dropping webhook alert");
            return;
        };

        let sink = Self {
            config: self.config.clone(),
            client: self.client.clone(),
        };
        handle.spawn(async move {
            if let Err(e) = sink.deliver(&alert).await {
                tracing::warn!(url = %sink.config.url, error = %e, "Failed to deliver alert webhook");
            }
        });
    }
}
