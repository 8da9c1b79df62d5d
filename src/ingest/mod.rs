//! Event ingestion
//!
//! For every configured source: fetch upcoming events through its
//! [`ScraperAdapter`], drop events matching the source's bad keywords,
//! deduplicate against every known event id and insert the rest. Approved
//! sources go straight to the publication queue; others wait for approval.
//!
//! A failing source is alerted and skipped; it never stops the other
//! sources.

pub mod feed;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::ParameterCache;
use crate::error::{ErrorCategory, EventcastErrorTrait};
use crate::metrics;
use crate::models::{Event, EventStatus, RawEvent};
use crate::notifications::{Alert, AlertKind, SharedAlertSink};
use crate::storage::{Deduplicator, SharedEventRepository};
use crate::utils::{RetryPolicies, RetryPolicy};

pub use feed::{fetch_parameters, JsonFeedScraper};

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by scraper adapters
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Source returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Failed to parse feed: {0}")]
    Parse(String),

    #[error("Invalid source configuration: {0}")]
    Config(String),
}

impl EventcastErrorTrait for ScrapeError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Parse(_) | Self::Config(_) => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Config,
            _ => ErrorCategory::Network,
        }
    }
}

// ============================================================================
// Adapter Boundary
// ============================================================================

/// Window of event start times to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// `[now, now + days]`
    pub fn ahead(now: DateTime<Utc>, days: u32) -> Self {
        Self::new(now, now + Duration::days(i64::from(days)))
    }
}

/// One external event source
#[async_trait]
pub trait ScraperAdapter: Send + Sync {
    /// Source name; prefixes derived event ids
    fn source(&self) -> &str;

    async fn fetch(&self, range: &TimeRange) -> Result<Vec<RawEvent>, ScrapeError>;
}

pub type SharedScraper = Arc<dyn ScraperAdapter>;

// ============================================================================
// Configuration
// ============================================================================

/// A configured event source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    /// JSON feed endpoint
    pub feed_url: String,

    /// Events of approved sources skip manual approval
    #[serde(default)]
    pub approved: bool,

    /// How many days ahead to fetch
    #[serde(default = "default_days_ahead")]
    pub days_ahead: u32,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    /// Upper bound on pages per fetch
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Attempts per fetch before the source is reported as failed
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,

    /// JSON document with the source's bad keywords
    #[serde(default)]
    pub parameters_url: Option<String>,
}

fn default_days_ahead() -> u32 {
    7
}

fn default_page_size() -> u32 {
    100
}

fn default_requests_per_second() -> u32 {
    2
}

fn default_max_pages() -> u32 {
    50
}

fn default_fetch_attempts() -> u32 {
    3
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, feed_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            feed_url: feed_url.into(),
            approved: false,
            days_ahead: default_days_ahead(),
            page_size: default_page_size(),
            requests_per_second: default_requests_per_second(),
            max_pages: default_max_pages(),
            fetch_attempts: default_fetch_attempts(),
            parameters_url: None,
        }
    }

    pub fn approved(mut self) -> Self {
        self.approved = true;
        self
    }

    pub fn with_parameters_url(mut self, url: impl Into<String>) -> Self {
        self.parameters_url = Some(url.into());
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Source name cannot be empty".to_string());
        }
        if !crate::utils::is_http_url(&self.feed_url) {
            return Err(format!(
                "Source '{}' feed URL must be an http(s) URL",
                self.name
            ));
        }
        if let Some(url) = &self.parameters_url {
            if !crate::utils::is_http_url(url) {
                return Err(format!(
                    "Source '{}' parameters URL must be an http(s) URL",
                    self.name
                ));
            }
        }
        if self.page_size == 0 || self.max_pages == 0 || self.requests_per_second == 0 {
            return Err(format!(
                "Source '{}' page_size, max_pages and requests_per_second must be positive",
                self.name
            ));
        }
        Ok(())
    }

    /// Status given to fresh events of this source
    pub fn target_status(&self) -> EventStatus {
        if self.approved {
            EventStatus::ReadyToPost
        } else {
            EventStatus::PendingApproval
        }
    }
}

/// Per-source filtering parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceParameters {
    #[serde(default)]
    pub bad_keywords: Vec<String>,
}

impl SourceParameters {
    /// First bad keyword found in the title or body
    pub fn blocked_by(&self, event: &Event) -> Option<&str> {
        let title = event.title.to_lowercase();
        let body = event.body.to_lowercase();
        self.bad_keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .find(|k| {
                let k = k.to_lowercase();
                title.contains(&k) || body.contains(&k)
            })
    }
}

// ============================================================================
// Ingestor
// ============================================================================

/// What happened to one source in an ingestion run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub source: String,
    pub fetched: usize,
    /// Dropped by bad keywords
    pub filtered: usize,
    pub already_known: usize,
    pub batch_duplicates: usize,
    pub inserted: usize,
    pub conflicts: usize,
    /// Set when the source failed and was skipped
    pub error: Option<String>,
}

impl IngestReport {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

struct Source {
    config: SourceConfig,
    adapter: SharedScraper,
}

pub struct Ingestor {
    repo: SharedEventRepository,
    sources: Vec<Source>,
    parameters: Option<ParameterCache>,
    http: reqwest::Client,
    policies: RetryPolicies,
    sink: SharedAlertSink,
}

impl Ingestor {
    pub fn new(repo: SharedEventRepository, sink: SharedAlertSink) -> Self {
        Self {
            repo,
            sources: Vec::new(),
            parameters: None,
            http: reqwest::Client::new(),
            policies: RetryPolicies::default(),
            sink,
        }
    }

    pub fn with_source(mut self, config: SourceConfig, adapter: SharedScraper) -> Self {
        self.sources.push(Source { config, adapter });
        self
    }

    /// Cache source parameters in `cache`; without it they are fetched every run
    pub fn with_parameter_cache(mut self, cache: ParameterCache) -> Self {
        self.parameters = Some(cache);
        self
    }

    pub fn with_policies(mut self, policies: RetryPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Ingest every source once
    pub async fn run(&self, now: DateTime<Utc>) -> Vec<IngestReport> {
        let mut reports = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            let mut report = IngestReport::new(&source.config.name);
            if let Err(e) = self.ingest_source(source, now, &mut report).await {
                warn!(source = %source.config.name, error = %e, "Source skipped");
                metrics::record_source_failure(&source.config.name);
                self.sink.notify(
                    Alert::new(
                        AlertKind::SourceFailed,
                        format!("Source {} failed: {e}", source.config.name),
                    )
                    .with_metadata("source", &source.config.name),
                );
                report.error = Some(e.to_string());
            }
            reports.push(report);
        }

        let inserted: usize = reports.iter().map(|r| r.inserted).sum();
        info!(sources = reports.len(), inserted, "Ingestion finished");
        reports
    }

    async fn ingest_source(
        &self,
        source: &Source,
        now: DateTime<Utc>,
        report: &mut IngestReport,
    ) -> crate::Result<()> {
        let name = source.config.name.as_str();
        let range = TimeRange::ahead(now, source.config.days_ahead);

        let fetch_policy = self.fetch_policy(&source.config);
        let raw = fetch_policy
            .run("fetch_source", || source.adapter.fetch(&range))
            .await?;
        report.fetched = raw.len();

        let parameters = self.parameters_for(&source.config).await;
        let mut events = Vec::with_capacity(raw.len());
        for raw_event in raw {
            let event = raw_event.into_event(name, now);
            if let Some(keyword) = parameters.blocked_by(&event) {
                debug!(source = name, event_id = %event.event_id, keyword, "Dropping event with bad keyword");
                report.filtered += 1;
                continue;
            }
            events.push(event);
        }

        // re-read per source so earlier sources in this run count as known
        let known = self
            .policies
            .read
            .run("existing_ids", || self.repo.existing_ids())
            .await?;
        let outcome = Deduplicator::check(&events, &known);
        report.already_known = outcome.already_known;
        report.batch_duplicates = outcome.batch_duplicates;
        metrics::record_dedup_results(
            name,
            outcome.new_count(),
            outcome.already_known + outcome.batch_duplicates,
        );

        if outcome.fresh.is_empty() {
            debug!(source = name, fetched = report.fetched, "No new events");
            return Ok(());
        }

        let status = source.config.target_status();
        let inserted = self
            .policies
            .write
            .run("insert_new", || {
                self.repo.insert_new(&outcome.fresh, now, status)
            })
            .await?;
        report.inserted = inserted.inserted_count();
        report.conflicts = inserted.conflicts.len();
        metrics::record_inserted(status.as_str(), report.inserted);

        info!(
            source = name,
            fetched = report.fetched,
            inserted = report.inserted,
            status = status.as_str(),
            dedup_ratio = format!("{:.2}", outcome.dedup_ratio()),
            "Source ingested"
        );
        Ok(())
    }

    fn fetch_policy(&self, config: &SourceConfig) -> RetryPolicy {
        let policy = RetryPolicy::bounded(config.fetch_attempts);
        match self.policies.read.sink() {
            Some(sink) => policy.with_sink(sink),
            None => policy,
        }
    }

    async fn parameters_for(&self, config: &SourceConfig) -> SourceParameters {
        let Some(url) = config.parameters_url.as_deref() else {
            return SourceParameters::default();
        };

        let loaded = match &self.parameters {
            Some(cache) => {
                cache
                    .get_or_load(&config.name, || fetch_parameters(&self.http, url))
                    .await
            }
            None => fetch_parameters(&self.http, url).await,
        };

        loaded.unwrap_or_else(|e| {
            warn!(source = %config.name, error = %e, "Source parameters unavailable, not filtering");
            SourceParameters::default()
        })
    }
}
