//! Publication coordinator
//!
//! One `tick` publishes at most one event:
//!
//! ```text
//! next_due_event ──► claim ──► re-read ──► primary.publish ──► mark_posted (CAS) ──► release claim
//!       │              │           │              │                   │
//!       ▼              ▼           ▼              ▼                   ▼
//!     Idle         Conflict    Conflict     DeliveryFailed     Conflict / Published ──► mirrors
//! ```
//!
//! The claim is a short-lived key in the shared key/value store. It keeps two
//! concurrent ticks from both sending the same event; `mark_posted` stays the
//! only status transition. The event is read again once the claim is held:
//! a worker whose selection went stale may win a claim that was released
//! right after another worker's `mark_posted`. A claim left behind by a
//! crashed process expires after `claim_ttl` and the event becomes
//! publishable again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::SharedKeyValueStore;
use crate::channels::{DeliveryError, SharedChannel};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::metrics;
use crate::models::{Event, EventStatus, PublishedRef};
use crate::notifications::{Alert, AlertKind, AlertSeverity, SharedAlertSink};
use crate::storage::SharedEventRepository;
use crate::utils::RetryPolicies;

/// Tunables of the publication step
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// How far ahead of `post_time` an event may be published
    pub due_window: chrono::Duration,
    /// Lifetime of a publication claim
    pub claim_ttl: Duration,
    /// `QueueLow` is raised at or below this many ready events
    pub queue_low_watermark: usize,
    /// Identifies this process in claim values
    pub owner: String,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            due_window: chrono::Duration::minutes(5),
            claim_ttl: Duration::from_secs(120),
            queue_low_watermark: 1,
            owner: default_owner(),
        }
    }
}

impl PublisherSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            due_window: chrono::Duration::seconds(config.due_window_secs as i64),
            claim_ttl: Duration::from_secs(config.claim_ttl_secs),
            queue_low_watermark: config.queue_low_watermark,
            owner: default_owner(),
        }
    }
}

fn default_owner() -> String {
    format!("eventcast-{}", std::process::id())
}

/// Where a tick lost its event to another worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStage {
    /// The publication claim is held elsewhere
    Claim,
    /// The claim was won but the event had already left `ReadyToPost`
    Status,
    /// The posted-state CAS found the event already posted
    MarkPosted,
}

impl ConflictStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Status => "status",
            Self::MarkPosted => "mark_posted",
        }
    }
}

/// Result of one tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing due within the window
    Idle,
    /// The event was sent and marked posted
    Published {
        event_id: String,
        receipt: PublishedRef,
    },
    /// Another worker claimed or posted the event first
    Conflict {
        event_id: String,
        stage: ConflictStage,
    },
    /// Sending failed after the allowed attempts; the event stays ready
    DeliveryFailed { event_id: String, error: String },
}

impl TickOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Published { .. } => "published",
            Self::Conflict { .. } => "conflict",
            Self::DeliveryFailed { .. } => "delivery_failed",
        }
    }

    pub fn event_id(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Published { event_id, .. }
            | Self::Conflict { event_id, .. }
            | Self::DeliveryFailed { event_id, .. } => Some(event_id),
        }
    }
}

pub struct PublicationCoordinator {
    repo: SharedEventRepository,
    claims: SharedKeyValueStore,
    primary: SharedChannel,
    mirrors: Vec<SharedChannel>,
    policies: RetryPolicies,
    sink: SharedAlertSink,
    settings: PublisherSettings,
}

impl PublicationCoordinator {
    pub fn new(
        repo: SharedEventRepository,
        claims: SharedKeyValueStore,
        primary: SharedChannel,
        sink: SharedAlertSink,
    ) -> Self {
        Self {
            repo,
            claims,
            primary,
            mirrors: Vec::new(),
            policies: RetryPolicies::default(),
            sink,
            settings: PublisherSettings::default(),
        }
    }

    /// Also send each published event to `channel`, once
    pub fn with_mirror(mut self, channel: SharedChannel) -> Self {
        self.mirrors.push(channel);
        self
    }

    pub fn with_policies(mut self, policies: RetryPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_settings(mut self, settings: PublisherSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    /// Latest time a claim taken at `now` can still be held
    pub fn claim_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.settings.claim_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        now + ttl
    }

    fn claim_key(event_id: &str) -> String {
        format!("claim:{event_id}")
    }

    /// Publish the next due event, if any
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        let outcome = self.tick_inner(now).await;
        metrics::record_tick(match &outcome {
            Ok(o) => o.as_str(),
            Err(_) => "error",
        });
        outcome
    }

    async fn tick_inner(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        let due_window = self.settings.due_window;
        let next = self
            .policies
            .read
            .run("next_due_event", || self.repo.next_due_event(now, due_window))
            .await?;

        let Some(event) = next else {
            info!(now = %now, "Nothing to publish");
            self.sink.notify(
                Alert::new(AlertKind::NothingToPublish, "Nothing to publish")
                    .with_metadata("now", now.to_rfc3339()),
            );
            return Ok(TickOutcome::Idle);
        };

        let claim_key = Self::claim_key(&event.event_id);
        let claim_value = format!("{}:{}", self.settings.owner, Uuid::new_v4());
        if !self.claim(&claim_key, &claim_value).await? {
            return Ok(self.conflict(&event, ConflictStage::Claim));
        }

        if !self.still_ready(&event).await? {
            self.release(&claim_key, &claim_value).await;
            return Ok(self.conflict(&event, ConflictStage::Status));
        }

        debug!(event_id = %event.event_id, channel = self.primary.name(), "Publishing event");
        let sent = self
            .policies
            .publish
            .run_if(
                "publish",
                || self.primary.publish(&event),
                DeliveryError::is_pre_send,
            )
            .await;

        let receipt = match sent {
            Ok(receipt) => receipt,
            Err(e) => {
                self.release(&claim_key, &claim_value).await;
                return Ok(self.delivery_failed(&event, self.primary.name(), &e));
            }
        };
        metrics::record_publication(self.primary.name());

        // a failed write keeps the claim until it expires
        let posted = self
            .policies
            .write
            .run("mark_posted", || self.repo.mark_posted(&event.event_id, &receipt))
            .await?;

        self.release(&claim_key, &claim_value).await;

        if !posted {
            return Ok(self.conflict(&event, ConflictStage::MarkPosted));
        }

        info!(
            event_id = %event.event_id,
            channel = %receipt.channel,
            message_id = %receipt.channel_message_id,
            "Event published"
        );

        self.mirror(&event).await;

        Ok(TickOutcome::Published {
            event_id: event.event_id,
            receipt,
        })
    }

    async fn claim(&self, key: &str, value: &str) -> Result<bool> {
        let ttl = self.settings.claim_ttl;
        let won = self
            .policies
            .write
            .run("claim_event", || self.claims.set_if(key, None, Some(value), Some(ttl)))
            .await?;
        if won {
            return Ok(true);
        }

        // a retried claim may have landed on an earlier attempt
        let current = self
            .policies
            .read
            .run("read_claim", || self.claims.get(key))
            .await?;
        Ok(current.as_deref() == Some(value))
    }

    /// The claimed event is still waiting to be posted
    async fn still_ready(&self, event: &Event) -> Result<bool> {
        let current = self
            .policies
            .read
            .run("reread_event", || self.repo.get(&event.event_id))
            .await?;
        Ok(current.is_some_and(|e| e.status == EventStatus::ReadyToPost))
    }

    async fn release(&self, key: &str, value: &str) {
        let released = self
            .policies
            .write
            .run("release_claim", || self.claims.set_if(key, Some(value), None, None))
            .await;
        match released {
            Ok(true) => {}
            Ok(false) => warn!(key, "Publication claim was already gone"),
            Err(e) => warn!(key, error = %e, "Failed to release publication claim"),
        }
    }

    fn conflict(&self, event: &Event, stage: ConflictStage) -> TickOutcome {
        let stage_name = stage.as_str();
        warn!(event_id = %event.event_id, stage = stage_name, "Publication conflict");
        metrics::record_conflict(stage_name);
        self.sink.notify(
            Alert::new(
                AlertKind::PublicationConflict,
                format!("Event was taken by another worker at {stage_name}"),
            )
            .with_event(&event.event_id)
            .with_metadata("stage", stage_name),
        );
        TickOutcome::Conflict {
            event_id: event.event_id.clone(),
            stage,
        }
    }

    fn delivery_failed(&self, event: &Event, channel: &str, error: &DeliveryError) -> TickOutcome {
        warn!(event_id = %event.event_id, channel, error = %error, "Delivery failed");
        metrics::record_delivery_failure(channel);
        self.sink.notify(
            Alert::new(AlertKind::DeliveryFailed, format!("Failed to publish: {error}"))
                .with_event(&event.event_id)
                .with_metadata("channel", channel),
        );
        TickOutcome::DeliveryFailed {
            event_id: event.event_id.clone(),
            error: error.to_string(),
        }
    }

    async fn mirror(&self, event: &Event) {
        for channel in &self.mirrors {
            match channel.publish(event).await {
                Ok(receipt) => {
                    metrics::record_publication(channel.name());
                    debug!(event_id = %event.event_id, channel = channel.name(), message_id = %receipt.channel_message_id, "Mirrored event");
                }
                Err(e) => {
                    warn!(event_id = %event.event_id, channel = channel.name(), error = %e, "Mirror delivery failed");
                    metrics::record_delivery_failure(channel.name());
                    self.sink.notify(
                        Alert::new(AlertKind::DeliveryFailed, format!("Mirror failed: {e}"))
                            .with_severity(AlertSeverity::Warning)
                            .with_event(&event.event_id)
                            .with_metadata("channel", channel.name()),
                    );
                }
            }
        }
    }

    /// Alert when the ready queue is about to run dry; returns the ready count
    pub async fn check_queue_depth(&self) -> Result<usize> {
        let counts = self
            .policies
            .read
            .run("count_by_status", || self.repo.count_by_status())
            .await?;
        let ready = counts.ready_to_post;
        metrics::set_ready_queue_depth(ready);

        if ready <= self.settings.queue_low_watermark {
            let message = match ready {
                0 => "No events for posting".to_string(),
                1 => "Posting last event".to_string(),
                n => format!("{n} events left for posting"),
            };
            warn!(ready, "{message}");
            self.sink.notify(
                Alert::new(AlertKind::QueueLow, message).with_metadata("ready", ready),
            );
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{create_memory_store, KeyValueStore};
    use crate::channels::{ChannelClient, LogChannel};
    use crate::notifications::MemorySink;
    use crate::storage::create_memory_repository;
    use crate::utils::RetryPolicy;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fails the first `failures` calls with the error built by `make_error`
    struct FlakyChannel {
        calls: AtomicU32,
        failures: u32,
        make_error: fn() -> DeliveryError,
    }

    impl FlakyChannel {
        fn new(failures: u32, make_error: fn() -> DeliveryError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                make_error,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChannelClient for FlakyChannel {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn publish(&self, event: &Event) -> std::result::Result<PublishedRef, DeliveryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err((self.make_error)());
            }
            Ok(PublishedRef::new("flaky", format!("{}-{n}", event.event_id)))
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    fn queued(id: &str, post_time: DateTime<Utc>) -> Event {
        let from = at(20, 0);
        Event::new(id, "test", id, format!("https://example.com/{id}"), from, from)
            .with_post_time(post_time)
    }

    struct Fixture {
        repo: SharedEventRepository,
        claims: SharedKeyValueStore,
        sink: Arc<MemorySink>,
    }

    async fn fixture(events: &[Event]) -> Fixture {
        let repo = create_memory_repository();
        repo.insert_new(events, at(0, 0), EventStatus::ReadyToPost)
            .await
            .unwrap();
        Fixture {
            repo,
            claims: create_memory_store(),
            sink: Arc::new(MemorySink::new()),
        }
    }

    fn coordinator(f: &Fixture, primary: SharedChannel) -> PublicationCoordinator {
        PublicationCoordinator::new(f.repo.clone(), f.claims.clone(), primary, f.sink.clone())
            .with_policies(RetryPolicies {
                read: RetryPolicy::bounded(1),
                write: RetryPolicy::bounded(1),
                publish: RetryPolicy::bounded(3),
            })
    }

    #[tokio::test]
    async fn test_idle_tick_alerts_nothing_to_publish() {
        let f = fixture(&[queued("E1", at(12, 0))]).await;
        let coordinator = coordinator(&f, Arc::new(LogChannel::new()));

        let outcome = coordinator.tick(at(10, 0)).await.unwrap();

        assert_eq!(outcome, TickOutcome::Idle);
        assert_eq!(f.sink.count(AlertKind::NothingToPublish), 1);
    }

    #[tokio::test]
    async fn test_publishes_due_event() {
        let f = fixture(&[queued("E1", at(10, 3))]).await;
        let channel = Arc::new(LogChannel::new());
        let coordinator = coordinator(&f, channel.clone());

        let outcome = coordinator.tick(at(10, 0)).await.unwrap();

        assert!(matches!(outcome, TickOutcome::Published { ref event_id, .. } if event_id == "E1"));
        assert_eq!(channel.published(), vec!["E1"]);
        let stored = f.repo.get("E1").await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Posted);
        assert_eq!(stored.channel_message_id.as_deref(), Some("dry-run-1"));
        // claim released
        assert!(f.claims.get("claim:E1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_held_claim_is_a_conflict() {
        let f = fixture(&[queued("E1", at(10, 0))]).await;
        f.claims
            .set("claim:E1", "other-worker", None)
            .await
            .unwrap();
        let channel = Arc::new(LogChannel::new());
        let coordinator = coordinator(&f, channel.clone());

        let outcome = coordinator.tick(at(10, 0)).await.unwrap();

        assert_eq!(
            outcome,
            TickOutcome::Conflict {
                event_id: "E1".into(),
                stage: ConflictStage::Claim,
            }
        );
        assert!(channel.published().is_empty());
        assert_eq!(f.sink.count(AlertKind::PublicationConflict), 1);
        assert_eq!(
            f.repo.get("E1").await.unwrap().unwrap().status,
            EventStatus::ReadyToPost
        );
    }

    #[tokio::test]
    async fn test_pre_send_failures_are_retried() {
        let f = fixture(&[queued("E1", at(10, 0))]).await;
        let channel = Arc::new(FlakyChannel::new(2, || {
            DeliveryError::Prepare("image probe timed out".into())
        }));
        let coordinator = coordinator(&f, channel.clone());

        let outcome = coordinator.tick(at(10, 0)).await.unwrap();

        assert!(matches!(outcome, TickOutcome::Published { .. }));
        assert_eq!(channel.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_delivery_keeps_event_ready() {
        let f = fixture(&[queued("E1", at(10, 0))]).await;
        let channel = Arc::new(FlakyChannel::new(10, || {
            DeliveryError::Prepare("image probe timed out".into())
        }));
        let coordinator = coordinator(&f, channel.clone());

        let outcome = coordinator.tick(at(10, 0)).await.unwrap();

        assert!(matches!(outcome, TickOutcome::DeliveryFailed { .. }));
        assert_eq!(channel.calls(), 3);
        assert_eq!(f.sink.count(AlertKind::DeliveryFailed), 1);
        assert_eq!(
            f.repo.get("E1").await.unwrap().unwrap().status,
            EventStatus::ReadyToPost
        );
        assert!(f.claims.get("claim:E1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_post_send_failure_is_not_retried() {
        let f = fixture(&[queued("E1", at(10, 0))]).await;
        let channel = Arc::new(FlakyChannel::new(10, || {
            DeliveryError::Transport("connection reset".into())
        }));
        let coordinator = coordinator(&f, channel.clone());

        let outcome = coordinator.tick(at(10, 0)).await.unwrap();

        assert!(matches!(outcome, TickOutcome::DeliveryFailed { .. }));
        assert_eq!(channel.calls(), 1);
    }

    #[tokio::test]
    async fn test_mirrors_after_success_and_failure_is_isolated() {
        let f = fixture(&[queued("E1", at(10, 0))]).await;
        let mirror_ok = Arc::new(LogChannel::new());
        let mirror_bad = Arc::new(FlakyChannel::new(10, || DeliveryError::Transport("down".into())));
        let coordinator = coordinator(&f, Arc::new(LogChannel::new()))
            .with_mirror(mirror_bad.clone())
            .with_mirror(mirror_ok.clone());

        let outcome = coordinator.tick(at(10, 0)).await.unwrap();

        assert!(matches!(outcome, TickOutcome::Published { .. }));
        assert_eq!(mirror_bad.calls(), 1);
        assert_eq!(mirror_ok.published(), vec!["E1"]);
        assert_eq!(f.sink.count(AlertKind::DeliveryFailed), 1);
    }

    #[tokio::test]
    async fn test_check_queue_depth() {
        let f = fixture(&[queued("E1", at(10, 0))]).await;
        let coordinator = coordinator(&f, Arc::new(LogChannel::new()));

        assert_eq!(coordinator.check_queue_depth().await.unwrap(), 1);
        let alert = &f.sink.alerts()[0];
        assert_eq!(alert.kind, AlertKind::QueueLow);
        assert_eq!(alert.message, "Posting last event");

        coordinator.tick(at(10, 0)).await.unwrap();
        f.sink.clear();
        assert_eq!(coordinator.check_queue_depth().await.unwrap(), 0);
        assert_eq!(f.sink.alerts()[0].message, "No events for posting");
    }
}
