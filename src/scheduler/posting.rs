//! Posting scheduler
//!
//! Keeps exactly one publish trigger outstanding, timed for the earliest
//! ready event. The trigger is recorded in a [`ReschedulingToken`] in the
//! shared key/value store, so any process (or a restarted one) can confirm or
//! replace it. Firing a trigger runs a publication tick and re-derives the
//! next trigger, which keeps the loop self-correcting.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::metrics;
use crate::models::ReschedulingToken;
use crate::notifications::{Alert, AlertKind, SharedAlertSink};
use crate::publisher::{ConflictStage, PublicationCoordinator, TickOutcome};
use crate::storage::SharedEventRepository;
use crate::utils::RetryPolicies;

use super::error::SchedulerResult;
use super::token::{StoredToken, TokenStore};
use super::trigger::{SharedTriggerQueue, Trigger, TriggerHandle, TriggerPayload};

/// Tunables of the rescheduling loop
#[derive(Debug, Clone, Copy)]
pub struct PostingSettings {
    /// A token this close to the target is left alone
    pub tolerance: Duration,
    /// Lookback so events due in the current tick window stay targeted
    pub due_window: Duration,
    /// Minimum delay before the next trigger after a failed tick
    pub failure_backoff: Duration,
}

impl Default for PostingSettings {
    fn default() -> Self {
        Self {
            tolerance: Duration::minutes(3),
            due_window: Duration::minutes(5),
            failure_backoff: Duration::seconds(60),
        }
    }
}

impl PostingSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            tolerance: Duration::seconds(config.reschedule_tolerance_secs as i64),
            due_window: Duration::seconds(config.due_window_secs as i64),
            failure_backoff: Duration::seconds(config.failure_backoff_secs as i64),
        }
    }
}

/// What a `reschedule` call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RescheduleOutcome {
    /// Nothing to publish and no token stored
    Idle,
    /// Nothing to publish; the stored token was removed
    Cleared { previous: Option<String> },
    /// No token existed; a trigger was scheduled
    Scheduled {
        at: DateTime<Utc>,
        handle: TriggerHandle,
    },
    /// The stored token already matches the queue
    Unchanged { at: DateTime<Utc> },
    /// The stored token was stale and has been replaced
    Replaced {
        at: DateTime<Utc>,
        handle: TriggerHandle,
        previous: String,
    },
    /// Another process changed the token first
    Contended,
}

impl RescheduleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Cleared { .. } => "cleared",
            Self::Scheduled { .. } => "scheduled",
            Self::Unchanged { .. } => "unchanged",
            Self::Replaced { .. } => "replaced",
            Self::Contended => "contended",
        }
    }

    /// Time of the outstanding trigger after this call, if known
    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Scheduled { at, .. } | Self::Unchanged { at } | Self::Replaced { at, .. } => {
                Some(*at)
            }
            _ => None,
        }
    }
}

/// Result of handling one fired trigger
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerOutcome {
    /// `None` when the tick failed with an error (already logged)
    pub tick: Option<TickOutcome>,
    pub reschedule: RescheduleOutcome,
}

pub struct PostingScheduler {
    repo: SharedEventRepository,
    tokens: TokenStore,
    triggers: SharedTriggerQueue,
    coordinator: Arc<PublicationCoordinator>,
    policies: RetryPolicies,
    sink: SharedAlertSink,
    settings: PostingSettings,
}

impl PostingScheduler {
    pub fn new(
        repo: SharedEventRepository,
        tokens: TokenStore,
        triggers: SharedTriggerQueue,
        coordinator: Arc<PublicationCoordinator>,
        sink: SharedAlertSink,
    ) -> Self {
        Self {
            repo,
            tokens,
            triggers,
            coordinator,
            policies: RetryPolicies::default(),
            sink,
            settings: PostingSettings::default(),
        }
    }

    pub fn with_policies(mut self, policies: RetryPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_settings(mut self, settings: PostingSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn coordinator(&self) -> &PublicationCoordinator {
        &self.coordinator
    }

    /// Make the outstanding trigger match the earliest ready event
    pub async fn reschedule(&self, now: DateTime<Utc>) -> SchedulerResult<RescheduleOutcome> {
        self.reschedule_not_before(now, None).await
    }

    /// Run a publication tick for a fired trigger, then reschedule
    ///
    /// Rescheduling happens even when the tick fails; after a failed tick
    /// the next trigger is pushed out by the failure backoff.
    pub async fn on_trigger(
        &self,
        trigger: &Trigger,
        now: DateTime<Utc>,
    ) -> SchedulerResult<TriggerOutcome> {
        debug!(handle = %trigger.handle, fire_at = %trigger.fire_at, "Trigger fired");
        self.tick_and_reschedule(now).await
    }

    /// Tick now, outside of any trigger, then reschedule
    pub async fn tick_and_reschedule(&self, now: DateTime<Utc>) -> SchedulerResult<TriggerOutcome> {
        let tick = match self.coordinator.tick(now).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(error = %e, "Publication tick failed");
                None
            }
        };

        let not_before = match &tick {
            Some(TickOutcome::Idle | TickOutcome::Published { .. }) => None,
            // the event already left the queue
            Some(TickOutcome::Conflict {
                stage: ConflictStage::Status | ConflictStage::MarkPosted,
                ..
            }) => None,
            // the holder either posts the event or its claim lapses
            Some(TickOutcome::Conflict {
                stage: ConflictStage::Claim,
                event_id,
            }) => {
                let until = self.coordinator.claim_expiry(now);
                debug!(event_id = %event_id, until = %until, "Claim held elsewhere, backing off");
                Some(until)
            }
            Some(TickOutcome::DeliveryFailed { .. }) | None => {
                Some(now + self.settings.failure_backoff)
            }
        };

        let reschedule = self.reschedule_not_before(now, not_before).await?;
        Ok(TriggerOutcome { tick, reschedule })
    }

    /// Claim every due trigger and handle each in fire order
    ///
    /// Claimed triggers are gone from the queue, so one that fails to
    /// reschedule is logged and the rest are still handled.
    pub async fn fire_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> SchedulerResult<Vec<TriggerOutcome>> {
        let fired = self
            .policies
            .write
            .run("claim_due", || self.triggers.claim_due(now, limit))
            .await?;

        let mut outcomes = Vec::with_capacity(fired.len());
        for trigger in &fired {
            match trigger.payload {
                TriggerPayload::Publish => match self.on_trigger(trigger, now).await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        error!(handle = %trigger.handle, error = %e, "Rescheduling after trigger failed")
                    }
                },
            }
        }
        Ok(outcomes)
    }

    async fn reschedule_not_before(
        &self,
        now: DateTime<Utc>,
        not_before: Option<DateTime<Utc>>,
    ) -> SchedulerResult<RescheduleOutcome> {
        let outcome = self.reconcile(now, not_before).await;
        if let Ok(outcome) = &outcome {
            metrics::record_reschedule(outcome.as_str());
        }
        outcome
    }

    async fn reconcile(
        &self,
        now: DateTime<Utc>,
        not_before: Option<DateTime<Utc>>,
    ) -> SchedulerResult<RescheduleOutcome> {
        let since = now - self.settings.due_window;
        let earliest = self
            .policies
            .read
            .run("earliest_ready_post_time", || {
                self.repo.earliest_ready_post_time(since)
            })
            .await?;

        if earliest.unscheduled > 0 {
            warn!(count = earliest.unscheduled, "Ready events without post time");
            self.sink.notify(
                Alert::new(
                    AlertKind::DataQuality,
                    format!("{} ready events have no post time", earliest.unscheduled),
                )
                .with_metadata("unscheduled", earliest.unscheduled),
            );
        }

        let target = earliest.at.map(|at| {
            let at = at.max(now);
            not_before.map_or(at, |nb| at.max(nb))
        });

        let stored = self
            .policies
            .read
            .run("load_token", || self.tokens.load())
            .await?;

        match target {
            None => self.clear(stored).await,
            Some(at) => self.ensure_trigger(at, stored).await,
        }
    }

    async fn clear(&self, stored: StoredToken) -> SchedulerResult<RescheduleOutcome> {
        let Some(raw) = stored.raw.as_deref() else {
            debug!("Nothing scheduled and nothing to publish");
            return Ok(RescheduleOutcome::Idle);
        };

        if !self
            .policies
            .write
            .run("clear_token", || self.tokens.replace(Some(raw), None))
            .await?
        {
            return Ok(self.contended(None));
        }

        let previous = stored.token.map(|t| t.trigger_handle);
        if let Some(handle) = &previous {
            self.cancel_quietly(&TriggerHandle::from(handle.as_str())).await;
        }
        info!(previous = ?previous, "Publish trigger cleared");
        Ok(RescheduleOutcome::Cleared { previous })
    }

    async fn ensure_trigger(
        &self,
        at: DateTime<Utc>,
        stored: StoredToken,
    ) -> SchedulerResult<RescheduleOutcome> {
        if let Some(token) = &stored.token {
            let drift = (token.scheduled_time - at).num_milliseconds().abs();
            if drift < self.settings.tolerance.num_milliseconds() {
                let handle = TriggerHandle::from(token.trigger_handle.as_str());
                let pending = self
                    .policies
                    .read
                    .run("trigger_pending", || self.triggers.is_pending(&handle))
                    .await?;
                if pending {
                    debug!(scheduled_time = %token.scheduled_time, target = %at, "Publish trigger is current");
                    return Ok(RescheduleOutcome::Unchanged {
                        at: token.scheduled_time,
                    });
                }
                debug!(handle = %handle, "Token refers to a trigger that already fired");
            }
        }

        // not retried: a duplicate trigger only costs an extra tick
        let handle = self.triggers.schedule_at(at, TriggerPayload::Publish).await?;
        let next = ReschedulingToken {
            scheduled_time: at,
            trigger_handle: handle.as_str().to_string(),
        };

        if !self.swap_token(stored.raw.as_deref(), &next, &handle).await? {
            self.cancel_quietly(&handle).await;
            return Ok(self.contended(Some(at)));
        }

        match stored.token {
            Some(previous) => {
                self.cancel_quietly(&TriggerHandle::from(previous.trigger_handle.as_str()))
                    .await;
                info!(
                    scheduled_time = %at,
                    previous_time = %previous.scheduled_time,
                    handle = %handle,
                    "Publish trigger replaced"
                );
                Ok(RescheduleOutcome::Replaced {
                    at,
                    handle,
                    previous: previous.trigger_handle,
                })
            }
            None => {
                info!(scheduled_time = %at, handle = %handle, "Publish trigger scheduled");
                Ok(RescheduleOutcome::Scheduled { at, handle })
            }
        }
    }

    /// CAS the token; a retry that already landed counts as a win
    async fn swap_token(
        &self,
        current: Option<&str>,
        next: &ReschedulingToken,
        handle: &TriggerHandle,
    ) -> SchedulerResult<bool> {
        if self
            .policies
            .write
            .run("replace_token", || self.tokens.replace(current, Some(next)))
            .await?
        {
            return Ok(true);
        }
        let stored = self
            .policies
            .read
            .run("load_token", || self.tokens.load())
            .await?;
        Ok(stored.references(handle))
    }

    async fn cancel_quietly(&self, handle: &TriggerHandle) {
        match self.triggers.cancel(handle).await {
            Ok(true) => debug!(handle = %handle, "Trigger cancelled"),
            Ok(false) => debug!(handle = %handle, "Trigger already fired or gone"),
            Err(e) => warn!(handle = %handle, error = %e, "Failed to cancel trigger"),
        }
    }

    fn contended(&self, target: Option<DateTime<Utc>>) -> RescheduleOutcome {
        warn!(target = ?target, "Rescheduling token changed concurrently");
        let mut alert = Alert::new(
            AlertKind::TriggerConflict,
            "Rescheduling token was changed by another process",
        );
        if let Some(at) = target {
            alert = alert.with_metadata("target", at.to_rfc3339());
        }
        self.sink.notify(alert);
        RescheduleOutcome::Contended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{create_memory_store, KeyValueStore, KvError, KvResult, SharedKeyValueStore};
    use crate::channels::{ChannelClient, DeliveryError, LogChannel, SharedChannel};
    use crate::models::{Event, EventStatus, PublishedRef};
    use crate::notifications::MemorySink;
    use crate::scheduler::trigger::{MemoryTriggerQueue, TriggerQueue};
    use crate::storage::create_memory_repository;
    use crate::utils::RetryPolicy;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    fn queued(id: &str, post_time: DateTime<Utc>) -> Event {
        let from = at(20, 0);
        Event::new(id, "test", id, format!("https://example.com/{id}"), from, from)
            .with_post_time(post_time)
    }

    fn policies() -> RetryPolicies {
        RetryPolicies {
            read: RetryPolicy::bounded(1),
            write: RetryPolicy::bounded(1),
            publish: RetryPolicy::bounded(1),
        }
    }

    struct Harness {
        repo: SharedEventRepository,
        kv: SharedKeyValueStore,
        triggers: Arc<MemoryTriggerQueue>,
        sink: Arc<MemorySink>,
        channel: Arc<LogChannel>,
    }

    impl Harness {
        async fn new(events: &[Event]) -> Self {
            let repo = create_memory_repository();
            repo.insert_new(events, at(0, 0), EventStatus::ReadyToPost)
                .await
                .unwrap();
            Self {
                repo,
                kv: create_memory_store(),
                triggers: Arc::new(MemoryTriggerQueue::new()),
                sink: Arc::new(MemorySink::new()),
                channel: Arc::new(LogChannel::new()),
            }
        }

        fn scheduler(&self) -> PostingScheduler {
            self.scheduler_with(self.kv.clone(), self.channel.clone())
        }

        fn scheduler_with(&self, kv: SharedKeyValueStore, channel: SharedChannel) -> PostingScheduler {
            let coordinator = PublicationCoordinator::new(
                self.repo.clone(),
                kv.clone(),
                channel,
                self.sink.clone(),
            )
            .with_policies(policies());
            PostingScheduler::new(
                self.repo.clone(),
                TokenStore::new(kv),
                self.triggers.clone(),
                Arc::new(coordinator),
                self.sink.clone(),
            )
            .with_policies(policies())
        }

        async fn token(&self) -> Option<ReschedulingToken> {
            TokenStore::new(self.kv.clone()).load().await.unwrap().token
        }
    }

    #[tokio::test]
    async fn test_empty_queue_is_idle() {
        let h = Harness::new(&[]).await;
        let outcome = h.scheduler().reschedule(at(9, 0)).await.unwrap();
        assert_eq!(outcome, RescheduleOutcome::Idle);
        assert!(h.token().await.is_none());
    }

    #[tokio::test]
    async fn test_schedules_then_confirms() {
        let h = Harness::new(&[queued("E1", at(10, 0))]).await;
        let scheduler = h.scheduler();

        let first = scheduler.reschedule(at(9, 0)).await.unwrap();
        let RescheduleOutcome::Scheduled { at: target, handle } = first else {
            panic!("expected a new trigger, got {first:?}");
        };
        assert_eq!(target, at(10, 0));
        assert_eq!(h.triggers.snapshot(), vec![(handle.clone(), at(10, 0))]);
        assert_eq!(h.token().await.unwrap().trigger_handle, handle.as_str());

        let second = scheduler.reschedule(at(9, 1)).await.unwrap();
        assert_eq!(second, RescheduleOutcome::Unchanged { at: at(10, 0) });
        assert_eq!(h.triggers.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_converges_after_insert_and_skip() {
        let h = Harness::new(&[queued("E1", at(12, 0))]).await;
        let scheduler = h.scheduler();
        scheduler.reschedule(at(9, 0)).await.unwrap();

        // an earlier event jumps the queue
        h.repo
            .insert_new(&[queued("E2", at(10, 0))], at(9, 0), EventStatus::ReadyToPost)
            .await
            .unwrap();
        let outcome = scheduler.reschedule(at(9, 5)).await.unwrap();
        assert!(matches!(outcome, RescheduleOutcome::Replaced { .. }));
        assert_eq!(h.token().await.unwrap().scheduled_time, at(10, 0));
        assert_eq!(h.triggers.pending().await.unwrap(), 1);

        // skipping it moves the target back
        h.repo.skip("E2", at(14, 0)).await.unwrap();
        scheduler.reschedule(at(9, 10)).await.unwrap();
        let earliest = h.repo.earliest_ready_post_time(at(9, 10)).await.unwrap();
        assert_eq!(h.token().await.unwrap().scheduled_time, earliest.at.unwrap());
        assert_eq!(h.triggers.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_clears_token_when_queue_drains() {
        let h = Harness::new(&[queued("E1", at(10, 0))]).await;
        let scheduler = h.scheduler();
        scheduler.reschedule(at(9, 0)).await.unwrap();

        h.repo
            .mark_posted("E1", &PublishedRef::new("log", "1"))
            .await
            .unwrap();
        let outcome = scheduler.reschedule(at(9, 30)).await.unwrap();

        assert!(matches!(outcome, RescheduleOutcome::Cleared { previous: Some(_) }));
        assert!(h.token().await.is_none());
        assert_eq!(h.triggers.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fired_token_is_replaced_within_tolerance() {
        let h = Harness::new(&[queued("E1", at(10, 0))]).await;
        let scheduler = h.scheduler();
        scheduler.reschedule(at(9, 0)).await.unwrap();

        // the trigger fires but nothing is published
        assert_eq!(h.triggers.claim_due(at(10, 0), 10).await.unwrap().len(), 1);

        let outcome = scheduler.reschedule(at(10, 0)).await.unwrap();
        assert!(matches!(outcome, RescheduleOutcome::Replaced { .. }));
        assert_eq!(h.triggers.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unscheduled_events_raise_data_quality() {
        let h = Harness::new(&[queued("E1", at(10, 0))]).await;
        let mut unscheduled = queued("E2", at(10, 0));
        unscheduled.post_time = None;
        h.repo
            .insert_new(&[unscheduled], at(0, 0), EventStatus::ReadyToPost)
            .await
            .unwrap();

        let outcome = h.scheduler().reschedule(at(9, 0)).await.unwrap();
        assert_eq!(outcome.scheduled_at(), Some(at(10, 0)));
        assert_eq!(h.sink.count(AlertKind::DataQuality), 1);
    }

    #[tokio::test]
    async fn test_trigger_rearms_for_event_sharing_post_time() {
        let h = Harness::new(&[queued("E1", at(10, 0)), queued("E2", at(10, 0))]).await;
        let scheduler = h.scheduler();
        scheduler.reschedule(at(9, 0)).await.unwrap();

        let first = scheduler.fire_due(at(10, 0), 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(matches!(&first[0].tick, Some(TickOutcome::Published { event_id, .. }) if event_id == "E1"));
        assert_eq!(first[0].reschedule.scheduled_at(), Some(at(10, 0)));

        let second = scheduler.fire_due(at(10, 0), 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(matches!(&second[0].tick, Some(TickOutcome::Published { event_id, .. }) if event_id == "E2"));
        assert!(matches!(second[0].reschedule, RescheduleOutcome::Cleared { .. }));

        assert_eq!(h.channel.published(), vec!["E1", "E2"]);
        assert!(h.token().await.is_none());
    }

    struct DownChannel;

    #[async_trait]
    impl ChannelClient for DownChannel {
        fn name(&self) -> &str {
            "down"
        }

        async fn publish(&self, _event: &Event) -> Result<PublishedRef, DeliveryError> {
            Err(DeliveryError::Transport("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_delivery_backs_off() {
        let h = Harness::new(&[queued("E1", at(10, 0))]).await;
        let scheduler = h.scheduler_with(h.kv.clone(), Arc::new(DownChannel));
        scheduler.reschedule(at(9, 0)).await.unwrap();

        let outcomes = scheduler.fire_due(at(10, 0), 10).await.unwrap();

        assert!(matches!(outcomes[0].tick, Some(TickOutcome::DeliveryFailed { .. })));
        assert_eq!(
            outcomes[0].reschedule.scheduled_at(),
            Some(at(10, 0) + Duration::seconds(60))
        );
        assert_eq!(
            h.repo.get("E1").await.unwrap().unwrap().status,
            EventStatus::ReadyToPost
        );
    }

    #[tokio::test]
    async fn test_held_claim_backs_off_until_claim_expiry() {
        let h = Harness::new(&[queued("E1", at(10, 0))]).await;
        h.kv.set("claim:E1", "crashed-worker", None).await.unwrap();
        let scheduler = h.scheduler();
        scheduler.reschedule(at(9, 0)).await.unwrap();

        let outcomes = scheduler.fire_due(at(10, 0), 10).await.unwrap();

        assert!(matches!(
            outcomes[0].tick,
            Some(TickOutcome::Conflict {
                stage: ConflictStage::Claim,
                ..
            })
        ));
        assert_eq!(
            outcomes[0].reschedule.scheduled_at(),
            Some(at(10, 0) + Duration::seconds(120))
        );

        // no trigger fires while the claim may still be held
        for second in 1..30 {
            let now = at(10, 0) + Duration::seconds(second);
            assert!(scheduler.fire_due(now, 10).await.unwrap().is_empty());
        }
        assert_eq!(h.sink.count(AlertKind::PublicationConflict), 1);
        assert!(h.channel.published().is_empty());
    }

    /// Fails the first read of the rescheduling token
    struct TokenReadFailsOnce {
        inner: SharedKeyValueStore,
        failed: AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for TokenReadFailsOnce {
        async fn get(&self, key: &str) -> KvResult<Option<String>> {
            if key == crate::scheduler::TOKEN_KEY && !self.failed.swap(true, Ordering::SeqCst) {
                return Err(KvError::Pool("connection refused".into()));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<std::time::Duration>) -> KvResult<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn set_if(
            &self,
            key: &str,
            expected: Option<&str>,
            new: Option<&str>,
            ttl: Option<std::time::Duration>,
        ) -> KvResult<bool> {
            self.inner.set_if(key, expected, new, ttl).await
        }

        async fn expire(&self, key: &str, ttl: std::time::Duration) -> KvResult<bool> {
            self.inner.expire(key, ttl).await
        }
    }

    #[tokio::test]
    async fn test_reschedule_error_does_not_drop_other_fired_triggers() {
        let h = Harness::new(&[queued("E1", at(10, 0)), queued("E2", at(10, 0))]).await;
        h.triggers
            .schedule_at(at(10, 0), TriggerPayload::Publish)
            .await
            .unwrap();
        h.triggers
            .schedule_at(at(10, 0), TriggerPayload::Publish)
            .await
            .unwrap();
        let flaky: SharedKeyValueStore = Arc::new(TokenReadFailsOnce {
            inner: h.kv.clone(),
            failed: AtomicBool::new(false),
        });
        let scheduler = h.scheduler_with(flaky, h.channel.clone());

        let outcomes = scheduler.fire_due(at(10, 0), 10).await.unwrap();

        // the first trigger published but could not reschedule
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(&outcomes[0].tick, Some(TickOutcome::Published { event_id, .. }) if event_id == "E2"));
        assert_eq!(h.channel.published(), vec!["E1", "E2"]);
    }

    /// Lets a competitor write the token right before our first CAS
    struct RacingStore {
        inner: SharedKeyValueStore,
        raced: AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for RacingStore {
        async fn get(&self, key: &str) -> KvResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<std::time::Duration>) -> KvResult<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn set_if(
            &self,
            key: &str,
            expected: Option<&str>,
            new: Option<&str>,
            ttl: Option<std::time::Duration>,
        ) -> KvResult<bool> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                let competitor = ReschedulingToken {
                    scheduled_time: at(10, 0),
                    trigger_handle: "competitor".into(),
                };
                self.inner
                    .set(key, &serde_json::to_string(&competitor).unwrap(), None)
                    .await?;
            }
            self.inner.set_if(key, expected, new, ttl).await
        }

        async fn expire(&self, key: &str, ttl: std::time::Duration) -> KvResult<bool> {
            self.inner.expire(key, ttl).await
        }
    }

    #[tokio::test]
    async fn test_lost_token_race_cancels_own_trigger() {
        let h = Harness::new(&[queued("E1", at(10, 0))]).await;
        let racing: SharedKeyValueStore = Arc::new(RacingStore {
            inner: h.kv.clone(),
            raced: AtomicBool::new(false),
        });
        let scheduler = h.scheduler_with(racing, h.channel.clone());

        let outcome = scheduler.reschedule(at(9, 0)).await.unwrap();

        assert_eq!(outcome, RescheduleOutcome::Contended);
        assert_eq!(h.triggers.pending().await.unwrap(), 0);
        assert_eq!(h.token().await.unwrap().trigger_handle, "competitor");
        assert_eq!(h.sink.count(AlertKind::TriggerConflict), 1);
    }
}
