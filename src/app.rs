//! Process wiring
//!
//! [`Collaborators`] holds the external boundaries (stores, trigger queue,
//! channels, alert sink, scrapers). [`App`] builds the core components on
//! top of them and exposes the operations used by the daemon and the admin
//! commands. Nothing here is global; tests assemble an `App` from in-memory
//! collaborators.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::redis_store::{create_pool, RedisStore};
use crate::cache::{create_memory_store, ParameterCache, SharedKeyValueStore};
use crate::channels::{LogChannel, SharedChannel, TelegramChannel, WebhookChannel};
use crate::config::Config;
use crate::error::Result;
use crate::ingest::{IngestReport, Ingestor, JsonFeedScraper, SharedScraper};
use crate::models::{ReschedulingToken, StatusCounts};
use crate::notifications::{
    tracing_sink, FanoutSink, SharedAlertSink, WebhookSink, WebhookSinkConfig,
};
use crate::publisher::{PublicationCoordinator, PublisherSettings};
use crate::scheduler::{
    MemoryTriggerQueue, PostingScheduler, PostingSettings, RedisTriggerQueue, RescheduleOutcome,
    SharedTriggerQueue, SlotAllocator, TokenStore, TriggerOutcome,
};
use crate::storage::{create_memory_repository, create_sqlite_repository, SharedEventRepository};
use crate::utils::RetryPolicies;

/// External boundaries of the process
pub struct Collaborators {
    pub repo: SharedEventRepository,
    pub kv: SharedKeyValueStore,
    pub triggers: SharedTriggerQueue,
    /// Primary channel first
    pub channels: Vec<SharedChannel>,
    pub sink: SharedAlertSink,
    /// Matched to configured sources by name
    pub scrapers: Vec<SharedScraper>,
}

impl Collaborators {
    /// Everything in process, publishing to `channel`
    pub fn in_memory(channel: SharedChannel, sink: SharedAlertSink) -> Self {
        Self {
            repo: create_memory_repository(),
            kv: create_memory_store(),
            triggers: Arc::new(MemoryTriggerQueue::new()),
            channels: vec![channel],
            sink,
            scrapers: Vec::new(),
        }
    }

    /// Connect to SQLite and Redis and build channels from `config`
    ///
    /// With `dry_run`, posts are logged instead of sent.
    pub async fn connect(config: &Config, dry_run: bool) -> anyhow::Result<Self> {
        if let Some(parent) = config.database.sqlite_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }
        let repo = create_sqlite_repository(&config.database.sqlite_path).with_context(|| {
            format!(
                "Failed to open event store {}",
                config.database.sqlite_path.display()
            )
        })?;

        let pool = create_pool(&config.redis)?;
        let store = RedisStore::from_pool(pool.clone(), &config.redis.key_prefix);
        let healthy = store
            .health_check()
            .await
            .with_context(|| format!("Redis is not reachable at {}", config.redis.url))?;
        if !healthy {
            anyhow::bail!("Redis at {} did not answer PING", config.redis.url);
        }
        let kv: SharedKeyValueStore = Arc::new(store);
        let triggers: SharedTriggerQueue =
            Arc::new(RedisTriggerQueue::new(pool, &config.redis.key_prefix));

        let offset = config.scheduler.utc_offset()?;
        let mut channels: Vec<SharedChannel> = Vec::new();
        if dry_run {
            channels.push(Arc::new(LogChannel::with_offset(offset)));
        } else {
            if let Some(telegram) = &config.channels.telegram {
                channels.push(Arc::new(TelegramChannel::new(telegram.clone(), offset)?));
            }
            for webhook in &config.channels.webhooks {
                channels.push(Arc::new(WebhookChannel::new(webhook.clone(), offset)?));
            }
        }
        if channels.is_empty() {
            anyhow::bail!("No publication channel configured; configure one or use --dry-run");
        }

        let mut sink = FanoutSink::new().with(tracing_sink());
        if let Some(url) = &config.alerts.webhook_url {
            let webhook = WebhookSink::new(WebhookSinkConfig::new(url.clone()))
                .map_err(anyhow::Error::msg)?;
            sink = sink.with(Arc::new(webhook));
        }

        let scrapers = config
            .sources
            .iter()
            .map(|source| JsonFeedScraper::new(source).map(|s| Arc::new(s) as SharedScraper))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            repo,
            kv,
            triggers,
            channels,
            sink: Arc::new(sink),
            scrapers,
        })
    }
}

/// Counts and scheduling state for operators
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub counts: StatusCounts,
    pub token: Option<ReschedulingToken>,
    pub pending_triggers: usize,
}

/// Result of approving an event
#[derive(Debug, Clone, Serialize)]
pub struct ApproveReport {
    pub event_id: String,
    pub queue_rank: i64,
    pub post_time: Option<DateTime<Utc>>,
}

/// Result of the daily maintenance run
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub swept: usize,
    pub ingested: Vec<IngestReport>,
    pub assigned: usize,
    pub ready: usize,
    pub reschedule: String,
}

pub struct App {
    config: Config,
    repo: SharedEventRepository,
    kv: SharedKeyValueStore,
    triggers: SharedTriggerQueue,
    scheduler: PostingScheduler,
    ingestor: Ingestor,
    allocator: SlotAllocator,
}

impl App {
    pub fn new(config: Config, parts: Collaborators) -> anyhow::Result<Self> {
        let Collaborators {
            repo,
            kv,
            triggers,
            channels,
            sink,
            scrapers,
        } = parts;

        let policies = RetryPolicies::from_config(&config.scheduler).with_sink(sink.clone());

        let mut channels = channels.into_iter();
        let primary = channels
            .next()
            .context("At least one publication channel is required")?;
        let mut coordinator =
            PublicationCoordinator::new(repo.clone(), kv.clone(), primary, sink.clone())
                .with_policies(policies.clone())
                .with_settings(PublisherSettings::from_config(&config.scheduler));
        for mirror in channels {
            coordinator = coordinator.with_mirror(mirror);
        }

        let scheduler = PostingScheduler::new(
            repo.clone(),
            TokenStore::new(kv.clone()),
            triggers.clone(),
            Arc::new(coordinator),
            sink.clone(),
        )
        .with_policies(policies.clone())
        .with_settings(PostingSettings::from_config(&config.scheduler));

        let mut ingestor = Ingestor::new(repo.clone(), sink)
            .with_policies(policies)
            .with_parameter_cache(ParameterCache::new(
                kv.clone(),
                config.scheduler.parameters_ttl(),
            ));
        for source in &config.sources {
            let adapter = match scrapers.iter().find(|s| s.source() == source.name) {
                Some(adapter) => adapter.clone(),
                None => Arc::new(JsonFeedScraper::new(source)?),
            };
            ingestor = ingestor.with_source(source.clone(), adapter);
        }

        let allocator = SlotAllocator::new(config.posting_slots()?);

        Ok(Self {
            config,
            repo,
            kv,
            triggers,
            scheduler,
            ingestor,
            allocator,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repository(&self) -> &SharedEventRepository {
        &self.repo
    }

    pub fn scheduler(&self) -> &PostingScheduler {
        &self.scheduler
    }

    pub fn allocator(&self) -> &SlotAllocator {
        &self.allocator
    }

    /// Handle every due trigger
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Result<Vec<TriggerOutcome>> {
        Ok(self.scheduler.fire_due(now, 16).await?)
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TriggerOutcome> {
        Ok(self.scheduler.tick_and_reschedule(now).await?)
    }

    pub async fn reschedule(&self, now: DateTime<Utc>) -> Result<RescheduleOutcome> {
        Ok(self.scheduler.reschedule(now).await?)
    }

    pub async fn ingest(&self, now: DateTime<Utc>) -> Vec<IngestReport> {
        self.ingestor.run(now).await
    }

    /// Give unscheduled ready events posting slots
    pub async fn fill_slots(&self, now: DateTime<Utc>) -> Result<Vec<(String, DateTime<Utc>)>> {
        Ok(self.allocator.fill_unscheduled(self.repo.as_ref(), now).await?)
    }

    /// Queue an inbox event and give it the next free slot
    pub async fn approve(&self, event_id: &str, now: DateTime<Utc>) -> Result<ApproveReport> {
        let queue_rank = self.repo.approve(event_id, None).await?;
        self.fill_slots(now).await?;
        let post_time = self.repo.get(event_id).await?.and_then(|e| e.post_time);
        info!(event_id, queue_rank, post_time = ?post_time, "Event approved");

        self.reschedule(now).await?;
        Ok(ApproveReport {
            event_id: event_id.to_string(),
            queue_rank,
            post_time,
        })
    }

    /// Move a queued event to its next slot
    pub async fn skip(&self, event_id: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let moved = self.allocator.skip(self.repo.as_ref(), event_id, now).await?;
        if moved.is_none() {
            warn!(event_id, "Event can not be skipped");
        }
        self.reschedule(now).await?;
        Ok(moved)
    }

    /// Delete events that ended before the retention grace
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = now - self.config.scheduler.retention_grace();
        Ok(self.repo.sweep_expired(before).await?)
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let counts = self.repo.count_by_status().await?;
        let token = TokenStore::new(self.kv.clone()).load().await?.token;
        let pending_triggers = self.triggers.pending().await?;
        Ok(StatusReport {
            counts,
            token,
            pending_triggers,
        })
    }

    /// Sweep, ingest, assign slots, check the queue and reschedule
    pub async fn daily_maintenance(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let swept = self.sweep(now).await?;
        let ingested = self.ingest(now).await;
        let assigned = self.fill_slots(now).await?.len();
        let ready = self.scheduler.coordinator().check_queue_depth().await?;
        let reschedule = self.reschedule(now).await?;

        info!(swept, assigned, ready, reschedule = reschedule.as_str(), "Daily maintenance finished");
        Ok(MaintenanceReport {
            swept,
            ingested,
            assigned,
            ready,
            reschedule: reschedule.as_str().to_string(),
        })
    }
}
