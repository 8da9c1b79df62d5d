//! Configuration management for eventcast
//!
//! Configuration is loaded from a TOML file or from environment variables,
//! then validated before any collaborator is built.

use anyhow::{Context, Result};
use chrono::{FixedOffset, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::channels::{TelegramConfig, WebhookChannelConfig};
use crate::ingest::SourceConfig;
use crate::scheduler::{offset_from_minutes, parse_hhmm, PostingSlots, SlotsConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event store
    pub database: DatabaseConfig,

    /// Key/value store and trigger queue
    pub redis: CacheConfig,

    /// Publication timing and retry bounds
    pub scheduler: SchedulerConfig,

    /// Local posting times
    pub slots: SlotsConfig,

    /// Outbound channels
    pub channels: ChannelsConfig,

    /// Operator alerts
    pub alerts: AlertsConfig,

    /// Event sources
    pub sources: Vec<SourceConfig>,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics endpoint
    pub metrics: MetricsConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/eventcast.db"),
        }
    }
}

/// Scheduler and publication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How far ahead of `post_time` an event may be published
    pub due_window_secs: u64,

    /// Token drift left alone by `reschedule`
    pub reschedule_tolerance_secs: u64,

    /// Attempts for pre-send publication failures
    pub publish_attempts: u32,

    /// Attempts for store writes and key/value updates
    pub write_attempts: u32,

    /// Attempts for reads; unset retries until success
    pub read_attempts: Option<u32>,

    /// Lifetime of a publication claim
    pub claim_ttl_secs: u64,

    /// How often the daemon polls the trigger queue
    pub poll_interval_ms: u64,

    /// How often the daemon re-derives the trigger
    pub reconcile_interval_secs: u64,

    /// Local time of the daily maintenance run (`HH:MM`)
    pub daily_update_time: String,

    /// Events are swept this long after they end
    pub retention_grace_secs: u64,

    /// Offset of local time from UTC, in minutes
    pub utc_offset_minutes: i32,

    /// Alert when this many or fewer events are ready
    pub queue_low_watermark: usize,

    /// Delay of the next trigger after a failed tick
    pub failure_backoff_secs: u64,

    /// Lifetime of cached source parameters
    pub parameters_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            due_window_secs: 300,
            reschedule_tolerance_secs: 180,
            publish_attempts: 3,
            write_attempts: 3,
            read_attempts: None,
            claim_ttl_secs: 120,
            poll_interval_ms: 1000,
            reconcile_interval_secs: 300,
            daily_update_time: String::from("00:00"),
            retention_grace_secs: 3600,
            utc_offset_minutes: 180,
            queue_low_watermark: 1,
            failure_backoff_secs: 60,
            parameters_ttl_secs: 3600,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    #[must_use]
    pub fn retention_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_grace_secs as i64)
    }

    #[must_use]
    pub fn parameters_ttl(&self) -> Duration {
        Duration::from_secs(self.parameters_ttl_secs)
    }

    pub fn utc_offset(&self) -> Result<FixedOffset> {
        Ok(offset_from_minutes(self.utc_offset_minutes)?)
    }

    pub fn daily_update_time(&self) -> Result<NaiveTime> {
        parse_hhmm(&self.daily_update_time)
            .with_context(|| format!("Invalid daily_update_time '{}'", self.daily_update_time))
    }
}

/// Outbound channels; the first configured one is primary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub telegram: Option<TelegramConfig>,
    pub webhooks: Vec<WebhookChannelConfig>,
}

impl ChannelsConfig {
    pub fn is_empty(&self) -> bool {
        self.telegram.is_none() && self.webhooks.is_empty()
    }
}

/// Operator alert destinations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Webhook receiving alerts as JSON
    pub webhook_url: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address for `/metrics` and `/health`, e.g. `0.0.0.0:9090`
    pub listen_addr: Option<String>,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = SchedulerConfig::default();

        let scheduler = SchedulerConfig {
            due_window_secs: env_or("EVENTCAST_DUE_WINDOW_SECS", defaults.due_window_secs),
            reschedule_tolerance_secs: env_or(
                "EVENTCAST_RESCHEDULE_TOLERANCE_SECS",
                defaults.reschedule_tolerance_secs,
            ),
            publish_attempts: env_or("EVENTCAST_PUBLISH_ATTEMPTS", defaults.publish_attempts),
            write_attempts: env_or("EVENTCAST_WRITE_ATTEMPTS", defaults.write_attempts),
            read_attempts: std::env::var("EVENTCAST_READ_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok()),
            utc_offset_minutes: env_or("EVENTCAST_UTC_OFFSET_MINUTES", defaults.utc_offset_minutes),
            daily_update_time: std::env::var("EVENTCAST_DAILY_UPDATE_TIME")
                .unwrap_or(defaults.daily_update_time.clone()),
            ..defaults
        };

        let telegram = match (
            std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            std::env::var("TELEGRAM_CHAT_ID").ok(),
        ) {
            (Some(token), Some(chat_id)) => Some(TelegramConfig::new(token, chat_id)),
            _ => None,
        };

        let sqlite_path = std::env::var("EVENTCAST_SQLITE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| DatabaseConfig::default().sqlite_path);

        Ok(Self {
            database: DatabaseConfig { sqlite_path },
            redis: CacheConfig::from_env(),
            scheduler,
            slots: SlotsConfig::default(),
            channels: ChannelsConfig {
                telegram,
                webhooks: Vec::new(),
            },
            alerts: AlertsConfig {
                webhook_url: std::env::var("ALERT_WEBHOOK_URL").ok(),
            },
            sources: Vec::new(),
            logging: LoggingConfig {
                level: std::env::var("EVENTCAST_LOG_LEVEL").unwrap_or_else(|_| String::from("info")),
                format: std::env::var("EVENTCAST_LOG_FORMAT")
                    .unwrap_or_else(|_| String::from("text")),
            },
            metrics: MetricsConfig {
                listen_addr: std::env::var("EVENTCAST_METRICS_ADDR").ok(),
            },
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from `path` when given, otherwise from the environment, and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let scheduler = &self.scheduler;
        if scheduler.publish_attempts == 0 || scheduler.write_attempts == 0 {
            anyhow::bail!("publish_attempts and write_attempts must be greater than 0");
        }
        if scheduler.read_attempts == Some(0) {
            anyhow::bail!("read_attempts must be greater than 0 when set");
        }
        if scheduler.claim_ttl_secs == 0 {
            anyhow::bail!("claim_ttl_secs must be greater than 0");
        }
        if scheduler.poll_interval_ms == 0 || scheduler.reconcile_interval_secs == 0 {
            anyhow::bail!("poll_interval_ms and reconcile_interval_secs must be greater than 0");
        }
        scheduler.daily_update_time()?;
        self.posting_slots()?;

        if self.redis.pool_size == 0 {
            anyhow::bail!("redis pool_size must be greater than 0");
        }

        if let Some(telegram) = &self.channels.telegram {
            telegram.validate().map_err(anyhow::Error::msg)?;
        }
        let mut channel_names = HashSet::new();
        if self.channels.telegram.is_some() {
            channel_names.insert("telegram");
        }
        for webhook in &self.channels.webhooks {
            webhook.validate().map_err(anyhow::Error::msg)?;
            if !channel_names.insert(webhook.name.as_str()) {
                anyhow::bail!("Duplicate channel name '{}'", webhook.name);
            }
        }

        if let Some(url) = &self.alerts.webhook_url {
            if !crate::utils::is_http_url(url) {
                anyhow::bail!("Alert webhook URL must be an http(s) URL");
            }
        }

        let mut source_names = HashSet::new();
        for source in &self.sources {
            source.validate().map_err(anyhow::Error::msg)?;
            if !source_names.insert(source.name.as_str()) {
                anyhow::bail!("Duplicate source name '{}'", source.name);
            }
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("Log format must be 'text' or 'json', got '{}'", self.logging.format);
        }

        Ok(())
    }

    /// Posting slots at the configured offset
    pub fn posting_slots(&self) -> Result<PostingSlots> {
        PostingSlots::new(&self.slots, self.scheduler.utc_offset_minutes)
            .context("Invalid posting slots")
    }
}
