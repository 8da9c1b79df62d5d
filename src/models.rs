//! Core data models for eventcast
//!
//! This module defines the event record that flows through ingestion, approval
//! and publication, together with the small value types exchanged with the
//! scheduler and the channel clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle status of an event
///
/// Transitions only move forward along
/// `Scraped -> PendingApproval -> ReadyToPost -> Posted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Freshly ingested, not yet reviewed
    Scraped,
    /// Waiting for an operator or moderation step
    PendingApproval,
    /// Approved and queued for publication
    ReadyToPost,
    /// Published; terminal
    Posted,
}

impl EventStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scraped => "scraped",
            Self::PendingApproval => "pending_approval",
            Self::ReadyToPost => "ready_to_post",
            Self::Posted => "posted",
        }
    }

    /// Position along the lifecycle, used to reject backward transitions
    pub fn rank(&self) -> u8 {
        match self {
            Self::Scraped => 0,
            Self::PendingApproval => 1,
            Self::ReadyToPost => 2,
            Self::Posted => 3,
        }
    }

    /// Identity space the status belongs to
    pub fn partition(&self) -> Partition {
        match self {
            Self::Scraped | Self::PendingApproval => Partition::Inbox,
            Self::ReadyToPost | Self::Posted => Partition::Queue,
        }
    }

    /// Check whether moving to `next` is a forward transition
    pub fn can_advance_to(&self, next: EventStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Posted)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scraped" => Ok(Self::Scraped),
            "pending_approval" | "pending" => Ok(Self::PendingApproval),
            "ready_to_post" | "ready" => Ok(Self::ReadyToPost),
            "posted" => Ok(Self::Posted),
            other => Err(format!("Unknown event status: {other}")),
        }
    }
}

/// Event identity spaces
///
/// `Scraped` and `PendingApproval` events share the inbox; `ReadyToPost` and
/// `Posted` events live in the publication queue. The same `event_id` may
/// exist once in each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Inbox,
    Queue,
}

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Queue => "queue",
        }
    }
}

/// One discovered occurrence of a real-world happening
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Stable identifier assigned by the source adapter
    pub event_id: String,

    /// Name of the source the event was scraped from
    pub source: String,

    pub title: String,

    pub body: String,

    pub address: Option<String>,

    pub price: Option<String>,

    /// Image URL or other reference understood by the channel clients
    pub image_ref: Option<String>,

    pub url: String,

    /// Start of the event itself (not the publication time)
    pub from_time: DateTime<Utc>,

    /// End of the event itself; drives the retention sweep
    pub to_time: DateTime<Utc>,

    /// When this system first observed the event
    pub explored_at: DateTime<Utc>,

    pub status: EventStatus,

    /// FIFO order among queued events; assigned once on entering the queue
    pub queue_rank: Option<i64>,

    /// Instant the event becomes eligible for publication
    pub post_time: Option<DateTime<Utc>>,

    /// Set together with `Posted`
    pub posted_at: Option<DateTime<Utc>>,

    /// Message id returned by the primary channel
    pub channel_message_id: Option<String>,
}

impl Event {
    /// Create a scraped event with the minimal descriptive fields
    pub fn new(
        event_id: impl Into<String>,
        source: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
        from_time: DateTime<Utc>,
        to_time: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            source: source.into(),
            title: title.into(),
            body: String::new(),
            address: None,
            price: None,
            image_ref: None,
            url: url.into(),
            from_time,
            to_time,
            explored_at: Utc::now(),
            status: EventStatus::Scraped,
            queue_rank: None,
            post_time: None,
            posted_at: None,
            channel_message_id: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_price(mut self, price: impl Into<String>) -> Self {
        self.price = Some(price.into());
        self
    }

    pub fn with_image(mut self, image_ref: impl Into<String>) -> Self {
        self.image_ref = Some(image_ref.into());
        self
    }

    pub fn with_post_time(mut self, post_time: DateTime<Utc>) -> Self {
        self.post_time = Some(post_time);
        self
    }

    /// Check if the event has been published
    pub fn is_posted(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Event as delivered by a scraper adapter, before normalisation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Source-assigned identifier, if the source has one
    #[serde(default)]
    pub id: Option<String>,

    pub title: String,

    #[serde(default)]
    pub body: String,

    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub price: Option<String>,

    #[serde(default)]
    pub image_url: Option<String>,

    pub url: String,

    pub from_time: DateTime<Utc>,

    #[serde(default)]
    pub to_time: Option<DateTime<Utc>>,
}

impl RawEvent {
    /// Convert into a `Scraped` event attributed to `source`
    ///
    /// Sources without their own identifiers get one derived from the event
    /// URL, prefixed with the source name so ids never collide across sources.
    pub fn into_event(self, source: &str, explored_at: DateTime<Utc>) -> Event {
        let event_id = match self.id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => derive_event_id(source, &self.url),
        };

        Event {
            event_id,
            source: source.to_string(),
            title: self.title.trim().to_string(),
            body: self.body,
            address: self.address.filter(|a| !a.trim().is_empty()),
            price: self.price.filter(|p| !p.trim().is_empty()),
            image_ref: self.image_url.filter(|u| !u.trim().is_empty()),
            url: self.url,
            from_time: self.from_time,
            to_time: self.to_time.unwrap_or(self.from_time),
            explored_at,
            status: EventStatus::Scraped,
            queue_rank: None,
            post_time: None,
            posted_at: None,
            channel_message_id: None,
        }
    }
}

/// Derive a stable event id from the source name and URL
pub fn derive_event_id(source: &str, url: &str) -> String {
    let hash = Sha256::digest(url.trim().as_bytes());
    let hex = format!("{hash:x}");
    format!("{source}-{}", &hex[..16])
}

/// Reference to a message created by a channel client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedRef {
    /// Channel name (e.g. "telegram")
    pub channel: String,

    pub channel_message_id: String,

    pub published_at: DateTime<Utc>,
}

impl PublishedRef {
    pub fn new(channel: impl Into<String>, channel_message_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            channel_message_id: channel_message_id.into(),
            published_at: Utc::now(),
        }
    }
}

/// Persisted record of the single outstanding delayed trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReschedulingToken {
    pub scheduled_time: DateTime<Utc>,
    pub trigger_handle: String,
}

/// Per-status event counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub scraped: usize,
    pub pending_approval: usize,
    pub ready_to_post: usize,
    pub posted: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.scraped + self.pending_approval + self.ready_to_post + self.posted
    }

    pub fn add(&mut self, status: EventStatus) {
        self.add_many(status, 1);
    }

    pub fn add_many(&mut self, status: EventStatus, count: usize) {
        match status {
            EventStatus::Scraped => self.scraped += count,
            EventStatus::PendingApproval => self.pending_approval += count,
            EventStatus::ReadyToPost => self.ready_to_post += count,
            EventStatus::Posted => self.posted += count,
        }
    }
}
