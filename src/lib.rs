//! eventcast - event aggregator and publication scheduler
//!
//! Scrapes upcoming events from several sources, deduplicates them, queues
//! approved events and publishes exactly one event per posting slot to one or
//! more channels.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`models`] - Events, lifecycle statuses and receipts
//! - [`storage`] - Event repository (SQLite, in-memory) and deduplication
//! - [`cache`] - Key/value store (Redis, in-memory) and parameter cache
//! - [`publisher`] - At-most-once publication of the next due event
//! - [`scheduler`] - Delayed triggers, rescheduling token and posting slots
//! - [`channels`] - Outbound channel clients (Telegram, webhook)
//! - [`ingest`] - Scraper adapters and the ingestion pipeline
//! - [`notifications`] - Operator alerts
//! - [`metrics`] - Prometheus metrics
//! - [`config`] - Configuration management and settings
//! - [`app`] - Wiring of all of the above for the binary
//! - [`utils`] - Retry policy and text helpers
//!
//! # Example
//!
//! ```no_run
//! use eventcast::app::{App, Collaborators};
//! use eventcast::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let parts = Collaborators::connect(&config, true).await?;
//!     let app = App::new(config, parts)?;
//!     app.reschedule(chrono::Utc::now()).await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod cache;
pub mod channels;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod models;
pub mod notifications;
pub mod publisher;
pub mod scheduler;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::app::{App, Collaborators};
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, EventcastErrorTrait, Result};
    pub use crate::models::{Event, EventStatus, PublishedRef, RawEvent, ReschedulingToken};
    pub use crate::publisher::{ConflictStage, PublicationCoordinator, TickOutcome};
    pub use crate::scheduler::{PostingScheduler, RescheduleOutcome};
    pub use crate::storage::{EventRepository, SharedEventRepository};
}

// Direct re-exports for convenience
pub use error::{Error, Result};
pub use models::{Event, EventStatus};
