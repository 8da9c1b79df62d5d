//! Unified error handling for the eventcast crate
//!
//! Each boundary has its own error type (store, key/value store, channel
//! delivery, scraping, scheduling). This module wraps them in a single
//! [`Error`] enum for code that crosses module boundaries, such as the
//! command layer and the daemon loop.
//!
//! # Architecture
//!
//! - [`EventcastErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use eventcast::error::{Error, EventcastErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(category = ?err.category(), "Transient failure: {err}");
//!     } else {
//!         tracing::error!("Fatal error: {err}");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::cache::KvError;
pub use crate::channels::DeliveryError;
pub use crate::ingest::ScrapeError;
pub use crate::scheduler::error::SchedulerError;
pub use crate::storage::StoreError;

/// Common trait for all eventcast error types
pub trait EventcastErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network-related errors (HTTP, timeout, connection)
    Network,
    /// Relational or key/value storage errors
    Storage,
    /// Outbound channel delivery errors
    Delivery,
    /// Trigger queue, token and time-slot errors
    Scheduler,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Delivery => "delivery",
            Self::Scheduler => "scheduler",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the eventcast crate
#[derive(Error, Debug)]
pub enum Error {
    /// Event store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Key/value store errors
    #[error("Key/value store error: {0}")]
    Kv(#[from] KvError),

    /// Channel delivery errors
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Scraper adapter errors
    #[error("Scrape error: {0}")]
    Scrape(#[from] ScrapeError),

    /// Scheduler and timing errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl EventcastErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_recoverable(),
            Self::Kv(e) => e.is_recoverable(),
            Self::Delivery(e) => e.is_recoverable(),
            Self::Scrape(e) => e.is_recoverable(),
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Io(_) => true,
            Self::Json(_) => false,
            Self::Http(_) => true,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Store(_) | Self::Kv(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Delivery(_) => ErrorCategory::Delivery,
            Self::Scrape(_) | Self::Http(_) => ErrorCategory::Network,
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Json(_) | Self::Other { .. } => ErrorCategory::Other,
            Self::Config(_) => ErrorCategory::Config,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
