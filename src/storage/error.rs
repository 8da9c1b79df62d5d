//! Error types for the event store

use thiserror::Error;

use crate::error::{ErrorCategory, EventcastErrorTrait};
use crate::models::EventStatus;

/// Result type for repository operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by [`EventRepository`](super::EventRepository) implementations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying SQLite failure
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The event id already exists in the target partition
    #[error("Event '{event_id}' already exists in the {partition} partition")]
    Conflict {
        event_id: String,
        partition: &'static str,
    },

    #[error("Event '{0}' not found")]
    NotFound(String),

    /// Requested status change is not a forward transition
    #[error("Invalid transition for '{event_id}': {from} -> {to}")]
    InvalidTransition {
        event_id: String,
        from: EventStatus,
        to: EventStatus,
    },

    /// A stored row could not be decoded
    #[error("Corrupt row for '{event_id}': {reason}")]
    Corrupt { event_id: String, reason: String },

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn conflict(event_id: impl Into<String>, partition: crate::models::Partition) -> Self {
        Self::Conflict {
            event_id: event_id.into(),
            partition: partition.as_str(),
        }
    }

    /// Check if this is an expected concurrency outcome rather than a fault
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl EventcastErrorTrait for StoreError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Self::Io(_) => true,
            _ => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Storage
    }
}
