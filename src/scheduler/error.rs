//! Error types for the scheduler module

use std::fmt;

use crate::cache::KvError;
use crate::error::{ErrorCategory, EventcastErrorTrait};
use crate::storage::StoreError;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug)]
pub enum SchedulerError {
    /// Invalid `HH:MM` posting or maintenance time
    InvalidTime { value: String, reason: String },

    /// Invalid UTC offset in minutes
    InvalidOffset { minutes: i32 },

    /// No slots configured for some day kind
    NoSlots,

    /// Trigger substrate failure
    TriggerQueue { operation: String, reason: String },

    /// Stored rescheduling token could not be decoded
    CorruptToken { raw: String, reason: String },

    /// Event store failure surfaced after retries
    Store(StoreError),

    /// Key/value store failure surfaced after retries
    Kv(KvError),

    /// Serialization/deserialization error
    SerializationError { reason: String },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTime { value, reason } => {
                write!(f, "Invalid time '{}': {}. Expected HH:MM", value, reason)
            }
            Self::InvalidOffset { minutes } => {
                write!(f, "Invalid UTC offset: {} minutes", minutes)
            }
            Self::NoSlots => write!(f, "No posting slots configured"),
            Self::TriggerQueue { operation, reason } => {
                write!(f, "Trigger queue error during '{}': {}", operation, reason)
            }
            Self::CorruptToken { raw, reason } => {
                write!(f, "Corrupt rescheduling token '{}': {}", raw, reason)
            }
            Self::Store(e) => write!(f, "Store error: {}", e),
            Self::Kv(e) => write!(f, "Key/value store error: {}", e),
            Self::SerializationError { reason } => {
                write!(f, "Serialization error: {}", reason)
            }
        }
    }
}

impl std::error::Error for SchedulerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Kv(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError {
            reason: err.to_string(),
        }
    }
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<KvError> for SchedulerError {
    fn from(err: KvError) -> Self {
        Self::Kv(err)
    }
}

impl From<redis::RedisError> for SchedulerError {
    fn from(err: redis::RedisError) -> Self {
        Self::TriggerQueue {
            operation: "redis".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<deadpool_redis::PoolError> for SchedulerError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::TriggerQueue {
            operation: "pool".to_string(),
            reason: err.to_string(),
        }
    }
}

impl SchedulerError {
    /// Create an invalid time error
    pub fn invalid_time(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTime {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create a trigger queue error
    pub fn trigger_queue(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TriggerQueue {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn corrupt_token(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptToken {
            raw: raw.into(),
            reason: reason.into(),
        }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::TriggerQueue { .. } => true,
            Self::Store(e) => e.is_recoverable(),
            Self::Kv(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

impl EventcastErrorTrait for SchedulerError {
    fn is_recoverable(&self) -> bool {
        SchedulerError::is_recoverable(self)
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Store(_) | Self::Kv(_) => ErrorCategory::Storage,
            Self::InvalidTime { .. } | Self::InvalidOffset { .. } | Self::NoSlots => {
                ErrorCategory::Config
            }
            _ => ErrorCategory::Scheduler,
        }
    }
}
