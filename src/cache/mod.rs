//! Shared key/value store
//!
//! Holds the small pieces of cross-process state the publication core needs:
//! the rescheduling token, per-event publication claims and cached source
//! parameters. Every write that matters goes through [`KeyValueStore::set_if`],
//! an atomic compare-and-set.
//!
//! # Example
//!
//! ```rust,ignore
//! use eventcast::cache::{CacheConfig, RedisStore, KeyValueStore};
//!
//! let store = RedisStore::new(&CacheConfig::from_env()).await?;
//! let won = store.set_if("claim:E1", None, Some("worker-1"), Some(ttl)).await?;
//! ```

pub mod memory;
pub mod parameters;
pub mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ErrorCategory, EventcastErrorTrait};

pub use memory::MemoryStore;
pub use parameters::ParameterCache;
pub use redis_store::RedisStore;

/// Key/value store errors
#[derive(Error, Debug)]
pub enum KvError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Key/value store lock poisoned")]
    Poisoned,
}

impl From<deadpool_redis::PoolError> for KvError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

impl EventcastErrorTrait for KvError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Redis(e) => {
                e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
            }
            Self::Pool(_) => true,
            Self::Serialization(_) | Self::Poisoned => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Storage
    }
}

pub type KvResult<T> = std::result::Result<T, KvError>;

/// Atomic string store with optional expiry
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Unconditional write
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;

    /// Compare-and-set
    ///
    /// Succeeds only when the current value equals `expected` (`None` means
    /// the key must be absent). `new = None` deletes the key. Returns whether
    /// the write happened.
    async fn set_if(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> KvResult<bool>;

    /// Reset the expiry of an existing key
    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool>;
}

pub type SharedKeyValueStore = Arc<dyn KeyValueStore>;

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,

    /// Connection pool size
    pub pool_size: usize,

    /// Key prefix for namespacing
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            key_prefix: "eventcast".to_string(),
        }
    }
}

impl CacheConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            pool_size: std::env::var("REDIS_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            key_prefix: std::env::var("EVENTCAST_KEY_PREFIX")
                .unwrap_or_else(|_| "eventcast".to_string()),
        }
    }
}

pub fn create_memory_store() -> SharedKeyValueStore {
    Arc::new(MemoryStore::new())
}
