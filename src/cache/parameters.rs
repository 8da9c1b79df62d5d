//! TTL cache for slow-to-fetch JSON parameters
//!
//! Source parameters (keyword block lists and the like) live behind rate-limited
//! backends. They are cached in the key/value store under
//! `parameters:{name}` so every process shares one copy per TTL.

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::SharedKeyValueStore;

pub struct ParameterCache {
    store: SharedKeyValueStore,
    ttl: Duration,
}

impl ParameterCache {
    pub fn new(store: SharedKeyValueStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn key(name: &str) -> String {
        format!("parameters:{name}")
    }

    /// Return the cached value for `name`, loading and caching it on a miss
    ///
    /// Cache failures degrade to calling `load`; only loader errors are
    /// returned.
    pub async fn get_or_load<T, E, F, Fut>(&self, name: &str, load: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = Self::key(name);

        match self.store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    debug!(name, "Parameter cache hit");
                    return Ok(value);
                }
                Err(e) => warn!(name, error = %e, "Discarding undecodable cached parameters"),
            },
            Ok(None) => debug!(name, "Parameter cache miss"),
            Err(e) => warn!(name, error = %e, "Parameter cache unavailable"),
        }

        let value = load().await?;

        match serde_json::to_string(&value) {
            Ok(raw) => {
                if let Err(e) = self.store.set(&key, &raw, Some(self.ttl)).await {
                    warn!(name, error = %e, "Failed to cache parameters");
                }
            }
            Err(e) => warn!(name, error = %e, "Failed to encode parameters"),
        }

        Ok(value)
    }

    /// Drop the cached value so the next read reloads it
    pub async fn invalidate(&self, name: &str) -> bool {
        let key = Self::key(name);
        match self.store.get(&key).await {
            Ok(Some(current)) => self
                .store
                .set_if(&key, Some(&current), None, None)
                .await
                .unwrap_or(false),
            _ => false,
        }
    }
}
