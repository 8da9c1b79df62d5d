//! In-process key/value store

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{KeyValueStore, KvError, KvResult};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Mutex-guarded map with lazy expiry
///
/// A single lock makes every operation atomic, which is all `set_if` needs
/// within one process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> KvResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries.lock().map_err(|_| KvError::Poisoned)
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut entries = self.lock()?;
        Ok(Self::live_value(&mut entries, key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let mut entries = self.lock()?;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_if(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> KvResult<bool> {
        let mut entries = self.lock()?;
        let current = Self::live_value(&mut entries, key);

        if current.as_deref() != expected {
            return Ok(false);
        }

        match new {
            Some(value) => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_string(),
                        expires_at: ttl.map(|t| Instant::now() + t),
                    },
                );
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let mut entries = self.lock()?;
        if Self::live_value(&mut entries, key).is_none() {
            return Ok(false);
        }
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_if_absent() {
        let store = MemoryStore::new();

        assert!(store.set_if("k", None, Some("a"), None).await.unwrap());
        assert!(!store.set_if("k", None, Some("b"), None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_set_if_expected_and_delete() {
        let store = MemoryStore::new();
        store.set("k", "a", None).await.unwrap();

        assert!(!store.set_if("k", Some("x"), Some("b"), None).await.unwrap());
        assert!(store.set_if("k", Some("a"), Some("b"), None).await.unwrap());
        assert!(store.set_if("k", Some("b"), None, None).await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_key_is_absent() {
        let store = MemoryStore::new();
        store
            .set("claim", "owner", Some(Duration::from_millis(5)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(store.get("claim").await.unwrap().is_none());
        assert!(!store.expire("claim", Duration::from_secs(1)).await.unwrap());
        assert!(store.set_if("claim", None, Some("other"), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryStore::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let owner = format!("worker-{i}");
                    store.set_if("claim:E1", None, Some(&owner), None).await.unwrap()
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.len(), 1);
    }
}
