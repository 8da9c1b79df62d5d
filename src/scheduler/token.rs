//! Persisted rescheduling token
//!
//! The token records the single outstanding publish trigger. It is stored as
//! JSON in the key/value store; every update is a compare-and-set against
//! the raw value that was read, so two reschedulers racing on the same token
//! cannot both win.

use crate::cache::{KvResult, SharedKeyValueStore};
use crate::models::ReschedulingToken;

use super::trigger::TriggerHandle;

/// Default key of the token in the key/value store
pub const TOKEN_KEY: &str = "posting_token";

/// The token as read, with the raw value needed for a later CAS
#[derive(Debug, Clone, Default)]
pub struct StoredToken {
    /// Exact stored string; `None` when no token is stored
    pub raw: Option<String>,
    /// Decoded token; `None` when absent or undecodable
    pub token: Option<ReschedulingToken>,
}

impl StoredToken {
    pub fn references(&self, handle: &TriggerHandle) -> bool {
        self.token
            .as_ref()
            .is_some_and(|t| t.trigger_handle == handle.as_str())
    }
}

pub struct TokenStore {
    store: SharedKeyValueStore,
    key: String,
}

impl TokenStore {
    pub fn new(store: SharedKeyValueStore) -> Self {
        Self::with_key(store, TOKEN_KEY)
    }

    pub fn with_key(store: SharedKeyValueStore, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub async fn load(&self) -> KvResult<StoredToken> {
        let raw = self.store.get(&self.key).await?;
        let token = match raw.as_deref() {
            Some(value) => match serde_json::from_str::<ReschedulingToken>(value) {
                Ok(token) => Some(token),
                Err(e) => {
                    tracing::warn!(key = %self.key, error = %e, "Ignoring undecodable rescheduling token");
                    None
                }
            },
            None => None,
        };
        Ok(StoredToken { raw, token })
    }

    /// Replace the token only if the stored value is still `current`
    ///
    /// `next = None` clears the token.
    pub async fn replace(
        &self,
        current: Option<&str>,
        next: Option<&ReschedulingToken>,
    ) -> KvResult<bool> {
        let encoded = next.map(serde_json::to_string).transpose()?;
        self.store
            .set_if(&self.key, current, encoded.as_deref(), None)
            .await
    }
}
