//! Delayed-trigger substrate
//!
//! A [`TriggerQueue`] holds one-shot triggers that fire at a wall-clock
//! instant. The daemon polls [`TriggerQueue::claim_due`]; a claimed trigger
//! is removed atomically so that with several pollers each firing is handed
//! out once. Delivery is at-least-once: a poller that crashes after claiming
//! loses the firing, and the reconcile loop re-arms it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use deadpool_redis::Pool;
use redis::Script;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{SchedulerError, SchedulerResult};

// ============================================================================
// Trigger Types
// ============================================================================

/// Opaque identifier of a scheduled trigger
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerHandle(String);

impl TriggerHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TriggerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for TriggerHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TriggerHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TriggerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a trigger asks the daemon to do when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPayload {
    /// Run a publication tick, then reschedule
    Publish,
}

/// A fired (claimed) trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub handle: TriggerHandle,
    pub fire_at: DateTime<Utc>,
    pub payload: TriggerPayload,
}

// ============================================================================
// Trigger Queue
// ============================================================================

#[async_trait]
pub trait TriggerQueue: Send + Sync {
    /// Schedule a one-shot trigger for `at`
    async fn schedule_at(
        &self,
        at: DateTime<Utc>,
        payload: TriggerPayload,
    ) -> SchedulerResult<TriggerHandle>;

    /// Remove a pending trigger; false if it already fired or never existed
    async fn cancel(&self, handle: &TriggerHandle) -> SchedulerResult<bool>;

    /// Atomically remove and return up to `limit` triggers with `fire_at <= now`
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> SchedulerResult<Vec<Trigger>>;

    /// Whether the trigger is still waiting to fire
    async fn is_pending(&self, handle: &TriggerHandle) -> SchedulerResult<bool>;

    /// Number of pending triggers
    async fn pending(&self) -> SchedulerResult<usize>;
}

pub type SharedTriggerQueue = Arc<dyn TriggerQueue>;

// ============================================================================
// In-process Implementation
// ============================================================================

#[derive(Debug, Default)]
struct MemoryTriggers {
    /// Ordered by fire time, then handle
    by_time: BTreeMap<(DateTime<Utc>, TriggerHandle), TriggerPayload>,
    fire_at: HashMap<TriggerHandle, DateTime<Utc>>,
}

/// Trigger queue living in process memory
#[derive(Debug, Default)]
pub struct MemoryTriggerQueue {
    inner: Mutex<MemoryTriggers>,
}

impl MemoryTriggerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> SchedulerResult<MutexGuard<'_, MemoryTriggers>> {
        self.inner
            .lock()
            .map_err(|_| SchedulerError::trigger_queue("lock", "trigger queue lock poisoned"))
    }

    /// Pending triggers in fire order
    pub fn snapshot(&self) -> Vec<(TriggerHandle, DateTime<Utc>)> {
        self.lock()
            .map(|inner| {
                inner
                    .by_time
                    .keys()
                    .map(|(at, handle)| (handle.clone(), *at))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl TriggerQueue for MemoryTriggerQueue {
    async fn schedule_at(
        &self,
        at: DateTime<Utc>,
        payload: TriggerPayload,
    ) -> SchedulerResult<TriggerHandle> {
        let handle = TriggerHandle::new();
        let mut inner = self.lock()?;
        inner.by_time.insert((at, handle.clone()), payload);
        inner.fire_at.insert(handle.clone(), at);
        Ok(handle)
    }

    async fn cancel(&self, handle: &TriggerHandle) -> SchedulerResult<bool> {
        let mut inner = self.lock()?;
        match inner.fire_at.remove(handle) {
            Some(at) => {
                inner.by_time.remove(&(at, handle.clone()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> SchedulerResult<Vec<Trigger>> {
        let mut inner = self.lock()?;

        let due: Vec<(DateTime<Utc>, TriggerHandle)> = inner
            .by_time
            .keys()
            .take_while(|(at, _)| *at <= now)
            .take(limit)
            .cloned()
            .collect();

        let mut claimed = Vec::with_capacity(due.len());
        for key in due {
            if let Some(payload) = inner.by_time.remove(&key) {
                inner.fire_at.remove(&key.1);
                claimed.push(Trigger {
                    handle: key.1,
                    fire_at: key.0,
                    payload,
                });
            }
        }
        Ok(claimed)
    }

    async fn is_pending(&self, handle: &TriggerHandle) -> SchedulerResult<bool> {
        Ok(self.lock()?.fire_at.contains_key(handle))
    }

    async fn pending(&self) -> SchedulerResult<usize> {
        Ok(self.lock()?.fire_at.len())
    }
}

// ============================================================================
// Redis Implementation
// ============================================================================

/// Pop up to ARGV[2] members scored <= ARGV[1] and their payloads
const CLAIM_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'WITHSCORES', 'LIMIT', 0, tonumber(ARGV[2]))
local out = {}
for i = 1, #due, 2 do
  local handle = due[i]
  local payload = redis.call('HGET', KEYS[2], handle)
  redis.call('ZREM', KEYS[1], handle)
  redis.call('HDEL', KEYS[2], handle)
  if payload then
    table.insert(out, handle)
    table.insert(out, due[i + 1])
    table.insert(out, payload)
  end
end
return out
"#;

const CANCEL_SCRIPT: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
return removed
"#;

/// Trigger queue shared by every process through Redis
///
/// A sorted set scored by fire time in epoch milliseconds holds the handles;
/// a hash maps each handle to its JSON payload.
pub struct RedisTriggerQueue {
    pool: Pool,
    schedule_key: String,
    payload_key: String,
    claim_script: Script,
    cancel_script: Script,
}

impl RedisTriggerQueue {
    pub fn new(pool: Pool, key_prefix: &str) -> Self {
        Self {
            pool,
            schedule_key: format!("{key_prefix}:triggers:schedule"),
            payload_key: format!("{key_prefix}:triggers:payload"),
            claim_script: Script::new(CLAIM_DUE_SCRIPT),
            cancel_script: Script::new(CANCEL_SCRIPT),
        }
    }
}

fn millis_to_time(ms: i64) -> SchedulerResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| SchedulerError::trigger_queue("claim_due", format!("invalid score {ms}")))
}

#[async_trait]
impl TriggerQueue for RedisTriggerQueue {
    async fn schedule_at(
        &self,
        at: DateTime<Utc>,
        payload: TriggerPayload,
    ) -> SchedulerResult<TriggerHandle> {
        let handle = TriggerHandle::new();
        let payload = serde_json::to_string(&payload)?;
        let mut conn = self.pool.get().await?;

        redis::pipe()
            .atomic()
            .hset(&self.payload_key, handle.as_str(), payload)
            .ignore()
            .zadd(&self.schedule_key, handle.as_str(), at.timestamp_millis())
            .ignore()
            .query_async::<()>(&mut *conn)
            .await?;

        Ok(handle)
    }

    async fn cancel(&self, handle: &TriggerHandle) -> SchedulerResult<bool> {
        let mut conn = self.pool.get().await?;
        let removed: i64 = self
            .cancel_script
            .key(&self.schedule_key)
            .key(&self.payload_key)
            .arg(handle.as_str())
            .invoke_async(&mut *conn)
            .await?;
        Ok(removed > 0)
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> SchedulerResult<Vec<Trigger>> {
        let mut conn = self.pool.get().await?;
        let flat: Vec<String> = self
            .claim_script
            .key(&self.schedule_key)
            .key(&self.payload_key)
            .arg(now.timestamp_millis())
            .arg(limit)
            .invoke_async(&mut *conn)
            .await?;

        let mut triggers = Vec::with_capacity(flat.len() / 3);
        for chunk in flat.chunks_exact(3) {
            let score: f64 = chunk[1].parse().map_err(|_| {
                SchedulerError::trigger_queue("claim_due", format!("invalid score '{}'", chunk[1]))
            })?;
            triggers.push(Trigger {
                handle: TriggerHandle::from(chunk[0].as_str()),
                fire_at: millis_to_time(score as i64)?,
                payload: serde_json::from_str(&chunk[2])?,
            });
        }
        Ok(triggers)
    }

    async fn is_pending(&self, handle: &TriggerHandle) -> SchedulerResult<bool> {
        let mut conn = self.pool.get().await?;
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(&self.schedule_key)
            .arg(handle.as_str())
            .query_async(&mut *conn)
            .await?;
        Ok(score.is_some())
    }

    async fn pending(&self) -> SchedulerResult<usize> {
        let mut conn = self.pool.get().await?;
        let count: usize = redis::cmd("ZCARD")
            .arg(&self.schedule_key)
            .query_async(&mut *conn)
            .await?;
        Ok(count)
    }
}
