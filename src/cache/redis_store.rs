//! Redis-backed key/value store

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::{AsyncCommands, Script};

use super::{CacheConfig, KeyValueStore, KvResult};

/// Atomic compare-and-set
///
/// ARGV: has_expected, expected, has_new, new, ttl_ms (0 = no expiry)
const SET_IF_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
else
  if current then return 0 end
end
if ARGV[3] == '1' then
  local ttl = tonumber(ARGV[5])
  if ttl > 0 then
    redis.call('SET', KEYS[1], ARGV[4], 'PX', ttl)
  else
    redis.call('SET', KEYS[1], ARGV[4])
  end
else
  redis.call('DEL', KEYS[1])
end
return 1
"#;

/// Redis key/value store over a `deadpool-redis` pool
pub struct RedisStore {
    pool: Pool,
    key_prefix: String,
    set_if_script: Script,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`
    pub async fn new(config: &CacheConfig) -> anyhow::Result<Self> {
        let pool = create_pool(config)?;

        let mut conn = pool.get().await.context("Failed to get Redis connection")?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .context("Failed to ping Redis")?;

        tracing::info!(url = %config.url, "Connected to Redis");

        Ok(Self::from_pool(pool, &config.key_prefix))
    }

    pub fn from_pool(pool: Pool, key_prefix: &str) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.to_string(),
            set_if_script: Script::new(SET_IF_SCRIPT),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    pub async fn health_check(&self) -> KvResult<bool> {
        let mut conn = self.pool.get().await?;
        let result: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(result == "PONG")
    }
}

/// Build a connection pool from config
pub fn create_pool(config: &CacheConfig) -> anyhow::Result<Pool> {
    PoolConfig::from_url(&config.url)
        .builder()
        .map_err(|e| anyhow::anyhow!("Failed to create pool builder: {e}"))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .context("Failed to create Redis connection pool")
}

fn ttl_millis(ttl: Option<Duration>) -> u64 {
    ttl.map(|t| t.as_millis().max(1) as u64).unwrap_or(0)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let mut conn = self.pool.get().await?;
        let key = self.key(key);
        match ttl {
            Some(ttl) => {
                conn.pset_ex::<_, _, ()>(key, value, ttl_millis(Some(ttl)))
                    .await?
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn set_if(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> KvResult<bool> {
        let mut conn = self.pool.get().await?;
        let written: i64 = self
            .set_if_script
            .key(self.key(key))
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(if new.is_some() { "1" } else { "0" })
            .arg(new.unwrap_or(""))
            .arg(ttl_millis(ttl))
            .invoke_async(&mut *conn)
            .await?;
        Ok(written == 1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let mut conn = self.pool.get().await?;
        let updated: bool = conn.pexpire(self.key(key), ttl_millis(Some(ttl)) as i64).await?;
        Ok(updated)
    }
}
