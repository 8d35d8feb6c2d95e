//! Key-value store abstraction and the Redis implementation
//!
//! The store is the only place cache state lives. Every write is a single
//! "set whole value at key" operation, so concurrent writers resolve by
//! last-write-wins.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;

use crate::StoreError;

/// Number of keys requested per SCAN round trip
const SCAN_BATCH: usize = 200;

/// Networked key-value store holding serialized cache entries
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Read the raw value stored at `key`
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Overwrite `key`, optionally expiring it after `ttl`
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Delete every key starting with `prefix`, returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError>;
}

/// Redis-backed store using a multiplexed, auto-reconnecting connection
#[derive(Clone)]
pub struct RedisStore {
    redis: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis
    pub async fn new(redis_client: redis::Client) -> Result<Self, StoreError> {
        let redis = redis::aio::ConnectionManager::new(redis_client).await?;
        Ok(Self { redis })
    }

    /// Wrap an existing connection manager
    pub fn from_manager(redis: redis::aio::ConnectionManager) -> Self {
        Self { redis }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        match ttl {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                    .await?
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let keys = self.scan_prefix(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.redis.clone();
        let mut removed = 0;
        for chunk in keys.chunks(SCAN_BATCH) {
            removed += conn.del::<_, usize>(chunk.to_vec()).await?;
        }
        debug!("Deleted {} Redis keys with prefix {}", removed, prefix);
        Ok(removed)
    }
}

/// Escape Redis glob metacharacters so a prefix matches literally
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
